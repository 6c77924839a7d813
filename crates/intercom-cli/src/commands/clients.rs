//! `intercom clients` — simulated WebSocket clients.
//!
//! Each client connects with its index as the `CE-X-USER` identity, pings
//! periodically, and answers every pushed request with the request's own
//! message.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use intercom_core::codec::response_frame;
use intercom_core::{body_decode, frame_decode, CommRequest, Kind, USER_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open `number` clients against `url` and run them until they all end or
/// Ctrl+C.
pub async fn run(url: &str, number: usize, dial_limit: usize, ping: Duration) -> Result<()> {
    let limit = Arc::new(Semaphore::new(dial_limit.max(1)));
    let mut clients = JoinSet::new();

    for index in 0..number {
        let url = url.to_string();
        let user = index.to_string();
        let limit = limit.clone();
        clients.spawn(async move {
            let permit = limit.acquire_owned().await?;
            let socket = dial(&url, &user).await;
            drop(permit);
            let result = echo(socket?, &user, ping).await;
            result.with_context(|| format!("client {user}"))
        });
    }
    info!(clients = number, "started clients");

    let mut failed = 0usize;
    loop {
        tokio::select! {
            joined = clients.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    failed += 1;
                    warn!("{e:#}");
                }
                Some(Err(e)) => {
                    failed += 1;
                    warn!(error = %e, "client task failed");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing clients");
                clients.abort_all();
                break;
            }
        }
    }

    info!(failed, "clients finished");
    Ok(())
}

async fn dial(url: &str, user: &str) -> Result<Socket> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid websocket url {url}"))?;
    request.headers_mut().insert(
        USER_HEADER,
        HeaderValue::from_str(user).context("invalid user header")?,
    );

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("dial {url} as {user}"))?;
    info!(user, "connected");
    Ok(socket)
}

/// Answer pushed requests until the server closes the socket.
async fn echo(socket: Socket, user: &str, ping: Duration) -> Result<()> {
    let (mut write, mut read) = socket.split();
    let mut ticker = tokio::time::interval(ping);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write.send(Message::Ping(Default::default())).await.context("ping")?;
            }
            message = read.next() => {
                let data = match message {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | None => {
                        info!(user, "server closed connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("read"),
                };
                debug!(user, frame = %String::from_utf8_lossy(&data), "recv");

                match answer(&data) {
                    Ok(Some(reply)) => {
                        write.send(Message::Text(reply.into())).await.context("write")?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(user, error = %e, "ignoring undecodable frame"),
                }
            }
        }
    }
}

/// Build the echo reply for one server frame, if it carries a request.
pub fn answer(frame: &[u8]) -> Result<Option<String>> {
    let envelope = frame_decode(frame)?;
    if envelope.kind != Kind::Message {
        return Ok(None);
    }
    let request: CommRequest = body_decode(&envelope)?;
    let reply = response_frame(&request.id, &request.msg)?;
    Ok(Some(String::from_utf8(reply)?))
}
