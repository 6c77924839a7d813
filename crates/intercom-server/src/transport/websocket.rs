//! WebSocket transport over axum's upgraded socket.
//!
//! The socket is split into sink and stream halves so the read loop and push
//! callers never contend for the same lock. Ping/pong is answered by the
//! WebSocket layer; only text and binary frames reach the relay.

use super::{FrameSink, FrameStream};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use intercom_core::{IntercomError, IntercomResult};

/// Maximum frame size accepted from a client (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Sending half of an upgraded WebSocket.
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Receiving half of an upgraded WebSocket.
pub struct WsStream(SplitStream<WebSocket>);

/// Split an upgraded socket into relay transport halves.
pub fn split(socket: WebSocket) -> (WsSink, WsStream) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsStream(stream))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: &[u8]) -> IntercomResult<()> {
        let message = match std::str::from_utf8(frame) {
            Ok(text) => Message::Text(text.to_owned().into()),
            Err(_) => Message::Binary(frame.to_vec().into()),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| IntercomError::Transport(format!("WS send failed: {e}")))
    }

    async fn close(&mut self) -> IntercomResult<()> {
        self.0
            .close()
            .await
            .map_err(|e| IntercomError::Transport(format!("WS close failed: {e}")))
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<IntercomResult<Vec<u8>>> {
        loop {
            let data = match self.0.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) => return None,
                // Ping/pong
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(IntercomError::Transport(format!("WS recv failed: {e}"))));
                }
                None => return None,
            };

            if data.len() > MAX_WS_FRAME_SIZE {
                return Some(Err(IntercomError::Transport(format!(
                    "WS frame too large: {} bytes (max {})",
                    data.len(),
                    MAX_WS_FRAME_SIZE
                ))));
            }
            return Some(Ok(data));
        }
    }
}
