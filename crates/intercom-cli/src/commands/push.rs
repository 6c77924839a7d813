//! `intercom push` — periodic pusher.
//!
//! Each round posts one timestamped message per user `0..N` with a fresh
//! command id and prints the relay's reply.

use anyhow::{Context, Result};
use intercom_core::messages::PushRequest;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub struct PushOptions {
    pub url: String,
    pub users: usize,
    pub interval: Duration,
    pub once: bool,
    pub is_async: bool,
    pub secret: Option<String>,
}

pub async fn run(options: &PushOptions) -> Result<()> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    info!(url = %options.url, users = options.users, "pushing");
    loop {
        for index in 0..options.users {
            let request = build_request(&index.to_string(), options.is_async);
            match send(&client, options, &request).await {
                Ok((status, body)) => println!("{status} {body}"),
                Err(e) => {
                    warn!(user = %request.user_id, "{e:#}");
                    println!("{e:#}");
                }
            }
        }

        if options.once {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}

async fn send(
    client: &reqwest::Client,
    options: &PushOptions,
    request: &PushRequest,
) -> Result<(reqwest::StatusCode, String)> {
    let mut builder = client.post(&options.url).json(request);
    if let Some(secret) = &options.secret {
        builder = builder.bearer_auth(secret);
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("push to user {}", request.user_id))?;
    let status = response.status();
    let body = response.text().await.context("read push reply")?;
    debug!(user = %request.user_id, comm_id = %request.comm_id, %status, "push reply");
    Ok((status, body))
}

/// One push for `user` with a fresh random command id.
pub fn build_request(user: &str, is_async: bool) -> PushRequest {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    PushRequest {
        user_id: user.to_string(),
        comm_id: hex::encode(rand::random::<[u8; 16]>()),
        message: format!("Hello user[{user}], it is now: {millis}"),
        is_async,
    }
}
