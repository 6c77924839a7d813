//! Core server: accepts connections, pushes commands, and reaps expired ones.
//!
//! Owns the connection registry and the policy callbacks. Transport-specific
//! wiring (the axum router) lives in [`crate::http`]; everything here works
//! against the [`FrameSink`]/[`FrameStream`] traits.

use crate::auth::{AuthTokenFn, PushAuthFn};
use crate::config::ServerConfig;
use crate::http;
use crate::metrics::{COMMANDS_EXPIRED_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, PUSHES_TOTAL};
use crate::relay::{Conn, ConnManager};
use crate::transport::{FrameSink, FrameStream};
use axum::http::HeaderMap;
use intercom_core::codec::request_frame;
use intercom_core::{CommResponse, IntercomError, IntercomResult};
use metrics::{counter, gauge};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a push waits for its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Block until the client answers, the deadline passes, or the
    /// connection goes away.
    Wait(Duration),
    /// Return as soon as the request is written; the sweep reaps the command.
    FireAndForget,
}

/// Identity presented when a connection opens.
enum HeaderIdentity {
    /// Raw header value, still to be resolved.
    Token(String),
    /// Already resolved user id.
    User(String),
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Answered(CommResponse),
    /// Request written; carries the command id.
    Accepted(String),
}

/// The intercom relay instance.
pub struct IntercomServer {
    config: ServerConfig,
    manager: Arc<ConnManager>,
    auth_token: Option<AuthTokenFn>,
    push_auth: Option<PushAuthFn>,
}

impl IntercomServer {
    /// Create a new server instance.
    pub fn new(
        config: ServerConfig,
        auth_token: Option<AuthTokenFn>,
        push_auth: Option<PushAuthFn>,
    ) -> IntercomResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            manager: Arc::new(ConnManager::new()),
            auth_token,
            push_auth,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnManager> {
        &self.manager
    }

    /// Wrap an accepted transport as a connection and start its read loop.
    ///
    /// `header_token` is the `CE-X-USER` header, if the client sent one; it
    /// goes through the same token callback as a register envelope. If that
    /// bind fails the connection is closed.
    pub async fn accept(
        self: &Arc<Self>,
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        header_token: Option<String>,
    ) -> IntercomResult<Arc<Conn>> {
        let identity = header_token.filter(|t| !t.is_empty()).map(HeaderIdentity::Token);
        self.start(sink, stream, identity).await
    }

    /// Like [`accept`](Self::accept), for a header identity the caller has
    /// already resolved with [`resolve_identity`](Self::resolve_identity).
    pub async fn accept_as(
        self: &Arc<Self>,
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        user_id: Option<String>,
    ) -> IntercomResult<Arc<Conn>> {
        let identity = user_id.filter(|u| !u.is_empty()).map(HeaderIdentity::User);
        self.start(sink, stream, identity).await
    }

    async fn start(
        self: &Arc<Self>,
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        identity: Option<HeaderIdentity>,
    ) -> IntercomResult<Arc<Conn>> {
        let conn = Arc::new(Conn::new(
            self.manager.next_conn_id(),
            sink,
            self.manager.clone(),
            self.auth_token.clone(),
        ));
        counter!(CONNECTIONS_TOTAL).increment(1);

        let bound = match &identity {
            Some(HeaderIdentity::Token(token)) => conn.register(token, "").await,
            Some(HeaderIdentity::User(user_id)) => conn.bind_as(user_id, "").await,
            None => Ok(()),
        };
        if let Err(e) = bound {
            let _ = conn.close().await;
            return Err(e);
        }

        debug!(conn_id = conn.id(), user = conn.user().unwrap_or_default(), "connection accepted");
        let supervised = conn.clone();
        let manager = self.manager.clone();
        tokio::spawn(supervise(supervised, stream, manager));
        Ok(conn)
    }

    /// Send `message` to `user_id` as command `comm_id`.
    ///
    /// An empty `comm_id` gets a server-generated id. A failed write removes
    /// the command again.
    pub async fn push(
        &self,
        user_id: &str,
        comm_id: &str,
        message: &str,
        mode: PushMode,
    ) -> IntercomResult<PushOutcome> {
        let result = self.push_inner(user_id, comm_id, message, mode).await;
        let outcome = match &result {
            Ok(PushOutcome::Answered(_)) => "answered",
            Ok(PushOutcome::Accepted(_)) => "accepted",
            Err(IntercomError::Timeout) => "timeout",
            Err(IntercomError::Disconnected) => "disconnected",
            Err(_) => "error",
        };
        counter!(PUSHES_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn push_inner(
        &self,
        user_id: &str,
        comm_id: &str,
        message: &str,
        mode: PushMode,
    ) -> IntercomResult<PushOutcome> {
        if user_id.is_empty() {
            return Err(IntercomError::InvalidArgument("user id can't be empty".into()));
        }
        let comm_id = if comm_id.is_empty() {
            generate_comm_id()
        } else {
            comm_id.to_string()
        };
        let timeout = match mode {
            PushMode::Wait(timeout) => timeout,
            PushMode::FireAndForget => self.config.push_timeout,
        };

        let conn = self.manager.connection_for(user_id).await?;
        let command = conn.new_command(&comm_id, message, timeout).await?;

        let frame = request_frame(&comm_id, message)?;
        if let Err(e) = conn.write(&frame).await {
            conn.remove_exact(&command).await;
            warn!(user = %user_id, comm_id = %comm_id, error = %e, "push write failed");
            return Err(e);
        }
        debug!(user = %user_id, comm_id = %comm_id, "push sent");

        match mode {
            PushMode::FireAndForget => Ok(PushOutcome::Accepted(comm_id)),
            PushMode::Wait(_) => {
                let result = command.wait().await;
                // close() or the sweep may already have removed it, and the id
                // may now belong to a newer command.
                conn.remove_exact(&command).await;
                match &result {
                    Ok(_) => debug!(user = %user_id, comm_id = %comm_id, "push answered"),
                    Err(e) => info!(user = %user_id, comm_id = %comm_id, error = %e, "push unanswered"),
                }
                result.map(PushOutcome::Answered)
            }
        }
    }

    /// Force-close the connection bound to `user_id`.
    ///
    /// With an event filter, only a connection registered with that event is
    /// closed. Returns how many connections were closed.
    pub async fn drop_user(&self, user_id: &str, event: Option<&str>) -> IntercomResult<usize> {
        let conn = match self.manager.connection_for(user_id).await {
            Ok(conn) => conn,
            Err(IntercomError::NoSuchUser(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        if let Some(event) = event.filter(|e| !e.is_empty()) {
            if conn.event() != Some(event) {
                return Ok(0);
            }
        }

        match conn.close().await {
            Ok(()) => {
                info!(user = %user_id, conn_id = conn.id(), "connection dropped");
                Ok(1)
            }
            // Closed concurrently by its own read loop.
            Err(IntercomError::Closed) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Whether `user_id` is currently connected.
    pub async fn lookup(&self, user_id: &str) -> IntercomResult<bool> {
        self.manager.has_user(user_id).await
    }

    /// Map a connection-time token to a user id. Without a token callback the
    /// token is the user id.
    pub fn resolve_identity(&self, token: &str) -> Option<String> {
        match &self.auth_token {
            Some(resolve) => resolve(token),
            None => Some(token.to_string()),
        }
    }

    /// Run the push authorization policy. Pushes are open when none is set.
    pub fn authorize_push(&self, headers: &HeaderMap) -> bool {
        self.push_auth.as_ref().is_none_or(|allow| allow(headers))
    }

    /// Expire overdue commands on every connection. Returns how many expired.
    pub async fn sweep(&self) -> usize {
        let mut expired = 0;
        for conn in self.manager.connections().await {
            expired += conn.sweep_expired().await;
        }
        if expired > 0 {
            counter!(COMMANDS_EXPIRED_TOTAL).increment(expired as u64);
            debug!(expired, "swept expired commands");
        }
        expired
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                server.sweep().await;
            }
        })
    }

    /// Close every connection, aborting their pending commands.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for conn in self.manager.connections().await {
            if conn.close().await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    /// Serve HTTP on `listener` until `shutdown` resolves.
    pub async fn serve<F>(
        self: Arc<Self>,
        listener: TcpListener,
        metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
        shutdown: F,
    ) -> IntercomResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.spawn_sweeper();
        let app = http::router(self.clone(), metrics);

        info!(
            addr = %listener.local_addr()?,
            ws = %self.config.paths.ws,
            push = %self.config.paths.push,
            "intercom-server ready"
        );

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        sweeper.abort();
        let closed = self.close_all().await;
        info!(closed, "closed remaining connections");
        result.map_err(IntercomError::Io)
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(
        self: Arc<Self>,
        metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
        shutdown: F,
    ) -> IntercomResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, metrics, shutdown).await
    }
}

/// Run a connection's read loop, then tear it down.
async fn supervise(conn: Arc<Conn>, stream: Box<dyn FrameStream>, manager: Arc<ConnManager>) {
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    conn.listen(stream).await;
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);

    if !conn.is_closed() {
        let _ = conn.close().await;
    }
    match manager.unbind(&conn).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            debug!(conn_id = conn.id(), error = %e, "nothing to unbind");
        }
        Err(e) => {
            debug!(conn_id = conn.id(), error = %e, "unbind skipped");
        }
    }
    info!(
        conn_id = conn.id(),
        user = conn.user().unwrap_or_default(),
        dropped_frames = conn.dropped_frames(),
        uptime_secs = conn.connected_at().elapsed().as_secs(),
        "connection closed"
    );
}

/// 16 random bytes, hex-encoded.
fn generate_comm_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
