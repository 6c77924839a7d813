//! Server side of one client connection.
//!
//! A `Conn` owns the transport sink, the optional user identity it was bound
//! to, and the map of commands pushed over it. Its read loop decodes
//! envelopes and either registers the connection or completes a pending
//! command. Unbinding on exit is left to whoever spawned the loop.

use super::command::CommObject;
use super::registry::ConnManager;
use crate::auth::AuthTokenFn;
use crate::metrics::{FRAMES_DROPPED_TOTAL, ORPHAN_RESPONSES_TOTAL, REGISTRATIONS_TOTAL};
use crate::transport::{FrameSink, FrameStream};
use intercom_core::{
    body_decode, frame_decode, CommRequest, CommResponse, IntercomError, IntercomResult, Kind,
    RegisterMessage,
};
use metrics::counter;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Process-unique connection identifier, compared on unbind.
pub type ConnId = u64;

/// Decoded client frame.
enum Inbound {
    Register(RegisterMessage),
    Response(CommResponse),
}

/// One client connection.
pub struct Conn {
    id: ConnId,
    sink: Mutex<Box<dyn FrameSink>>,
    manager: Arc<ConnManager>,
    auth_token: Option<AuthTokenFn>,
    /// Set once by the registry on bind.
    user: OnceLock<String>,
    /// Event label from the register envelope.
    event: OnceLock<String>,
    commands: RwLock<HashMap<String, Arc<CommObject>>>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    dropped_frames: AtomicU64,
    connected_at: Instant,
}

impl Conn {
    pub fn new(
        id: ConnId,
        sink: Box<dyn FrameSink>,
        manager: Arc<ConnManager>,
        auth_token: Option<AuthTokenFn>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            id,
            sink: Mutex::new(sink),
            manager,
            auth_token,
            user: OnceLock::new(),
            event: OnceLock::new(),
            commands: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stop_tx,
            dropped_frames: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// User this connection is bound to, if registered.
    pub fn user(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    /// Event label supplied at registration, if any.
    pub fn event(&self) -> Option<&str> {
        self.event.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames dropped because they did not decode.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Stamp the bound identity. Called by the registry under its lock.
    pub(crate) fn stamp_user(&self, user_id: &str) -> bool {
        self.user.set(user_id.to_string()).is_ok()
    }

    /// Send one frame to the client.
    pub async fn write(&self, frame: &[u8]) -> IntercomResult<()> {
        if self.is_closed() {
            return Err(IntercomError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send_frame(frame).await
    }

    /// Handle one raw frame from the client.
    ///
    /// Frames that do not decode as an envelope are dropped and counted; the
    /// connection stays open. Errors from registration or completion are
    /// returned to the caller.
    pub async fn on_message(self: &Arc<Self>, frame: &[u8]) -> IntercomResult<()> {
        let decoded = frame_decode(frame).and_then(|envelope| match envelope.kind {
            Kind::Register => body_decode::<RegisterMessage>(&envelope).map(Inbound::Register),
            Kind::Message => body_decode::<CommResponse>(&envelope).map(Inbound::Response),
        });

        match decoded {
            Ok(Inbound::Register(register)) => {
                self.register(&register.token, &register.event).await
            }
            Ok(Inbound::Response(response)) => self.handle_response(response).await,
            Err(e) => {
                self.drop_frame(&e);
                Ok(())
            }
        }
    }

    fn drop_frame(&self, error: &IntercomError) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        counter!(FRAMES_DROPPED_TOTAL).increment(1);
        debug!(conn_id = self.id, error = %error, "dropping undecodable frame");
    }

    /// Resolve `token` to a user id and bind this connection to it.
    pub async fn register(self: &Arc<Self>, token: &str, event: &str) -> IntercomResult<()> {
        let user_id = match &self.auth_token {
            Some(resolve) => resolve(token).ok_or_else(|| {
                IntercomError::Unauthorized(format!("token rejected for connection {}", self.id))
            }),
            None => Ok(token.to_string()),
        };

        let result = match user_id {
            Ok(user_id) => self.manager.bind(&user_id, self).await,
            Err(e) => Err(e),
        };
        self.record_registration(result, event)
    }

    /// Bind this connection to an already resolved user id, skipping the
    /// token callback.
    pub async fn bind_as(self: &Arc<Self>, user_id: &str, event: &str) -> IntercomResult<()> {
        let result = self.manager.bind(user_id, self).await;
        self.record_registration(result, event)
    }

    fn record_registration(&self, result: IntercomResult<()>, event: &str) -> IntercomResult<()> {
        match &result {
            Ok(()) => {
                if !event.is_empty() {
                    let _ = self.event.set(event.to_string());
                }
                counter!(REGISTRATIONS_TOTAL, "outcome" => "ok").increment(1);
                info!(conn_id = self.id, user = self.user().unwrap_or_default(), event, "connection registered");
            }
            Err(e) => {
                counter!(REGISTRATIONS_TOTAL, "outcome" => "rejected").increment(1);
                warn!(conn_id = self.id, error = %e, "registration rejected");
            }
        }
        result
    }

    async fn handle_response(&self, response: CommResponse) -> IntercomResult<()> {
        if self.user().is_none() {
            return Err(IntercomError::NotRegistered);
        }

        // Completion happens under the read lock so that removal cannot
        // interleave with it.
        let commands = self.commands.read().await;
        let Some(command) = commands.get(&response.id) else {
            counter!(ORPHAN_RESPONSES_TOTAL).increment(1);
            return Err(IntercomError::NoSuchCommand(response.id));
        };
        let comm_id = response.id.clone();
        if command.complete(response) {
            debug!(conn_id = self.id, comm_id = %comm_id, "command completed");
        } else {
            debug!(conn_id = self.id, comm_id = %comm_id, "response for finished command ignored");
        }
        Ok(())
    }

    /// Create and register a command on this connection.
    pub async fn new_command(
        &self,
        comm_id: &str,
        message: &str,
        timeout: Duration,
    ) -> IntercomResult<Arc<CommObject>> {
        if comm_id.is_empty() {
            return Err(IntercomError::InvalidArgument("command id can't be empty".into()));
        }

        let mut commands = self.commands.write().await;
        // Checked under the lock so close() cannot miss a late insert.
        if self.is_closed() {
            return Err(IntercomError::Closed);
        }
        match commands.entry(comm_id.to_string()) {
            Entry::Occupied(_) => Err(IntercomError::DuplicateCommand(comm_id.to_string())),
            Entry::Vacant(slot) => {
                let command = Arc::new(CommObject::new(
                    comm_id.to_string(),
                    CommRequest {
                        id: comm_id.to_string(),
                        msg: message.to_string(),
                    },
                    timeout,
                ));
                slot.insert(command.clone());
                Ok(command)
            }
        }
    }

    /// Look up a pending command by id.
    pub async fn lookup_command(&self, comm_id: &str) -> Option<Arc<CommObject>> {
        self.commands.read().await.get(comm_id).cloned()
    }

    /// Remove a command by id.
    pub async fn remove_command(&self, comm_id: &str) -> IntercomResult<Arc<CommObject>> {
        self.commands
            .write()
            .await
            .remove(comm_id)
            .ok_or_else(|| IntercomError::NoSuchCommand(comm_id.to_string()))
    }

    /// Remove `command` only if it is still the entry under its id. An id
    /// reused by a newer command is left alone.
    pub async fn remove_exact(&self, command: &Arc<CommObject>) -> bool {
        let mut commands = self.commands.write().await;
        match commands.get(command.id()) {
            Some(current) if Arc::ptr_eq(current, command) => {
                commands.remove(command.id());
                true
            }
            _ => false,
        }
    }

    pub async fn pending_commands(&self) -> usize {
        self.commands.read().await.len()
    }

    /// Expire overdue commands and drop finished ones. Returns how many were
    /// expired.
    pub async fn sweep_expired(&self) -> usize {
        let mut commands = self.commands.write().await;
        let mut expired = 0;
        commands.retain(|_, command| {
            if command.state().is_terminal() {
                return false;
            }
            if command.is_expired() {
                command.expire();
                expired += 1;
                debug!(
                    conn_id = self.id,
                    comm_id = command.id(),
                    timeout_ms = command.timeout().as_millis() as u64,
                    "command expired"
                );
                return false;
            }
            true
        });
        expired
    }

    /// Run the read loop until the transport fails, the peer closes, or
    /// [`Conn::close`] is called.
    pub async fn listen(self: &Arc<Self>, mut stream: Box<dyn FrameStream>) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stopped(&mut stop_rx) => {
                    debug!(conn_id = self.id, "read loop stopped");
                    break;
                }
                frame = stream.next_frame() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.on_message(&frame).await {
                            warn!(conn_id = self.id, user = self.user().unwrap_or_default(), error = %e, "frame handling failed");
                        }
                    }
                    Some(Err(e)) => {
                        debug!(conn_id = self.id, error = %e, "transport read failed");
                        break;
                    }
                    None => {
                        debug!(conn_id = self.id, "peer closed transport");
                        break;
                    }
                },
            }
        }
    }

    /// Close the transport, stop the read loop, and abort pending commands.
    ///
    /// Fails if the connection was already closed.
    pub async fn close(&self) -> IntercomResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(IntercomError::Closed);
        }
        self.stop_tx.send_replace(true);

        if let Err(e) = self.sink.lock().await.close().await {
            debug!(conn_id = self.id, error = %e, "transport close failed");
        }

        let mut commands = self.commands.write().await;
        let aborted = commands
            .drain()
            .filter(|(_, command)| command.abort())
            .count();
        if aborted > 0 {
            debug!(conn_id = self.id, aborted, "aborted pending commands");
        }
        Ok(())
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::command::CommandState;
    use crate::transport::memory::{self, MemoryPeer};
    use intercom_core::codec::{register_frame, response_frame};

    fn conn(manager: &Arc<ConnManager>) -> (Arc<Conn>, MemoryPeer) {
        let (sink, _stream, peer) = memory::pair();
        let conn = Arc::new(Conn::new(
            manager.next_conn_id(),
            Box::new(sink),
            manager.clone(),
            None,
        ));
        (conn, peer)
    }

    #[tokio::test]
    async fn register_envelope_binds_user() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        c.on_message(&register_frame("alice", "evt").unwrap()).await.unwrap();

        assert_eq!(c.user(), Some("alice"));
        assert_eq!(c.event(), Some("evt"));
        assert!(manager.has_user("alice").await.unwrap());
    }

    #[tokio::test]
    async fn register_goes_through_token_callback() {
        let manager = Arc::new(ConnManager::new());
        let (sink, _stream, _peer) = memory::pair();
        let resolve: AuthTokenFn =
            Arc::new(|token: &str| (token == "tok-a").then(|| "alice".to_string()));
        let c = Arc::new(Conn::new(
            manager.next_conn_id(),
            Box::new(sink),
            manager.clone(),
            Some(resolve),
        ));

        let err = c.register("tok-b", "").await.unwrap_err();
        assert!(matches!(err, IntercomError::Unauthorized(_)));
        assert!(c.user().is_none());

        c.register("tok-a", "").await.unwrap();
        assert_eq!(c.user(), Some("alice"));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_counted() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        c.on_message(b"{definitely not json").await.unwrap();
        c.on_message(br#"{"Kind":42,"Body":""}"#).await.unwrap();
        c.on_message(br#"{"Kind":255,"Body":"not a payload"}"#).await.unwrap();
        assert_eq!(c.dropped_frames(), 3);
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn response_completes_pending_command() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);
        manager.bind("alice", &c).await.unwrap();

        let command = c
            .new_command("c1", "hello", Duration::from_secs(5))
            .await
            .unwrap();
        c.on_message(&response_frame("c1", "hi").unwrap()).await.unwrap();

        assert_eq!(command.response().unwrap().msg, "hi");
        // A duplicate answer is not an error.
        c.on_message(&response_frame("c1", "again").unwrap()).await.unwrap();
        assert_eq!(command.response().unwrap().msg, "hi");
    }

    #[tokio::test]
    async fn response_requires_registration() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        let err = c
            .on_message(&response_frame("c1", "hi").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IntercomError::NotRegistered));
    }

    #[tokio::test]
    async fn response_for_unknown_command_fails() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);
        manager.bind("alice", &c).await.unwrap();

        let err = c
            .on_message(&response_frame("gone", "hi").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IntercomError::NoSuchCommand(id) if id == "gone"));
    }

    #[tokio::test]
    async fn write_reaches_peer_until_closed() {
        let manager = Arc::new(ConnManager::new());
        let (c, mut peer) = conn(&manager);

        c.write(b"one").await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), b"one");

        c.close().await.unwrap();
        assert!(matches!(c.write(b"two").await, Err(IntercomError::Closed)));
    }

    #[tokio::test]
    async fn second_close_fails() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        c.close().await.unwrap();
        assert!(matches!(c.close().await, Err(IntercomError::Closed)));
    }

    #[tokio::test]
    async fn close_aborts_pending_commands() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);
        manager.bind("alice", &c).await.unwrap();

        let command = c
            .new_command("c1", "hello", Duration::from_secs(5))
            .await
            .unwrap();
        c.close().await.unwrap();

        assert_eq!(command.state(), CommandState::Disconnected);
        assert_eq!(c.pending_commands().await, 0);
        assert!(matches!(
            c.new_command("c2", "hello", Duration::from_secs(5)).await,
            Err(IntercomError::Closed)
        ));
    }

    #[tokio::test]
    async fn sweep_expires_overdue_commands() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        let overdue = c.new_command("old", "x", Duration::ZERO).await.unwrap();
        let fresh = c.new_command("new", "y", Duration::from_secs(60)).await.unwrap();

        assert_eq!(c.sweep_expired().await, 1);
        assert_eq!(overdue.state(), CommandState::TimedOut);
        assert_eq!(fresh.state(), CommandState::Pending);
        assert!(c.lookup_command("old").await.is_none());
        assert!(c.lookup_command("new").await.is_some());
    }

    #[tokio::test]
    async fn remove_exact_leaves_reused_id_alone() {
        let manager = Arc::new(ConnManager::new());
        let (c, _peer) = conn(&manager);

        let stale = c.new_command("c1", "a", Duration::ZERO).await.unwrap();
        assert_eq!(c.sweep_expired().await, 1);
        let newer = c.new_command("c1", "b", Duration::from_secs(60)).await.unwrap();

        assert!(!c.remove_exact(&stale).await);
        let current = c.lookup_command("c1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &newer));

        assert!(c.remove_exact(&newer).await);
        assert!(c.lookup_command("c1").await.is_none());
    }

    #[tokio::test]
    async fn listen_survives_garbage_and_stops_on_close() {
        let manager = Arc::new(ConnManager::new());
        let (sink, stream, peer) = memory::pair();
        let c = Arc::new(Conn::new(
            manager.next_conn_id(),
            Box::new(sink),
            manager.clone(),
            None,
        ));

        let reader = {
            let c = c.clone();
            tokio::spawn(async move { c.listen(Box::new(stream)).await })
        };

        peer.send("garbage");
        peer.send(register_frame("alice", "").unwrap());

        for _ in 0..100 {
            if c.user().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(c.user(), Some("alice"));
        assert_eq!(c.dropped_frames(), 1);

        c.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn listen_ends_on_transport_error() {
        let manager = Arc::new(ConnManager::new());
        let (sink, stream, peer) = memory::pair();
        let c = Arc::new(Conn::new(
            manager.next_conn_id(),
            Box::new(sink),
            manager.clone(),
            None,
        ));

        peer.fail("connection reset");
        tokio::time::timeout(Duration::from_secs(1), c.listen(Box::new(stream)))
            .await
            .unwrap();
        assert!(!c.is_closed());
    }
}
