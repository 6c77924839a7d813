//! User -> connection registry.
//!
//! Holds at most one live connection per user id. Every operation takes the
//! registry lock only long enough to resolve a connection; command-map work
//! then happens under that connection's own lock.

use super::command::CommObject;
use super::conn::{Conn, ConnId};
use intercom_core::{IntercomError, IntercomResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of connected users.
pub struct ConnManager {
    users: RwLock<HashMap<String, Arc<Conn>>>,
    /// Monotonic connection ID counter.
    next_conn_id: AtomicU64,
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnManager {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted connection.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind `user_id` to `conn`.
    ///
    /// Fails if the user is already bound, or if the connection is closed or
    /// already bound to some user.
    pub async fn bind(&self, user_id: &str, conn: &Arc<Conn>) -> IntercomResult<()> {
        if user_id.is_empty() {
            return Err(IntercomError::InvalidArgument("user id can't be empty".into()));
        }

        let mut users = self.users.write().await;
        if conn.is_closed() {
            return Err(IntercomError::Closed);
        }
        let slot = match users.entry(user_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(IntercomError::AlreadyRegistered(user_id.to_string()));
            }
            Entry::Vacant(slot) => slot,
        };
        if !conn.stamp_user(user_id) {
            return Err(IntercomError::AlreadyBound(
                conn.user().unwrap_or_default().to_string(),
            ));
        }
        slot.insert(Arc::clone(conn));

        info!(user = %user_id, conn_id = conn.id(), "user bound");
        Ok(())
    }

    /// Remove the binding that points at `conn`.
    ///
    /// A connection that never registered is a no-op. A connection whose user
    /// is now bound to a different connection cannot unbind it.
    pub async fn unbind(&self, conn: &Conn) -> IntercomResult<()> {
        let Some(user_id) = conn.user() else {
            return Ok(());
        };

        let mut users = self.users.write().await;
        match users.get(user_id) {
            Some(bound) if bound.id() == conn.id() => {
                users.remove(user_id);
                debug!(user = %user_id, conn_id = conn.id(), "user unbound");
                Ok(())
            }
            Some(bound) => {
                debug!(
                    user = %user_id,
                    conn_id = conn.id(),
                    bound_conn_id = bound.id(),
                    "refusing stale unbind"
                );
                Err(IntercomError::NotOwner(user_id.to_string()))
            }
            None => Err(IntercomError::NoSuchUser(user_id.to_string())),
        }
    }

    /// Whether `user_id` currently has a live binding.
    pub async fn has_user(&self, user_id: &str) -> IntercomResult<bool> {
        if user_id.is_empty() {
            return Err(IntercomError::InvalidArgument("user id can't be empty".into()));
        }
        Ok(self.users.read().await.contains_key(user_id))
    }

    /// The connection bound to `user_id`.
    pub async fn connection_for(&self, user_id: &str) -> IntercomResult<Arc<Conn>> {
        if user_id.is_empty() {
            return Err(IntercomError::InvalidArgument("user id can't be empty".into()));
        }
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| IntercomError::NoSuchUser(user_id.to_string()))
    }

    /// Create a command on the connection bound to `user_id`.
    pub async fn new_command(
        &self,
        user_id: &str,
        comm_id: &str,
        message: &str,
        timeout: Duration,
    ) -> IntercomResult<Arc<CommObject>> {
        if comm_id.is_empty() {
            return Err(IntercomError::InvalidArgument("command id can't be empty".into()));
        }
        let conn = self.connection_for(user_id).await?;
        conn.new_command(comm_id, message, timeout).await
    }

    /// Look up a command. `Ok(None)` means the user is connected but has no
    /// such command.
    pub async fn lookup_command(
        &self,
        user_id: &str,
        comm_id: &str,
    ) -> IntercomResult<Option<Arc<CommObject>>> {
        if comm_id.is_empty() {
            return Err(IntercomError::InvalidArgument("command id can't be empty".into()));
        }
        let conn = self.connection_for(user_id).await?;
        Ok(conn.lookup_command(comm_id).await)
    }

    /// Remove a command. Fails if the user or command does not exist.
    pub async fn remove_command(&self, user_id: &str, comm_id: &str) -> IntercomResult<()> {
        if comm_id.is_empty() {
            return Err(IntercomError::InvalidArgument("command id can't be empty".into()));
        }
        let conn = self.connection_for(user_id).await?;
        conn.remove_command(comm_id).await.map(|_| ())
    }

    /// All bound connections.
    pub async fn connections(&self) -> Vec<Arc<Conn>> {
        self.users.read().await.values().cloned().collect()
    }

    /// Number of bound users.
    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}
