//! One pushed request awaiting its correlated response.
//!
//! A command starts `Pending` and moves exactly once to a terminal state:
//! `Completed` when the client answers, `TimedOut` when its deadline passes,
//! or `Disconnected` when the owning connection closes first. The state lives
//! in a `watch` channel so that the first transition wins atomically and a
//! waiter arriving after the transition sees it immediately.

use intercom_core::{CommRequest, CommResponse, IntercomError, IntercomResult};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lifecycle of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Completed(CommResponse),
    TimedOut,
    Disconnected,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Pending)
    }
}

/// An in-flight push scoped to one connection.
#[derive(Debug)]
pub struct CommObject {
    id: String,
    request: CommRequest,
    created_at: Instant,
    timeout: Duration,
    state: watch::Sender<CommandState>,
}

impl CommObject {
    pub fn new(id: String, request: CommRequest, timeout: Duration) -> Self {
        let (state, _) = watch::channel(CommandState::Pending);
        Self {
            id,
            request,
            created_at: Instant::now(),
            timeout,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &CommRequest {
        &self.request
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> CommandState {
        self.state.borrow().clone()
    }

    /// The client's answer, once completed.
    pub fn response(&self) -> Option<CommResponse> {
        match &*self.state.borrow() {
            CommandState::Completed(response) => Some(response.clone()),
            _ => None,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.timeout
    }

    /// Store the response and fire the completion signal.
    ///
    /// Returns `false` if the command already reached a terminal state.
    pub fn complete(&self, response: CommResponse) -> bool {
        self.transition(CommandState::Completed(response))
    }

    /// Mark the command timed out. Returns `false` if it already finished.
    pub fn expire(&self) -> bool {
        self.transition(CommandState::TimedOut)
    }

    /// Mark the command abandoned by its connection. Returns `false` if it
    /// already finished.
    pub fn abort(&self) -> bool {
        self.transition(CommandState::Disconnected)
    }

    fn transition(&self, next: CommandState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == CommandState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the command finishes or its deadline passes.
    ///
    /// If the deadline passes, the command is expired; a response that won
    /// the race is still returned.
    pub async fn wait(&self) -> IntercomResult<CommResponse> {
        let mut rx = self.state.subscribe();
        let remaining = self.timeout.saturating_sub(self.created_at.elapsed());
        let finished = tokio::time::timeout(remaining, rx.wait_for(CommandState::is_terminal))
            .await
            .is_ok();
        if !finished {
            self.expire();
        }

        let state = self.state();
        match state {
            CommandState::Completed(response) => Ok(response),
            CommandState::Disconnected => Err(IntercomError::Disconnected),
            CommandState::TimedOut | CommandState::Pending => Err(IntercomError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn command(timeout: Duration) -> Arc<CommObject> {
        Arc::new(CommObject::new(
            "c1".into(),
            CommRequest {
                id: "c1".into(),
                msg: "hello".into(),
            },
            timeout,
        ))
    }

    fn response(msg: &str) -> CommResponse {
        CommResponse {
            id: "c1".into(),
            msg: msg.into(),
        }
    }

    #[tokio::test]
    async fn completion_before_wait_is_observed() {
        let cmd = command(Duration::from_secs(5));
        assert!(cmd.complete(response("hi")));

        let got = cmd.wait().await.unwrap();
        assert_eq!(got.msg, "hi");
    }

    #[tokio::test]
    async fn completion_unblocks_waiter() {
        let cmd = command(Duration::from_secs(5));
        let waiter = {
            let cmd = cmd.clone();
            tokio::spawn(async move { cmd.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cmd.complete(response("hi")));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.msg, "hi");
    }

    #[test]
    fn second_completion_is_a_no_op() {
        let cmd = command(Duration::from_secs(5));
        assert!(cmd.complete(response("first")));
        assert!(!cmd.complete(response("second")));
        assert!(!cmd.abort());
        assert_eq!(cmd.response().unwrap().msg, "first");
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let cmd = command(Duration::from_millis(30));
        let started = Instant::now();
        let err = cmd.wait().await.unwrap_err();
        assert!(matches!(err, IntercomError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(cmd.state(), CommandState::TimedOut);

        // A late answer is ignored.
        assert!(!cmd.complete(response("late")));
        assert!(cmd.response().is_none());
    }

    #[tokio::test]
    async fn abort_wakes_waiter_with_disconnect() {
        let cmd = command(Duration::from_secs(5));
        let waiter = {
            let cmd = cmd.clone();
            tokio::spawn(async move { cmd.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cmd.abort());

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, IntercomError::Disconnected));
    }

    #[test]
    fn expiry_tracks_deadline() {
        let cmd = command(Duration::ZERO);
        assert!(cmd.is_expired());
        assert!(!command(Duration::from_secs(60)).is_expired());
    }
}
