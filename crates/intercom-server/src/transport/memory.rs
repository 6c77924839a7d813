//! In-process transport backed by unbounded channels, for tests.

use super::{FrameSink, FrameStream};
use async_trait::async_trait;
use intercom_core::{IntercomError, IntercomResult};
use tokio::sync::mpsc;

pub struct MemorySink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: bool,
}

pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<IntercomResult<Vec<u8>>>,
}

/// The client side of a memory transport.
pub struct MemoryPeer {
    to_conn: mpsc::UnboundedSender<IntercomResult<Vec<u8>>>,
    from_conn: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn pair() -> (MemorySink, MemoryStream, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemorySink {
            tx: out_tx,
            closed: false,
        },
        MemoryStream { rx: in_rx },
        MemoryPeer {
            to_conn: in_tx,
            from_conn: out_rx,
        },
    )
}

impl MemoryPeer {
    pub fn send(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.to_conn.send(Ok(frame.into()));
    }

    /// Make the connection's next read fail.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_conn
            .send(Err(IntercomError::Transport(reason.to_string())));
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_conn.recv().await
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: &[u8]) -> IntercomResult<()> {
        if self.closed {
            return Err(IntercomError::Transport("memory transport closed".into()));
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| IntercomError::Transport("memory peer gone".into()))
    }

    async fn close(&mut self) -> IntercomResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<IntercomResult<Vec<u8>>> {
        self.rx.recv().await
    }
}
