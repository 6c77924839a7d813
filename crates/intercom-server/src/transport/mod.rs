//! Frame transport seen by a relay connection.
//!
//! A transport is split into a sink (send one frame, close once) and a
//! stream (receive the next frame). The relay never looks at framing details
//! beyond these operations.

#[cfg(test)]
pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use intercom_core::IntercomResult;

/// Sending half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send_frame(&mut self, frame: &[u8]) -> IntercomResult<()>;

    /// Close the transport.
    async fn close(&mut self) -> IntercomResult<()>;
}

/// Receiving half of a transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Wait for the next frame. `None` means the peer closed the transport.
    async fn next_frame(&mut self) -> Option<IntercomResult<Vec<u8>>>;
}
