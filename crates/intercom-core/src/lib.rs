//! intercom-core: shared protocol library for the intercom push relay.
//!
//! Provides the JSON wire envelopes, the frame codec, and the error type used
//! by both the relay server and the load-generation CLI.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{body_decode, envelope_of, frame_decode, frame_encode};
pub use error::{IntercomError, IntercomResult};
pub use messages::{CommRequest, CommResponse, Envelope, Kind, RegisterMessage, USER_HEADER};
