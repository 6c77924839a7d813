//! Push relay: user registry, per-connection state, and command correlation.

pub mod command;
pub mod conn;
pub mod registry;

pub use command::{CommObject, CommandState};
pub use conn::{Conn, ConnId};
pub use registry::ConnManager;
