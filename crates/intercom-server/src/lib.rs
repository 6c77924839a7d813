//! intercom-server: push relay between HTTP callers and WebSocket clients.
//!
//! Clients hold a WebSocket open and register a user identity; callers POST a
//! message for a user and get back that client's correlated answer.

pub mod auth;
pub mod config;
pub mod http;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::ServerConfig;
pub use server::{IntercomServer, PushMode, PushOutcome};
