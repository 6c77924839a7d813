//! Pluggable authentication and push-authorization policies.

pub mod policy;

pub use policy::{bearer_secret, token_table, AuthTokenFn, PushAuthFn};
