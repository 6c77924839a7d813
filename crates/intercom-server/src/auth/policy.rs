//! Policy callbacks consumed by the relay.
//!
//! The relay never decides who a client is or who may push; it asks these
//! callbacks. The binary builds them from the `[auth]` config section, and
//! embedders can supply their own closures.

use axum::http::{header, HeaderMap};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a registration token to a user id. `None` rejects the token.
pub type AuthTokenFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Decides whether a push request may proceed, given its headers.
pub type PushAuthFn = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Token lookup backed by a static table.
///
/// Returns `None` for an empty table so that tokens are used as user ids
/// directly.
pub fn token_table(tokens: HashMap<String, String>) -> Option<AuthTokenFn> {
    if tokens.is_empty() {
        return None;
    }
    Some(Arc::new(move |token: &str| tokens.get(token).cloned()))
}

/// Require `Authorization: Bearer <secret>` on push requests.
pub fn bearer_secret(secret: String) -> PushAuthFn {
    Arc::new(move |headers: &HeaderMap| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|given| given == secret)
    })
}
