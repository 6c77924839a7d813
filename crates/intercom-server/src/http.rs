//! HTTP surface: WebSocket upgrade, push, lookup, health, and metrics routes.

use crate::server::{IntercomServer, PushMode, PushOutcome};
use crate::transport::websocket;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use intercom_core::messages::{ErrorReply, LookupReply, PushAccepted, PushRequest};
use intercom_core::{IntercomError, USER_HEADER};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
struct AppState {
    server: Arc<IntercomServer>,
    metrics: Option<PrometheusHandle>,
}

/// Build the router for the configured paths.
pub fn router(server: Arc<IntercomServer>, metrics: Option<PrometheusHandle>) -> Router {
    let paths = server.config().paths.clone();
    let mut app = Router::new()
        .route(&paths.ws, get(ws_upgrade))
        .route(&paths.push, post(push))
        .route(&paths.lookup, get(lookup))
        .route(&paths.health, get(health));
    if metrics.is_some() {
        app = app.route(&paths.metrics, get(render_metrics));
    }
    app.with_state(AppState { server, metrics })
}

/// HTTP status for a relay error.
pub fn status_for(error: &IntercomError) -> StatusCode {
    match error {
        IntercomError::InvalidArgument(_) | IntercomError::Codec(_) => StatusCode::BAD_REQUEST,
        IntercomError::Unauthorized(_) => StatusCode::FORBIDDEN,
        IntercomError::NoSuchUser(_)
        | IntercomError::NoSuchCommand(_)
        | IntercomError::NotRegistered => StatusCode::NOT_FOUND,
        IntercomError::AlreadyRegistered(_)
        | IntercomError::AlreadyBound(_)
        | IntercomError::NotOwner(_)
        | IntercomError::DuplicateCommand(_) => StatusCode::CONFLICT,
        IntercomError::Transport(_) | IntercomError::Closed | IntercomError::Disconnected => {
            StatusCode::BAD_GATEWAY
        }
        IntercomError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        IntercomError::Config(_) | IntercomError::Io(_) | IntercomError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorReply {
            error: error.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for PushOutcome {
    fn into_response(self) -> Response {
        match self {
            PushOutcome::Answered(response) => (StatusCode::OK, Json(response)).into_response(),
            PushOutcome::Accepted(comm_id) => {
                (StatusCode::ACCEPTED, Json(PushAccepted { comm_id })).into_response()
            }
        }
    }
}

async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    // Resolve once and refuse early when the identity is already taken;
    // accept_as() re-checks under the registry lock.
    let mut header_user = None;
    if let Some(token) = header_token {
        let Some(user) = state.server.resolve_identity(token) else {
            return error_response(StatusCode::FORBIDDEN, "identity rejected");
        };
        if state.server.lookup(&user).await.unwrap_or(false) {
            return error_response(
                StatusCode::CONFLICT,
                IntercomError::AlreadyRegistered(user),
            );
        }
        header_user = Some(user);
    }

    let server = state.server.clone();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = websocket::split(socket);
        if let Err(e) = server
            .accept_as(Box::new(sink), Box::new(stream), header_user)
            .await
        {
            warn!(error = %e, "rejected websocket connection");
        }
    })
}

async fn push(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !state.server.authorize_push(&headers) {
        return error_response(
            StatusCode::FORBIDDEN,
            IntercomError::Unauthorized("push not authorized".into()),
        );
    }

    let request: PushRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, IntercomError::from(e)),
    };
    let mode = if request.is_async {
        PushMode::FireAndForget
    } else {
        PushMode::Wait(state.server.config().push_timeout)
    };

    match state
        .server
        .push(&request.user_id, &request.comm_id, &request.message, mode)
        .await
    {
        Ok(outcome) => outcome.into_response(),
        Err(e) => {
            debug!(user = %request.user_id, error = %e, "push failed");
            error_response(status_for(&e), e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    #[serde(default)]
    user: String,
}

async fn lookup(State(state): State<AppState>, Query(query): Query<LookupQuery>) -> Response {
    match state.server.lookup(&query.user).await {
        Ok(online) => Json(LookupReply {
            user_id: query.user,
            online,
        })
        .into_response(),
        Err(e) => error_response(status_for(&e), e),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
