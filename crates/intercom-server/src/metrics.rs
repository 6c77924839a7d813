//! Prometheus metrics recorder and metric names.

use intercom_core::{IntercomError, IntercomResult};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the metrics endpoint. Call once at
/// startup, before any metric is recorded.
pub fn install_recorder() -> IntercomResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| IntercomError::Other(format!("failed to install metrics recorder: {e}")))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Accepted transport connections (counter).
pub const CONNECTIONS_TOTAL: &str = "intercom_connections_total";
/// Connections whose read loop is running (gauge).
pub const CONNECTIONS_ACTIVE: &str = "intercom_connections_active";
/// Registration attempts (counter, labels: outcome).
pub const REGISTRATIONS_TOTAL: &str = "intercom_registrations_total";
/// Frames dropped because they did not decode (counter).
pub const FRAMES_DROPPED_TOTAL: &str = "intercom_frames_dropped_total";
/// Responses that matched no pending command (counter).
pub const ORPHAN_RESPONSES_TOTAL: &str = "intercom_orphan_responses_total";
/// Push calls (counter, labels: outcome).
pub const PUSHES_TOTAL: &str = "intercom_pushes_total";
/// Commands removed by the expiry sweep (counter).
pub const COMMANDS_EXPIRED_TOTAL: &str = "intercom_commands_expired_total";
