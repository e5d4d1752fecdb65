//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// API requests total (counter, labels: name).
pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
/// API errors total (counter, labels: name, error_type).
pub const API_ERRORS_TOTAL: &str = "api_errors_total";
/// API handler duration seconds (histogram, labels: name).
pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";
/// Sync calls total (counter, labels: name).
pub const SYNC_REQUESTS_TOTAL: &str = "sync_requests_total";
/// Sync calls rejected before fanout (counter, labels: name).
pub const SYNC_ERRORS_TOTAL: &str = "sync_errors_total";
/// Recipients reached per sync call (histogram).
pub const SYNC_FANOUT_RECIPIENTS: &str = "sync_fanout_recipients";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Outbound frames dropped on a full queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Grace periods started (counter, labels: class).
pub const PRESENCE_GRACE_STARTED_TOTAL: &str = "presence_grace_started_total";
/// Grace periods that ran out (counter).
pub const PRESENCE_GRACE_EXPIRED_TOTAL: &str = "presence_grace_expired_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            API_REQUESTS_TOTAL,
            API_ERRORS_TOTAL,
            API_REQUEST_DURATION_SECONDS,
            SYNC_REQUESTS_TOTAL,
            SYNC_ERRORS_TOTAL,
            SYNC_FANOUT_RECIPIENTS,
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_SEND_DROPS_TOTAL,
            PRESENCE_GRACE_STARTED_TOTAL,
            PRESENCE_GRACE_EXPIRED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
