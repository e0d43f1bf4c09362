//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Sessions admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Sessions removed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live sessions (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Session lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound events dropped on a full or closed channel (counter).
pub const WS_OUTBOUND_DROPS_TOTAL: &str = "ws_outbound_drops_total";
/// Inbound events handled (counter, labels: event_type).
pub const RELAY_EVENTS_ROUTED_TOTAL: &str = "relay_events_routed_total";
/// Inbound events rejected (counter, labels: error).
pub const RELAY_ROUTE_ERRORS_TOTAL: &str = "relay_route_errors_total";
/// User turns published to the worker queue (counter).
pub const RELAY_TURNS_DISPATCHED_TOTAL: &str = "relay_turns_dispatched_total";
/// Queue messages applied and acknowledged (counter, labels: queue).
pub const QUEUE_MESSAGES_PROCESSED_TOTAL: &str = "queue_messages_processed_total";
/// Queue messages left for redelivery (counter, labels: queue).
pub const QUEUE_MESSAGES_FAILED_TOTAL: &str = "queue_messages_failed_total";
/// Dead-lettered messages dropped because they can never apply (counter, labels: queue).
pub const QUEUE_MESSAGES_DISCARDED_TOTAL: &str = "queue_messages_discarded_total";
/// Final flushes that failed after all retries (counter).
pub const SESSION_FLUSH_FAILURES_TOTAL: &str = "session_flush_failures_total";
