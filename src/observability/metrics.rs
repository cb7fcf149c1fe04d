//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define pipeline and connection metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `sluice_connections_total` (counter): accepted connections
//! - `sluice_active_connections` (gauge): current connection count
//! - `sluice_events_total` (counter): events by direction (`in`, `out`)
//! - `sluice_suspensions_total` (counter): stages that returned pending
//! - `sluice_backpressure_overflows_total` (counter): connections closed by overflow
//! - `sluice_protocol_violations_total` (counter): malformed sequences seen by stages
//! - `sluice_bridge_defects_total` (counter): bridge misuse by reason
//! - `sluice_stage_messages_total` (counter): messages seen by `count` stages
//! - `sluice_config_reloads_total` (counter): reload attempts by outcome
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened() {
    ::metrics::counter!("sluice_connections_total").increment(1);
    ::metrics::gauge!("sluice_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    ::metrics::gauge!("sluice_active_connections").decrement(1.0);
}

pub fn record_event(direction: &'static str) {
    ::metrics::counter!("sluice_events_total", "direction" => direction).increment(1);
}

pub fn record_suspension() {
    ::metrics::counter!("sluice_suspensions_total").increment(1);
}

pub fn record_backpressure_overflow() {
    ::metrics::counter!("sluice_backpressure_overflows_total").increment(1);
}

pub fn record_protocol_violation() {
    ::metrics::counter!("sluice_protocol_violations_total").increment(1);
}

pub fn record_bridge_defect(reason: &'static str) {
    ::metrics::counter!("sluice_bridge_defects_total", "reason" => reason).increment(1);
}

pub fn record_stage_message(counter: &str) {
    ::metrics::counter!("sluice_stage_messages_total", "counter" => counter.to_string())
        .increment(1);
}

pub fn record_reload(outcome: &'static str) {
    ::metrics::counter!("sluice_config_reloads_total", "outcome" => outcome).increment(1);
}
