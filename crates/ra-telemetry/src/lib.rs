//! Observability for the agent runtime.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus and JSON export
//! - **Tracing**: span helpers that stamp agent id, execution id and trace id
//!   on everything logged inside an execution

pub mod logging;
pub mod metrics;
pub mod tracing_setup;
