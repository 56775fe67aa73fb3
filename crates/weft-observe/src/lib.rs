//! Observability setup for weft: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
