//! Errors raised while wiring telemetry into a unit of work.
//!
//! Nothing in this crate lets these errors reach the unit of work itself:
//! span and event operations degrade to no-ops and only bootstrap and
//! shutdown return them to the caller.
use crate::span::WorkId;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

/// Errors reported by configuration, bootstrap and the context carrier.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    /// The tracer provider or exporter could not be configured. Telemetry
    /// keeps running in disabled mode.
    #[error("tracing unavailable: {0}")]
    TracingUnavailable(String),

    /// A span handle is already attached to this unit of work.
    #[error("a span is already attached to unit of work {0}")]
    DuplicateAttachment(WorkId),

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// An event sink failed to deliver a record.
    #[error("event sink failed: {0}")]
    Sink(String),

    /// Building an OTLP exporter failed.
    #[error(transparent)]
    Exporter(#[from] ExporterBuildError),

    /// The SDK failed to flush or shut down a provider.
    #[error(transparent)]
    Sdk(#[from] OTelSdkError),
}

/// Result alias used across the crate.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
