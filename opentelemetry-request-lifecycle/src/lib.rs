//! Request-scoped tracing and custom events for web services built on
//! [OpenTelemetry].
//!
//! Every inbound request gets exactly one server span. The span is begun when
//! the request enters the service, carries the request's annotations and
//! recorded failures, and is finalized once with a status derived from the
//! response, the error or cancellation. Custom events emitted while the
//! request runs are correlated with its trace.
//!
//! [OpenTelemetry]: https://opentelemetry.io
//!
//! # Getting started
//!
//! ```no_run
//! use opentelemetry_request_lifecycle::{telemetry, Dimensions, TelemetryConfig};
//!
//! // Reads OTEL_EXPORTER_OTLP_ENDPOINT, OTEL_SERVICE_NAME, OTEL_ENABLED, ...
//! let telemetry = telemetry::init(TelemetryConfig::from_env());
//!
//! // Wrap any `tower::Service<http::Request<B>>`.
//! let _layer = telemetry.layer();
//!
//! telemetry
//!     .emitter()
//!     .emit("page_view", Dimensions::new().with("page", "/home"), "INFO");
//!
//! telemetry.shutdown().expect("telemetry shut down cleanly");
//! ```
//!
//! Without an export destination [`telemetry::init`] returns disabled
//! telemetry: spans and events are no-ops and never fail.
//!
//! # Without global state
//!
//! [`SpanLifecycleController`], [`EventEmitter`] and [`RequestHooks`] can be
//! built from injected providers and sinks, see
//! [`Telemetry::from_providers`](telemetry::Telemetry::from_providers).
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod config;
mod error;
pub mod events;
pub mod hooks;
pub mod middleware;
pub mod span;
pub mod telemetry;

pub use config::{ConnectionString, Destination, TelemetryConfig};
pub use error::{TelemetryError, TelemetryResult};
pub use events::{EventEmitter, EventRecord, EventSeverity, EventSink, LoggerSink, NoopSink};
pub use hooks::RequestHooks;
pub use middleware::{RequestSpanLayer, RequestSpanService};
pub use span::{
    ContextCarrier, Dimensions, Failure, Outcome, OutcomeRecorder, Phase, SpanHandle,
    SpanLifecycleController, WorkId,
};
pub use telemetry::Telemetry;
