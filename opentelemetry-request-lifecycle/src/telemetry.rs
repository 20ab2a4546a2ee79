//! One-time telemetry bootstrap.
//!
//! [`init`] configures exporters, providers and the request span controller
//! exactly once per process. Without a destination everything it hands out is
//! a no-op, so applications can wire the hooks unconditionally.
use crate::config::{
    signal_endpoint, Destination, TelemetryConfig, LOGS_PATH, OTEL_EXPORTER_OTLP_ENDPOINT,
    TRACES_PATH,
};
use crate::error::{TelemetryError, TelemetryResult};
use crate::events::{EventEmitter, LoggerSink};
use crate::hooks::RequestHooks;
use crate::middleware::RequestSpanLayer;
use crate::span::{SpanLifecycleController, TRACER_NAME};
use opentelemetry::{global, otel_debug, otel_info, otel_warn};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static TELEMETRY: OnceLock<Telemetry> = OnceLock::new();

// Exporter and HTTP client crates must never feed their own diagnostics back
// into the log pipeline.
const BRIDGE_FILTER: &str = "info,opentelemetry=off,hyper=off,h2=off,tonic=off,reqwest=off";
const FMT_FILTER: &str = "info,opentelemetry=debug";

/// Initializes process-wide telemetry.
///
/// Only the first call configures anything; later calls return the same
/// instance and ignore `config`. Initialization never fails: missing
/// configuration or an exporter that cannot be built leaves telemetry in
/// disabled mode.
pub fn init(config: TelemetryConfig) -> &'static Telemetry {
    TELEMETRY.get_or_init(|| Telemetry::from_config(&config))
}

/// The instance created by [`init`], if it ran.
pub fn get() -> Option<&'static Telemetry> {
    TELEMETRY.get()
}

/// Providers and request instrumentation produced by [`init`].
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    controller: Arc<SpanLifecycleController>,
    emitter: EventEmitter,
}

impl Telemetry {
    fn from_config(config: &TelemetryConfig) -> Self {
        if !config.is_active() {
            otel_info!(
                name: "Telemetry.Disabled",
                enabled = config.is_enabled(),
                has_destination = config.destination().is_some()
            );
            return Self::disabled();
        }

        match Self::try_from_config(config) {
            Ok(telemetry) => {
                otel_info!(
                    name: "Telemetry.Initialized",
                    service_name = config.service_name().to_owned()
                );
                telemetry
            }
            Err(err) => {
                otel_warn!(name: "Telemetry.InitFailed", error = err.to_string());
                Self::disabled()
            }
        }
    }

    /// Builds OTLP exporters for `config` and installs the global propagator
    /// and tracer provider.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::TracingUnavailable`] if `config` is disabled
    /// or has no destination, and [`TelemetryError::Exporter`] if an exporter
    /// cannot be built.
    pub fn try_from_config(config: &TelemetryConfig) -> TelemetryResult<Self> {
        if !config.is_enabled() {
            return Err(TelemetryError::TracingUnavailable(
                "telemetry is disabled".into(),
            ));
        }
        let endpoint = match config.destination() {
            Some(Destination::Endpoint(endpoint)) => endpoint.as_str(),
            Some(Destination::ConnectionString(_)) => {
                return Err(TelemetryError::TracingUnavailable(format!(
                    "connection strings cannot be exported over OTLP, set {OTEL_EXPORTER_OTLP_ENDPOINT} instead"
                )))
            }
            None => {
                return Err(TelemetryError::TracingUnavailable(
                    "no export destination configured".into(),
                ))
            }
        };

        let resource = Resource::builder()
            .with_service_name(config.service_name().to_owned())
            .build();
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter(endpoint)?)
            .with_resource(resource.clone())
            .build();
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter(endpoint)?)
            .with_resource(resource)
            .build();

        global::set_text_map_propagator(TraceContextPropagator::new());
        global::set_tracer_provider(tracer_provider.clone());
        if config.install_subscriber() {
            install_subscriber(Some(&logger_provider));
        }

        Ok(Self::assemble(
            tracer_provider,
            logger_provider,
            config.tracer_name_owned(),
        ))
    }

    /// Wraps existing providers without touching any global state.
    pub fn from_providers(
        tracer_provider: SdkTracerProvider,
        logger_provider: SdkLoggerProvider,
    ) -> Self {
        Self::assemble(tracer_provider, logger_provider, Cow::Borrowed(TRACER_NAME))
    }

    fn assemble(
        tracer_provider: SdkTracerProvider,
        logger_provider: SdkLoggerProvider,
        tracer_name: Cow<'static, str>,
    ) -> Self {
        let controller = Arc::new(SpanLifecycleController::from_provider_named(
            &tracer_provider,
            tracer_name.clone(),
        ));
        let sink = LoggerSink::from_provider_named(&logger_provider, tracer_name);
        let emitter = EventEmitter::new(Arc::new(sink)).with_carrier(controller.carrier().clone());

        Telemetry {
            tracer_provider: Some(tracer_provider),
            logger_provider: Some(logger_provider),
            controller,
            emitter,
        }
    }

    /// Telemetry that records nothing.
    pub fn disabled() -> Self {
        let controller = Arc::new(SpanLifecycleController::disabled());
        let emitter = EventEmitter::noop().with_carrier(controller.carrier().clone());
        Telemetry {
            tracer_provider: None,
            logger_provider: None,
            controller,
            emitter,
        }
    }

    /// False when [`init`] fell back to disabled mode.
    pub fn is_enabled(&self) -> bool {
        self.controller.is_enabled()
    }

    /// The request span controller.
    pub fn controller(&self) -> &Arc<SpanLifecycleController> {
        &self.controller
    }

    /// The custom event emitter, correlated with the controller's spans.
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Hooks for frameworks not built on `tower`.
    pub fn hooks(&self) -> RequestHooks {
        RequestHooks::new(self.controller.clone())
    }

    /// Tower layer instrumenting every request of a service.
    pub fn layer(&self) -> RequestSpanLayer {
        RequestSpanLayer::new(self.controller.clone())
    }

    /// The tracer provider, absent in disabled mode.
    pub fn tracer_provider(&self) -> Option<&SdkTracerProvider> {
        self.tracer_provider.as_ref()
    }

    /// The logger provider, absent in disabled mode.
    pub fn logger_provider(&self) -> Option<&SdkLoggerProvider> {
        self.logger_provider.as_ref()
    }

    /// Exports everything buffered so far.
    pub fn force_flush(&self) -> TelemetryResult<()> {
        if let Some(provider) = &self.tracer_provider {
            provider.force_flush()?;
        }
        if let Some(provider) = &self.logger_provider {
            provider.force_flush()?;
        }
        Ok(())
    }

    /// Flushes and shuts down both providers. Spans begun afterwards are not
    /// exported.
    pub fn shutdown(&self) -> TelemetryResult<()> {
        let traces = self
            .tracer_provider
            .as_ref()
            .map_or(Ok(()), SdkTracerProvider::shutdown);
        let logs = self
            .logger_provider
            .as_ref()
            .map_or(Ok(()), SdkLoggerProvider::shutdown);
        traces?;
        logs?;
        Ok(())
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.is_enabled())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

fn span_exporter(endpoint: &str) -> TelemetryResult<SpanExporter> {
    Ok(SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, TRACES_PATH))
        .build()?)
}

fn log_exporter(endpoint: &str) -> TelemetryResult<LogExporter> {
    Ok(LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, LOGS_PATH))
        .build()?)
}

/// Installs the global `tracing` subscriber: a `fmt` layer filtered by
/// `RUST_LOG`, plus a bridge into `logger_provider` when one is given.
///
/// Returns false if a global subscriber was already set.
pub fn install_subscriber(logger_provider: Option<&SdkLoggerProvider>) -> bool {
    let fmt_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FMT_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(fmt_filter);
    let otel_layer = logger_provider.map(|provider| {
        OpenTelemetryTracingBridge::new(provider).with_filter(EnvFilter::new(BRIDGE_FILTER))
    });

    match tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            otel_debug!(name: "Telemetry.SubscriberAlreadySet", error = err.to_string());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Outcome, WorkId};
    use crate::Dimensions;
    use opentelemetry_sdk::logs::InMemoryLogExporter;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    #[test]
    fn disabled_config_yields_noop_telemetry() {
        let telemetry = Telemetry::from_config(&TelemetryConfig::new());
        assert!(!telemetry.is_enabled());
        assert!(telemetry.tracer_provider().is_none());

        let handle = telemetry
            .controller()
            .begin(WorkId::next(), "GET /", None);
        telemetry.emitter().page_view(Dimensions::new());
        assert!(telemetry.controller().finalize(&handle, Outcome::response(200)));
        telemetry.force_flush().unwrap();
        telemetry.shutdown().unwrap();
    }

    #[test]
    fn try_from_config_requires_destination() {
        let err = Telemetry::try_from_config(&TelemetryConfig::new()).unwrap_err();
        assert!(matches!(err, TelemetryError::TracingUnavailable(_)));

        let config = TelemetryConfig::new()
            .with_endpoint("http://localhost:4318")
            .with_enabled(false);
        assert!(Telemetry::try_from_config(&config).is_err());
    }

    #[test]
    fn connection_string_is_reported_unavailable() {
        let config = TelemetryConfig::new()
            .with_connection_string("InstrumentationKey=abc")
            .unwrap();
        assert!(config.is_active());

        let err = Telemetry::try_from_config(&config).unwrap_err();
        assert!(matches!(err, TelemetryError::TracingUnavailable(ref reason)
            if reason.contains(OTEL_EXPORTER_OTLP_ENDPOINT)));
        assert!(!Telemetry::from_config(&config).is_enabled());
    }

    #[test]
    fn from_providers_records_spans_and_events() {
        let span_exporter = InMemorySpanExporter::default();
        let log_exporter = InMemoryLogExporter::default();
        let telemetry = Telemetry::from_providers(
            SdkTracerProvider::builder()
                .with_simple_exporter(span_exporter.clone())
                .build(),
            SdkLoggerProvider::builder()
                .with_simple_exporter(log_exporter.clone())
                .build(),
        );
        assert!(telemetry.is_enabled());

        let work = WorkId::next();
        let handle = telemetry.controller().begin(work, "GET /home", None);
        telemetry.emitter().emit_for(
            work,
            "page_view",
            Dimensions::new().with("page", "/home"),
            crate::EventSeverity::Info,
        );
        telemetry
            .controller()
            .finalize(&handle, Outcome::response(200));
        telemetry.force_flush().unwrap();

        let spans = span_exporter.get_finished_spans().unwrap();
        let logs = log_exporter.get_emitted_logs().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(logs.len(), 1);
        assert_eq!(
            logs[0].record.trace_context().map(|tc| tc.trace_id),
            Some(spans[0].span_context.trace_id())
        );
        assert_eq!(logs[0].instrumentation.name(), TRACER_NAME);
        telemetry.shutdown().unwrap();
    }
}
