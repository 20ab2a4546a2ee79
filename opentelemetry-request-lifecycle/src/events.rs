//! Custom events and structured logs.
//!
//! [`EventEmitter`] fires named events with a severity and a property map to
//! an injected [`EventSink`]. Emission is best effort: it never returns an
//! error and never panics because of a sink failure.
use crate::error::TelemetryResult;
use crate::span::{
    instrumentation_scope, ContextCarrier, Dimensions, Failure, WorkId, EVENT_NAME, TRACE_ID,
    TRACER_NAME,
};
use opentelemetry::logs::{AnyValue, LogRecord, Logger, LoggerProvider, Severity};
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceId};
use opentelemetry::{otel_debug, Array, Context, KeyValue, Value};
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Event name used by [`EventEmitter::page_view`].
pub const PAGE_VIEW: &str = "page_view";
/// Event name used by [`EventEmitter::track_api_call`].
pub const API_CALL: &str = "api_call";

/// Severity of an event, ordered from least to most severe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventSeverity {
    /// Finest-grained diagnostics.
    Trace,
    /// Diagnostics for developers.
    Debug,
    /// Normal operation, the default.
    #[default]
    Info,
    /// Something unexpected that was handled.
    Warning,
    /// An operation failed.
    Error,
    /// The service cannot continue normally.
    Critical,
}

impl EventSeverity {
    /// Parses a severity name case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let severity = match name.trim().to_ascii_uppercase().as_str() {
            "TRACE" => EventSeverity::Trace,
            "DEBUG" => EventSeverity::Debug,
            "INFO" => EventSeverity::Info,
            "WARNING" => EventSeverity::Warning,
            "ERROR" => EventSeverity::Error,
            "CRITICAL" => EventSeverity::Critical,
            _ => return None,
        };
        Some(severity)
    }

    /// Parses a severity name, falling back to `INFO` for unknown names.
    pub fn parse_lossy(name: &str) -> Self {
        Self::from_name(name).unwrap_or_default()
    }

    /// Upper-case name, e.g. `WARNING`.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Trace => "TRACE",
            EventSeverity::Debug => "DEBUG",
            EventSeverity::Info => "INFO",
            EventSeverity::Warning => "WARNING",
            EventSeverity::Error => "ERROR",
            EventSeverity::Critical => "CRITICAL",
        }
    }

    /// The OpenTelemetry log severity number.
    pub const fn to_otel(self) -> Severity {
        match self {
            EventSeverity::Trace => Severity::Trace,
            EventSeverity::Debug => Severity::Debug,
            EventSeverity::Info => Severity::Info,
            EventSeverity::Warning => Severity::Warn,
            EventSeverity::Error => Severity::Error,
            EventSeverity::Critical => Severity::Fatal,
        }
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event or log line handed to a sink.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    /// Event name, absent for plain log lines.
    pub name: Option<String>,
    /// Severity of the record.
    pub severity: EventSeverity,
    /// `CustomEvent: {name}` for events, the message for log lines.
    pub body: String,
    /// Reserved keys first, then caller properties.
    pub attributes: Vec<KeyValue>,
    /// Trace the record was emitted in, if any.
    pub trace_id: Option<TraceId>,
}

impl EventRecord {
    /// Looks up the attribute stored under `key`.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// Destination of event records.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Delivers one record. Errors are swallowed by the emitter.
    fn emit(&self, record: EventRecord) -> TelemetryResult<()>;
}

/// Sink that drops every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _record: EventRecord) -> TelemetryResult<()> {
        Ok(())
    }
}

/// Sink writing records as OpenTelemetry log records.
///
/// The trace context of the record is taken from the current [`Context`] by
/// the logger, so correlation works for any logger that honours it.
pub struct LoggerSink<L> {
    logger: L,
}

impl<L: Logger> LoggerSink<L> {
    /// Creates a sink writing to `logger`.
    pub fn new(logger: L) -> Self {
        LoggerSink { logger }
    }
}

impl LoggerSink<SdkLogger> {
    /// Creates a sink from an SDK logger provider.
    pub fn from_provider(provider: &SdkLoggerProvider) -> Self {
        Self::from_provider_named(provider, TRACER_NAME)
    }

    /// Like [`from_provider`](Self::from_provider), with a custom
    /// instrumentation scope name.
    pub fn from_provider_named(
        provider: &SdkLoggerProvider,
        logger_name: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(provider.logger_with_scope(instrumentation_scope(logger_name)))
    }
}

impl<L> EventSink for LoggerSink<L>
where
    L: Logger + Send + Sync,
{
    fn emit(&self, record: EventRecord) -> TelemetryResult<()> {
        let now = SystemTime::now();
        let mut log_record = self.logger.create_log_record();
        log_record.set_timestamp(now);
        log_record.set_observed_timestamp(now);
        log_record.set_severity_number(record.severity.to_otel());
        log_record.set_severity_text(record.severity.as_str().into());
        log_record.set_body(AnyValue::from(record.body));
        for kv in record.attributes {
            log_record.add_attribute(kv.key, to_any_value(kv.value));
        }
        self.logger.emit(log_record);
        Ok(())
    }
}

fn to_any_value(value: Value) -> AnyValue {
    match value {
        Value::Bool(b) => AnyValue::Boolean(b),
        Value::I64(i) => AnyValue::Int(i),
        Value::F64(f) => AnyValue::Double(f),
        Value::String(s) => AnyValue::String(s),
        Value::Array(Array::Bool(values)) => values.into_iter().collect(),
        Value::Array(Array::I64(values)) => values.into_iter().collect(),
        Value::Array(Array::F64(values)) => values.into_iter().collect(),
        Value::Array(Array::String(values)) => values.into_iter().collect(),
        other => AnyValue::String(other.to_string().into()),
    }
}

impl<L> fmt::Debug for LoggerSink<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerSink").finish_non_exhaustive()
    }
}

/// Fire-and-forget emitter of custom events and structured logs.
///
/// Records are stamped with the trace id of the span active in the current
/// [`Context`]. [`emit_for`](Self::emit_for) correlates with the span of a
/// given unit of work instead; the carrier is only read, never modified.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    carrier: Option<Arc<ContextCarrier>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

impl EventEmitter {
    /// Creates an emitter delivering to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        EventEmitter {
            sink,
            carrier: None,
        }
    }

    /// An emitter dropping every record.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Lets [`emit_for`](Self::emit_for) look up spans in `carrier`.
    pub fn with_carrier(mut self, carrier: Arc<ContextCarrier>) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Emits a custom event. Unknown severity names resolve to `INFO`.
    pub fn emit(&self, name: &str, properties: Dimensions, severity: &str) {
        self.emit_with(name, properties, EventSeverity::parse_lossy(severity));
    }

    /// Emits a custom event with a typed severity.
    pub fn emit_with(&self, name: &str, properties: Dimensions, severity: EventSeverity) {
        let span_context = current_span_context();
        self.dispatch(event_record(name, properties, severity, &span_context));
    }

    /// Emits a custom event correlated with the span of `work`.
    ///
    /// Falls back to the current context when no span is attached to `work`.
    pub fn emit_for(
        &self,
        work: WorkId,
        name: &str,
        properties: Dimensions,
        severity: EventSeverity,
    ) {
        let handle = self
            .carrier
            .as_ref()
            .and_then(|carrier| carrier.retrieve(work));
        match handle {
            Some(handle) => {
                let span_context = handle.span_context();
                let _guard = handle.context().clone().attach();
                self.dispatch(event_record(name, properties, severity, &span_context));
            }
            None => self.emit_with(name, properties, severity),
        }
    }

    /// Emits a plain log line with contextual dimensions.
    pub fn log(&self, severity: EventSeverity, message: impl Into<String>, dimensions: Dimensions) {
        let span_context = current_span_context();
        let trace_id = valid_trace_id(&span_context);
        let system = trace_id
            .map(|id| vec![KeyValue::new(TRACE_ID, id.to_string())])
            .unwrap_or_default();
        self.dispatch(EventRecord {
            name: None,
            severity,
            body: message.into(),
            attributes: dimensions.merge_under(system),
            trace_id,
        });
    }

    /// Logs `message` at `TRACE`.
    pub fn trace(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Trace, message, dimensions);
    }

    /// Logs `message` at `DEBUG`.
    pub fn debug(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Debug, message, dimensions);
    }

    /// Logs `message` at `INFO`.
    pub fn info(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Info, message, dimensions);
    }

    /// Logs `message` at `WARNING`.
    pub fn warning(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Warning, message, dimensions);
    }

    /// Logs `message` at `ERROR`.
    pub fn error(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Error, message, dimensions);
    }

    /// Logs `message` at `CRITICAL`.
    pub fn critical(&self, message: impl Into<String>, dimensions: Dimensions) {
        self.log(EventSeverity::Critical, message, dimensions);
    }

    /// Logs `message` at `ERROR` together with the type and message of
    /// `error`.
    pub fn exception<E>(&self, message: impl Into<String>, error: &E, dimensions: Dimensions)
    where
        E: fmt::Display + ?Sized,
    {
        let mut dimensions = dimensions;
        dimensions.extend(Failure::from_error(error).attributes().into());
        self.log(EventSeverity::Error, message, dimensions);
    }

    /// Emits a `page_view` event.
    pub fn page_view(&self, properties: Dimensions) {
        self.page_view_named(PAGE_VIEW, properties);
    }

    /// Emits a page view under a custom event name, e.g. `checkout_view`.
    pub fn page_view_named(&self, name: &str, properties: Dimensions) {
        self.emit_with(name, properties, EventSeverity::Info);
    }

    /// Emits a `user_action_{action}` event.
    ///
    /// `properties` may replace `action_type` and `action_name`, but never
    /// the `user_id` given here.
    pub fn track_user_action(&self, action: &str, user_id: Option<&str>, properties: Dimensions) {
        let mut dimensions = Dimensions::new()
            .with("action_type", "user_action")
            .with("action_name", action.to_owned());
        dimensions.extend(properties);
        if let Some(user_id) = user_id.filter(|id| !id.is_empty()) {
            dimensions.insert("user_id", user_id.to_owned());
        }
        self.emit_with(
            &format!("user_action_{action}"),
            dimensions,
            EventSeverity::Info,
        );
    }

    /// Emits an `api_call` event.
    pub fn track_api_call(
        &self,
        endpoint: &str,
        method: &str,
        status_code: u16,
        properties: Dimensions,
    ) {
        let mut dimensions = Dimensions::new()
            .with("endpoint", endpoint.to_owned())
            .with("method", method.to_owned())
            .with("status_code", i64::from(status_code));
        dimensions.extend(properties);
        self.emit_with(API_CALL, dimensions, EventSeverity::Info);
    }

    fn dispatch(&self, record: EventRecord) {
        if let Err(err) = self.sink.emit(record) {
            otel_debug!(name: "EventEmitter.EmitFailed", error = err.to_string());
        }
    }
}

fn current_span_context() -> SpanContext {
    Context::map_current(|cx| cx.span().span_context().clone())
}

fn valid_trace_id(span_context: &SpanContext) -> Option<TraceId> {
    span_context
        .is_valid()
        .then(|| span_context.trace_id())
}

fn event_record(
    name: &str,
    properties: Dimensions,
    severity: EventSeverity,
    span_context: &SpanContext,
) -> EventRecord {
    let trace_id = valid_trace_id(span_context);
    let mut system = vec![KeyValue::new(EVENT_NAME, name.to_owned())];
    if let Some(id) = trace_id {
        system.push(KeyValue::new(TRACE_ID, id.to_string()));
    }

    EventRecord {
        name: Some(name.to_owned()),
        severity,
        body: format!("CustomEvent: {name}"),
        attributes: properties.merge_under(system),
        trace_id,
    }
}
