//! Telemetry configuration.
//!
//! Configuration is built programmatically or read from the environment with
//! [`TelemetryConfig::from_env`]. It is consumed once by
//! [`telemetry::init`](crate::telemetry::init).
use crate::error::{TelemetryError, TelemetryResult};
use opentelemetry::otel_warn;
use std::borrow::Cow;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Connection string of the export destination.
pub const APPLICATIONINSIGHTS_CONNECTION_STRING: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";
/// Legacy name of [`APPLICATIONINSIGHTS_CONNECTION_STRING`].
pub const APPINSIGHTS_CONNECTION_STRING: &str = "APPINSIGHTS_CONNECTION_STRING";
/// Base URL of an OTLP/HTTP collector.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Value of the `service.name` resource attribute.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Set to `false`, `0`, `no` or `off` to turn telemetry off.
pub const OTEL_ENABLED: &str = "OTEL_ENABLED";
/// Set to `true` to turn telemetry off.
pub const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";

/// Service name used when `OTEL_SERVICE_NAME` is unset.
pub const DEFAULT_SERVICE_NAME: &str = "web-app";
/// Ingestion endpoint used when the connection string names none.
pub const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";

/// Path of the OTLP/HTTP trace endpoint.
pub const TRACES_PATH: &str = "/v1/traces";
/// Path of the OTLP/HTTP log endpoint.
pub const LOGS_PATH: &str = "/v1/logs";

/// Parsed `Key=Value;Key=Value` connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    instrumentation_key: String,
    ingestion_endpoint: String,
}

impl ConnectionString {
    /// Parses a connection string. Keys are matched case-insensitively and
    /// unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConnectionString`] if a segment is not
    /// a `Key=Value` pair or `InstrumentationKey` is missing.
    pub fn parse(raw: &str) -> TelemetryResult<Self> {
        let mut instrumentation_key = None;
        let mut ingestion_endpoint = None;

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                TelemetryError::InvalidConnectionString(format!(
                    "segment `{segment}` is not a Key=Value pair"
                ))
            })?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "instrumentationkey" if !value.is_empty() => {
                    instrumentation_key = Some(value.to_owned())
                }
                "ingestionendpoint" if !value.is_empty() => {
                    ingestion_endpoint = Some(value.trim_end_matches('/').to_owned())
                }
                _ => {}
            }
        }

        let instrumentation_key = instrumentation_key.ok_or_else(|| {
            TelemetryError::InvalidConnectionString("InstrumentationKey is missing".into())
        })?;
        Ok(ConnectionString {
            instrumentation_key,
            ingestion_endpoint: ingestion_endpoint
                .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_owned()),
        })
    }

    /// The `InstrumentationKey` value.
    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    /// The `IngestionEndpoint` value without trailing slash.
    pub fn ingestion_endpoint(&self) -> &str {
        &self.ingestion_endpoint
    }
}

impl FromStr for ConnectionString {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// The instrumentation key is a credential.
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("instrumentation_key", &"<redacted>")
            .field("ingestion_endpoint", &self.ingestion_endpoint)
            .finish()
    }
}

/// Where spans and events are exported to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Base URL of an OTLP/HTTP collector.
    Endpoint(String),
    /// Application Insights connection string. The ingestion service does
    /// not accept OTLP, so [`telemetry::init`](crate::telemetry::init)
    /// reports it as unavailable.
    ConnectionString(ConnectionString),
}

impl Destination {
    /// Base URL the OTLP signal paths are appended to, if this destination
    /// speaks OTLP.
    pub fn otlp_endpoint(&self) -> Option<&str> {
        match self {
            Destination::Endpoint(endpoint) => Some(endpoint),
            Destination::ConnectionString(_) => None,
        }
    }

    /// Full URL of the `signal_path` OTLP export endpoint.
    pub fn signal_endpoint(&self, signal_path: &str) -> Option<String> {
        self.otlp_endpoint()
            .map(|base| signal_endpoint(base, signal_path))
    }
}

/// Appends `signal_path` to `base`, e.g. `/v1/traces`.
pub fn signal_endpoint(base: &str, signal_path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), signal_path)
}

/// Configuration consumed by [`telemetry::init`](crate::telemetry::init).
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    destination: Option<Destination>,
    service_name: String,
    enabled: bool,
    install_subscriber: bool,
    tracer_name: Cow<'static, str>,
}

impl Default for TelemetryConfig {
    /// Enabled, without destination, so telemetry stays a no-op until a
    /// destination is configured.
    fn default() -> Self {
        TelemetryConfig {
            destination: None,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            enabled: true,
            install_subscriber: true,
            tracer_name: Cow::Borrowed(crate::span::TRACER_NAME),
        }
    }
}

impl TelemetryConfig {
    /// Same as [`TelemetryConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from the process environment.
    ///
    /// A connection string takes precedence over an OTLP endpoint. A
    /// malformed connection string is logged and ignored.
    pub fn from_env() -> Self {
        let enabled = parse_flag(env_value(OTEL_ENABLED).as_deref()).unwrap_or(true)
            && !parse_flag(env_value(OTEL_SDK_DISABLED).as_deref()).unwrap_or(false);

        let connection_string = env_value(APPLICATIONINSIGHTS_CONNECTION_STRING)
            .or_else(|| env_value(APPINSIGHTS_CONNECTION_STRING))
            .and_then(|raw| match ConnectionString::parse(&raw) {
                Ok(cs) => Some(Destination::ConnectionString(cs)),
                Err(err) => {
                    otel_warn!(
                        name: "TelemetryConfig.InvalidConnectionString",
                        error = err.to_string()
                    );
                    None
                }
            });
        let destination = connection_string
            .or_else(|| env_value(OTEL_EXPORTER_OTLP_ENDPOINT).map(Destination::Endpoint));

        TelemetryConfig {
            destination,
            service_name: env_value(OTEL_SERVICE_NAME)
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned()),
            enabled,
            ..Self::default()
        }
    }

    /// Sets where spans and events are exported to.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Exports to the OTLP/HTTP collector at `endpoint`.
    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        self.with_destination(Destination::Endpoint(endpoint.into()))
    }

    /// Parses and sets a connection string destination.
    ///
    /// # Errors
    ///
    /// See [`ConnectionString::parse`].
    pub fn with_connection_string(self, raw: &str) -> TelemetryResult<Self> {
        let cs = ConnectionString::parse(raw)?;
        Ok(self.with_destination(Destination::ConnectionString(cs)))
    }

    /// Removes the destination, turning telemetry into a no-op.
    pub fn without_destination(mut self) -> Self {
        self.destination = None;
        self
    }

    /// Sets the `service.name` resource attribute.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Turns telemetry on or off regardless of the destination.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether [`telemetry::init`](crate::telemetry::init) installs the
    /// global `tracing` subscriber.
    pub fn with_install_subscriber(mut self, install: bool) -> Self {
        self.install_subscriber = install;
        self
    }

    /// Instrumentation scope name of spans and events.
    pub fn with_tracer_name(mut self, tracer_name: impl Into<Cow<'static, str>>) -> Self {
        self.tracer_name = tracer_name.into();
        self
    }

    /// The configured destination, if any.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// The `service.name` resource attribute.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Whether telemetry was switched on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when telemetry is enabled and has somewhere to export to.
    pub fn is_active(&self) -> bool {
        self.enabled && self.destination.is_some()
    }

    /// Whether the global `tracing` subscriber is installed on init.
    pub fn install_subscriber(&self) -> bool {
        self.install_subscriber
    }

    /// Instrumentation scope name of spans and events.
    pub fn tracer_name(&self) -> &str {
        &self.tracer_name
    }

    pub(crate) fn tracer_name_owned(&self) -> Cow<'static, str> {
        self.tracer_name.clone()
    }
}

/// Reads the `OTEL_{name}` environment variable, falling back to `default`.
pub fn otel_setting(name: &str, default: &str) -> String {
    env_value(&format!("OTEL_{}", name.to_ascii_uppercase()))
        .unwrap_or_else(|| default.to_owned())
}

/// Interprets a boolean flag. Unrecognised values yield `None`.
pub fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
