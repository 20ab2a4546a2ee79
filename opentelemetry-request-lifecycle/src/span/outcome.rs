//! Mapping of a unit of work's result onto span status and attributes.
use opentelemetry::trace::Status;
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, EXCEPTION_MESSAGE, EXCEPTION_STACKTRACE, EXCEPTION_TYPE,
    HTTP_RESPONSE_STATUS_CODE,
};
use std::any::type_name;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;
use std::iter;
use std::num::{ParseFloatError, ParseIntError, TryFromIntError};
use std::ops::Range;
use std::str::Utf8Error;
use std::string::FromUtf8Error;
use std::time::Duration;

/// Reserved key carrying the name of a custom event.
pub const EVENT_NAME: &str = "event_name";
/// Reserved key carrying the hex trace id an event is correlated with.
pub const TRACE_ID: &str = "trace_id";
/// Keys callers can never set through [`Dimensions`].
pub const RESERVED_KEYS: [&str; 2] = [EVENT_NAME, TRACE_ID];

/// Name of the unit of work.
pub const WORK_NAME: &str = "work.name";
/// Duration of the unit of work in milliseconds.
pub const WORK_DURATION_MS: &str = "work.duration_ms";
/// Set when the unit of work was dropped before it completed.
pub const WORK_CANCELLED: &str = "work.cancelled";
/// Result code of the unit of work.
pub const STATUS_CODE: &str = "status_code";

/// Ordered, string-keyed attribute map supplied by callers.
///
/// Inserting an existing key replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dimensions(Vec<KeyValue>);

impl Dimensions {
    /// Creates an empty map.
    pub fn new() -> Self {
        Dimensions(Vec::new())
    }

    /// Builder-style [`Dimensions::insert`].
    pub fn with(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces `key`.
    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|kv| kv.key == key) {
            Some(existing) => existing.value = value,
            None => self.0.push(KeyValue::new(key, value)),
        }
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True without entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Merges `other` into `self`; entries of `other` win.
    pub fn extend(&mut self, other: Dimensions) {
        for kv in other.0 {
            self.insert(kv.key, kv.value);
        }
    }

    /// Produces the final attribute list: `system` entries first, followed by
    /// the caller entries whose key is neither reserved nor already present
    /// in `system`.
    pub fn merge_under(self, system: Vec<KeyValue>) -> Vec<KeyValue> {
        let mut merged = system;
        let caller: Vec<KeyValue> = self
            .0
            .into_iter()
            .filter(|kv| !RESERVED_KEYS.contains(&kv.key.as_str()))
            .filter(|kv| !merged.iter().any(|system| system.key == kv.key))
            .collect();
        merged.extend(caller);
        merged
    }
}

impl<K, V> FromIterator<(K, V)> for Dimensions
where
    K: Into<Key>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dimensions = Dimensions::new();
        for (key, value) in iter {
            dimensions.insert(key, value);
        }
        dimensions
    }
}

impl From<Vec<KeyValue>> for Dimensions {
    fn from(attributes: Vec<KeyValue>) -> Self {
        attributes
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect()
    }
}

/// An error raised by the unit of work, captured as span data.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    type_name: Cow<'static, str>,
    message: String,
    stacktrace: Option<String>,
}

impl Failure {
    /// Creates a failure with an explicit exception type.
    pub fn new(type_name: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Failure {
            type_name: type_name.into(),
            message: message.into(),
            stacktrace: None,
        }
    }

    /// Captures `error`, using its Rust type name as the exception type.
    ///
    /// References and `Box`, `Arc` or `Rc` wrappers are looked through, so
    /// `Box<io::Error>` is recorded as `std::io::error::Error`. A stack trace
    /// is attached when backtraces are enabled through `RUST_BACKTRACE` or
    /// `RUST_LIB_BACKTRACE`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: fmt::Display + ?Sized,
    {
        Self::captured(error_type_name(type_name::<E>()), error.to_string())
    }

    /// Captures a type-erased error such as [`tower::BoxError`].
    ///
    /// The exception type is the first error in the `source()` chain whose
    /// type is known, e.g. `std::io::Error` or `http::Error`. Unknown errors
    /// are recorded as `dyn core::error::Error`.
    pub fn from_dyn_error(error: &(dyn Error + 'static)) -> Self {
        let type_name = iter::successors(Some(error), |&error| error.source())
            .find_map(known_error_type)
            .unwrap_or(ERASED_ERROR_TYPE);
        Self::captured(Cow::Borrowed(type_name), error.to_string())
    }

    fn captured(type_name: impl Into<Cow<'static, str>>, message: String) -> Self {
        let backtrace = Backtrace::capture();
        let stacktrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());
        Failure {
            type_name: type_name.into(),
            message,
            stacktrace,
        }
    }

    /// Attaches a stack trace, replacing a captured one.
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    /// Exception type, recorded as `exception.type` and `error.type`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Exception message, also the span status description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace, if one was captured or attached.
    pub fn stacktrace(&self) -> Option<&str> {
        self.stacktrace.as_deref()
    }

    /// Attributes of the `exception` span event.
    pub(crate) fn attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(EXCEPTION_TYPE, self.type_name.to_string()),
            KeyValue::new(EXCEPTION_MESSAGE, self.message.clone()),
        ];
        if let Some(stacktrace) = &self.stacktrace {
            attributes.push(KeyValue::new(EXCEPTION_STACKTRACE, stacktrace.clone()));
        }
        attributes
    }
}

const ERASED_ERROR_TYPE: &str = "dyn core::error::Error";

const POINTER_TYPES: [&str; 3] = ["alloc::boxed::Box<", "alloc::sync::Arc<", "alloc::rc::Rc<"];

fn error_type_name(mut name: &'static str) -> &'static str {
    loop {
        if let Some(inner) = name.strip_prefix('&') {
            name = inner.strip_prefix("mut ").unwrap_or(inner);
            continue;
        }
        match POINTER_TYPES
            .iter()
            .find_map(|pointer| name.strip_prefix(*pointer)?.strip_suffix('>'))
        {
            Some(inner) => name = inner,
            None => break,
        }
    }
    // `dyn Error + Send + Sync` is named after its principal trait.
    match name.split_once(" + ") {
        Some((principal, _)) if name.starts_with("dyn ") => principal,
        _ => name,
    }
}

fn known_error_type(error: &(dyn Error + 'static)) -> Option<&'static str> {
    macro_rules! first_match {
        ($($ty:ty),+ $(,)?) => {
            $(
                if error.is::<$ty>() {
                    return Some(type_name::<$ty>());
                }
            )+
        };
    }
    first_match!(
        io::Error,
        fmt::Error,
        ParseIntError,
        ParseFloatError,
        TryFromIntError,
        Utf8Error,
        FromUtf8Error,
        http::Error,
        http::header::InvalidHeaderValue,
        http::uri::InvalidUri,
    );
    None
}

/// How a unit of work ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The unit of work produced a result code, e.g. an HTTP status.
    Response {
        /// The result code.
        status_code: u16,
    },
    /// The unit of work raised an error it did not handle.
    Failed {
        /// Type of the error, see [`Failure::type_name`].
        error_type: Cow<'static, str>,
        /// Message of the error.
        description: String,
    },
    /// The unit of work was dropped before it completed.
    Cancelled,
}

impl Outcome {
    /// The unit of work answered with `status_code`.
    pub fn response(status_code: u16) -> Self {
        Outcome::Response { status_code }
    }

    /// The unit of work raised `failure`.
    pub fn failed(failure: &Failure) -> Self {
        Outcome::Failed {
            error_type: failure.type_name.clone(),
            description: failure.message.clone(),
        }
    }
}

/// Status and attributes computed for a finished span.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedOutcome {
    /// Final span status.
    pub status: Status,
    /// Final span attributes.
    pub attributes: Vec<KeyValue>,
}

/// Deterministic mapping from [`Outcome`] to span status and attributes.
#[derive(Clone, Debug)]
pub struct OutcomeRecorder {
    success: Range<u16>,
}

impl Default for OutcomeRecorder {
    /// Informational, successful and redirection codes count as success.
    fn default() -> Self {
        OutcomeRecorder { success: 100..400 }
    }
}

impl OutcomeRecorder {
    /// Creates a recorder treating `success` as the successful code range.
    pub fn new(success: Range<u16>) -> Self {
        OutcomeRecorder { success }
    }

    /// Whether `status_code` lies in the success range.
    pub fn is_success(&self, status_code: u16) -> bool {
        self.success.contains(&status_code)
    }

    /// The span status `outcome` maps to.
    pub fn status(&self, outcome: &Outcome) -> Status {
        match outcome {
            Outcome::Response { status_code } if self.is_success(*status_code) => Status::Ok,
            Outcome::Response { status_code } => {
                Status::error(format!("unit of work ended with status code {status_code}"))
            }
            Outcome::Failed { description, .. } => Status::error(description.clone()),
            Outcome::Cancelled => Status::error("cancelled"),
        }
    }

    /// Computes the final status and attribute set of a span.
    pub fn record(
        &self,
        outcome: &Outcome,
        name: &str,
        duration: Duration,
        dimensions: Dimensions,
    ) -> RecordedOutcome {
        let mut system = vec![
            KeyValue::new(WORK_NAME, name.to_owned()),
            KeyValue::new(WORK_DURATION_MS, duration.as_secs_f64() * 1000.0),
        ];
        match outcome {
            Outcome::Response { status_code } => {
                system.push(KeyValue::new(STATUS_CODE, i64::from(*status_code)));
                system.push(KeyValue::new(
                    HTTP_RESPONSE_STATUS_CODE,
                    i64::from(*status_code),
                ));
            }
            Outcome::Failed { error_type, .. } => {
                system.push(KeyValue::new(ERROR_TYPE, error_type.to_string()));
            }
            Outcome::Cancelled => system.push(KeyValue::new(WORK_CANCELLED, true)),
        }

        RecordedOutcome {
            status: self.status(outcome),
            attributes: dimensions.merge_under(system),
        }
    }
}
