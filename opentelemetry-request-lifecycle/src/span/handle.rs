use super::outcome::Dimensions;
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceId};
use opentelemetry::Context;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one in-flight unit of work, e.g. one inbound request.
///
/// Identifiers handed out by [`WorkId::next`] are unique for the lifetime of
/// the process, so two concurrent units of work never share a carrier entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId(u64);

impl WorkId {
    /// Allocates a fresh identifier.
    pub fn next() -> Self {
        WorkId(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an identifier owned by the caller, e.g. a framework task id.
    pub const fn from_raw(id: u64) -> Self {
        WorkId(id)
    }

    /// The raw numeric identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a span handle is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The span exists but is not yet attached to its unit of work.
    Created,
    /// The span accepts failures and dimensions.
    Active,
    /// The span has ended. Nothing can be added any more.
    Finalized,
}

#[derive(Debug)]
pub(crate) struct HandleState {
    pub(crate) phase: Phase,
    pub(crate) dimensions: Dimensions,
    pub(crate) failures: usize,
}

struct Inner {
    work: WorkId,
    name: Cow<'static, str>,
    started_at: SystemTime,
    started: Instant,
    cx: Context,
    state: Mutex<HandleState>,
}

/// A reference to the span owned by one unit of work.
///
/// Handles are cheap to clone; all clones refer to the same span. Two handles
/// compare equal only when they are clones of each other.
#[derive(Clone)]
pub struct SpanHandle {
    inner: Arc<Inner>,
}

impl SpanHandle {
    pub(crate) fn new(
        work: WorkId,
        name: Cow<'static, str>,
        started_at: SystemTime,
        started: Instant,
        cx: Context,
    ) -> Self {
        SpanHandle {
            inner: Arc::new(Inner {
                work,
                name,
                started_at,
                started,
                cx,
                state: Mutex::new(HandleState {
                    phase: Phase::Created,
                    dimensions: Dimensions::new(),
                    failures: 0,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The unit of work this span belongs to.
    pub fn work_id(&self) -> WorkId {
        self.inner.work
    }

    /// The span name given at `begin`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wall-clock start of the span.
    pub fn started_at(&self) -> SystemTime {
        self.inner.started_at
    }

    /// Monotonic time since the span started.
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Whether the span has already been finalized.
    pub fn is_finalized(&self) -> bool {
        self.phase() == Phase::Finalized
    }

    /// Whether the underlying span records data. Handles created in disabled
    /// mode never do.
    pub fn is_recording(&self) -> bool {
        self.inner.cx.span().is_recording()
    }

    /// Number of failures recorded through `record_failure`.
    pub fn failures_recorded(&self) -> usize {
        self.state().failures
    }

    /// The span context, invalid for no-op handles.
    pub fn span_context(&self) -> SpanContext {
        self.inner.cx.span().span_context().clone()
    }

    /// The trace id, if the span context is valid.
    pub fn trace_id(&self) -> Option<TraceId> {
        let span = self.inner.cx.span();
        let span_context = span.span_context();
        span_context.is_valid().then(|| span_context.trace_id())
    }

    /// The OpenTelemetry context carrying this span as the active one.
    ///
    /// Attach it while the unit of work runs so that child spans and events
    /// are correlated with it.
    pub fn context(&self) -> &Context {
        &self.inner.cx
    }

    /// Returns true if both handles refer to the same span.
    pub fn same_as(&self, other: &SpanHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn activate(&self) {
        let mut state = self.state();
        if state.phase == Phase::Created {
            state.phase = Phase::Active;
        }
    }

    /// Runs `f` on the state if and only if the handle is active.
    pub(crate) fn with_active<R>(&self, f: impl FnOnce(&mut HandleState) -> R) -> Option<R> {
        let mut state = self.state();
        (state.phase == Phase::Active).then(|| f(&mut state))
    }

    /// Moves the handle to `Finalized` and runs `f` with the pending
    /// dimensions while the state lock is held. Returns false if the handle
    /// was already finalized, in which case `f` is not called.
    pub(crate) fn finish(&self, f: impl FnOnce(Dimensions)) -> bool {
        let mut state = self.state();
        if state.phase == Phase::Finalized {
            return false;
        }
        state.phase = Phase::Finalized;
        f(std::mem::take(&mut state.dimensions));
        true
    }
}

impl PartialEq for SpanHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for SpanHandle {}

impl fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanHandle")
            .field("work", &self.inner.work)
            .field("name", &self.inner.name)
            .field("phase", &self.phase())
            .field("span_context", self.inner.cx.span().span_context())
            .finish()
    }
}
