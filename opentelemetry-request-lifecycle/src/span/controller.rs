use super::carrier::ContextCarrier;
use super::handle::{SpanHandle, WorkId};
use super::outcome::{Dimensions, Failure, Outcome, OutcomeRecorder};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::{otel_debug, otel_warn, Context, InstrumentationScope, KeyValue};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Instrumentation scope name of the spans created by this crate.
pub const TRACER_NAME: &str = "opentelemetry-request-lifecycle";

pub(crate) fn instrumentation_scope(name: impl Into<Cow<'static, str>>) -> InstrumentationScope {
    InstrumentationScope::builder(name)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

/// Owns the create, annotate and finalize protocol of one span per unit of
/// work.
///
/// Every handle returned by [`begin`](Self::begin) is closed exactly once by
/// [`finalize`](Self::finalize); later calls are no-ops. Without a tracer the
/// controller runs in disabled mode and hands out no-op handles that follow
/// the same state machine, so callers never have to special-case it.
pub struct SpanLifecycleController {
    tracer: Option<BoxedTracer>,
    carrier: Arc<ContextCarrier>,
    recorder: OutcomeRecorder,
}

impl SpanLifecycleController {
    /// Creates a controller starting spans with `tracer`.
    pub fn new(tracer: BoxedTracer) -> Self {
        SpanLifecycleController {
            tracer: Some(tracer),
            carrier: Arc::new(ContextCarrier::new()),
            recorder: OutcomeRecorder::default(),
        }
    }

    /// Creates a controller using a tracer from `provider`.
    pub fn from_provider<P>(provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        Self::from_provider_named(provider, TRACER_NAME)
    }

    /// Like [`from_provider`](Self::from_provider), with a custom
    /// instrumentation scope name.
    pub fn from_provider_named<P>(
        provider: &P,
        tracer_name: impl Into<Cow<'static, str>>,
    ) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        let tracer = provider.tracer_with_scope(instrumentation_scope(tracer_name));
        Self::new(BoxedTracer::new(Box::new(tracer)))
    }

    /// Creates a controller using the globally installed tracer provider.
    pub fn global() -> Self {
        Self::new(global::tracer_with_scope(instrumentation_scope(TRACER_NAME)))
    }

    /// Creates a controller that never records anything.
    pub fn disabled() -> Self {
        SpanLifecycleController {
            tracer: None,
            carrier: Arc::new(ContextCarrier::new()),
            recorder: OutcomeRecorder::default(),
        }
    }

    /// Replaces the outcome recorder, e.g. to change the success range.
    pub fn with_recorder(mut self, recorder: OutcomeRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Shares `carrier` instead of the controller's own one.
    pub fn with_carrier(mut self, carrier: Arc<ContextCarrier>) -> Self {
        self.carrier = carrier;
        self
    }

    /// False in disabled mode.
    pub fn is_enabled(&self) -> bool {
        self.tracer.is_some()
    }

    /// The carrier holding the in-flight handles.
    pub fn carrier(&self) -> &Arc<ContextCarrier> {
        &self.carrier
    }

    /// The recorder applied on finalize.
    pub fn recorder(&self) -> &OutcomeRecorder {
        &self.recorder
    }

    /// Starts the span of `work`. See [`begin_with_attributes`](Self::begin_with_attributes).
    pub fn begin(
        &self,
        work: WorkId,
        name: impl Into<Cow<'static, str>>,
        parent: Option<&Context>,
    ) -> SpanHandle {
        self.begin_with_attributes(work, name, parent, Vec::new())
    }

    /// Starts a server span for `work` and attaches it to the carrier.
    ///
    /// `parent` is usually the context extracted from inbound propagation
    /// headers; without it the span starts a new trace. This never fails:
    /// in disabled mode a no-op handle is returned.
    ///
    /// Beginning twice for the same `work` without finalizing is a programming
    /// error. It trips a debug assertion; release builds log it and return a
    /// handle that is not attached to the carrier.
    pub fn begin_with_attributes(
        &self,
        work: WorkId,
        name: impl Into<Cow<'static, str>>,
        parent: Option<&Context>,
        attributes: Vec<KeyValue>,
    ) -> SpanHandle {
        let name = name.into();
        let started = Instant::now();
        let started_at = SystemTime::now();

        let cx = match &self.tracer {
            Some(tracer) => {
                let parent_cx = parent.cloned().unwrap_or_else(Context::new);
                let span = tracer
                    .span_builder(name.clone())
                    .with_kind(SpanKind::Server)
                    .with_start_time(started_at)
                    .with_attributes(attributes)
                    .start_with_context(tracer, &parent_cx);
                parent_cx.with_span(span)
            }
            None => Context::new(),
        };

        let handle = SpanHandle::new(work, name, started_at, started, cx);
        if let Err(err) = self.carrier.attach(work, handle.clone()) {
            otel_warn!(
                name: "SpanLifecycle.DuplicateAttachment",
                work_id = work.get(),
                error = err.to_string()
            );
            debug_assert!(false, "{err}");
        }
        handle.activate();

        otel_debug!(
            name: "SpanLifecycle.Begin",
            work_id = work.get(),
            span_name = handle.name(),
            recording = handle.is_recording()
        );
        handle
    }

    /// Looks up the handle attached to `work`.
    pub fn retrieve(&self, work: WorkId) -> Option<SpanHandle> {
        self.carrier.retrieve(work)
    }

    /// Queues caller dimensions for the finalize-time attribute merge.
    ///
    /// Returns false, doing nothing, unless the handle is active.
    pub fn annotate(&self, handle: &SpanHandle, dimensions: Dimensions) -> bool {
        handle
            .with_active(|state| state.dimensions.extend(dimensions))
            .is_some()
    }

    /// Appends an `exception` event to the span without ending it.
    ///
    /// Returns false, doing nothing, unless the handle is active.
    pub fn record_failure(&self, handle: &SpanHandle, failure: &Failure) -> bool {
        let recorded = handle
            .with_active(|state| {
                state.failures += 1;
                handle
                    .context()
                    .span()
                    .add_event("exception", failure.attributes());
            })
            .is_some();

        if !recorded {
            otel_debug!(
                name: "SpanLifecycle.RecordFailureIgnored",
                work_id = handle.work_id().get()
            );
        }
        recorded
    }

    /// Sets the final status and attributes, ends the span and detaches it.
    ///
    /// Returns true on the call that finalized the span. Any later call is a
    /// no-op returning false.
    pub fn finalize(&self, handle: &SpanHandle, outcome: Outcome) -> bool {
        let finalized = handle.finish(|dimensions| {
            let elapsed = handle.elapsed();
            let recorded = self
                .recorder
                .record(&outcome, handle.name(), elapsed, dimensions);
            let span = handle.context().span();
            span.set_attributes(recorded.attributes);
            span.set_status(recorded.status);
            span.end_with_timestamp(handle.started_at() + elapsed);
        });

        if finalized {
            self.carrier.detach_handle(handle);
            otel_debug!(
                name: "SpanLifecycle.Finalize",
                work_id = handle.work_id().get(),
                failures = handle.failures_recorded()
            );
        } else {
            otel_debug!(
                name: "SpanLifecycle.AlreadyFinalized",
                work_id = handle.work_id().get()
            );
        }
        finalized
    }

    /// Records `failure` and finalizes with the matching failed outcome.
    pub fn finalize_failure(&self, handle: &SpanHandle, failure: &Failure) -> bool {
        self.record_failure(handle, failure);
        self.finalize(handle, Outcome::failed(failure))
    }
}

impl fmt::Debug for SpanLifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanLifecycleController")
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.carrier.len())
            .field("recorder", &self.recorder)
            .finish()
    }
}
