//! Request-scoped span lifecycle.
//!
//! A [`SpanLifecycleController`] starts one span per unit of work, keeps it in
//! a [`ContextCarrier`] while the work runs and closes it exactly once with
//! the status the [`OutcomeRecorder`] derives from the work's [`Outcome`].
//!
//! ```text
//!   begin ──▶ Created ──attach──▶ Active ──finalize──▶ Finalized
//!                                   │  ▲                  │
//!                     record_failure│  │annotate          │ finalize (no-op)
//!                                   └──┘                  └──▶ Finalized
//! ```
mod carrier;
mod controller;
mod handle;
mod outcome;

pub use carrier::ContextCarrier;
pub(crate) use controller::instrumentation_scope;
pub use controller::{SpanLifecycleController, TRACER_NAME};
pub use handle::{Phase, SpanHandle, WorkId};
pub use outcome::{
    Dimensions, Failure, Outcome, OutcomeRecorder, RecordedOutcome, EVENT_NAME, RESERVED_KEYS,
    STATUS_CODE, TRACE_ID, WORK_CANCELLED, WORK_DURATION_MS, WORK_NAME,
};
