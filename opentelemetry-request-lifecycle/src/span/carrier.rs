use super::handle::{SpanHandle, WorkId};
use crate::error::{TelemetryError, TelemetryResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Associates the active span handle with its unit of work.
///
/// All operations lock a single map, so they are mutually exclusive. A
/// poisoned lock is recovered rather than reported: the map only ever holds
/// complete entries.
#[derive(Debug, Default)]
pub struct ContextCarrier {
    entries: Mutex<HashMap<WorkId, SpanHandle>>,
}

impl ContextCarrier {
    /// Creates an empty carrier.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkId, SpanHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `handle` to `work`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::DuplicateAttachment`] if a handle is already
    /// attached to `work`. The existing attachment is left untouched.
    pub fn attach(&self, work: WorkId, handle: SpanHandle) -> TelemetryResult<()> {
        match self.entries().entry(work) {
            Entry::Occupied(_) => Err(TelemetryError::DuplicateAttachment(work)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Returns the handle attached to `work`, if any. Absence is normal, e.g.
    /// when the unit of work started before telemetry was enabled.
    pub fn retrieve(&self, work: WorkId) -> Option<SpanHandle> {
        self.entries().get(&work).cloned()
    }

    /// Removes and returns the handle attached to `work`.
    pub fn detach(&self, work: WorkId) -> Option<SpanHandle> {
        self.entries().remove(&work)
    }

    /// Removes the entry for the handle's unit of work only if it is this very
    /// handle.
    pub(crate) fn detach_handle(&self, handle: &SpanHandle) -> bool {
        let mut entries = self.entries();
        match entries.entry(handle.work_id()) {
            Entry::Occupied(entry) if entry.get().same_as(handle) => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Number of units of work currently carrying a span.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// True when no unit of work carries a span.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
