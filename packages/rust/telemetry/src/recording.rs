//! Scoped phase recording.
//!
//! Every helper here pairs `start_phase` with an end on every exit path:
//! `Ok`, `Err`, panic, and (for futures) being dropped mid-flight. Errors and
//! panics are recorded and then handed back to the caller untouched.

use std::fmt::Display;
use std::future::Future;

use phasewatch_shared::Result as TelemetryResult;

use crate::collector::TelemetryCollector;
use crate::event::{EventId, PhaseEnd, PhaseEvent, PhaseSpec, PhaseStatus};
use crate::telemetry_collector;

/// Name given to the recovery phase of `original`.
pub fn recovery_phase_name(original: &str) -> String {
    format!("{original} (Recovery)")
}

impl PhaseSpec {
    /// Spec for a remediation phase displayed under `original`.
    pub fn recovery(original: &str, reason: &str) -> Self {
        PhaseSpec::new(recovery_phase_name(original))
            .notes(format!("Recovery: {reason}"))
            .parent(original)
            .recovery_reason(reason)
    }
}

// ---------------------------------------------------------------------------
// PhaseGuard
// ---------------------------------------------------------------------------

/// RAII handle for a running phase.
///
/// Dropping it unfinished ends the phase as `Success`, or `Failed` if the
/// thread is unwinding from a panic.
#[must_use = "dropping the guard immediately ends the phase"]
#[derive(Debug)]
pub struct PhaseGuard<'a> {
    collector: &'a TelemetryCollector,
    id: EventId,
    name: String,
    done: bool,
    /// Notes recorded as `Failed` when dropped unfinished outside a panic.
    abandoned: Option<&'static str>,
}

impl<'a> PhaseGuard<'a> {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// End the phase as `Success`.
    pub fn succeed(mut self) -> Option<PhaseEvent> {
        self.close(PhaseStatus::Success, PhaseEnd::new()).ok()
    }

    /// End the phase as `Failed`, recording `error` in its notes.
    pub fn fail(mut self, error: impl Display) -> Option<PhaseEvent> {
        self.close(PhaseStatus::Failed, PhaseEnd::new().notes(format!("Error: {error}")))
            .ok()
    }

    /// End the phase with any terminal status.
    pub fn finish(mut self, status: PhaseStatus, end: PhaseEnd) -> TelemetryResult<PhaseEvent> {
        self.close(status, end)
    }

    fn close(&mut self, status: PhaseStatus, end: PhaseEnd) -> TelemetryResult<PhaseEvent> {
        let result = self.collector.end_event(self.id, status, end);
        // A rejected non-terminal status leaves the phase running; keep the
        // guard armed so drop still ends it.
        if !matches!(
            result,
            Err(phasewatch_shared::PhasewatchError::NonTerminalStatus { .. })
        ) {
            self.done = true;
        }
        result
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let (status, end) = if std::thread::panicking() {
            (PhaseStatus::Failed, PhaseEnd::new().notes("Panicked"))
        } else if let Some(note) = self.abandoned {
            (PhaseStatus::Failed, PhaseEnd::new().notes(note))
        } else {
            (PhaseStatus::Success, PhaseEnd::new())
        };
        // Fails only if the collector was cleared mid-phase.
        let _ = self.close(status, end);
    }
}

// ---------------------------------------------------------------------------
// Collector methods
// ---------------------------------------------------------------------------

impl TelemetryCollector {
    /// Start a phase and return a guard that ends it.
    pub fn enter(&self, spec: impl Into<PhaseSpec>) -> PhaseGuard<'_> {
        let event = self.start_phase(spec);
        PhaseGuard {
            collector: self,
            id: event.id,
            name: event.name,
            done: false,
            abandoned: None,
        }
    }

    /// Run `f` as a phase: `Ok` records `Success`, `Err(e)` records `Failed`
    /// with `"Error: {e}"` and returns `e` unchanged.
    pub fn record_phase<T, E: Display>(
        &self,
        spec: impl Into<PhaseSpec>,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let guard = self.enter(spec);
        match f() {
            Ok(value) => {
                guard.succeed();
                Ok(value)
            }
            Err(e) => {
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// [`record_phase`](Self::record_phase) for futures. A future dropped
    /// before completion is recorded as `Failed`.
    pub async fn record_phase_async<T, E, F>(&self, spec: impl Into<PhaseSpec>, fut: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let mut guard = self.enter(spec);
        guard.abandoned = Some("Cancelled before completion");
        match fut.await {
            Ok(value) => {
                guard.succeed();
                Ok(value)
            }
            Err(e) => {
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// Record a phase that was bypassed: a `Skipped` event with near-zero
    /// duration and the reason in its notes.
    ///
    /// `spec` may be a bare name or a full [`PhaseSpec`]; its model, parent,
    /// and metadata are kept, while its notes are replaced by the reason.
    pub fn record_skip(&self, spec: impl Into<PhaseSpec>, reason: &str) -> PhaseEvent {
        let notes = format!("Skipped: {reason}");
        let started = self.start_phase(spec.into().notes(notes.clone()));
        self.end_event(started.id, PhaseStatus::Skipped, PhaseEnd::new().notes(notes))
            .unwrap_or(started)
    }

    /// Run `f` as the recovery phase of `original`.
    pub fn record_recovery<T, E: Display>(
        &self,
        original: &str,
        reason: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        self.record_phase(PhaseSpec::recovery(original, reason), f)
    }
}

// ---------------------------------------------------------------------------
// Default-collector shorthands
// ---------------------------------------------------------------------------

/// [`TelemetryCollector::record_phase`] on the process-wide collector.
pub fn record_phase<T, E: Display>(
    spec: impl Into<PhaseSpec>,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    telemetry_collector().record_phase(spec, f)
}

/// [`TelemetryCollector::record_phase_async`] on the process-wide collector.
pub async fn record_phase_async<T, E, F>(spec: impl Into<PhaseSpec>, fut: F) -> Result<T, E>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    let collector = telemetry_collector();
    collector.record_phase_async(spec, fut).await
}

/// [`TelemetryCollector::record_skip`] on the process-wide collector.
pub fn record_skip(spec: impl Into<PhaseSpec>, reason: &str) -> PhaseEvent {
    telemetry_collector().record_skip(spec, reason)
}

/// [`TelemetryCollector::record_recovery`] on the process-wide collector.
pub fn record_recovery<T, E: Display>(
    original: &str,
    reason: &str,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    telemetry_collector().record_recovery(original, reason, f)
}
