//! Thread-safe phase event collector.
//!
//! One mutex guards the whole state: the append-only event log, the active
//! set, the name lookup, the pipeline bracket, and the listener list.
//! Readers only ever get clones. Listeners run after the lock is released.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use phasewatch_shared::{PhasewatchError, Result};
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::event::{EventId, PhaseEnd, PhaseEvent, PhaseSpec, PhaseStatus, PipelineStatus};

type Listener = Arc<dyn Fn(&PhaseEvent) + Send + Sync>;

/// Handle returned by [`TelemetryCollector::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PipelineBracket {
    start_time: Option<DateTime<Local>>,
    start_mono: Option<Duration>,
    end_mono: Option<Duration>,
    status: Option<PipelineStatus>,
}

impl PipelineBracket {
    fn duration(&self, now: Duration) -> Option<Duration> {
        let start = self.start_mono?;
        Some(self.end_mono.unwrap_or(now).saturating_sub(start))
    }
}

#[derive(Default)]
struct CollectorState {
    events: Vec<PhaseEvent>,
    /// Unterminated events, by id, pointing into `events`.
    active: HashMap<EventId, usize>,
    /// Active events for each name, oldest first.
    by_name: HashMap<String, Vec<EventId>>,
    bracket: PipelineBracket,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl CollectorState {
    fn finish(
        &mut self,
        id: EventId,
        status: PhaseStatus,
        end: PhaseEnd,
        wall: DateTime<Local>,
        mono: Duration,
    ) -> Option<PhaseEvent> {
        let index = self.active.remove(&id)?;
        let event = &mut self.events[index];
        event.finish(status, end, wall, mono);
        let finished = event.clone();

        if let Some(stack) = self.by_name.get_mut(&finished.name) {
            if let Some(pos) = stack.iter().rposition(|other| *other == id) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                self.by_name.remove(&finished.name);
            }
        }

        Some(finished)
    }

    fn active_events(&self) -> Vec<PhaseEvent> {
        let mut indices: Vec<usize> = self.active.values().copied().collect();
        indices.sort_unstable();
        indices.into_iter().map(|i| self.events[i].clone()).collect()
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of collector state, taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct CollectorSnapshot {
    /// Every event, in start order.
    pub events: Vec<PhaseEvent>,
    /// Unterminated events, in start order.
    pub active: Vec<PhaseEvent>,
    pub pipeline_duration: Option<Duration>,
    pub pipeline_status: Option<PipelineStatus>,
    /// Monotonic reading at which the snapshot was taken.
    pub taken_at: Duration,
}

impl CollectorSnapshot {
    pub fn is_pipeline_complete(&self) -> bool {
        self.pipeline_status.is_some()
    }
}

// ---------------------------------------------------------------------------
// TelemetryCollector
// ---------------------------------------------------------------------------

/// Central collector for phase events.
pub struct TelemetryCollector {
    clock: Arc<dyn Clock>,
    state: Mutex<CollectorState>,
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TelemetryCollector")
            .field("events", &state.events.len())
            .field("active", &state.active.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    /// Collector backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Collector backed by a custom clock (tests use [`crate::ManualClock`]).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Current monotonic reading of this collector's clock.
    pub fn now(&self) -> Duration {
        self.clock.monotonic()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        // Every mutation leaves the state consistent, so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Pipeline bracket ---------------------------------------------------

    /// Mark the start of the run. Clears any previous end and status.
    pub fn set_pipeline_start(&self) {
        let wall = self.clock.wall();
        let mono = self.clock.monotonic();
        let mut state = self.lock();
        state.bracket = PipelineBracket {
            start_time: Some(wall),
            start_mono: Some(mono),
            end_mono: None,
            status: None,
        };
        debug!("pipeline started");
    }

    /// Mark the end of the run with its final status.
    pub fn set_pipeline_end(&self, status: PipelineStatus) {
        let mono = self.clock.monotonic();
        let mut state = self.lock();
        state.bracket.end_mono = Some(mono);
        state.bracket.status = Some(status);
        debug!(%status, "pipeline ended");
    }

    /// `None` before the run starts; live while running; frozen once ended.
    pub fn pipeline_duration(&self) -> Option<Duration> {
        let now = self.clock.monotonic();
        self.lock().bracket.duration(now)
    }

    pub fn pipeline_status(&self) -> Option<PipelineStatus> {
        self.lock().bracket.status
    }

    pub fn pipeline_start_time(&self) -> Option<DateTime<Local>> {
        self.lock().bracket.start_time
    }

    pub fn is_pipeline_complete(&self) -> bool {
        self.lock().bracket.status.is_some()
    }

    // --- Phases ---------------------------------------------------------------

    /// Start a phase and make it the active entry for its name.
    ///
    /// Starting a name that is already active does not orphan the older
    /// event: it stays active and can still be ended by id, and regains the
    /// name once the newer one ends.
    pub fn start_phase(&self, spec: impl Into<PhaseSpec>) -> PhaseEvent {
        let spec = spec.into();
        let (event, listeners) = {
            let mut state = self.lock();
            let event = PhaseEvent::begin(spec, self.clock.wall(), self.clock.monotonic());
            let index = state.events.len();
            let stack = state.by_name.entry(event.name.clone()).or_default();
            if let Some(previous) = stack.last() {
                debug!(
                    phase = %event.name,
                    %previous,
                    "phase started while another with the same name is active"
                );
            }
            stack.push(event.id);
            state.active.insert(event.id, index);
            state.events.push(event.clone());
            (event, state.listeners())
        };

        trace!(phase = %event.name, id = %event.id, "phase started");
        notify(&listeners, &event);
        event
    }

    /// End the newest active phase called `name`.
    ///
    /// Returns [`PhasewatchError::NoActivePhase`] (and changes nothing) when
    /// no phase of that name is running, and
    /// [`PhasewatchError::NonTerminalStatus`] for `Pending`/`Running`.
    pub fn end_phase(&self, name: &str, status: PhaseStatus, end: PhaseEnd) -> Result<PhaseEvent> {
        ensure_terminal(status)?;
        let wall = self.clock.wall();
        let mono = self.clock.monotonic();

        let (event, listeners) = {
            let mut state = self.lock();
            let Some(id) = state.by_name.get(name).and_then(|stack| stack.last()).copied() else {
                debug!(phase = name, "end_phase with no matching active phase");
                return Err(PhasewatchError::NoActivePhase {
                    name: name.to_string(),
                });
            };
            let event = state
                .finish(id, status, end, wall, mono)
                .ok_or_else(|| PhasewatchError::NoActivePhase {
                    name: name.to_string(),
                })?;
            (event, state.listeners())
        };

        self.ended(&listeners, &event);
        Ok(event)
    }

    /// End one specific event. Used by scoped recording so a scope always
    /// closes exactly the event it opened.
    pub fn end_event(&self, id: EventId, status: PhaseStatus, end: PhaseEnd) -> Result<PhaseEvent> {
        ensure_terminal(status)?;
        let wall = self.clock.wall();
        let mono = self.clock.monotonic();

        let (event, listeners) = {
            let mut state = self.lock();
            let event = state.finish(id, status, end, wall, mono).ok_or_else(|| {
                PhasewatchError::NoActivePhase {
                    name: format!("event {id}"),
                }
            })?;
            (event, state.listeners())
        };

        self.ended(&listeners, &event);
        Ok(event)
    }

    fn ended(&self, listeners: &[Listener], event: &PhaseEvent) {
        debug!(
            phase = %event.name,
            status = %event.status,
            duration_ms = event.duration.map(|d| d.as_millis() as u64),
            "phase ended"
        );
        notify(listeners, event);
    }

    // --- Reads ----------------------------------------------------------------

    /// Copy of every event, in start order.
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.lock().events.clone()
    }

    /// Copy of the unterminated events, in start order.
    pub fn active_phases(&self) -> Vec<PhaseEvent> {
        self.lock().active_events()
    }

    /// Most recent event with this name, finished or not.
    pub fn phase_by_name(&self, name: &str) -> Option<PhaseEvent> {
        self.lock()
            .events
            .iter()
            .rev()
            .find(|e| e.name == name)
            .cloned()
    }

    /// Everything a renderer needs, copied under a single lock.
    pub fn snapshot(&self) -> CollectorSnapshot {
        let state = self.lock();
        let now = self.clock.monotonic();
        CollectorSnapshot {
            events: state.events.clone(),
            active: state.active_events(),
            pipeline_duration: state.bracket.duration(now),
            pipeline_status: state.bracket.status,
            taken_at: now,
        }
    }

    /// Drop all events, active phases, and the pipeline bracket. Listeners stay.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.events.clear();
        state.active.clear();
        state.by_name.clear();
        state.bracket = PipelineBracket::default();
    }

    // --- Listeners ------------------------------------------------------------

    /// Register a callback invoked on every phase start and end.
    ///
    /// A panicking listener is caught and logged, and the recording call
    /// still succeeds. The process panic hook runs before the unwind is
    /// caught, so its message still reaches stderr unless the caller
    /// installs a quieter hook.
    pub fn add_listener(&self, listener: impl Fn(&PhaseEvent) + Send + Sync + 'static) -> ListenerId {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the listener was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }
}

fn ensure_terminal(status: PhaseStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(PhasewatchError::NonTerminalStatus {
            status: status.to_string(),
        })
    }
}

fn notify(listeners: &[Listener], event: &PhaseEvent) {
    for listener in listeners {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            warn!(phase = %event.name, "telemetry listener panicked; ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;

    fn manual() -> (Arc<ManualClock>, TelemetryCollector) {
        let clock = Arc::new(ManualClock::default());
        let collector = TelemetryCollector::with_clock(clock.clone());
        (clock, collector)
    }

    #[test]
    fn start_and_end_phase() {
        let (clock, collector) = manual();

        let event = collector.start_phase(PhaseSpec::new("Test Phase").notes("Testing basics"));
        assert_eq!(event.status, PhaseStatus::Running);
        assert_eq!(event.notes, "Testing basics");
        assert!(event.duration.is_none());
        assert_eq!(collector.active_phases().len(), 1);

        clock.advance(Duration::from_millis(50));
        let ended = collector
            .end_phase(
                "Test Phase",
                PhaseStatus::Success,
                PhaseEnd::new().notes("Completed successfully"),
            )
            .expect("phase is active");

        assert_eq!(ended.duration, Some(Duration::from_millis(50)));
        assert!(collector.active_phases().is_empty());

        let events = collector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, PhaseStatus::Success);
        assert_eq!(events[0].notes, "Completed successfully");
    }

    #[test]
    fn events_keep_start_order() {
        let (_clock, collector) = manual();
        collector.start_phase("A");
        collector.start_phase("B");
        collector.start_phase("C");
        collector.end_phase("B", PhaseStatus::Success, PhaseEnd::new()).unwrap();
        collector.end_phase("C", PhaseStatus::Failed, PhaseEnd::new()).unwrap();
        collector.end_phase("A", PhaseStatus::Skipped, PhaseEnd::new()).unwrap();

        let names: Vec<_> = collector.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["A", "B", "C"]);
    }

    #[test]
    fn phase_ends_exactly_once() {
        let (clock, collector) = manual();
        collector.start_phase("Report Agent");
        clock.advance(Duration::from_secs(1));
        collector
            .end_phase("Report Agent", PhaseStatus::Failed, PhaseEnd::new().notes("first"))
            .unwrap();

        clock.advance(Duration::from_secs(5));
        let second = collector.end_phase("Report Agent", PhaseStatus::Success, PhaseEnd::new());
        assert!(matches!(second, Err(PhasewatchError::NoActivePhase { .. })));

        let event = collector.phase_by_name("Report Agent").unwrap();
        assert_eq!(event.status, PhaseStatus::Failed);
        assert_eq!(event.notes, "first");
        assert_eq!(event.duration, Some(Duration::from_secs(1)));
    }

    #[test]
    fn unmatched_end_changes_nothing() {
        let (_clock, collector) = manual();
        collector.start_phase("Clarify Agent");
        let before = collector.events();

        let err = collector
            .end_phase("Nope", PhaseStatus::Success, PhaseEnd::new())
            .unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(collector.events(), before);
    }

    #[test]
    fn non_terminal_end_is_rejected() {
        let (_clock, collector) = manual();
        collector.start_phase("Planner");
        for status in [PhaseStatus::Running, PhaseStatus::Pending] {
            let err = collector
                .end_phase("Planner", status, PhaseEnd::new())
                .unwrap_err();
            assert!(matches!(err, PhasewatchError::NonTerminalStatus { .. }));
        }
        assert_eq!(collector.active_phases().len(), 1);
    }

    #[test]
    fn wall_clock_jump_does_not_change_duration() {
        let (clock, collector) = manual();
        collector.start_phase("Researcher Agent");

        // Wall clock leaps forward an hour; the monotonic reading does not move.
        clock.set_wall(clock.wall() + chrono::Duration::hours(1));
        let event = collector
            .end_phase("Researcher Agent", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();

        assert_eq!(event.duration, Some(Duration::ZERO));
        assert!(event.end_time.unwrap() > event.start_time);
    }

    #[test]
    fn end_merges_metadata_and_recovery_reason() {
        let (_clock, collector) = manual();
        collector.start_phase(PhaseSpec::new("Compress").meta("sources", 12));
        let event = collector
            .end_phase(
                "Compress",
                PhaseStatus::Recovered,
                PhaseEnd::new()
                    .recovery_reason("conflicting claims")
                    .meta("conflicts", 2),
            )
            .unwrap();

        assert_eq!(event.recovery_reason.as_deref(), Some("conflicting claims"));
        assert_eq!(event.metadata["sources"], 12);
        assert_eq!(event.metadata["conflicts"], 2);
    }

    #[test]
    fn duplicate_name_is_not_orphaned() {
        let (_clock, collector) = manual();
        let first = collector.start_phase("Research Subquery");
        let second = collector.start_phase("Research Subquery");
        assert_eq!(collector.active_phases().len(), 2);

        // Name lookups target the newest, then fall back to the older one.
        let ended = collector
            .end_phase("Research Subquery", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();
        assert_eq!(ended.id, second.id);
        let ended = collector
            .end_phase("Research Subquery", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();
        assert_eq!(ended.id, first.id);
        assert!(collector.active_phases().is_empty());
    }

    #[test]
    fn ending_older_duplicate_keeps_newer_addressable() {
        let (_clock, collector) = manual();
        let first = collector.start_phase("Research Subquery");
        let second = collector.start_phase("Research Subquery");
        let third = collector.start_phase("Research Subquery");

        // Close the middle one out of order; the name still resolves newest-first.
        collector
            .end_event(second.id, PhaseStatus::Failed, PhaseEnd::new())
            .unwrap();
        let ended = collector
            .end_phase("Research Subquery", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();
        assert_eq!(ended.id, third.id);
        let ended = collector
            .end_phase("Research Subquery", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();
        assert_eq!(ended.id, first.id);

        assert!(collector.lock().by_name.is_empty());
        let err = collector
            .end_phase("Research Subquery", PhaseStatus::Success, PhaseEnd::new())
            .unwrap_err();
        assert!(matches!(err, PhasewatchError::NoActivePhase { .. }));
    }

    #[test]
    fn end_event_targets_exact_event() {
        let (_clock, collector) = manual();
        let first = collector.start_phase("Same");
        let _second = collector.start_phase("Same");

        collector
            .end_event(first.id, PhaseStatus::Failed, PhaseEnd::new())
            .unwrap();
        let active = collector.active_phases();
        assert_eq!(active.len(), 1);
        assert_ne!(active[0].id, first.id);

        // The name still resolves to the newer, still-running event.
        collector
            .end_phase("Same", PhaseStatus::Success, PhaseEnd::new())
            .unwrap();
        assert!(collector.active_phases().is_empty());
    }

    #[test]
    fn pipeline_bracket() {
        let (clock, collector) = manual();
        assert_eq!(collector.pipeline_duration(), None);
        assert!(!collector.is_pipeline_complete());

        collector.set_pipeline_start();
        clock.advance(Duration::from_millis(100));
        let d1 = collector.pipeline_duration().unwrap();
        clock.advance(Duration::from_millis(100));
        let d2 = collector.pipeline_duration().unwrap();
        assert!(d2 > d1);
        assert!(!collector.is_pipeline_complete());

        collector.set_pipeline_end(PipelineStatus::Failed);
        let frozen = collector.pipeline_duration().unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(collector.pipeline_duration(), Some(frozen));
        assert_eq!(frozen, Duration::from_millis(200));
        assert!(collector.is_pipeline_complete());
        assert_eq!(collector.pipeline_status(), Some(PipelineStatus::Failed));
    }

    #[test]
    fn pipeline_timing_with_system_clock() {
        let collector = TelemetryCollector::new();
        collector.set_pipeline_start();
        thread::sleep(Duration::from_millis(100));
        let duration = collector.pipeline_duration().unwrap();
        assert!(duration > Duration::from_millis(50));
        assert!(duration < Duration::from_secs(5));
    }

    #[test]
    fn clear_resets_everything() {
        let (_clock, collector) = manual();
        collector.set_pipeline_start();
        collector.start_phase("A");
        collector.set_pipeline_end(PipelineStatus::Completed);

        collector.clear();
        assert!(collector.events().is_empty());
        assert!(collector.active_phases().is_empty());
        assert!(!collector.is_pipeline_complete());
        assert_eq!(collector.pipeline_duration(), None);
        // The cleared phase can no longer be ended.
        assert!(collector.end_phase("A", PhaseStatus::Success, PhaseEnd::new()).is_err());
    }

    #[test]
    fn listeners_see_start_and_end() {
        let (_clock, collector) = manual();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = collector.add_listener(move |e| sink.lock().unwrap().push(e.status));

        collector.start_phase("A");
        collector.end_phase("A", PhaseStatus::Success, PhaseEnd::new()).unwrap();
        assert!(collector.remove_listener(id));
        assert!(!collector.remove_listener(id));
        collector.start_phase("B");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![PhaseStatus::Running, PhaseStatus::Success]
        );
    }

    #[test]
    fn panicking_listener_does_not_break_others() {
        let (_clock, collector) = manual();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        collector.add_listener(|_| panic!("faulty observer"));
        collector.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        collector.start_phase("A");
        collector.end_phase("A", PhaseStatus::Success, PhaseEnd::new()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(collector.events().len(), 1);
    }

    #[test]
    fn listener_may_read_collector() {
        let collector = Arc::new(TelemetryCollector::new());
        let observed = Arc::new(AtomicUsize::new(0));
        let (reader, count) = (Arc::downgrade(&collector), observed.clone());
        collector.add_listener(move |_| {
            if let Some(c) = reader.upgrade() {
                count.store(c.events().len(), Ordering::SeqCst);
            }
        });

        collector.start_phase("A");
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_producers() {
        let collector = Arc::new(TelemetryCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("worker {worker} step {i}");
                        collector.start_phase(name.as_str());
                        collector
                            .end_phase(&name, PhaseStatus::Success, PhaseEnd::new())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = collector.events();
        assert_eq!(events.len(), 400);
        assert!(events.iter().all(|e| e.status == PhaseStatus::Success));
        assert!(collector.active_phases().is_empty());
    }

    #[test]
    fn snapshot_is_consistent() {
        let (clock, collector) = manual();
        collector.set_pipeline_start();
        collector.start_phase("A");
        clock.advance(Duration::from_millis(30));
        collector.end_phase("A", PhaseStatus::Success, PhaseEnd::new()).unwrap();
        collector.start_phase("B");
        clock.advance(Duration::from_millis(20));

        let snap = collector.snapshot();
        assert_eq!(snap.events.len(), 2);
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].name, "B");
        assert_eq!(snap.pipeline_duration, Some(Duration::from_millis(50)));
        assert_eq!(snap.active[0].elapsed_at(snap.taken_at), Duration::from_millis(20));
        assert!(!snap.is_pipeline_complete());
    }
}
