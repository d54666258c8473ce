//! Phase telemetry for the research pipeline.
//!
//! Pipeline stages wrap their work in [`record_phase`] (or the matching
//! [`TelemetryCollector`] methods); the collector keeps an append-only log of
//! [`PhaseEvent`]s that readers such as the live dashboard copy out through
//! [`TelemetryCollector::snapshot`].

pub mod clock;
pub mod collector;
pub mod event;
pub mod export;
pub mod recording;

use std::sync::{Arc, LazyLock};

pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{CollectorSnapshot, ListenerId, TelemetryCollector};
pub use event::{
    EventId, Metadata, PhaseEnd, PhaseEvent, PhaseRecord, PhaseSpec, PhaseStatus, PipelineStatus,
};
pub use export::{export_jsonl, write_jsonl};
pub use recording::{
    PhaseGuard, record_phase, record_phase_async, record_recovery, record_skip,
    recovery_phase_name,
};

static DEFAULT_COLLECTOR: LazyLock<Arc<TelemetryCollector>> =
    LazyLock::new(|| Arc::new(TelemetryCollector::new()));

/// Process-wide default collector shared by every pipeline stage.
///
/// Tests should build their own [`TelemetryCollector`] instead.
pub fn telemetry_collector() -> Arc<TelemetryCollector> {
    Arc::clone(&DEFAULT_COLLECTOR)
}
