//! Phase event model: statuses, events, and the builders used to start and
//! end them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form caller context attached to an event.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    /// Reserved for staged scheduling; never produced by the collector.
    Pending,
    Running,
    Success,
    Skipped,
    Recovered,
    Failed,
}

impl PhaseStatus {
    /// Every status, in display order.
    pub const ALL: [PhaseStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Success,
        Self::Skipped,
        Self::Recovered,
        Self::Failed,
    ];

    /// Whether a phase in this status has ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Skipped | Self::Recovered | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Recovered => "recovered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of the whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one event (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Everything known about a phase when it starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseSpec {
    pub name: String,
    pub notes: String,
    pub model_used: Option<String>,
    pub parent_phase: Option<String>,
    pub recovery_reason: Option<String>,
    pub metadata: Metadata,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    /// Group this phase under another one in the timeline (by name).
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_phase = Some(parent.into());
        self
    }

    pub fn recovery_reason(mut self, reason: impl Into<String>) -> Self {
        self.recovery_reason = Some(reason.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for PhaseSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PhaseSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Extra details merged into an event when it ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseEnd {
    /// Replaces the event's notes when non-empty.
    pub notes: String,
    pub recovery_reason: Option<String>,
    pub metadata: Metadata,
}

impl PhaseEnd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn recovery_reason(mut self, reason: impl Into<String>) -> Self {
        self.recovery_reason = Some(reason.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// PhaseEvent
// ---------------------------------------------------------------------------

/// One instrumented unit of pipeline work.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEvent {
    pub id: EventId,
    pub name: String,
    pub status: PhaseStatus,
    /// Wall-clock start, for display only.
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    /// Monotonic duration; `None` until the phase ends.
    pub duration: Option<Duration>,
    pub notes: String,
    pub model_used: Option<String>,
    pub recovery_reason: Option<String>,
    /// Name of the phase this one is displayed under.
    pub parent_phase: Option<String>,
    pub metadata: Metadata,
    start_mono: Duration,
}

impl PhaseEvent {
    pub(crate) fn begin(spec: PhaseSpec, wall: DateTime<Local>, mono: Duration) -> Self {
        Self {
            id: EventId::new(),
            name: spec.name,
            status: PhaseStatus::Running,
            start_time: wall,
            end_time: None,
            duration: None,
            notes: spec.notes,
            model_used: spec.model_used,
            recovery_reason: spec.recovery_reason,
            parent_phase: spec.parent_phase,
            metadata: spec.metadata,
            start_mono: mono,
        }
    }

    /// Freeze the event. Callers guarantee it is still running and `status`
    /// is terminal.
    pub(crate) fn finish(
        &mut self,
        status: PhaseStatus,
        end: PhaseEnd,
        wall: DateTime<Local>,
        mono: Duration,
    ) {
        debug_assert!(self.status == PhaseStatus::Running && status.is_terminal());
        self.status = status;
        self.end_time = Some(wall);
        self.duration = Some(mono.saturating_sub(self.start_mono));
        if !end.notes.is_empty() {
            self.notes = end.notes;
        }
        if end.recovery_reason.is_some() {
            self.recovery_reason = end.recovery_reason;
        }
        self.metadata.extend(end.metadata);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Monotonic reading taken when the phase started.
    pub fn started_at(&self) -> Duration {
        self.start_mono
    }

    /// Frozen duration once terminal, otherwise time elapsed up to `now`
    /// (a monotonic reading from the same clock).
    pub fn elapsed_at(&self, now: Duration) -> Duration {
        self.duration
            .unwrap_or_else(|| now.saturating_sub(self.start_mono))
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration.map(|d| d.as_secs_f64())
    }

    /// Flatten into a serializable record for log shipping.
    pub fn to_record(&self) -> PhaseRecord {
        PhaseRecord {
            id: self.id,
            phase_name: self.name.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration: self.duration_secs(),
            notes: self.notes.clone(),
            model_used: self.model_used.clone(),
            recovery_reason: self.recovery_reason.clone(),
            parent_phase: self.parent_phase.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Flat key-value form of a [`PhaseEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: EventId,
    pub phase_name: String,
    pub status: PhaseStatus,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    /// Seconds.
    pub duration: Option<f64>,
    pub notes: String,
    pub model_used: Option<String>,
    pub recovery_reason: Option<String>,
    pub parent_phase: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}
