//! Derives everything one dashboard frame shows from a collector snapshot.
//!
//! Kept free of `ratatui` so the layout rules can be tested on plain data.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Local};
use phasewatch_telemetry::{CollectorSnapshot, PhaseEvent, PhaseStatus, PipelineStatus};

/// Format a duration for display: `-`, `340ms`, `12.3s`, or `2m 5.0s`.
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "-".to_string();
    };
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let minutes = (secs / 60.0).floor() as u64;
        format!("{minutes}m {:.1}s", secs % 60.0)
    }
}

// ---------------------------------------------------------------------------
// View types
// ---------------------------------------------------------------------------

/// One frame's worth of derived dashboard content.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub header: Header,
    /// Timeline rows, depth-first.
    pub timeline: Vec<TimelineRow>,
    /// Present once the pipeline has ended.
    pub summary: Option<PipelineSummary>,
    pub details: Details,
    /// Event counts per status, in taxonomy order, zeros omitted.
    pub tally: Vec<(PhaseStatus, usize)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// `None` until the pipeline bracket starts.
    pub elapsed: Option<Duration>,
    pub state: HeaderState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderState {
    Completed,
    Failed,
    /// Still running; an empty list means idle between phases.
    Running { active: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRow {
    /// Nesting level; 0 for top-level phases.
    pub depth: usize,
    pub name: String,
    pub status: PhaseStatus,
    /// Frozen duration, or live elapsed time for running phases.
    pub duration: Duration,
    pub live: bool,
    pub start_time: DateTime<Local>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSummary {
    pub status: PipelineStatus,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Details {
    /// Nothing has started yet.
    Waiting,
    /// A phase is running.
    Active {
        name: String,
        elapsed: Duration,
        model: Option<String>,
        notes: String,
        metadata: Vec<(String, String)>,
    },
    /// Nothing is running; shows the latest event.
    Last {
        name: String,
        status: PhaseStatus,
        duration: Option<Duration>,
        notes: String,
    },
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

impl DashboardView {
    pub fn from_snapshot(snapshot: &CollectorSnapshot) -> Self {
        let now = snapshot.taken_at;

        let state = match snapshot.pipeline_status {
            Some(PipelineStatus::Completed) => HeaderState::Completed,
            Some(PipelineStatus::Failed) => HeaderState::Failed,
            None => HeaderState::Running {
                active: snapshot.active.iter().map(|e| e.name.clone()).collect(),
            },
        };

        let summary = snapshot.pipeline_status.map(|status| PipelineSummary {
            status,
            duration: snapshot.pipeline_duration,
        });

        Self {
            header: Header {
                elapsed: snapshot.pipeline_duration,
                state,
            },
            timeline: timeline_rows(&snapshot.events, now),
            summary,
            details: details(snapshot),
            tally: tally(&snapshot.events),
        }
    }
}

/// Lay events out as a forest. An event whose `parent_phase` names an
/// earlier event goes under the most recent such event; otherwise it is
/// top-level. Siblings keep start order.
fn timeline_rows(events: &[PhaseEvent], now: Duration) -> Vec<TimelineRow> {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); events.len()];
    let mut roots = Vec::new();
    let mut latest: HashMap<&str, usize> = HashMap::new();

    for (i, event) in events.iter().enumerate() {
        let parent = event
            .parent_phase
            .as_deref()
            .and_then(|name| latest.get(name).copied());
        match parent {
            Some(p) => children[p].push(i),
            None => roots.push(i),
        }
        latest.insert(event.name.as_str(), i);
    }

    let mut rows = Vec::with_capacity(events.len());
    let mut stack: Vec<(usize, usize)> = roots.iter().rev().map(|&i| (i, 0)).collect();
    while let Some((i, depth)) = stack.pop() {
        let event = &events[i];
        rows.push(TimelineRow {
            depth,
            name: event.name.clone(),
            status: event.status,
            duration: event.elapsed_at(now),
            live: !event.is_terminal(),
            start_time: event.start_time,
            notes: event.notes.clone(),
        });
        stack.extend(children[i].iter().rev().map(|&c| (c, depth + 1)));
    }
    rows
}

fn details(snapshot: &CollectorSnapshot) -> Details {
    if let Some(active) = snapshot.active.first() {
        return Details::Active {
            name: active.name.clone(),
            elapsed: active.elapsed_at(snapshot.taken_at),
            model: active.model_used.clone(),
            notes: active.notes.clone(),
            metadata: active
                .metadata
                .iter()
                .map(|(k, v)| {
                    let shown = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), shown)
                })
                .collect(),
        };
    }

    match snapshot.events.last() {
        Some(last) => Details::Last {
            name: last.name.clone(),
            status: last.status,
            duration: last.duration,
            notes: last.notes.clone(),
        },
        None => Details::Waiting,
    }
}

fn tally(events: &[PhaseEvent]) -> Vec<(PhaseStatus, usize)> {
    PhaseStatus::ALL
        .into_iter()
        .map(|status| (status, events.iter().filter(|e| e.status == status).count()))
        .filter(|&(_, count)| count > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use phasewatch_telemetry::{ManualClock, PhaseEnd, PhaseSpec, TelemetryCollector};

    use super::*;

    fn collector() -> (Arc<ManualClock>, TelemetryCollector) {
        let clock = Arc::new(ManualClock::default());
        (clock.clone(), TelemetryCollector::with_clock(clock))
    }

    fn end(c: &TelemetryCollector, name: &str, status: PhaseStatus) {
        c.end_phase(name, status, PhaseEnd::new()).unwrap();
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(Duration::from_millis(340))), "340ms");
        assert_eq!(format_duration(Some(Duration::from_millis(12_340))), "12.3s");
        assert_eq!(format_duration(Some(Duration::from_millis(125_000))), "2m 5.0s");
    }

    #[test]
    fn empty_collector_view() {
        let (_clock, c) = collector();
        let view = DashboardView::from_snapshot(&c.snapshot());

        assert_eq!(view.header.elapsed, None);
        assert_eq!(view.header.state, HeaderState::Running { active: vec![] });
        assert!(view.timeline.is_empty());
        assert!(view.summary.is_none());
        assert_eq!(view.details, Details::Waiting);
        assert!(view.tally.is_empty());
    }

    #[test]
    fn children_nest_under_matching_parent() {
        let (_clock, c) = collector();
        c.start_phase("Clarify Agent");
        end(&c, "Clarify Agent", PhaseStatus::Success);
        c.start_phase("Researcher Agent");
        for i in 1..=2 {
            let name = format!("Research Subquery {i}");
            c.start_phase(PhaseSpec::new(name.as_str()).parent("Researcher Agent"));
            end(&c, &name, PhaseStatus::Success);
        }
        end(&c, "Researcher Agent", PhaseStatus::Success);
        c.start_phase("Report Agent");
        end(&c, "Report Agent", PhaseStatus::Failed);
        c.start_phase(PhaseSpec::recovery("Report Agent", "quality"));
        end(&c, "Report Agent (Recovery)", PhaseStatus::Success);

        let view = DashboardView::from_snapshot(&c.snapshot());
        let layout: Vec<(usize, &str)> = view
            .timeline
            .iter()
            .map(|r| (r.depth, r.name.as_str()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, "Clarify Agent"),
                (0, "Researcher Agent"),
                (1, "Research Subquery 1"),
                (1, "Research Subquery 2"),
                (0, "Report Agent"),
                (1, "Report Agent (Recovery)"),
            ]
        );
    }

    #[test]
    fn unknown_parent_renders_top_level() {
        let (_clock, c) = collector();
        c.start_phase(PhaseSpec::new("Orphan").parent("Never Ran"));
        let view = DashboardView::from_snapshot(&c.snapshot());
        assert_eq!(view.timeline.len(), 1);
        assert_eq!(view.timeline[0].depth, 0);
    }

    #[test]
    fn nesting_goes_deeper_than_one_level() {
        let (_clock, c) = collector();
        c.start_phase("Researcher Agent");
        c.start_phase(PhaseSpec::new("Research Subquery 1").parent("Researcher Agent"));
        c.start_phase(PhaseSpec::recovery("Research Subquery 1", "no results"));

        let view = DashboardView::from_snapshot(&c.snapshot());
        let depths: Vec<usize> = view.timeline.iter().map(|r| r.depth).collect();
        assert_eq!(depths, vec![0, 1, 2]);
    }

    #[test]
    fn active_phase_details_are_live() {
        let (clock, c) = collector();
        c.set_pipeline_start();
        c.start_phase(
            PhaseSpec::new("Researcher Agent")
                .model("gpt-4")
                .meta("total_subqueries", 3)
                .meta("topic", "solar"),
        );
        clock.advance(Duration::from_millis(1500));

        let view = DashboardView::from_snapshot(&c.snapshot());
        assert_eq!(
            view.header.state,
            HeaderState::Running {
                active: vec!["Researcher Agent".into()]
            }
        );
        assert!(view.timeline[0].live);
        assert_eq!(view.timeline[0].duration, Duration::from_millis(1500));
        match view.details {
            Details::Active {
                elapsed,
                model,
                metadata,
                ..
            } => {
                assert_eq!(elapsed, Duration::from_millis(1500));
                assert_eq!(model.as_deref(), Some("gpt-4"));
                assert!(metadata.contains(&("topic".into(), "solar".into())));
                assert!(metadata.contains(&("total_subqueries".into(), "3".into())));
            }
            other => panic!("expected active details, got {other:?}"),
        }
    }

    #[test]
    fn completed_pipeline_view() {
        let (clock, c) = collector();
        c.set_pipeline_start();
        c.start_phase("Evaluator Agent");
        clock.advance(Duration::from_millis(600));
        end(&c, "Evaluator Agent", PhaseStatus::Success);
        c.record_skip("Model Router Agent", "not needed");
        c.set_pipeline_end(PipelineStatus::Completed);

        let view = DashboardView::from_snapshot(&c.snapshot());
        assert_eq!(view.header.state, HeaderState::Completed);
        assert_eq!(
            view.summary,
            Some(PipelineSummary {
                status: PipelineStatus::Completed,
                duration: Some(Duration::from_millis(600)),
            })
        );
        assert!(matches!(
            view.details,
            Details::Last { status: PhaseStatus::Skipped, .. }
        ));
        assert_eq!(
            view.tally,
            vec![(PhaseStatus::Success, 1), (PhaseStatus::Skipped, 1)]
        );
    }
}
