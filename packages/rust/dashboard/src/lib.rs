//! Live terminal dashboard for pipeline telemetry.
//!
//! A [`Visualizer`] polls a [`TelemetryCollector`](phasewatch_telemetry::TelemetryCollector)
//! from one background thread and redraws a `ratatui` view of it: header,
//! hierarchical timeline, phase details, and a status tally. It only reads
//! the collector and never fails the pipeline it watches.

mod view;
mod visualizer;
mod widgets;

pub use view::{
    DashboardView, Details, Header, HeaderState, PipelineSummary, TimelineRow, format_duration,
};
pub use visualizer::{
    DashboardConfig, LoopState, RENDER_THREAD_NAME, Visualizer, VisualizerGuard, visualize_pipeline,
};
pub use widgets::{status_color, status_glyph};
