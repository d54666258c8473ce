//! Dashboard widgets.

use phasewatch_telemetry::{PhaseStatus, PipelineStatus};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::view::{DashboardView, Details, HeaderState, format_duration};

/// Single-width glyph for a status.
pub fn status_glyph(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "·",
        PhaseStatus::Running => "⟳",
        PhaseStatus::Success => "✔",
        PhaseStatus::Skipped => "»",
        PhaseStatus::Recovered => "↺",
        PhaseStatus::Failed => "✘",
    }
}

pub fn status_color(status: PhaseStatus) -> Color {
    match status {
        PhaseStatus::Pending => Color::Yellow,
        PhaseStatus::Running => Color::Cyan,
        PhaseStatus::Success => Color::Green,
        PhaseStatus::Skipped => Color::Blue,
        PhaseStatus::Recovered => Color::Magenta,
        PhaseStatus::Failed => Color::Red,
    }
}

fn dim() -> Style {
    Style::default().fg(Color::DarkGray)
}

/// Draw a whole frame.
pub(crate) fn draw(f: &mut Frame, view: &DashboardView, title: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(3),    // Timeline + details
            Constraint::Length(3), // Footer
        ])
        .split(f.area());

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(2, 3), Constraint::Ratio(1, 3)])
        .split(chunks[1]);

    f.render_widget(header(view, title), chunks[0]);
    draw_timeline(f, view, main[0]);
    f.render_widget(details(&view.details), main[1]);
    f.render_widget(footer(view), chunks[2]);
}

fn header<'a>(view: &DashboardView, title: &'a str) -> Paragraph<'a> {
    let elapsed = match view.header.elapsed {
        Some(d) => format_duration(Some(d)),
        None => "Starting...".to_string(),
    };

    let mut spans = vec![Span::styled(
        format!("{title} "),
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )];
    let bold = Style::default().add_modifier(Modifier::BOLD);
    match &view.header.state {
        HeaderState::Completed => {
            spans.push(Span::styled(format!("│ Completed in {elapsed}"), bold.fg(Color::Green)));
        }
        HeaderState::Failed => {
            spans.push(Span::styled(format!("│ Failed after {elapsed}"), bold.fg(Color::Red)));
        }
        HeaderState::Running { active } => {
            spans.push(Span::styled(format!("│ Runtime: {elapsed}"), bold));
            if active.is_empty() {
                spans.push(Span::styled(
                    " │ Idle – awaiting next phase",
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::DIM),
                ));
            } else {
                spans.push(Span::styled(
                    format!(" │ Active: {}", active.join(", ")),
                    bold.fg(Color::Yellow),
                ));
            }
        }
    }

    Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Pipeline Status ")
            .border_style(Style::default().fg(Color::Cyan)),
    )
}

fn draw_timeline(f: &mut Frame, view: &DashboardView, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Execution Timeline ")
        .border_style(Style::default().fg(Color::Blue));

    if view.timeline.is_empty() {
        let empty = Paragraph::new("No phases started yet...").style(dim()).block(block);
        f.render_widget(empty, area);
        return;
    }

    let mut lines: Vec<Line> = Vec::new();
    for row in &view.timeline {
        let indent = "   ".repeat(row.depth);
        let color = status_color(row.status);
        let duration = format_duration(Some(row.duration));
        let duration = if row.live {
            format!(" ({duration}…) ")
        } else {
            format!(" ({duration}) ")
        };

        lines.push(Line::from(vec![
            Span::raw(indent.clone()),
            Span::styled(format!("{} ", status_glyph(row.status)), Style::default().fg(color)),
            Span::styled(
                row.name.clone(),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::styled(duration, dim()),
            Span::styled(
                format!("[{}]", row.start_time.format("%H:%M:%S")),
                Style::default().fg(Color::Blue),
            ),
        ]));
        if !row.notes.is_empty() {
            lines.push(Line::from(Span::styled(
                format!("{indent}   {}", row.notes),
                dim(),
            )));
        }
    }

    if let Some(summary) = view.summary {
        let (glyph, label, color) = match summary.status {
            PipelineStatus::Completed => ("■", "Pipeline Completed", Color::Green),
            PipelineStatus::Failed => ("✘", "Pipeline Failed", Color::Red),
        };
        let style = Style::default().fg(color).add_modifier(Modifier::BOLD);
        let mut spans = vec![
            Span::styled(format!("{glyph} "), style),
            Span::styled(label, style),
        ];
        if summary.duration.is_some() {
            spans.push(Span::styled(format!(" ({})", format_duration(summary.duration)), dim()));
        }
        lines.push(Line::from(spans));
    }

    // Keep the newest rows in view once the timeline outgrows its panel.
    let visible = area.height.saturating_sub(2) as usize;
    let offset = lines.len().saturating_sub(visible) as u16;
    let timeline = Paragraph::new(lines).block(block).scroll((offset, 0));
    f.render_widget(timeline, area);
}

fn details(details: &Details) -> Paragraph<'static> {
    let bold = Style::default().add_modifier(Modifier::BOLD);
    let (lines, title, border) = match details {
        Details::Waiting => (
            vec![Line::from(Span::styled("Waiting for pipeline to start...", dim()))],
            " Phase Details ",
            Color::DarkGray,
        ),
        Details::Active {
            name,
            elapsed,
            model,
            notes,
            metadata,
        } => {
            let mut lines = vec![
                Line::from(vec![
                    Span::styled("Currently Running: ", bold),
                    Span::styled(name.clone(), bold.fg(Color::Cyan)),
                ]),
                Line::from(Span::styled(
                    format!("Running for: {}", format_duration(Some(*elapsed))),
                    dim(),
                )),
            ];
            if let Some(model) = model {
                lines.push(Line::from(Span::styled(format!("Model: {model}"), dim())));
            }
            if !notes.is_empty() {
                lines.push(Line::from(Span::styled(format!("Notes: {notes}"), dim())));
            }
            if !metadata.is_empty() {
                lines.push(Line::from(""));
                lines.push(Line::from(Span::styled("Metadata:", bold)));
                for (key, value) in metadata {
                    lines.push(Line::from(Span::styled(format!("  {key}: {value}"), dim())));
                }
            }
            (lines, " Current Phase ", Color::Cyan)
        }
        Details::Last {
            name,
            status,
            duration,
            notes,
        } => {
            let mut lines = vec![
                Line::from(vec![
                    Span::styled("Last Phase: ", bold),
                    Span::styled(name.clone(), bold.fg(Color::White)),
                ]),
                Line::from(Span::styled(
                    format!("Status: {}", capitalize(status.as_str())),
                    Style::default().fg(status_color(*status)),
                )),
            ];
            if duration.is_some() {
                lines.push(Line::from(Span::styled(
                    format!("Duration: {}", format_duration(*duration)),
                    dim(),
                )));
            }
            if !notes.is_empty() {
                lines.push(Line::from(Span::styled(format!("Notes: {notes}"), dim())));
            }
            (lines, " Phase Details ", Color::Green)
        }
    };

    Paragraph::new(lines).wrap(Wrap { trim: false }).block(
        Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(border)),
    )
}

fn footer(view: &DashboardView) -> Paragraph<'static> {
    let line = if view.tally.is_empty() {
        Line::from(Span::styled("Ready to start pipeline...", dim()))
    } else {
        let mut spans = vec![Span::styled("Status: ", Style::default().add_modifier(Modifier::BOLD))];
        for (i, (status, count)) in view.tally.iter().enumerate() {
            if i > 0 {
                spans.push(Span::raw(" │ "));
            }
            spans.push(Span::styled(
                format!("{} {} {count}", status_glyph(*status), status.as_str()),
                Style::default().fg(status_color(*status)),
            ));
        }
        Line::from(spans)
    };

    Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(dim()),
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
