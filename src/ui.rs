use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use invigil::session::SessionPhase;
use invigil::util::format_clock;

use crate::Snapshot;

const HORIZONTAL_MARGIN: u16 = 5;
const VERTICAL_MARGIN: u16 = 1;

pub fn render(f: &mut Frame, snap: &Snapshot) {
    let bold = Style::default().add_modifier(Modifier::BOLD);
    let dim = Style::default().add_modifier(Modifier::DIM);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(HORIZONTAL_MARGIN)
        .vertical_margin(VERTICAL_MARGIN)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(2),
        ])
        .split(f.area());

    let header = Paragraph::new(Line::from(vec![
        Span::styled(format!("session {}", snap.session_id), bold),
        Span::raw("  ·  "),
        Span::styled(snap.phase.to_string(), phase_style(snap.phase).patch(bold)),
    ]))
    .block(Block::default().borders(Borders::BOTTOM))
    .alignment(Alignment::Center);
    f.render_widget(header, chunks[0]);

    render_body(f, chunks[1], snap);

    let hints = Paragraph::new(Span::styled(hints_for(snap), dim))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });
    f.render_widget(hints, chunks[2]);
}

fn phase_style(phase: SessionPhase) -> Style {
    let color = match phase {
        SessionPhase::Gate => Color::Yellow,
        SessionPhase::Instructions => Color::Cyan,
        SessionPhase::InProgress => Color::Green,
        SessionPhase::Submitting => Color::Magenta,
        SessionPhase::Finished => Color::Green,
        SessionPhase::Aborted => Color::Red,
    };
    Style::default().fg(color)
}

fn render_body(f: &mut Frame, area: Rect, snap: &Snapshot) {
    let bold = Style::default().add_modifier(Modifier::BOLD);
    let mut lines: Vec<Line> = Vec::new();

    match snap.phase {
        SessionPhase::Gate => {
            lines.push(Line::from(Span::styled(
                format!("exam unlocks in {}", format_clock(snap.dwell_remaining)),
                bold.fg(Color::Yellow),
            )));
            lines.push(Line::from(
                "use this time to settle in; the start key appears when the wait ends",
            ));
        }
        SessionPhase::Instructions => {
            lines.push(Line::from(Span::styled("Instructions", bold)));
            lines.push(Line::from(
                "answer every question you can; the timer starts the moment you begin",
            ));
            lines.push(Line::from(
                "leaving the window is recorded and too many violations end the exam",
            ));
        }
        SessionPhase::InProgress => {
            lines.push(Line::from(Span::styled(
                format!("time remaining  {}", format_clock(snap.remaining)),
                bold.fg(Color::Green),
            )));
            lines.push(Line::from(format!("answers recorded: {}", snap.answers)));

            if snap.violations > 0 {
                lines.push(Line::from(Span::styled(
                    format!("violations: {}", snap.violations),
                    bold.fg(Color::Red),
                )));
            }
            if snap.degraded {
                lines.push(Line::from(Span::styled(
                    "proctoring unavailable - continuing unmonitored",
                    Style::default().fg(Color::Yellow),
                )));
            }
            if let Some(exec) = &snap.last_exec {
                lines.push(Line::from(format!(
                    "sample run: exit {} in {}ms: {}",
                    exec.exit_code,
                    exec.runtime_ms,
                    exec.stdout.trim_end()
                )));
            }
            if snap.end_confirm_pending {
                lines.push(Line::from(Span::styled(
                    "finish the exam now? (y/n)",
                    bold.fg(Color::Magenta),
                )));
            }
        }
        SessionPhase::Submitting => {
            lines.push(Line::from(Span::styled(
                "submitting answers...",
                bold.fg(Color::Magenta),
            )));
            lines.push(Line::from("answers are retried until the server confirms"));
        }
        SessionPhase::Finished => {
            lines.push(Line::from(Span::styled("submission confirmed", bold)));
            if let Some(receipt) = &snap.receipt {
                lines.push(Line::from(format!("receipt {}", receipt.submission_id)));
                if let Some(score) = receipt.score_percent {
                    let passed = score >= snap.pass_mark_percent;
                    let (verdict, color) = if passed {
                        ("pass", Color::Green)
                    } else {
                        ("fail", Color::Red)
                    };
                    lines.push(Line::from(Span::styled(
                        format!("score {score:.1}% - {verdict}"),
                        bold.fg(color),
                    )));
                }
            }
        }
        SessionPhase::Aborted => {
            lines.push(Line::from(Span::styled(
                "session aborted",
                bold.fg(Color::Red),
            )));
            if let Some(error) = &snap.error {
                lines.push(Line::from(error.clone()));
            }
        }
    }

    let body = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });
    f.render_widget(body, centered(area));
}

/// Push the body text toward the vertical middle of its area.
fn centered(area: Rect) -> Rect {
    let pad = area.height.saturating_sub(8) / 2;
    Rect {
        y: area.y + pad,
        height: area.height - pad,
        ..area
    }
}

fn hints_for(snap: &Snapshot) -> String {
    match snap.phase {
        SessionPhase::Gate => "(esc) leave".into(),
        SessionPhase::Instructions => "(s) start exam  (esc) leave".into(),
        SessionPhase::InProgress => {
            "(1-9) answer  (j) run sample  (e) end  (x) fullscreen-exit  (t) tab-hide  (r) reacquire  (esc) leave"
                .into()
        }
        SessionPhase::Submitting => "(esc) leave".into(),
        SessionPhase::Finished | SessionPhase::Aborted => "(esc) quit".into(),
    }
}
