use crate::live::App;
use crate::render::RenderedLine;
use crate::theme::{self, Tone};
use chrono::Utc;
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::Style,
    text::{Line, Span, Text},
    widgets::Paragraph,
    Frame,
};

const SEPARATOR: &str = "  ";

pub fn render(frame: &mut Frame, app: &App) {
    let size = frame.size();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(size);

    frame.render_widget(render_header(app), layout[0]);
    frame.render_widget(
        render_table(app, layout[1].width, layout[1].height),
        layout[1],
    );
    frame.render_widget(render_status(app), layout[2]);
}

fn render_header(app: &App) -> Paragraph<'static> {
    let counts = app.counts();
    let user = if app.user.is_empty() {
        "all users".to_string()
    } else {
        app.user.clone()
    };
    let summary = format!(
        "qtop  {user}  running {}  queued {}  done {}  finished {}  [{}]",
        counts.running,
        counts.queued,
        counts.completed,
        counts.finished,
        app.phase.as_str()
    );
    let refreshed = app
        .last_refresh
        .map(|at| format!("refreshed {}s ago", at.elapsed().as_secs()))
        .unwrap_or_else(|| "waiting for first refresh".to_string());

    let mut detail = vec![Span::styled(
        format!("{refreshed}  {}", app.loader_status),
        theme::STATUS_STYLE,
    )];
    if let Some(err) = app.last_error.as_deref() {
        detail.push(Span::styled(
            format!("  error: {err}"),
            theme::tui_style(Tone::Attention),
        ));
    }

    Paragraph::new(Text::from(vec![
        Line::from(Span::styled(summary, theme::TITLE_STYLE)),
        Line::from(detail),
    ]))
}

/// Banners and the column header stay pinned; only job rows scroll.
fn render_table(app: &App, width: u16, height: u16) -> Paragraph<'static> {
    let report = app.report(Utc::now().timestamp(), Some(width));
    let pinned = report.warnings.len() + 1;
    let visible = usize::from(height).saturating_sub(pinned);
    let scroll = app.scroll.min(report.rows.len().saturating_sub(1));

    let mut lines: Vec<Line<'static>> = report
        .warnings
        .iter()
        .map(|line| styled_line(line, Style::new()))
        .collect();
    lines.push(styled_line(&report.header, Style::new()));
    lines.extend(
        report
            .rows
            .iter()
            .enumerate()
            .skip(scroll)
            .take(visible)
            .map(|(index, row)| styled_line(row, theme::zebra_row_style(index))),
    );
    if report.rows.is_empty() {
        lines.push(Line::from(Span::styled(
            "no jobs",
            theme::tui_style(Tone::Muted),
        )));
    }
    Paragraph::new(Text::from(lines))
}

fn styled_line(line: &RenderedLine, base: Style) -> Line<'static> {
    let mut spans = Vec::with_capacity(line.cells.len() * 2);
    for (index, cell) in line.cells.iter().enumerate() {
        if index > 0 {
            spans.push(Span::styled(SEPARATOR, base));
        }
        spans.push(Span::styled(
            cell.text.clone(),
            base.patch(theme::tui_style(cell.tone)),
        ));
    }
    Line::from(spans)
}

fn render_status(app: &App) -> Paragraph<'static> {
    let keys = "q quit  r refresh  h toggle queued  j/k scroll  g top";
    let line = match app.status.as_deref() {
        Some(note) => Line::from(vec![
            Span::styled(note.to_string(), theme::tui_style(Tone::Ok)),
            Span::styled(format!("  |  {keys}"), theme::STATUS_STYLE),
        ]),
        None => Line::from(Span::styled(keys, theme::STATUS_STYLE)),
    };
    Paragraph::new(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, Settings, SourceArgs};
    use qtop_core::reconcile::SourceBatch;
    use qtop_core::{JobRecord, JobState, Source};
    use ratatui::{backend::TestBackend, Terminal};

    fn buffer_text(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let area = buffer.area;
        let mut text = String::new();
        for y in 0..area.height {
            for x in 0..area.width {
                text.push_str(buffer.get(x, y).symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn frame_shows_counts_rows_and_keys() {
        let mut settings = Settings::resolve(&SourceArgs::default(), FileConfig::default());
        settings.user = "alice".to_string();
        let mut app = App::new(&settings);
        app.apply_active(Ok(SourceBatch {
            source: Source::Active,
            records: vec![JobRecord {
                id: "42.pbs".to_string(),
                name: "solver".to_string(),
                state: JobState::Running,
                ..JobRecord::default()
            }],
            ..SourceBatch::default()
        }));

        let mut terminal = Terminal::new(TestBackend::new(200, 10)).expect("terminal");
        terminal
            .draw(|frame| render(frame, &app))
            .expect("draw");
        let text = buffer_text(&terminal);
        assert!(text.contains("running 1"));
        assert!(text.contains("42.pbs"));
        assert!(text.contains("solver"));
        assert!(text.contains("q quit"));
    }
}
