//! Fixed-column job table shared by `qtop list` and the live view.
//!
//! Cells are padded by terminal display width, so wide glyphs and CJK job
//! names never shift the columns after them. Color is attached per cell as a
//! [`Tone`] and only turned into escapes (or ratatui styles) at the edge.

use crate::theme::{self, glyphs, Tone};
use qtop_core::metrics::JobMetrics;
use qtop_core::reconcile::Reconciled;
use qtop_core::units::{format_duration, format_gb, format_span};
use qtop_core::{JobRecord, JobState, Thresholds};
use std::cmp::Ordering;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const SEPARATOR: &str = "  ";
/// Room for `<seq>.<server>` ids such as `1234567.pbs-server01`.
const ID_WIDTH: usize = 24;
const NAME_WIDTH: usize = 20;
const NAME_MIN_WIDTH: usize = 8;
const NOTE_MIN_WIDTH: usize = 16;
const BAR_CELLS: usize = 10;
const ELLIPSIS: char = '…';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    List,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Id,
    /// Running (longest first), queued (longest waiting first), then
    /// terminal (most recently finished first).
    Lifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Name,
    Used,
    Progress,
    Walltime,
    Waited,
    Age,
    Cpus,
    CpuPercent,
    Ram,
    RamPercent,
    State,
    Queue,
    Source,
    Note,
}

impl Column {
    pub fn title(self) -> &'static str {
        match self {
            Column::Id => "job id",
            Column::Name => "name",
            Column::Used => "used",
            Column::Progress => "progress",
            Column::Walltime => "walltime",
            Column::Waited => "waited",
            Column::Age => "age",
            Column::Cpus => "cpus",
            Column::CpuPercent => "cpu%",
            Column::Ram => "ram",
            Column::RamPercent => "ram%",
            Column::State => "state",
            Column::Queue => "queue",
            Column::Source => "source",
            Column::Note => "note",
        }
    }

    /// Zero means "as wide as the content" (only the trailing note column).
    fn width(self) -> usize {
        let natural = match self {
            Column::Id => ID_WIDTH,
            Column::Name => NAME_WIDTH,
            Column::Used | Column::Walltime => 9,
            Column::Progress => BAR_CELLS + 7,
            Column::Waited | Column::Age => 6,
            Column::Cpus => 5,
            Column::CpuPercent | Column::RamPercent => 4,
            Column::Ram => 7,
            Column::State => 5,
            Column::Queue => 10,
            Column::Source => 8,
            Column::Note => return 0,
        };
        natural.max(self.title().width())
    }

    fn align(self) -> Align {
        match self {
            Column::Used
            | Column::Walltime
            | Column::Waited
            | Column::Age
            | Column::Cpus
            | Column::CpuPercent
            | Column::Ram
            | Column::RamPercent => Align::Right,
            _ => Align::Left,
        }
    }
}

pub fn columns_for(mode: ViewMode, any_terminal: bool) -> Vec<Column> {
    let mut columns = vec![
        Column::Id,
        Column::Name,
        Column::Used,
        Column::Progress,
        Column::Walltime,
        Column::Waited,
    ];
    if any_terminal {
        columns.push(Column::Age);
    }
    columns.extend([
        Column::Cpus,
        Column::CpuPercent,
        Column::Ram,
        Column::RamPercent,
        Column::State,
        Column::Queue,
    ]);
    if mode == ViewMode::Live {
        columns.push(Column::Source);
    }
    columns.push(Column::Note);
    columns
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub mode: ViewMode,
    pub sort: SortOrder,
    pub width: Option<u16>,
    pub show_queued: bool,
    pub max_jobs: Option<usize>,
    pub now: i64,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub tone: Tone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedLine {
    pub cells: Vec<Cell>,
}

impl RenderedLine {
    fn banner(text: String) -> Self {
        Self {
            cells: vec![Cell {
                text,
                tone: Tone::Attention,
            }],
        }
    }

    pub fn plain(&self) -> String {
        self.cells
            .iter()
            .map(|cell| cell.text.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    pub fn ansi(&self, color: bool) -> String {
        if !color {
            return self.plain();
        }
        self.cells
            .iter()
            .map(|cell| match theme::ansi_style(cell.tone) {
                Some(style) if !cell.text.is_empty() => style.apply(&cell.text).to_string(),
                _ => cell.text.clone(),
            })
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub warnings: Vec<RenderedLine>,
    pub header: RenderedLine,
    pub rows: Vec<RenderedLine>,
}

impl Report {
    pub fn lines(&self) -> impl Iterator<Item = &RenderedLine> {
        self.warnings
            .iter()
            .chain(std::iter::once(&self.header))
            .chain(self.rows.iter())
    }

    pub fn ansi_lines(&self, color: bool) -> Vec<String> {
        self.lines().map(|line| line.ansi(color)).collect()
    }

    #[cfg(test)]
    pub fn plain_lines(&self) -> Vec<String> {
        self.lines().map(RenderedLine::plain).collect()
    }
}

/// A record paired with the metrics derived for this refresh.
#[derive(Debug, Clone)]
pub struct JobView<'a> {
    pub job: &'a JobRecord,
    pub metrics: JobMetrics,
}

pub fn job_views<'a>(merged: &'a Reconciled, now: i64, thresholds: &Thresholds) -> Vec<JobView<'a>> {
    merged
        .records()
        .map(|job| JobView {
            job,
            metrics: JobMetrics::compute(job, now, thresholds),
        })
        .collect()
}

pub fn sort_views(views: &mut [JobView<'_>], order: SortOrder) {
    match order {
        SortOrder::Id => views.sort_by(|a, b| id_key(&a.job.id).cmp(&id_key(&b.job.id))),
        SortOrder::Lifecycle => views.sort_by(compare_lifecycle),
    }
}

/// Numeric job sequence first so `99.server` sorts before `100.server`.
fn id_key(id: &str) -> (Option<u64>, &str) {
    let digits_end = id.find(|c: char| !c.is_ascii_digit()).unwrap_or(id.len());
    (id[..digits_end].parse().ok(), id)
}

fn lifecycle_group(state: JobState) -> u8 {
    match state {
        JobState::Running => 0,
        JobState::Queued => 1,
        JobState::Completed | JobState::Finished => 2,
    }
}

fn compare_lifecycle(a: &JobView<'_>, b: &JobView<'_>) -> Ordering {
    let group = lifecycle_group(a.job.state);
    group
        .cmp(&lifecycle_group(b.job.state))
        .then_with(|| match group {
            0 => b.metrics.walltime_used.cmp(&a.metrics.walltime_used),
            1 => missing_last(a.job.queued_at, b.job.queued_at),
            _ => b.job.ended_at.cmp(&a.job.ended_at),
        })
        .then_with(|| id_key(&a.job.id).cmp(&id_key(&b.job.id)))
}

fn missing_last(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn render(merged: &Reconciled, options: &RenderOptions) -> Report {
    let mut views = job_views(merged, options.now, &options.thresholds);
    if !options.show_queued {
        views.retain(|view| view.job.state != JobState::Queued);
    }
    sort_views(&mut views, options.sort);

    let any_terminal = views.iter().any(|view| view.job.is_terminal());
    let columns = columns_for(options.mode, any_terminal);
    let widths = layout(&columns, options.width);

    let header = build_line(
        columns
            .iter()
            .map(|column| (column.title().to_string(), Tone::Header)),
        &columns,
        &widths,
    );
    let rows = views
        .iter()
        .map(|view| {
            build_line(
                columns.iter().map(|column| cell_content(*column, view)),
                &columns,
                &widths,
            )
        })
        .collect();

    Report {
        warnings: truncation_warnings(merged, options.max_jobs),
        header,
        rows,
    }
}

fn truncation_warnings(merged: &Reconciled, max_jobs: Option<usize>) -> Vec<RenderedLine> {
    let limit = max_jobs
        .map(|max| format!(" at {max} jobs"))
        .unwrap_or_default();
    let mut warnings = Vec::new();
    if merged.active_truncated {
        warnings.push(RenderedLine::banner(format!(
            "warning: active source truncated{limit}; raise --max-jobs to see more"
        )));
    }
    if merged.history_truncated {
        warnings.push(RenderedLine::banner(format!(
            "warning: history source truncated{limit}; raise --max-jobs to see more"
        )));
    }
    warnings
}

/// Resolves column widths; with a known terminal width the name column
/// gives way first and the note column takes whatever is left.
fn layout(columns: &[Column], width: Option<u16>) -> Vec<usize> {
    let mut widths: Vec<usize> = columns.iter().map(|column| column.width()).collect();
    let Some(total) = width.map(usize::from) else {
        return widths;
    };

    let separators = SEPARATOR.len() * columns.len().saturating_sub(1);
    let fixed: usize = columns
        .iter()
        .zip(&widths)
        .filter(|(column, _)| !matches!(column, Column::Name | Column::Note))
        .map(|(_, width)| *width)
        .sum::<usize>()
        + separators;

    let name_width = total
        .saturating_sub(fixed + NOTE_MIN_WIDTH)
        .clamp(NAME_MIN_WIDTH, NAME_WIDTH);
    let note_width = total.saturating_sub(fixed + name_width).max(1);
    for (column, slot) in columns.iter().zip(widths.iter_mut()) {
        match column {
            Column::Name => *slot = name_width,
            Column::Note => *slot = note_width,
            _ => {}
        }
    }
    widths
}

fn build_line<I>(contents: I, columns: &[Column], widths: &[usize]) -> RenderedLine
where
    I: IntoIterator<Item = (String, Tone)>,
{
    let last = columns.len().saturating_sub(1);
    let cells = contents
        .into_iter()
        .zip(columns.iter().zip(widths))
        .enumerate()
        .map(|(index, ((text, tone), (column, width)))| {
            let text = if index == last && *column == Column::Note {
                if *width == 0 {
                    text
                } else {
                    truncate(&text, *width)
                }
            } else {
                fit(&text, *width, column.align())
            };
            Cell { text, tone }
        })
        .collect();
    RenderedLine { cells }
}

fn cell_content(column: Column, view: &JobView<'_>) -> (String, Tone) {
    let job = view.job;
    let metrics = &view.metrics;
    let plain = |text: Option<String>| (text.unwrap_or_default(), Tone::Plain);
    match column {
        Column::Id => (job.id.clone(), Tone::Plain),
        Column::Name => (job.name.clone(), Tone::Plain),
        Column::Used => (
            metrics
                .walltime_used
                .map(format_duration)
                .unwrap_or_default(),
            time_tone(job, metrics),
        ),
        Column::Progress => (
            metrics.progress.map(progress_bar).unwrap_or_default(),
            time_tone(job, metrics),
        ),
        Column::Walltime => plain(job.walltime_total.map(format_duration)),
        Column::Waited => plain(metrics.waited.map(format_span)),
        Column::Age => plain(metrics.age.map(format_span)),
        Column::Cpus => plain(job.cpu_count_requested.map(|cpus| {
            if metrics.high_cpu_request {
                format!("{cpus}{}", glyphs::CPU)
            } else {
                cpus.to_string()
            }
        })),
        Column::CpuPercent => plain(metrics.cpu_percent.map(|pct| format!("{pct:.0}%"))),
        Column::Ram => plain(job.memory_requested_kb.map(|kb| {
            if metrics.high_ram_request {
                format!("{}{}", format_gb(kb), glyphs::RAM)
            } else {
                format_gb(kb)
            }
        })),
        Column::RamPercent => plain(metrics.ram_percent.map(|pct| format!("{pct:.0}%"))),
        Column::State => (job.state.as_str().to_string(), state_tone(job.state)),
        Column::Queue => (job.queue.clone(), Tone::Plain),
        Column::Source => (job.source.as_str().to_string(), Tone::Muted),
        Column::Note => (metrics.note().unwrap_or_default(), Tone::Attention),
    }
}

fn time_tone(job: &JobRecord, metrics: &JobMetrics) -> Tone {
    if job.state != JobState::Running {
        Tone::Plain
    } else if metrics.near_walltime_limit {
        Tone::Attention
    } else {
        Tone::Ok
    }
}

fn state_tone(state: JobState) -> Tone {
    match state {
        JobState::Running => Tone::Ok,
        JobState::Queued => Tone::Plain,
        JobState::Completed | JobState::Finished => Tone::Muted,
    }
}

fn progress_bar(progress: f64) -> String {
    let filled = ((progress * BAR_CELLS as f64).round() as usize).min(BAR_CELLS);
    let percent = format!("{:.0}%", progress * 100.0);
    let bar: String = std::iter::repeat(glyphs::BAR_FULL)
        .take(filled)
        .chain(std::iter::repeat(glyphs::BAR_EMPTY).take(BAR_CELLS - filled))
        .collect();
    format!("[{bar}] {percent:>4}")
}

/// Pads or truncates to exactly `width` display columns.
fn fit(text: &str, width: usize, align: Align) -> String {
    let body = truncate(text, width);
    let pad = " ".repeat(width.saturating_sub(body.width()));
    match align {
        Align::Left => format!("{body}{pad}"),
        Align::Right => format!("{pad}{body}"),
    }
}

/// Cuts to at most `width` display columns, marking the cut with an ellipsis.
/// A wide glyph that would straddle the edge is dropped, never split.
fn truncate(text: &str, width: usize) -> String {
    if text.width() <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let budget = width - 1;
    let mut used = 0;
    let mut out = String::new();
    for ch in text.chars() {
        let ch_width = ch.width().unwrap_or(0);
        if used + ch_width > budget {
            break;
        }
        used += ch_width;
        out.push(ch);
    }
    out.push(ELLIPSIS);
    out
}
