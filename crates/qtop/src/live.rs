use crate::config::Settings;
use crate::loader::{HistoryLoader, HistorySnapshot};
use crate::render::{self, RenderOptions, Report, SortOrder, ViewMode};
use crate::source::SourceReader;
use crate::ui;
use anyhow::Result;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use qtop_core::reconcile::{promote_finished, reconcile, Reconciled, SourceBatch};
use qtop_core::{JobState, Source, Thresholds};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::collections::HashSet;
use std::io;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const UI_TICK: Duration = Duration::from_millis(250);
const MIN_ACTIVE_TIMEOUT: Duration = Duration::from_secs(5);
const PAGE: usize = 10;

type ActiveRead = JoinHandle<Result<SourceBatch, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Refreshing,
    Rendered,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Refreshing => "refreshing",
            Phase::Rendered => "ok",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub finished: usize,
}

pub struct App {
    pub user: String,
    pub phase: Phase,
    pub show_queued: bool,
    pub scroll: usize,
    /// One-shot notices such as newly finished jobs.
    pub status: Option<String>,
    pub last_error: Option<String>,
    pub loader_status: String,
    pub last_refresh: Option<Instant>,
    /// Set when jobs left the active feed that history has not confirmed.
    pub history_wanted: bool,
    thresholds: Thresholds,
    max_jobs: usize,
    active: Option<SourceBatch>,
    history: Vec<SourceBatch>,
    merged: Reconciled,
    /// Every id the active feed reported this session.
    seen_active: HashSet<String>,
    announced: HashSet<String>,
    /// Vanished ids a history reload was already requested for.
    awaiting: HashSet<String>,
}

impl App {
    pub fn new(settings: &Settings) -> Self {
        Self {
            user: settings.user.clone(),
            phase: Phase::Idle,
            show_queued: settings.show_queued,
            scroll: 0,
            status: None,
            last_error: None,
            loader_status: String::new(),
            last_refresh: None,
            history_wanted: false,
            thresholds: settings.thresholds.clone(),
            max_jobs: settings.max_jobs,
            active: None,
            history: Vec::new(),
            merged: Reconciled::default(),
            seen_active: HashSet::new(),
            announced: HashSet::new(),
            awaiting: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn merged(&self) -> &Reconciled {
        &self.merged
    }

    pub fn begin_refresh(&mut self) {
        self.phase = Phase::Refreshing;
    }

    /// A failed read keeps the previous active batch so running jobs do not
    /// flicker out of the table (and get promoted) on a transient error.
    pub fn apply_active(&mut self, result: Result<SourceBatch, String>) {
        match result {
            Ok(batch) => {
                debug!(records = batch.records.len(), "active refresh");
                self.active = Some(batch);
                self.last_error = None;
                self.last_refresh = Some(Instant::now());
                self.rebuild();
            }
            Err(err) => {
                warn!("active refresh failed: {err}");
                self.last_error = Some(err);
            }
        }
        self.phase = Phase::Rendered;
    }

    pub fn apply_history(&mut self, snapshot: HistorySnapshot) {
        if snapshot.all_failed() {
            return;
        }
        self.history = snapshot.batches;
        self.rebuild();
    }

    /// Re-merges the latest batches and swaps the result in whole.
    fn rebuild(&mut self) {
        let current_active = self
            .active
            .as_ref()
            .map(SourceBatch::ids)
            .unwrap_or_default();
        self.seen_active.extend(current_active.iter().cloned());

        let batches = self.active.iter().chain(&self.history).cloned();
        let mut merged = reconcile(batches);
        let promoted = promote_finished(&mut merged, &self.seen_active, &current_active);
        let fresh: Vec<String> = promoted
            .into_iter()
            .filter(|id| self.announced.insert(id.clone()))
            .collect();
        if !fresh.is_empty() {
            self.status = Some(format!("finished: {}", fresh.join(", ")));
        }

        let in_history: HashSet<&str> = self
            .history
            .iter()
            .flat_map(|batch| batch.records.iter().map(|job| job.id.as_str()))
            .collect();
        for id in self.seen_active.difference(&current_active) {
            if !in_history.contains(id.as_str()) && self.awaiting.insert(id.clone()) {
                self.history_wanted = true;
            }
        }
        self.merged = merged;
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for job in self.merged.records() {
            match job.state {
                JobState::Running => counts.running += 1,
                JobState::Queued => counts.queued += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Finished => counts.finished += 1,
            }
        }
        counts
    }

    pub fn report(&self, now: i64, width: Option<u16>) -> Report {
        render::render(
            &self.merged,
            &RenderOptions {
                mode: ViewMode::Live,
                sort: SortOrder::Lifecycle,
                width,
                show_queued: self.show_queued,
                max_jobs: Some(self.max_jobs),
                now,
                thresholds: self.thresholds.clone(),
            },
        )
    }
}

/// Returns true when the session should end.
pub fn handle_key(key: KeyEvent, app: &mut App, refresh_requested: &mut bool) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return true;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('r') => {
            *refresh_requested = true;
            false
        }
        KeyCode::Char('h') => {
            app.show_queued = !app.show_queued;
            app.scroll = 0;
            app.status = Some(if app.show_queued {
                "showing queued jobs".to_string()
            } else {
                "hiding queued jobs".to_string()
            });
            false
        }
        KeyCode::Down | KeyCode::Char('j') => {
            app.scroll = app.scroll.saturating_add(1);
            false
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.scroll = app.scroll.saturating_sub(1);
            false
        }
        KeyCode::PageDown => {
            app.scroll = app.scroll.saturating_add(PAGE);
            false
        }
        KeyCode::PageUp => {
            app.scroll = app.scroll.saturating_sub(PAGE);
            false
        }
        KeyCode::Char('g') | KeyCode::Home => {
            app.scroll = 0;
            false
        }
        _ => false,
    }
}

/// A hung `qstat` must never hold the loop longer than this.
pub fn active_timeout(interval: Duration) -> Duration {
    (interval * 3).max(MIN_ACTIVE_TIMEOUT)
}

fn spawn_active_read(reader: SourceReader, timeout: Duration) -> ActiveRead {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, reader.read(Source::Active)).await {
            Ok(Ok(batch)) => Ok(batch),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "active read timed out after {}s",
                timeout.as_secs()
            )),
        }
    })
}

/// Resolves when the in-flight active read completes; pends forever when
/// there is none so it can sit in a `select!`.
async fn next_active(pending: &mut Option<ActiveRead>) -> Result<SourceBatch, String> {
    let Some(handle) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = handle.await;
    *pending = None;
    match outcome {
        Ok(result) => result,
        Err(err) => Err(format!("active read task failed: {err}")),
    }
}

pub async fn run(settings: Settings) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, &settings).await;
    restore_terminal(&mut terminal)?;
    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    settings: &Settings,
) -> Result<()> {
    let reader = SourceReader::new(settings);
    let read_timeout = active_timeout(settings.interval);
    let mut app = App::new(settings);
    let mut loader = HistoryLoader::new();
    loader.start(reader.clone());

    let mut events = EventStream::new();
    let mut refresh_ticker = tokio::time::interval(settings.interval);
    refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ui_ticker = tokio::time::interval(UI_TICK);
    let mut pending: Option<ActiveRead> = None;
    let mut refresh_requested = false;

    loop {
        if refresh_requested && pending.is_none() {
            app.begin_refresh();
            pending = Some(spawn_active_read(reader.clone(), read_timeout));
        }
        refresh_requested = false;

        if let Some(snapshot) = loader.poll() {
            app.apply_history(snapshot);
        }
        if app.history_wanted && loader.start(reader.clone()) {
            debug!("history reload for jobs that left the active feed");
            app.history_wanted = false;
        }
        app.loader_status = loader.phase().describe(Instant::now());

        terminal.draw(|frame| ui::render(frame, &app))?;

        tokio::select! {
            _ = refresh_ticker.tick() => {
                refresh_requested = true;
            }
            _ = ui_ticker.tick() => {}
            result = next_active(&mut pending) => {
                app.apply_active(result);
            }
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if handle_key(key, &mut app, &mut refresh_requested) {
                            break;
                        }
                        if refresh_requested && loader.start(reader.clone()) {
                            debug!("history reload requested");
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => warn!("terminal event error: {err}"),
                    None => break,
                }
            }
        }
    }

    loader.cancel();
    if let Some(handle) = pending.take() {
        handle.abort();
    }
    Ok(())
}
