//! Background fetch of the slow history and fallback sources.
//!
//! The task publishes one completed [`HistorySnapshot`] into a single-slot
//! mailbox. The live loop drains the slot with `try_lock` at tick
//! boundaries and never waits on it. The task only holds a weak handle to
//! the slot, so a result that lands after the session ended is dropped.

use crate::source::{Settled, SourceReader};
use qtop_core::reconcile::SourceBatch;
use qtop_core::Source;
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct HistorySnapshot {
    pub batches: Vec<SourceBatch>,
    pub failures: Vec<String>,
}

impl HistorySnapshot {
    fn from_settled(settled: Settled) -> Self {
        Self {
            batches: settled.batches,
            failures: settled
                .failures
                .into_iter()
                .map(|(source, err)| format!("{source}: {err}"))
                .collect(),
        }
    }

    pub fn all_failed(&self) -> bool {
        self.batches.is_empty() && !self.failures.is_empty()
    }
}

type Mailbox = Arc<Mutex<Option<HistorySnapshot>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderPhase {
    Idle,
    Loading { since: Instant },
    Loaded { at: Instant },
    Failed(String),
}

impl LoaderPhase {
    pub fn describe(&self, now: Instant) -> String {
        match self {
            LoaderPhase::Idle => "history idle".to_string(),
            LoaderPhase::Loading { since } => {
                format!("history loading ({}s)", now.saturating_duration_since(*since).as_secs())
            }
            LoaderPhase::Loaded { at } => {
                format!("history loaded {}s ago", now.saturating_duration_since(*at).as_secs())
            }
            LoaderPhase::Failed(reason) => format!("history failed: {reason}"),
        }
    }
}

#[derive(Debug)]
pub struct HistoryLoader {
    mailbox: Mailbox,
    handle: Option<JoinHandle<()>>,
    phase: LoaderPhase,
}

impl Default for HistoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLoader {
    pub fn new() -> Self {
        Self {
            mailbox: Arc::new(Mutex::new(None)),
            handle: None,
            phase: LoaderPhase::Idle,
        }
    }

    pub fn phase(&self) -> &LoaderPhase {
        &self.phase
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns a fetch unless one is already in flight. Returns whether a
    /// new task was started.
    pub fn start(&mut self, reader: SourceReader) -> bool {
        if self.is_running() {
            return false;
        }
        let slot = Arc::downgrade(&self.mailbox);
        self.handle = Some(tokio::spawn(async move {
            let snapshot = load(&reader).await;
            if !deliver(&slot, snapshot) {
                debug!("session ended before history arrived; result dropped");
            }
        }));
        self.phase = LoaderPhase::Loading {
            since: Instant::now(),
        };
        true
    }

    /// Takes a finished snapshot if one is waiting. Never blocks.
    pub fn poll(&mut self) -> Option<HistorySnapshot> {
        // Checked before the slot so a just-delivered result is never missed.
        let finished = self.handle.as_ref().is_some_and(JoinHandle::is_finished);
        let taken = match self.mailbox.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
        };
        match taken {
            Some(snapshot) => {
                self.handle = None;
                self.phase = if snapshot.all_failed() {
                    LoaderPhase::Failed(snapshot.failures.join("; "))
                } else {
                    LoaderPhase::Loaded { at: Instant::now() }
                };
                Some(snapshot)
            }
            None => {
                if finished {
                    self.handle = None;
                    warn!("history loader stopped without a result");
                    self.phase = LoaderPhase::Failed("loader stopped unexpectedly".to_string());
                }
                None
            }
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HistoryLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn load(reader: &SourceReader) -> HistorySnapshot {
    let started = Instant::now();
    let settled = reader
        .read_all(&[Source::History, Source::Fallback])
        .await;
    let snapshot = HistorySnapshot::from_settled(settled);
    info!(
        batches = snapshot.batches.len(),
        failures = snapshot.failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "history load finished"
    );
    snapshot
}

/// Overwrites the slot if the session still holds it.
fn deliver(slot: &Weak<Mutex<Option<HistorySnapshot>>>, snapshot: HistorySnapshot) -> bool {
    let Some(mailbox) = slot.upgrade() else {
        return false;
    };
    let mut guard = match mailbox.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(snapshot);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, Settings, SourceArgs, SourceFiles};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    const FINISHED: &str = "Job Id: 5.pbs\n    Job_Owner = alice@login\n    job_state = F\n    queue = batch\n";

    fn reader(files: SourceFiles) -> SourceReader {
        let mut settings = Settings::resolve(&SourceArgs::default(), FileConfig::default());
        settings.user = "alice".to_string();
        settings.files = files;
        SourceReader::new(&settings)
    }

    async fn wait_for_snapshot(
        loader: &mut HistoryLoader,
        poll_every: Duration,
    ) -> Option<HistorySnapshot> {
        loop {
            if let Some(snapshot) = loader.poll() {
                return Some(snapshot);
            }
            if loader.handle.is_none() {
                return None;
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    #[tokio::test]
    async fn snapshot_arrives_in_the_mailbox() {
        let dir = tempfile::tempdir().expect("temp dir");
        let history = dir.path().join("history.txt");
        fs::write(&history, FINISHED).expect("write fixture");

        let mut loader = HistoryLoader::new();
        assert!(loader.start(reader(SourceFiles {
            history: Some(history),
            ..SourceFiles::default()
        })));
        assert!(matches!(loader.phase(), LoaderPhase::Loading { .. }));

        let snapshot = wait_for_snapshot(&mut loader, Duration::from_millis(5))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.batches.len(), 1);
        assert_eq!(snapshot.batches[0].records[0].id, "5.pbs");
        assert!(matches!(loader.phase(), LoaderPhase::Loaded { .. }));
        assert!(loader.poll().is_none());
    }

    #[tokio::test]
    async fn failed_sources_mark_the_phase_failed() {
        let mut loader = HistoryLoader::new();
        loader.start(reader(SourceFiles {
            history: Some(PathBuf::from("/nonexistent/qtop/history.txt")),
            ..SourceFiles::default()
        }));
        let snapshot = wait_for_snapshot(&mut loader, Duration::from_millis(5))
            .await
            .expect("snapshot");
        assert!(snapshot.all_failed());
        assert!(matches!(loader.phase(), LoaderPhase::Failed(reason) if reason.contains("history")));
    }

    #[test]
    fn late_results_are_dropped_after_the_session_ends() {
        let mailbox: Mailbox = Arc::new(Mutex::new(None));
        let slot = Arc::downgrade(&mailbox);
        assert!(deliver(&slot, HistorySnapshot::default()));
        assert!(mailbox.lock().expect("lock").is_some());

        drop(mailbox);
        assert!(!deliver(&slot, HistorySnapshot::default()));
    }

    #[test]
    fn phase_descriptions_are_short() {
        let now = Instant::now();
        assert_eq!(LoaderPhase::Idle.describe(now), "history idle");
        assert_eq!(
            LoaderPhase::Failed("boom".to_string()).describe(now),
            "history failed: boom"
        );
        assert!(LoaderPhase::Loaded { at: now }
            .describe(now)
            .starts_with("history loaded 0s"));
    }
}
