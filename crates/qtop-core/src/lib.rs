pub mod metrics;
pub mod parser;
pub mod reconcile;
pub mod units;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One observed job state as reported by a single source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub owning_user: String,
    pub state: JobState,
    pub cpu_count_requested: Option<u32>,
    pub memory_requested_kb: Option<u64>,
    pub walltime_total: Option<u64>,
    pub walltime_used: Option<u64>,
    pub cpu_time_used: Option<u64>,
    pub memory_used_kb: Option<u64>,
    pub cpu_percent_instantaneous: Option<u32>,
    pub cpus_in_use: Option<u32>,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub exit_status: Option<i32>,
    pub comment: Option<String>,
    pub source: Source,
}

impl JobRecord {
    pub fn memory_gb_requested(&self) -> Option<f64> {
        self.memory_requested_kb
            .map(|kb| kb as f64 / units::KB_PER_GB as f64)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Completed,
    /// Synthesized: seen in the active feed earlier, since vanished and
    /// confirmed terminal by a slower source.
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "Q",
            JobState::Running => "R",
            JobState::Completed => "C",
            JobState::Finished => "F",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Finished)
    }

    /// How far along the lifecycle a state is; used to let a slower source
    /// correct a stale one.
    pub fn terminal_rank(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Running => 1,
            JobState::Completed | JobState::Finished => 2,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    /// Accepts the scheduler's single-letter job states.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "Q" | "H" | "W" | "T" | "M" => Ok(JobState::Queued),
            "R" | "E" | "B" | "S" | "U" => Ok(JobState::Running),
            "F" | "X" | "C" => Ok(JobState::Completed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Which reader produced a record. Declaration order is merge priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    #[default]
    Active,
    History,
    Fallback,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Active, Source::History, Source::Fallback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Active => "active",
            Source::History => "history",
            Source::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for derived metrics, advisories and rendering highlights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub low_usage_percent: f64,
    pub min_runtime_secs: u64,
    pub oversubscription_ratio: f64,
    pub high_cpu_request: u32,
    pub high_ram_request_gb: f64,
    pub walltime_warning_secs: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_usage_percent: 10.0,
            min_runtime_secs: 600,
            oversubscription_ratio: 4.0,
            high_cpu_request: 16,
            high_ram_request_gb: 128.0,
            walltime_warning_secs: 900,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_letters_map_to_lifecycle_states() {
        assert_eq!("Q".parse::<JobState>(), Ok(JobState::Queued));
        assert_eq!("H".parse::<JobState>(), Ok(JobState::Queued));
        assert_eq!("R".parse::<JobState>(), Ok(JobState::Running));
        assert_eq!("E".parse::<JobState>(), Ok(JobState::Running));
        assert_eq!("F".parse::<JobState>(), Ok(JobState::Completed));
        assert_eq!("C".parse::<JobState>(), Ok(JobState::Completed));
        assert!("Z".parse::<JobState>().is_err());
    }

    #[test]
    fn finished_and_completed_share_terminal_rank() {
        assert!(JobState::Running.terminal_rank() > JobState::Queued.terminal_rank());
        assert_eq!(
            JobState::Finished.terminal_rank(),
            JobState::Completed.terminal_rank()
        );
        assert!(JobState::Finished.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn source_order_is_merge_priority() {
        assert!(Source::Active < Source::History);
        assert!(Source::History < Source::Fallback);
    }

    #[test]
    fn requested_memory_is_reported_in_gigabytes() {
        let job = JobRecord {
            memory_requested_kb: Some(4 * 1024 * 1024),
            ..JobRecord::default()
        };
        assert_eq!(job.memory_gb_requested(), Some(4.0));
    }
}
