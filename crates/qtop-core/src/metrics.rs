//! Derived, presentation-independent fields. Everything here is a pure
//! function of a record, the current time and the thresholds; callers
//! recompute on every refresh.

use crate::{JobRecord, JobState, Thresholds};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    /// A finished job that used almost none of what it asked for.
    UnderUtilized { cpu_percent: f64, ram_percent: f64 },
    /// A running job holding far more cpus than it keeps busy.
    OverSubscribed { requested: u32, busy: f64 },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::UnderUtilized {
                cpu_percent,
                ram_percent,
            } => write!(
                f,
                "low usage: cpu {cpu_percent:.0}% ram {ram_percent:.0}%"
            ),
            Advisory::OverSubscribed { requested, busy } => {
                write!(f, "oversubscribed: {busy:.1} of {requested} cpus busy")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub walltime_used: Option<u64>,
    pub remaining: Option<u64>,
    pub progress: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub ram_percent: Option<f64>,
    pub waited: Option<u64>,
    pub age: Option<u64>,
    pub near_walltime_limit: bool,
    pub high_cpu_request: bool,
    pub high_ram_request: bool,
    pub advisories: Vec<Advisory>,
}

impl JobMetrics {
    pub fn compute(job: &JobRecord, now: i64, thresholds: &Thresholds) -> Self {
        let walltime_used = walltime_used(job, now);
        let walltime_total = job.walltime_total.filter(|total| *total > 0);

        let progress = match (walltime_used, walltime_total) {
            (Some(used), Some(total)) => Some((used as f64 / total as f64).clamp(0.0, 1.0)),
            _ => None,
        };
        let remaining = match (walltime_used, walltime_total) {
            (Some(used), Some(total)) => Some(total.saturating_sub(used)),
            _ => None,
        };
        let near_walltime_limit = job.state == JobState::Running
            && remaining.is_some_and(|left| left < thresholds.walltime_warning_secs);

        let cpu_percent = cpu_utilization(job, walltime_used);
        let ram_percent = ram_utilization(job);

        let waited = match (job.queued_at, job.started_at) {
            (Some(queued), Some(started)) => Some(started.saturating_sub(queued).max(0) as u64),
            _ => None,
        };
        let age = if job.is_terminal() {
            job.ended_at
                .map(|ended| now.saturating_sub(ended).max(0) as u64)
        } else {
            None
        };

        let high_cpu_request = job
            .cpu_count_requested
            .is_some_and(|cpus| cpus >= thresholds.high_cpu_request);
        let high_ram_request = job
            .memory_gb_requested()
            .is_some_and(|gb| gb >= thresholds.high_ram_request_gb);

        let mut metrics = Self {
            walltime_used,
            remaining,
            progress,
            cpu_percent,
            ram_percent,
            waited,
            age,
            near_walltime_limit,
            high_cpu_request,
            high_ram_request,
            advisories: Vec::new(),
        };
        metrics.advisories = advisories(job, &metrics, thresholds);
        metrics
    }

    pub fn note(&self) -> Option<String> {
        if self.advisories.is_empty() {
            return None;
        }
        Some(
            self.advisories
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Reported walltime, else derived from start/end timestamps.
fn walltime_used(job: &JobRecord, now: i64) -> Option<u64> {
    if let Some(used) = job.walltime_used {
        return Some(used);
    }
    let started = job.started_at?;
    let until = match job.state {
        JobState::Running => now,
        JobState::Completed | JobState::Finished => job.ended_at?,
        JobState::Queued => return None,
    };
    Some(until.saturating_sub(started).max(0) as u64)
}

fn cpu_utilization(job: &JobRecord, walltime_used: Option<u64>) -> Option<f64> {
    let cput = job.cpu_time_used?;
    let cpus = job.cpu_count_requested.filter(|cpus| *cpus > 0)?;
    let used = walltime_used.filter(|used| *used > 0)?;
    let capacity = used as f64 * cpus as f64;
    Some((cput as f64 / capacity * 100.0).clamp(0.0, 100.0))
}

fn ram_utilization(job: &JobRecord) -> Option<f64> {
    let used = job.memory_used_kb?;
    let requested = job.memory_requested_kb.filter(|kb| *kb > 0)?;
    Some((used as f64 / requested as f64 * 100.0).clamp(0.0, 100.0))
}

fn advisories(job: &JobRecord, metrics: &JobMetrics, thresholds: &Thresholds) -> Vec<Advisory> {
    let mut notes = Vec::new();
    let ran_long_enough = metrics
        .walltime_used
        .is_some_and(|used| used >= thresholds.min_runtime_secs);
    if !ran_long_enough {
        return notes;
    }

    if job.is_terminal() {
        if let (Some(cpu), Some(ram)) = (metrics.cpu_percent, metrics.ram_percent) {
            if cpu < thresholds.low_usage_percent && ram < thresholds.low_usage_percent {
                notes.push(Advisory::UnderUtilized {
                    cpu_percent: cpu,
                    ram_percent: ram,
                });
            }
        }
    }

    if job.state == JobState::Running {
        if let (Some(requested), Some(percent)) =
            (job.cpu_count_requested, job.cpu_percent_instantaneous)
        {
            let busy = percent as f64 / 100.0;
            if requested > 1 && requested as f64 >= thresholds.oversubscription_ratio * busy {
                notes.push(Advisory::OverSubscribed { requested, busy });
            }
        }
    }

    notes
}
