use crate::{JobRecord, JobState, Source};
use std::collections::{BTreeMap, HashSet};

/// Everything one source produced during a single read.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub source: Source,
    pub records: Vec<JobRecord>,
    pub truncated: bool,
    pub malformed: usize,
}

impl SourceBatch {
    pub fn empty(source: Source) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    /// Keeps only jobs owned by `user`; an empty user keeps everything.
    pub fn retain_owner(&mut self, user: &str) {
        if user.is_empty() {
            return;
        }
        self.records.retain(|job| job.owning_user == user);
    }

    /// Keeps the first `max` records and flags the batch if any were dropped.
    pub fn cap(&mut self, max: usize) {
        if self.records.len() > max {
            self.records.truncate(max);
            self.truncated = true;
        }
    }

    pub fn ids(&self) -> HashSet<String> {
        self.records.iter().map(|job| job.id.clone()).collect()
    }
}

/// The merged job set of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub jobs: BTreeMap<String, JobRecord>,
    pub active_truncated: bool,
    pub history_truncated: bool,
}

impl Reconciled {
    pub fn any_truncated(&self) -> bool {
        self.active_truncated || self.history_truncated
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    merged: Reconciled,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb<I>(&mut self, source: Source, records: I, truncated: bool)
    where
        I: IntoIterator<Item = JobRecord>,
    {
        match source {
            Source::Active => self.merged.active_truncated |= truncated,
            Source::History | Source::Fallback => self.merged.history_truncated |= truncated,
        }
        for mut record in records {
            record.source = source;
            let replace = self
                .merged
                .jobs
                .get(&record.id)
                .map_or(true, |existing| supersedes(&record, existing));
            if replace {
                self.merged.jobs.insert(record.id.clone(), record);
            }
        }
    }

    pub fn absorb_batch(&mut self, batch: SourceBatch) {
        self.absorb(batch.source, batch.records, batch.truncated);
    }

    pub fn finish(self) -> Reconciled {
        self.merged
    }
}

/// A later record replaces an earlier one only when it is further along the
/// lifecycle; on a tie the higher-priority source keeps the id.
fn supersedes(candidate: &JobRecord, existing: &JobRecord) -> bool {
    let candidate_rank = candidate.state.terminal_rank();
    let existing_rank = existing.state.terminal_rank();
    candidate_rank > existing_rank
        || (candidate_rank == existing_rank && candidate.source < existing.source)
}

/// Merges batches in source priority order regardless of argument order.
pub fn reconcile<I>(batches: I) -> Reconciled
where
    I: IntoIterator<Item = SourceBatch>,
{
    let mut batches: Vec<SourceBatch> = batches.into_iter().collect();
    batches.sort_by_key(|batch| batch.source);
    let mut reconciler = Reconciler::new();
    for batch in batches {
        reconciler.absorb_batch(batch);
    }
    reconciler.finish()
}

/// Marks jobs that dropped out of the active feed and are confirmed terminal
/// by a slower source as `Finished`. Returns the ids promoted by this call.
pub fn promote_finished(
    merged: &mut Reconciled,
    previously_active: &HashSet<String>,
    currently_active: &HashSet<String>,
) -> Vec<String> {
    let mut promoted = Vec::new();
    for id in previously_active.difference(currently_active) {
        if let Some(job) = merged.jobs.get_mut(id) {
            if job.state == JobState::Completed && job.source != Source::Active {
                job.state = JobState::Finished;
                promoted.push(id.clone());
            }
        }
    }
    promoted.sort();
    promoted
}
