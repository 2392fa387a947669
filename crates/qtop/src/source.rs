//! Reads the raw scheduler output for each source, either by running
//! `qselect`/`qstat` or from a static file.

use crate::config::{CommandNames, Settings, WireFormat};
use futures_util::future::join_all;
use qtop_core::parser::{self, ParseOptions, RecordFormat, TRUNCATION_SENTINEL};
use qtop_core::reconcile::SourceBatch;
use qtop_core::Source;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("empty command configured for {0}")]
    EmptyCommand(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    File(PathBuf),
    Command,
    Disabled,
}

/// Per-source outcome of one read; failures stay attached to their source.
#[derive(Debug, Default)]
pub struct Settled {
    pub batches: Vec<SourceBatch>,
    pub failures: Vec<(Source, SourceError)>,
}

impl Settled {
    pub fn push(&mut self, source: Source, result: Result<SourceBatch, SourceError>) {
        match result {
            Ok(batch) => self.batches.push(batch),
            Err(err) => {
                warn!(%source, "source unavailable, treating as empty: {err}");
                self.failures.push((source, err));
            }
        }
    }

    /// True when nothing was read and at least one source was attempted.
    pub fn all_failed(&self) -> bool {
        self.batches.is_empty() && !self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SourceReader {
    user: String,
    max_jobs: usize,
    format: Option<WireFormat>,
    commands: CommandNames,
    active: Origin,
    history: Origin,
    fallback: Origin,
}

impl SourceReader {
    pub fn new(settings: &Settings) -> Self {
        let file_mode = settings.files.any();
        let origin = |file: &Option<PathBuf>, enabled: bool| match file {
            Some(path) => Origin::File(path.clone()),
            None if file_mode || !enabled => Origin::Disabled,
            None => Origin::Command,
        };
        Self {
            user: settings.user.clone(),
            max_jobs: settings.max_jobs,
            format: settings.format,
            commands: settings.commands.clone(),
            active: origin(&settings.files.active, true),
            history: origin(&settings.files.history, true),
            fallback: origin(&settings.files.fallback, settings.fallback_enabled),
        }
    }

    fn origin(&self, source: Source) -> &Origin {
        match source {
            Source::Active => &self.active,
            Source::History => &self.history,
            Source::Fallback => &self.fallback,
        }
    }

    pub fn is_enabled(&self, source: Source) -> bool {
        *self.origin(source) != Origin::Disabled
    }

    fn record_format(&self, source: Source) -> RecordFormat {
        match (self.format, self.origin(source)) {
            (Some(format), _) => format.record_format(),
            (None, Origin::File(_)) => RecordFormat::Auto,
            (None, _) => RecordFormat::Text,
        }
    }

    /// Reads and parses one source. A disabled source yields an empty batch.
    pub async fn read(&self, source: Source) -> Result<SourceBatch, SourceError> {
        let Some(blob) = self.read_raw(source).await? else {
            return Ok(SourceBatch::empty(source));
        };
        // The fallback lists the whole server, so the owner filter runs
        // before the cap.
        let fallback = source == Source::Fallback;
        let options = ParseOptions {
            format: self.record_format(source),
            max_records: (!fallback).then_some(self.max_jobs),
        };
        let stream = parser::parse(&blob, source, &options);
        let mut batch = stream.into_batch();
        if fallback {
            batch.retain_owner(&self.user);
            batch.cap(self.max_jobs);
        }
        debug!(
            %source,
            records = batch.records.len(),
            malformed = batch.malformed,
            truncated = batch.truncated,
            "source read"
        );
        Ok(batch)
    }

    /// Reads every enabled source among `sources` concurrently.
    pub async fn read_all(&self, sources: &[Source]) -> Settled {
        let reads = sources
            .iter()
            .copied()
            .filter(|source| self.is_enabled(*source))
            .map(|source| async move { (source, self.read(source).await) });
        let mut settled = Settled::default();
        for (source, result) in join_all(reads).await {
            settled.push(source, result);
        }
        settled
    }

    /// Raw blob for a source, `None` when the source is disabled.
    async fn read_raw(&self, source: Source) -> Result<Option<String>, SourceError> {
        match self.origin(source) {
            Origin::Disabled => Ok(None),
            Origin::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(Some)
                .map_err(|source| SourceError::Read {
                    path: path.clone(),
                    source,
                }),
            Origin::Command => self.run_source(source).await.map(Some),
        }
    }

    async fn run_source(&self, source: Source) -> Result<String, SourceError> {
        let format_args = self.format.unwrap_or_default().qstat_args();
        match source {
            Source::Active => {
                self.enumerate_then_query(&self.user_filter(), &["-f"], format_args)
                    .await
            }
            Source::History => {
                let mut args = vec!["-x".to_string(), "-s".to_string(), "F".to_string()];
                args.extend(self.user_filter());
                self.enumerate_then_query(&args, &["-x", "-f"], format_args)
                    .await
            }
            Source::Fallback => {
                let mut args: Vec<String> = vec!["-x".to_string(), "-f".to_string()];
                args.extend(format_args.iter().map(|arg| arg.to_string()));
                run(&self.commands.qstat, "qstat", &args).await
            }
        }
    }

    fn user_filter(&self) -> Vec<String> {
        if self.user.is_empty() {
            Vec::new()
        } else {
            vec!["-u".to_string(), self.user.clone()]
        }
    }

    /// `qselect` enumerates ids, the limiter caps them, `qstat` fetches
    /// the capped set. A capped enumeration appends the sentinel line.
    async fn enumerate_then_query(
        &self,
        select_args: &[String],
        stat_args: &[&str],
        format_args: &[&str],
    ) -> Result<String, SourceError> {
        let listing = run(&self.commands.qselect, "qselect", select_args).await?;
        let (ids, truncated) = limit_ids(&listing, self.max_jobs);
        let mut output = if ids.is_empty() {
            String::new()
        } else {
            let args: Vec<String> = stat_args
                .iter()
                .chain(format_args)
                .map(|arg| arg.to_string())
                .chain(ids)
                .collect();
            run(&self.commands.qstat, "qstat", &args).await?
        };
        if truncated {
            mark_truncated(&mut output);
        }
        Ok(output)
    }
}

/// Keeps the first `max` ids of a `qselect` listing and reports whether
/// more were offered.
pub fn limit_ids(listing: &str, max: usize) -> (Vec<String>, bool) {
    let mut ids = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from);
    let kept: Vec<String> = ids.by_ref().take(max).collect();
    let truncated = ids.next().is_some();
    (kept, truncated)
}

fn mark_truncated(output: &mut String) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(TRUNCATION_SENTINEL);
    output.push('\n');
}

/// Runs a configured command line (program plus leading arguments, e.g.
/// `ssh login qstat`) with extra arguments appended.
async fn run(
    command_line: &str,
    role: &'static str,
    extra: &[String],
) -> Result<String, SourceError> {
    let mut words = command_line.split_whitespace();
    let program = words.next().ok_or(SourceError::EmptyCommand(role))?;
    let output = Command::new(program)
        .args(words)
        .args(extra)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SourceError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    // qstat exits non-zero when some requested ids have already been purged.
    if !stdout.trim().is_empty() {
        warn!(program, status = %output.status, "partial output kept: {stderr}");
        return Ok(stdout);
    }
    Err(SourceError::Exit {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr,
    })
}
