//! Turns raw `qstat -f` output, plain or `-F json`, into [`JobRecord`]s.
//!
//! Both readers reduce a job block to a flat map of dotted attribute names
//! (`Resource_List.ncpus`) and hand it to [`normalize`], so field semantics
//! live in exactly one place.

use crate::reconcile::SourceBatch;
use crate::units::{self, UnitError};
use crate::{JobRecord, JobState, Source};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Lines;
use thiserror::Error;
use tracing::warn;

/// Line emitted by the enumeration limiter when it dropped ids.
pub const TRUNCATION_SENTINEL: &str = "__QTOP_TRUNCATED__";

const JOB_HEADER: &str = "Job Id:";

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFormat {
    #[default]
    Auto,
    Text,
    Json,
}

impl RecordFormat {
    pub fn detect(blob: &str) -> RecordFormat {
        match blob.trim_start().chars().next() {
            Some('{') => RecordFormat::Json,
            _ => RecordFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub format: RecordFormat,
    pub max_records: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedBlock {
    #[error("job block without an identifier")]
    MissingId,
    #[error("{id}: missing job_state")]
    MissingState { id: String },
    #[error("{id}: {detail}")]
    BadState { id: String, detail: String },
    #[error("{id}: field {field}: {source}")]
    Field {
        id: String,
        field: &'static str,
        source: UnitError,
    },
    #[error("{id}: unexpected line {line:?}")]
    StrayLine { id: String, line: String },
    #[error("{id}: job entry is not an object")]
    NotAnObject { id: String },
    #[error("invalid JSON document: {0}")]
    Json(String),
}

/// One job block as read off the wire, before normalization.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub id: String,
    pub attrs: Result<Attributes, MalformedBlock>,
}

/// Reads `Job Id:` blocks with indented `key = value` attributes.
pub struct TextReader<'a> {
    lines: Peekable<Lines<'a>>,
    sentinel_seen: bool,
}

impl<'a> TextReader<'a> {
    pub fn new(blob: &'a str) -> Self {
        Self {
            lines: blob.lines().peekable(),
            sentinel_seen: false,
        }
    }

    fn read_attributes(&mut self, id: &str) -> Result<Attributes, MalformedBlock> {
        let mut attrs = Attributes::new();
        let mut stray: Option<String> = None;
        let mut last_key: Option<String> = None;

        while let Some(line) = self.lines.peek().copied() {
            let trimmed = line.trim();
            if trimmed.starts_with(JOB_HEADER) {
                break;
            }
            self.lines.next();
            if trimmed == TRUNCATION_SENTINEL {
                self.sentinel_seen = true;
                break;
            }
            if trimmed.is_empty() {
                continue;
            }
            // qstat wraps long values onto tab-indented continuation lines.
            if line.starts_with('\t') {
                if let Some(value) = last_key.as_ref().and_then(|key| attrs.get_mut(key)) {
                    value.push_str(trimmed);
                    continue;
                }
            }
            match trimmed.split_once(" = ") {
                Some((key, value)) => {
                    let key = key.trim().to_string();
                    attrs.insert(key.clone(), value.trim().to_string());
                    last_key = Some(key);
                }
                None => {
                    stray.get_or_insert_with(|| trimmed.to_string());
                }
            }
        }

        match stray {
            Some(line) => Err(MalformedBlock::StrayLine {
                id: id.to_string(),
                line,
            }),
            None => Ok(attrs),
        }
    }
}

impl Iterator for TextReader<'_> {
    type Item = RawBlock;

    fn next(&mut self) -> Option<RawBlock> {
        if self.sentinel_seen {
            return None;
        }
        let id = loop {
            let line = self.lines.next()?.trim();
            if line == TRUNCATION_SENTINEL {
                self.sentinel_seen = true;
                return None;
            }
            if let Some(rest) = line.strip_prefix(JOB_HEADER) {
                break rest.trim().to_string();
            }
        };
        let attrs = self.read_attributes(&id);
        if id.is_empty() {
            return Some(RawBlock {
                id,
                attrs: Err(MalformedBlock::MissingId),
            });
        }
        Some(RawBlock { id, attrs })
    }
}

/// Reads the `Jobs` map of `qstat -f -F json`; the id only exists as the key.
pub struct JsonReader {
    entries: serde_json::map::IntoIter,
    failure: Option<MalformedBlock>,
    sentinel_seen: bool,
}

impl JsonReader {
    pub fn new(blob: &str) -> Self {
        let mut sentinel_seen = false;
        let document: String = blob
            .lines()
            .filter(|line| {
                let is_sentinel = line.trim() == TRUNCATION_SENTINEL;
                sentinel_seen |= is_sentinel;
                !is_sentinel
            })
            .collect::<Vec<_>>()
            .join("\n");

        let (jobs, failure) = match serde_json::from_str::<Value>(&document) {
            Ok(Value::Object(mut root)) => match root.remove("Jobs") {
                Some(Value::Object(jobs)) => (jobs, None),
                _ => (Map::new(), None),
            },
            Ok(_) => (
                Map::new(),
                Some(MalformedBlock::Json("top level is not an object".to_string())),
            ),
            Err(err) => (Map::new(), Some(MalformedBlock::Json(err.to_string()))),
        };

        Self {
            entries: jobs.into_iter(),
            failure,
            sentinel_seen,
        }
    }
}

impl Iterator for JsonReader {
    type Item = RawBlock;

    fn next(&mut self) -> Option<RawBlock> {
        if let Some(failure) = self.failure.take() {
            return Some(RawBlock {
                id: String::new(),
                attrs: Err(failure),
            });
        }
        let (id, job) = self.entries.next()?;
        let attrs = match job {
            Value::Object(map) => {
                let mut attrs = Attributes::new();
                flatten_into(&mut attrs, "", &Value::Object(map));
                Ok(attrs)
            }
            _ => Err(MalformedBlock::NotAnObject { id: id.clone() }),
        };
        Some(RawBlock { id, attrs })
    }
}

fn flatten_into(attrs: &mut Attributes, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(attrs, &path, nested);
            }
        }
        Value::Null => {}
        Value::String(text) => {
            attrs.insert(prefix.to_string(), text.clone());
        }
        other => {
            attrs.insert(prefix.to_string(), other.to_string());
        }
    }
}

pub enum JobReader<'a> {
    Text(TextReader<'a>),
    Json(JsonReader),
}

impl<'a> JobReader<'a> {
    pub fn new(blob: &'a str, format: RecordFormat) -> Self {
        let format = match format {
            RecordFormat::Auto => RecordFormat::detect(blob),
            other => other,
        };
        match format {
            RecordFormat::Json => JobReader::Json(JsonReader::new(blob)),
            _ => JobReader::Text(TextReader::new(blob)),
        }
    }

    pub fn sentinel_seen(&self) -> bool {
        match self {
            JobReader::Text(reader) => reader.sentinel_seen,
            JobReader::Json(reader) => reader.sentinel_seen,
        }
    }
}

impl Iterator for JobReader<'_> {
    type Item = RawBlock;

    fn next(&mut self) -> Option<RawBlock> {
        match self {
            JobReader::Text(reader) => reader.next(),
            JobReader::Json(reader) => reader.next(),
        }
    }
}

/// Lazily yields normalized records; malformed blocks are skipped and
/// counted, interactive sessions are dropped.
pub struct JobStream<'a> {
    reader: JobReader<'a>,
    source: Source,
    max_records: Option<usize>,
    emitted: usize,
    malformed: usize,
    interactive: usize,
    truncated: bool,
    done: bool,
}

impl JobStream<'_> {
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn interactive(&self) -> usize {
        self.interactive
    }

    /// Only final once the stream has been exhausted.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_batch(mut self) -> SourceBatch {
        let records: Vec<JobRecord> = self.by_ref().collect();
        SourceBatch {
            source: self.source,
            records,
            truncated: self.truncated,
            malformed: self.malformed,
        }
    }
}

impl Iterator for JobStream<'_> {
    type Item = JobRecord;

    fn next(&mut self) -> Option<JobRecord> {
        if self.done {
            return None;
        }
        loop {
            let Some(block) = self.reader.next() else {
                self.truncated |= self.reader.sentinel_seen();
                self.done = true;
                return None;
            };
            if self.max_records.is_some_and(|max| self.emitted >= max) {
                self.truncated = true;
                self.done = true;
                return None;
            }
            let outcome = block
                .attrs
                .and_then(|attrs| normalize(&block.id, &attrs, self.source));
            match outcome {
                Ok(Some(record)) => {
                    self.emitted += 1;
                    return Some(record);
                }
                Ok(None) => self.interactive += 1,
                Err(err) => {
                    self.malformed += 1;
                    warn!(source = %self.source, "skipping malformed job block: {err}");
                }
            }
        }
    }
}

pub fn parse<'a>(blob: &'a str, source: Source, options: &ParseOptions) -> JobStream<'a> {
    JobStream {
        reader: JobReader::new(blob, options.format),
        source,
        max_records: options.max_records,
        emitted: 0,
        malformed: 0,
        interactive: 0,
        truncated: false,
        done: false,
    }
}

/// Maps one flattened block onto a record. `Ok(None)` means the job is an
/// interactive session and must not be reported.
pub fn normalize(
    id: &str,
    attrs: &Attributes,
    source: Source,
) -> Result<Option<JobRecord>, MalformedBlock> {
    if id.is_empty() {
        return Err(MalformedBlock::MissingId);
    }
    if is_interactive(attrs) {
        return Ok(None);
    }

    let raw_state = attrs
        .get("job_state")
        .ok_or_else(|| MalformedBlock::MissingState { id: id.to_string() })?;
    let state: JobState = raw_state.parse().map_err(|detail| MalformedBlock::BadState {
        id: id.to_string(),
        detail,
    })?;

    let field = |key: &'static str| attrs.get(key).map(String::as_str);
    let convert = |key: &'static str, err: UnitError| MalformedBlock::Field {
        id: id.to_string(),
        field: key,
        source: err,
    };
    macro_rules! optional {
        ($key:literal, $parse:expr) => {
            field($key)
                .filter(|raw| !raw.trim().is_empty())
                .map($parse)
                .transpose()
                .map_err(|err| convert($key, err))?
        };
    }

    let memory_used_kb = match optional!("resources_used.mem", units::parse_memory_kb) {
        Some(kb) => Some(kb),
        None => optional!("resources_used.vmem", units::parse_memory_kb),
    };
    let queued_at = match optional!("qtime", units::parse_timestamp) {
        Some(ts) => Some(ts),
        None => optional!("ctime", units::parse_timestamp),
    };
    let ended_at = match optional!("obittime", units::parse_timestamp) {
        Some(ts) => Some(ts),
        None if state.is_terminal() => optional!("mtime", units::parse_timestamp),
        None => None,
    };
    let exit_status = field("Exit_status")
        .map(|raw| {
            raw.trim()
                .parse::<i32>()
                .map_err(|_| convert("Exit_status", UnitError::Number(raw.to_string())))
        })
        .transpose()?;

    Ok(Some(JobRecord {
        id: id.to_string(),
        name: field("Job_Name").unwrap_or_default().to_string(),
        queue: field("queue").unwrap_or_default().to_string(),
        owning_user: owner(attrs),
        state,
        cpu_count_requested: optional!("Resource_List.ncpus", units::parse_count),
        memory_requested_kb: optional!("Resource_List.mem", units::parse_memory_kb),
        walltime_total: optional!("Resource_List.walltime", units::parse_duration),
        walltime_used: optional!("resources_used.walltime", units::parse_duration),
        cpu_time_used: optional!("resources_used.cput", units::parse_duration),
        memory_used_kb,
        cpu_percent_instantaneous: optional!("resources_used.cpupercent", units::parse_count),
        cpus_in_use: optional!("resources_used.ncpus", units::parse_count),
        queued_at,
        started_at: optional!("stime", units::parse_timestamp),
        ended_at,
        exit_status,
        comment: field("comment").map(str::to_string),
        source,
    }))
}

fn owner(attrs: &Attributes) -> String {
    if let Some(euser) = attrs.get("euser").filter(|value| !value.is_empty()) {
        return euser.clone();
    }
    attrs
        .get("Job_Owner")
        .map(|owner| owner.split('@').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

fn is_interactive(attrs: &Attributes) -> bool {
    let flagged = attrs
        .get("interactive")
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false);
    let queue = attrs
        .get("queue")
        .map(|queue| queue.to_ascii_lowercase().contains("interactive"))
        .unwrap_or(false);
    let submitted_interactive = attrs
        .get("Submit_arguments")
        .map(|args| args.split_whitespace().any(|arg| arg == "-I"))
        .unwrap_or(false);
    flagged || queue || submitted_interactive
}
