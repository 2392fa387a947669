use crate::render::SortOrder;
use clap::{Args, Parser, Subcommand, ValueEnum};
use qtop_core::parser::RecordFormat;
use qtop_core::Thresholds;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_JOBS: usize = 200;
pub const DEFAULT_INTERVAL_SECS: f64 = 2.0;
const MIN_INTERVAL_SECS: f64 = 0.25;

#[derive(Parser, Debug)]
#[command(name = "qtop")]
#[command(about = "Watch your PBS jobs from the terminal", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the job table once and exit.
    List(ListArgs),
    /// Refreshing dashboard; history loads in the background.
    Top(TopArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Read the active feed from a file instead of running qstat.
    #[arg(long, value_name = "PATH")]
    pub active_file: Option<PathBuf>,
    /// Read the finished-jobs feed from a file.
    #[arg(long, value_name = "PATH")]
    pub history_file: Option<PathBuf>,
    /// Read the whole-server fallback feed from a file.
    #[arg(long, value_name = "PATH")]
    pub fallback_file: Option<PathBuf>,
    /// Cap on job ids enumerated per source.
    #[arg(long, env = "QTOP_MAX_JOBS", value_name = "N")]
    pub max_jobs: Option<usize>,
    /// Leave queued jobs out of the table.
    #[arg(long)]
    pub hide_queued: bool,
    #[arg(long, short = 'u', env = "QTOP_USER")]
    pub user: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Wire format requested from qstat; files are auto-detected unless set.
    #[arg(long, value_enum)]
    pub format: Option<WireFormat>,
    /// Skip the whole-server fallback enumeration.
    #[arg(long)]
    pub no_fallback: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[arg(long)]
    pub no_color: bool,
    #[arg(long, value_enum)]
    pub sort: Option<SortArg>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TopArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Seconds between active refreshes.
    #[arg(long, env = "QTOP_INTERVAL", value_name = "SECS")]
    pub interval: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Text,
    Json,
}

impl WireFormat {
    /// Extra qstat arguments selecting this format.
    pub fn qstat_args(self) -> &'static [&'static str] {
        match self {
            WireFormat::Text => &[],
            WireFormat::Json => &["-F", "json"],
        }
    }

    pub fn record_format(self) -> RecordFormat {
        match self {
            WireFormat::Text => RecordFormat::Text,
            WireFormat::Json => RecordFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortArg {
    Id,
    Lifecycle,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Id => SortOrder::Id,
            SortArg::Lifecycle => SortOrder::Lifecycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommandNames {
    pub qselect: String,
    pub qstat: String,
}

impl Default for CommandNames {
    fn default() -> Self {
        Self {
            qselect: "qselect".to_string(),
            qstat: "qstat".to_string(),
        }
    }
}

/// On-disk defaults; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub user: Option<String>,
    pub max_jobs: Option<usize>,
    pub interval_secs: Option<f64>,
    pub hide_queued: Option<bool>,
    pub format: Option<WireFormat>,
    pub fallback: Option<bool>,
    pub commands: CommandNames,
    pub thresholds: Thresholds,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// A missing file yields defaults; an unreadable or invalid one is an error.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = non_empty_var("QTOP_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("qtop/config.toml")
}

fn config_dir() -> PathBuf {
    if let Some(path) = non_empty_var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

/// `NO_COLOR` disables color whenever it is set to anything non-empty.
pub fn color_enabled(no_color_flag: bool, no_color_env: Option<&str>) -> bool {
    !no_color_flag && no_color_env.map_or(true, str::is_empty)
}

fn default_user() -> String {
    non_empty_var("USER")
        .or_else(|| non_empty_var("LOGNAME"))
        .unwrap_or_default()
}

/// Static files in place of scheduler commands. When any is set the
/// sources without a file are disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFiles {
    pub active: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub fallback: Option<PathBuf>,
}

impl SourceFiles {
    pub fn any(&self) -> bool {
        self.active.is_some() || self.history.is_some() || self.fallback.is_some()
    }
}

/// Fully resolved settings: flag, then environment, then file, then default.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub user: String,
    pub max_jobs: usize,
    pub show_queued: bool,
    /// Explicit wire format; `None` means text for commands and
    /// auto-detection for files.
    pub format: Option<WireFormat>,
    pub fallback_enabled: bool,
    pub commands: CommandNames,
    pub files: SourceFiles,
    pub interval: Duration,
    pub thresholds: Thresholds,
}

impl Settings {
    pub fn resolve(args: &SourceArgs, file: FileConfig) -> Self {
        Self::resolve_with(args, file, default_user)
    }

    fn resolve_with(args: &SourceArgs, file: FileConfig, fallback_user: impl FnOnce() -> String) -> Self {
        let user = args
            .user
            .clone()
            .filter(|user| !user.trim().is_empty())
            .or(file.user)
            .unwrap_or_else(fallback_user);
        let interval = file
            .interval_secs
            .and_then(interval_from_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_INTERVAL_SECS));
        Self {
            user,
            max_jobs: args
                .max_jobs
                .or(file.max_jobs)
                .unwrap_or(DEFAULT_MAX_JOBS)
                .max(1),
            show_queued: !(args.hide_queued || file.hide_queued.unwrap_or(false)),
            format: args.format.or(file.format),
            fallback_enabled: !args.no_fallback && file.fallback.unwrap_or(true),
            commands: file.commands,
            files: SourceFiles {
                active: args.active_file.clone(),
                history: args.history_file.clone(),
                fallback: args.fallback_file.clone(),
            },
            interval,
            thresholds: file.thresholds,
        }
    }

    pub fn with_interval(mut self, secs: Option<f64>) -> Self {
        if let Some(interval) = secs.and_then(interval_from_secs) {
            self.interval = interval;
        }
        self
    }
}

/// Floors at the minimum tick; `None` for values no `Duration` can hold.
fn interval_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.max(MIN_INTERVAL_SECS)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolve(args: &SourceArgs, file: FileConfig) -> Settings {
        Settings::resolve_with(args, file, || "login".to_string())
    }

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let settings = resolve(&SourceArgs::default(), FileConfig::default());
        assert_eq!(settings.user, "login");
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
        assert!(settings.show_queued);
        assert!(settings.fallback_enabled);
        assert_eq!(settings.interval, Duration::from_secs(2));
        assert_eq!(settings.commands.qstat, "qstat");
        assert_eq!(settings.thresholds, Thresholds::default());
        assert!(!settings.files.any());
    }

    #[test]
    fn flags_override_file_values() {
        let file = FileConfig {
            user: Some("fromfile".to_string()),
            max_jobs: Some(50),
            hide_queued: Some(false),
            format: Some(WireFormat::Text),
            ..FileConfig::default()
        };
        let args = SourceArgs {
            user: Some("alice".to_string()),
            max_jobs: Some(10),
            hide_queued: true,
            format: Some(WireFormat::Json),
            ..SourceArgs::default()
        };
        let settings = resolve(&args, file.clone());
        assert_eq!(settings.user, "alice");
        assert_eq!(settings.max_jobs, 10);
        assert!(!settings.show_queued);
        assert_eq!(settings.format, Some(WireFormat::Json));

        let from_file = resolve(&SourceArgs::default(), file);
        assert_eq!(from_file.user, "fromfile");
        assert_eq!(from_file.max_jobs, 50);
    }

    #[test]
    fn interval_flag_wins_and_is_floored() {
        let file = FileConfig {
            interval_secs: Some(5.0),
            ..FileConfig::default()
        };
        let settings = resolve(&SourceArgs::default(), file);
        assert_eq!(settings.interval, Duration::from_secs(5));
        let tuned = settings.clone().with_interval(Some(0.01));
        assert_eq!(tuned.interval, Duration::from_secs_f64(MIN_INTERVAL_SECS));
        assert_eq!(settings.with_interval(None).interval, Duration::from_secs(5));
    }

    #[test]
    fn unrepresentable_intervals_fall_back_to_the_default() {
        let file: FileConfig = toml::from_str("interval_secs = inf").expect("inf is valid toml");
        let settings = Settings::resolve(&SourceArgs::default(), file);
        assert_eq!(settings.interval, Duration::from_secs(2));

        let tuned = settings.with_interval(Some(1e300));
        assert_eq!(tuned.interval, Duration::from_secs(2));
        assert_eq!(interval_from_secs(f64::NAN), Some(Duration::from_secs_f64(MIN_INTERVAL_SECS)));
    }

    #[test]
    fn toml_file_fills_nested_sections() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "user = \"bob\"\nfallback = false\nformat = \"json\"\n\n[commands]\nqstat = \"/opt/pbs/bin/qstat\"\n\n[thresholds]\nhigh_cpu_request = 64\n"
        )
        .expect("write config");
        let config = load_config(file.path()).expect("valid config");
        assert_eq!(config.user.as_deref(), Some("bob"));
        assert_eq!(config.fallback, Some(false));
        assert_eq!(config.format, Some(WireFormat::Json));
        assert_eq!(config.commands.qstat, "/opt/pbs/bin/qstat");
        assert_eq!(config.commands.qselect, "qselect");
        assert_eq!(config.thresholds.high_cpu_request, 64);
        assert_eq!(config.thresholds.walltime_warning_secs, 900);
    }

    #[test]
    fn missing_file_is_default_and_bad_file_is_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.toml");
        assert_eq!(load_config(&missing).expect("defaults"), FileConfig::default());

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "max_jobs = \"many\"").expect("write");
        assert!(matches!(load_config(&broken), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = Path::new("/tmp/qtop-test.toml");
        assert_eq!(config_path(Some(path)), path.to_path_buf());
    }

    #[test]
    fn color_respects_flag_and_no_color() {
        assert!(color_enabled(false, None));
        assert!(color_enabled(false, Some("")));
        assert!(!color_enabled(false, Some("1")));
        assert!(!color_enabled(true, None));
    }

    #[test]
    fn cli_parses_both_subcommands() {
        let cli = Cli::try_parse_from([
            "qtop",
            "list",
            "--active-file",
            "active.txt",
            "--max-jobs",
            "5",
            "--no-color",
            "--sort",
            "lifecycle",
        ])
        .expect("list parses");
        match cli.command {
            Command::List(args) => {
                assert_eq!(args.source.active_file, Some(PathBuf::from("active.txt")));
                assert_eq!(args.source.max_jobs, Some(5));
                assert!(args.no_color);
                assert_eq!(args.sort, Some(SortArg::Lifecycle));
            }
            Command::Top(_) => panic!("expected list"),
        }

        let cli = Cli::try_parse_from(["qtop", "top", "--hide-queued", "--interval", "1.5"])
            .expect("top parses");
        match cli.command {
            Command::Top(args) => {
                assert!(args.source.hide_queued);
                assert_eq!(args.interval, Some(1.5));
            }
            Command::List(_) => panic!("expected top"),
        }
    }

    #[test]
    fn bool_flags_accept_common_spellings() {
        assert_eq!(parse_bool_flag("YES"), Some(true));
        assert_eq!(parse_bool_flag(" off "), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }
}
