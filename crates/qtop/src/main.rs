mod config;
mod live;
mod loader;
mod render;
mod source;
mod theme;
mod ui;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use config::{Cli, Command, FileConfig, ListArgs, Settings, SourceArgs};
use qtop_core::reconcile::reconcile;
use qtop_core::Source;
use render::{RenderOptions, ViewMode};
use source::SourceReader;
use std::env;
use std::io::{self, IsTerminal, Write};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::List(args) => {
            init_logging(true);
            let settings = load_settings(&args.source);
            run_list(&args, &settings).await
        }
        Command::Top(args) => {
            // The terminal belongs to the dashboard unless asked otherwise.
            init_logging(config::env_flag("QTOP_LOG_STDERR"));
            let settings = load_settings(&args.source).with_interval(args.interval);
            live::run(settings).await
        }
    }
}

fn init_logging(to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if to_stderr {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

fn load_settings(args: &SourceArgs) -> Settings {
    let path = config::config_path(args.config.as_deref());
    let file = config::load_config(&path).unwrap_or_else(|err| {
        warn!("{err}; using built-in defaults");
        FileConfig::default()
    });
    Settings::resolve(args, file)
}

async fn run_list(args: &ListArgs, settings: &Settings) -> Result<()> {
    let reader = SourceReader::new(settings);
    let settled = reader.read_all(&Source::ALL).await;
    if settled.all_failed() {
        let reasons: Vec<String> = settled
            .failures
            .iter()
            .map(|(source, err)| format!("{source}: {err}"))
            .collect();
        bail!("no readable job source ({})", reasons.join("; "));
    }

    let merged = reconcile(settled.batches);
    let stdout = io::stdout();
    let width = if stdout.is_terminal() {
        crossterm::terminal::size().ok().map(|(columns, _)| columns)
    } else {
        None
    };
    let report = render::render(
        &merged,
        &RenderOptions {
            mode: ViewMode::List,
            sort: args.sort.map(Into::into).unwrap_or_default(),
            width,
            show_queued: settings.show_queued,
            max_jobs: Some(settings.max_jobs),
            now: Utc::now().timestamp(),
            thresholds: settings.thresholds.clone(),
        },
    );

    let color = config::color_enabled(args.no_color, env::var("NO_COLOR").ok().as_deref());
    let mut out = stdout.lock();
    for line in report.ansi_lines(color) {
        writeln!(out, "{line}").context("failed to write listing")?;
    }
    out.flush().context("failed to write listing")?;
    Ok(())
}
