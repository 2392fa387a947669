use crossterm::style::{Color, ContentStyle};
use std::path::PathBuf;
use std::process::{Command, Output};

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .display()
        .to_string()
}

fn qtop_list(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_qtop"))
        .arg("list")
        .args(args)
        .env_remove("NO_COLOR")
        .env_remove("QTOP_MAX_JOBS")
        .env_remove("QTOP_USER")
        .env("QTOP_CONFIG_PATH", "/nonexistent/qtop/config.toml")
        .env("RUST_LOG", "off")
        .output()
        .expect("run qtop")
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8(output.stdout.clone())
        .expect("utf-8 output")
        .lines()
        .map(str::to_string)
        .collect()
}

fn red_prefix() -> String {
    let styled = ContentStyle {
        foreground_color: Some(Color::Red),
        ..ContentStyle::new()
    }
    .apply("X")
    .to_string();
    styled.split('X').next().unwrap_or_default().to_string()
}

fn row<'a>(lines: &'a [String], needle: &str) -> &'a str {
    lines
        .iter()
        .find(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("no row containing {needle}"))
}

#[test]
fn listing_flags_every_kind_of_job() {
    let active = fixture("active.txt");
    let history = fixture("history.txt");
    let output = qtop_list(&["--active-file", &active, "--history-file", &history]);
    assert!(output.status.success(), "{output:?}");

    let lines = stdout_lines(&output);
    assert!(lines[0].contains("job id"));
    assert_eq!(lines.len(), 6, "{lines:#?}");

    let attention = red_prefix();
    assert!(row(&lines, "deadline").contains(&attention));
    assert!(!row(&lines, "bigmem").contains(&attention));
    assert!(row(&lines, "bigmem").contains("256G🧠"));
    assert!(row(&lines, "wide").contains("32💪"));
    assert!(!row(&lines, "idle_long").contains('💪'));
    assert!(row(&lines, "finished_idle").contains("low usage: cpu 1% ram 3%"));
    assert!(row(&lines, "idle_long").contains("oversubscribed"));
}

#[test]
fn listing_without_color_has_no_escapes() {
    let active = fixture("active.txt");
    let output = qtop_list(&["--active-file", &active, "--no-color"]);
    assert!(output.status.success());
    let lines = stdout_lines(&output);
    assert!(lines.iter().all(|line| !line.contains('\x1b')));
    assert!(!lines[0].contains("age"));
}

#[test]
fn truncated_active_source_leads_with_its_warning() {
    let active = fixture("active_truncated.txt");
    let history = fixture("history.txt");
    let output = qtop_list(&[
        "--active-file",
        &active,
        "--history-file",
        &history,
        "--max-jobs",
        "4",
        "--no-color",
    ]);
    assert!(output.status.success());
    let lines = stdout_lines(&output);
    assert_eq!(
        lines[0],
        "warning: active source truncated at 4 jobs; raise --max-jobs to see more"
    );
    assert!(lines.iter().all(|line| !line.contains("history source truncated")));
}

#[test]
fn json_input_is_detected_and_queued_jobs_can_be_hidden() {
    let active = fixture("mixed.json");
    let shown = stdout_lines(&qtop_list(&["--active-file", &active, "--no-color"]));
    assert!(shown.iter().any(|line| line.contains("running_json")));
    assert!(shown.iter().any(|line| line.contains("waiting_json")));

    let hidden = stdout_lines(&qtop_list(&[
        "--active-file",
        &active,
        "--no-color",
        "--hide-queued",
    ]));
    assert!(hidden.iter().any(|line| line.contains("running_json")));
    assert!(hidden.iter().all(|line| !line.contains("waiting_json")));
}

#[test]
fn unreadable_sources_exit_non_zero() {
    let output = qtop_list(&["--active-file", "/nonexistent/qtop/active.txt"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no readable job source"), "{stderr}");
}

#[test]
fn one_unreadable_source_is_tolerated() {
    let active = fixture("active.txt");
    let output = qtop_list(&[
        "--active-file",
        &active,
        "--history-file",
        "/nonexistent/qtop/history.txt",
        "--no-color",
    ]);
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output).len(), 5);
}
