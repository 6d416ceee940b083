//! End-to-end tests for panicwatch
//!
//! Each test runs the panicwatch-test binary, which starts panicwatch and
//! then crashes (or not) in a specific way.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use panicwatch::{FailureKind, FailureRecord};

struct Run {
    output: Output,
    record: Option<FailureRecord>,
}

impl Run {
    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.stderr).into_owned()
    }

    fn code(&self) -> Option<i32> {
        self.output.status.code()
    }

    fn record(&self) -> &FailureRecord {
        self.record
            .as_ref()
            .unwrap_or_else(|| panic!("no failure record, stderr: {:?}", self.stderr()))
    }
}

fn harness(scenario: &str, extra: &[&str]) -> Run {
    let dir = tempfile::tempdir().expect("temp dir");
    run_in(dir.path(), scenario, extra)
}

fn run_in(dir: &Path, scenario: &str, extra: &[&str]) -> Run {
    let results = dir.join("results.json");

    // Waits for the watcher too: it holds the stderr pipe until it exits
    let output = Command::new(env!("CARGO_BIN_EXE_panicwatch-test"))
        .arg(scenario)
        .arg(&results)
        .args(extra)
        .env_remove("RUST_LOG")
        .env_remove("RUST_BACKTRACE")
        .output()
        .expect("failed to run panicwatch-test");

    let record = fs::read(&results).ok().map(|bytes| {
        serde_json::from_slice(&bytes).unwrap_or_else(|e| panic!("bad results file: {}", e))
    });

    Run { output, record }
}

#[test]
fn test_no_panic() {
    let run = harness("no-panic", &[]);
    assert!(run.output.status.success(), "stderr: {:?}", run.stderr());
    assert_eq!(run.stdout(), "some stdout output\n");
    assert_eq!(run.stderr(), "some stderr output\n");
    assert!(run.record.is_none());
}

#[test]
fn test_no_panic_error() {
    let run = harness("no-panic-error", &[]);
    assert_eq!(run.code(), Some(1));
    assert_eq!(run.stderr(), "blah blah something happened\n");
    assert!(run.record.is_none());
}

#[test]
fn test_panic() {
    let run = harness("panic", &[]);
    assert_eq!(run.code(), Some(101));
    assert_eq!(run.stdout(), "some output...\neverything looks good...\n");
    assert!(
        run.stderr()
            .starts_with("panic: wtf, unexpected panic!\n\nthread 'main' panicked at"),
        "unexpected stderr: {:?}",
        run.stderr()
    );

    let record = run.record();
    assert_eq!(record.kind(), FailureKind::Panic);
    assert_eq!(record.message(), "wtf, unexpected panic!");
    assert!(record.stack().starts_with("thread 'main' panicked at"));

    // What reached the real stderr is exactly what the application wrote
    assert!(run.stderr().ends_with(record.stack()));
}

#[test]
fn test_panic_and_error() {
    let run = harness("panic-and-error", &[]);
    assert_eq!(run.code(), Some(101));
    assert!(run.stdout().starts_with("some output...\neverything looks good...\n"));
    assert!(
        run.stderr()
            .starts_with("well something goes bad ...\npanic: ... and panic!"),
        "unexpected stderr: {:?}",
        run.stderr()
    );
    assert_eq!(run.record().message(), "... and panic!");
}

#[test]
fn test_panic_sync_split() {
    let run = harness("panic-sync-split", &[]);
    assert_eq!(run.code(), Some(2));
    assert!(run.stderr().starts_with("panic: i'm split in two lol\n"));

    let record = run.record();
    assert_eq!(record.kind(), FailureKind::Panic);
    assert_eq!(record.message(), "i'm split in two lol");
    assert!(record.stack().starts_with("thread 'main' [running]:\npanicwatch_test::execute()\n"));

    let err = record.as_error();
    let trace = err.stack_trace().expect("decodable stack");
    assert_eq!(trace.frames.len(), 2);
    assert_eq!(trace.frames[0].function, "panicwatch_test::execute()");
    assert!(trace.frames[0].file.as_deref().unwrap_or("").ends_with("main.rs"));
}

#[test]
fn test_panic_with_garbage() {
    let run = harness("panic-with-garbage", &[]);
    assert_eq!(run.code(), Some(101));
    assert!(run
        .stderr()
        .starts_with("panic: blah blah\n\nsome garbage here...\nsome garbage"));
    assert_eq!(run.record().message(), "and BAM!");
}

#[test]
fn test_only_last_panic_string_is_detected() {
    let run = harness("only-last-panic-string-is-detected", &[]);
    assert_eq!(run.code(), Some(101));
    assert_eq!(run.record().message(), "and this is not");
}

#[test]
fn test_fatal_error() {
    let run = harness("fatal-error", &[]);
    assert!(!run.output.status.success());
    assert!(run
        .stderr()
        .starts_with("about to fail hard\nfatal error: unrecoverable state\n\n"));

    let record = run.record();
    assert_eq!(record.kind(), FailureKind::FatalError);
    assert_eq!(record.message(), "unrecoverable state");
}

#[test]
fn test_window_too_small_misses_header() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = dir.path().join("watch.toml");
    fs::write(&config, "capture_window_bytes = 16\ntee_chunk_bytes = 4\n").expect("write config");

    let run = run_in(dir.path(), "panic", &["--config", config.to_str().expect("utf-8 path")]);
    assert_eq!(run.code(), Some(101));
    assert!(run.stderr().starts_with("panic: wtf, unexpected panic!\n\n"));
    assert!(run.record.is_none());
}

#[test]
fn test_invalid_config_runs_unwatched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = dir.path().join("watch.toml");
    fs::write(&config, "capture_window_bytes = 0\n").expect("write config");

    let run = run_in(dir.path(), "panic", &["--config", config.to_str().expect("utf-8 path")]);
    assert_eq!(run.code(), Some(3));
    assert!(run.stderr().contains("capture_window_bytes must be greater than zero"));
    assert!(run.record.is_none());
}

#[test]
#[cfg(unix)]
fn test_watcher_killed_restores_stderr() {
    let run = harness("watcher-killed", &[]);
    assert!(run.output.status.success(), "stderr: {:?}", run.stderr());
    assert!(run.stdout().starts_with("watcher exited: "));
    // The lifecycle thread logs the watcher's death before stderr is used again
    assert!(run.stderr().ends_with("stderr restored\n"), "stderr: {:?}", run.stderr());
    assert!(run.record.is_none());
}

#[test]
#[cfg(unix)]
fn test_watcher_killed_unhandled_exits_application() {
    let run = harness("watcher-killed-unhandled", &[]);
    assert_eq!(run.code(), Some(1), "stderr: {:?}", run.stderr());
    assert!(
        run.stderr().contains("panicwatch: watcher process died: "),
        "stderr: {:?}",
        run.stderr()
    );
    assert!(!run.stderr().contains("still running"));
    assert!(run.record.is_none());
}
