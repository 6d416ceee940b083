//! panicwatch-test - crash harness for panicwatch
//!
//! Starts panicwatch, then misbehaves in the way the chosen scenario asks.
//! A detected failure record is written as JSON to the results file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use panicwatch::{Config, FailureRecord, Watch, WatchOptions};

/// panicwatch-test - crash in various ways under panicwatch
#[derive(Parser, Debug)]
#[command(name = "panicwatch-test")]
#[command(about = "Crash in various ways under panicwatch")]
struct Cli {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: Scenario,

    /// File the detected failure record is written to
    results: PathBuf,

    /// TOML file with capture buffer sizes
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    NoPanic,
    NoPanicError,
    Panic,
    PanicAndError,
    PanicSyncSplit,
    PanicWithGarbage,
    OnlyLastPanicStringIsDetected,
    FatalError,
    WatcherKilled,
    WatcherKilledUnhandled,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        let _ = writeln!(io::stderr(), "unexpected error: {:#}", e);
        process::exit(3);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut config = Config::new();
    if let Some(ref path) = cli.config {
        let options = WatchOptions::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        config = config.with_options(options);
    }

    let results = cli.results.clone();
    config = config.on_failure(move |record| {
        if let Err(e) = write_results(&results, &record) {
            let _ = writeln!(io::stderr(), "failed to write results: {:#}", e);
            process::exit(3);
        }
    });

    if cli.scenario == Scenario::WatcherKilled {
        config = config.on_watcher_exited(|exit| {
            println!("watcher exited: {}", exit);
        });
    }

    panicwatch::hook::install();
    let watch = panicwatch::start(config).context("failed to start panicwatch")?;
    log::debug!("Running {:?} watched by PID {}", cli.scenario, watch.watcher_pid());

    execute(cli.scenario, &watch)
}

fn write_results(path: &Path, record: &FailureRecord) -> anyhow::Result<()> {
    let json = serde_json::to_vec(record)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn execute(scenario: Scenario, watch: &Watch) -> anyhow::Result<()> {
    match scenario {
        Scenario::NoPanic => {
            println!("some stdout output");
            eprintln!("some stderr output");
        }
        Scenario::NoPanicError => {
            eprintln!("blah blah something happened");
            process::exit(1);
        }
        Scenario::Panic => {
            println!("some output...\neverything looks good...");
            panic!("wtf, unexpected panic!");
        }
        Scenario::PanicAndError => {
            println!("some output...\neverything looks good...");
            eprintln!("well something goes bad ...");
            panic!("... and panic!");
        }
        Scenario::PanicSyncSplit => {
            let mut stderr = io::stderr();
            write!(stderr, "pani")?;
            stderr.flush()?;

            thread::sleep(Duration::from_millis(500));
            writeln!(stderr, "c: i'm split in two lol")?;
            writeln!(stderr, "\nthread 'main' [running]:")?;
            stderr.flush()?;

            thread::sleep(Duration::from_millis(500));
            writeln!(stderr, "panicwatch_test::execute()")?;
            writeln!(stderr, "\t{}:{} +0x8d7", file!(), line!())?;
            stderr.flush()?;

            writeln!(stderr, "panicwatch_test::main()")?;
            writeln!(stderr, "\t{}:{} +0x12ab", file!(), line!())?;
            process::exit(2);
        }
        Scenario::PanicWithGarbage => {
            eprintln!("panic: blah blah\n");
            for _ in 0..1500 {
                println!("some garbage here...");
                eprintln!("some garbage here...");
            }
            panic!("and BAM!");
        }
        Scenario::OnlyLastPanicStringIsDetected => {
            eprintln!("panic: this is fake\n");
            panic!("and this is not");
        }
        Scenario::FatalError => {
            eprintln!("about to fail hard");
            panicwatch::hook::fatal("unrecoverable state");
        }
        Scenario::WatcherKilled => {
            kill_watcher(watch)?;
            if !watch.wait_timeout(Duration::from_secs(10)) {
                anyhow::bail!("watcher exit was not handled in time");
            }
            eprintln!("stderr restored");
        }
        Scenario::WatcherKilledUnhandled => {
            // Without on_watcher_exited the lifecycle thread ends the process
            kill_watcher(watch)?;
            watch.wait_timeout(Duration::from_secs(10));
            anyhow::bail!("still running after the watcher died");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn kill_watcher(watch: &Watch) -> anyhow::Result<()> {
    let pid = libc::pid_t::try_from(watch.watcher_pid()).context("watcher PID out of range")?;
    if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
        return Err(io::Error::last_os_error()).context("failed to kill watcher");
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_watcher(_watch: &Watch) -> anyhow::Result<()> {
    anyhow::bail!("killing the watcher is only supported on Unix")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names() {
        let cli = Cli::parse_from(["panicwatch-test", "only-last-panic-string-is-detected", "out.json"]);
        assert_eq!(cli.scenario, Scenario::OnlyLastPanicStringIsDetected);
        assert_eq!(cli.results, PathBuf::from("out.json"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_config_flag() {
        let cli = Cli::parse_from(["panicwatch-test", "panic", "out.json", "--config", "w.toml"]);
        assert_eq!(cli.scenario, Scenario::Panic);
        assert_eq!(cli.config, Some(PathBuf::from("w.toml")));
    }

    #[test]
    fn test_watcher_killed_unhandled_name() {
        let cli = Cli::parse_from(["panicwatch-test", "watcher-killed-unhandled", "out.json"]);
        assert_eq!(cli.scenario, Scenario::WatcherKilledUnhandled);
    }

    #[test]
    fn test_unknown_scenario_rejected() {
        assert!(Cli::try_parse_from(["panicwatch-test", "explode", "out.json"]).is_err());
    }
}
