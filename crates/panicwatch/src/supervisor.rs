//! Application-side supervision
//!
//! [`start`] relaunches the current executable as a watcher and points the
//! process's stderr at a pipe the watcher reads from. A background thread
//! waits for the watcher; if it dies while the application is still running,
//! stderr is pointed back at the original stream so no output is lost.
//!
//! The lifecycle thread starts before the watcher and only receives it once
//! stderr is redirected. A watcher that is already gone at that point is
//! reaped by [`start`] itself, which leaves stderr untouched.

use std::env;
use std::io::{self, Write};
use std::process::{self, Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use panicwatch_core::handle::borrow_stream;
use panicwatch_core::{pipe, HandleDuplicator, OwnedStream, Platform};

use crate::config::{Config, ConfigError, WatcherExitedCallback};
use crate::role::{Role, MARKER_NAME, MARKER_VALUE};
use crate::watcher;

/// Errors that can occur while starting supervision
///
/// Every variant leaves the process's stderr as it was.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("panicwatch is already running in this process")]
    AlreadyStarted,

    #[error("Failed to resolve own executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Failed to duplicate stderr: {0}")]
    Duplicate(#[source] io::Error),

    #[error("Failed to spawn watcher: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to start lifecycle thread: {0}")]
    Thread(#[source] io::Error),

    #[error("Watcher exited during startup")]
    WatcherExited,

    #[error("Failed to redirect stderr: {0}")]
    Redirect(#[source] io::Error),
}

/// How the watcher process ended while the application was alive
#[derive(Error, Debug)]
pub enum WatcherExit {
    #[error("watcher process exited: {0}")]
    Exited(ExitStatus),

    #[error("failed to wait for watcher process: {0}")]
    Wait(#[from] io::Error),
}

/// Set while a watcher is attached to this process
static STARTED: AtomicBool = AtomicBool::new(false);

/// Start watching for fatal failures.
///
/// In the application this spawns the watcher, redirects stderr and returns
/// a [`Watch`]. In the watcher this runs the capture loop and never returns.
///
/// Code before this call runs in both processes, so call it early.
pub fn start(config: Config) -> Result<Watch, StartError> {
    config.validate()?;

    match Role::detect() {
        Role::Watcher => watcher::run(config),
        Role::Application => {
            if STARTED.swap(true, Ordering::SeqCst) {
                return Err(StartError::AlreadyStarted);
            }
            launch(config).inspect_err(|_| STARTED.store(false, Ordering::SeqCst))
        }
    }
}

/// The process's standard error binding while a watcher is attached
struct ErrorStream {
    duplicator: Platform,
    /// The stream stderr pointed at before redirection
    original: OwnedStream,
}

impl ErrorStream {
    /// Take hold of whatever stderr currently points at
    fn capture() -> io::Result<Self> {
        let duplicator = Platform::default();
        let original = duplicator.duplicate_stderr()?;
        Ok(Self {
            duplicator,
            original,
        })
    }

    /// Another handle to the original stream, for the watcher's stdout
    fn duplicate_original(&self) -> io::Result<OwnedStream> {
        self.duplicator.duplicate(borrow_stream(&self.original))
    }

    fn redirect_to(&self, target: OwnedStream) -> io::Result<()> {
        self.duplicator.redirect_stderr(target)
    }

    /// Point stderr back at the original stream
    fn restore(self) -> io::Result<()> {
        self.duplicator.redirect_stderr(self.original)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Lifecycle thread waiting for a watcher to be handed over
    Launching,
    /// Stderr redirected into the watcher, lifecycle thread owns it
    Armed,
    /// Startup failed; stderr was never redirected
    Abandoned,
    /// Watcher reaped and, if armed, stderr restored
    Exited,
}

struct State {
    phase: Phase,
    stream: Option<ErrorStream>,
    child: Option<Child>,
}

/// Shared between [`Watch`], [`launch`] and the lifecycle thread
struct Lifecycle {
    state: Mutex<State>,
    changed: Condvar,
}

impl Lifecycle {
    fn new(stream: ErrorStream) -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Launching,
                stream: Some(stream),
                child: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Redirect stderr into a live watcher and hand it to the lifecycle
    /// thread. On failure the watcher is killed and reaped and stderr is
    /// left as it was.
    fn arm(&self, mut child: Child, write_end: OwnedStream) -> Result<(), StartError> {
        let mut state = self.state.lock();

        let result = match child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("Watcher PID {} exited during startup: {}", child.id(), status);
                Err(StartError::WatcherExited)
            }
            Ok(None) => match state.stream {
                Some(ref stream) => stream.redirect_to(write_end).map_err(StartError::Redirect),
                None => Err(StartError::WatcherExited),
            },
            Err(e) => Err(StartError::Spawn(e)),
        };

        if result.is_ok() {
            state.child = Some(child);
            state.phase = Phase::Armed;
            drop(state);
            self.changed.notify_all();
        } else {
            state.phase = Phase::Abandoned;
            drop(state);
            self.changed.notify_all();
            reap(child);
        }
        result
    }

    /// Release the lifecycle thread when no watcher will be handed over
    fn abandon(&self) {
        self.state.lock().phase = Phase::Abandoned;
        self.changed.notify_all();
    }

    fn finish(&self) {
        self.state.lock().phase = Phase::Exited;
        self.changed.notify_all();
    }
}

/// Handle on a running watcher, held by the application
pub struct Watch {
    pid: u32,
    lifecycle: Arc<Lifecycle>,
}

impl Watch {
    pub fn watcher_pid(&self) -> u32 {
        self.pid
    }

    /// Whether the watcher has died and its exit has been handled
    pub fn has_exited(&self) -> bool {
        self.lifecycle.state.lock().phase == Phase::Exited
    }

    /// Block until the watcher's exit has been handled
    pub fn wait(&self) {
        let mut state = self.lifecycle.state.lock();
        while state.phase != Phase::Exited {
            self.lifecycle.changed.wait(&mut state);
        }
    }

    /// Like [`Self::wait`], giving up after `timeout`. Returns whether the
    /// exit was handled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lifecycle.state.lock();
        while state.phase != Phase::Exited {
            if self
                .lifecycle
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.phase == Phase::Exited;
            }
        }
        true
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("pid", &self.pid)
            .field("phase", &self.lifecycle.state.lock().phase)
            .finish()
    }
}

/// Spawn the watcher and hand stderr over to it
fn launch(config: Config) -> Result<Watch, StartError> {
    let exe = env::current_exe().map_err(StartError::CurrentExe)?;
    let (read_end, write_end) = pipe().map_err(StartError::Pipe)?;
    let stream = ErrorStream::capture().map_err(StartError::Duplicate)?;
    let watcher_output = stream.duplicate_original().map_err(StartError::Duplicate)?;

    // Started before the watcher exists so a failure here leaves nothing to clean up
    let lifecycle = Arc::new(Lifecycle::new(stream));
    let on_exited = config.on_watcher_exited;
    thread::Builder::new()
        .name("panicwatch-lifecycle".to_string())
        .spawn({
            let lifecycle = Arc::clone(&lifecycle);
            move || supervise(&lifecycle, on_exited)
        })
        .map_err(StartError::Thread)?;

    // stderr is inherited as-is: it still points at the original stream here
    let spawned = Command::new(&exe)
        .args(env::args_os().skip(1))
        .env(MARKER_NAME, MARKER_VALUE)
        .stdin(Stdio::from(read_end))
        .stdout(Stdio::from(watcher_output))
        .spawn();
    let child = match spawned {
        Ok(child) => child,
        Err(e) => {
            lifecycle.abandon();
            return Err(StartError::Spawn(e));
        }
    };

    let pid = child.id();
    log::debug!("Spawned watcher PID {} from {}", pid, exe.display());

    lifecycle.arm(child, write_end.into())?;
    log::debug!("Stderr redirected into watcher PID {}", pid);
    Ok(Watch { pid, lifecycle })
}

/// Kill and reap a watcher that never got stderr
fn reap(mut child: Child) {
    if let Err(e) = child.kill() {
        log::debug!("Failed to kill watcher PID {}: {}", child.id(), e);
    }
    match child.wait() {
        Ok(status) => log::debug!("Reaped watcher PID {}: {}", child.id(), status),
        Err(e) => log::warn!("Failed to reap watcher PID {}: {}", child.id(), e),
    }
}

/// Lifecycle thread body: wait for the watcher, then clean up after it
fn supervise(lifecycle: &Lifecycle, on_exited: Option<WatcherExitedCallback>) {
    let mut child = {
        let mut state = lifecycle.state.lock();
        while state.phase == Phase::Launching {
            lifecycle.changed.wait(&mut state);
        }
        match state.child.take() {
            Some(child) if state.phase == Phase::Armed => child,
            _ => {
                log::debug!("Watcher startup abandoned");
                state.phase = Phase::Exited;
                drop(state);
                lifecycle.changed.notify_all();
                return;
            }
        }
    };

    let exit = match child.wait() {
        Ok(status) => WatcherExit::Exited(status),
        Err(e) => WatcherExit::Wait(e),
    };

    let stream = lifecycle.state.lock().stream.take();
    if let Some(stream) = stream {
        if let Err(e) = stream.restore() {
            log::error!("Failed to restore stderr after watcher exit: {}", e);
        }
    }

    log::warn!("Watcher PID {} died: {}", child.id(), exit);

    match on_exited {
        Some(on_exited) => on_exited(exit),
        None => {
            let _ = writeln!(io::stderr(), "panicwatch: watcher process died: {}", exit);
            process::exit(1);
        }
    }

    lifecycle.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn lifecycle() -> Arc<Lifecycle> {
        let stream = ErrorStream::capture().expect("duplicate stderr");
        Arc::new(Lifecycle::new(stream))
    }

    fn phase(lifecycle: &Lifecycle) -> Phase {
        lifecycle.state.lock().phase
    }

    /// Block until `child` has exited, leaving it to be reaped
    #[cfg(target_os = "linux")]
    fn wait_unreaped(child: &Child) {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        assert_eq!(ret, 0, "waitid: {}", io::Error::last_os_error());
    }

    #[test]
    fn test_wait_timeout_before_exit() {
        let watch = Watch {
            pid: 1,
            lifecycle: lifecycle(),
        };
        assert!(!watch.has_exited());
        assert!(!watch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_wakes_on_finish() {
        let lifecycle = lifecycle();
        let watch = Watch {
            pid: 1,
            lifecycle: Arc::clone(&lifecycle),
        };

        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            lifecycle.finish();
        });

        assert!(watch.wait_timeout(Duration::from_secs(10)));
        assert!(watch.has_exited());
        watch.wait();
        finisher.join().expect("finisher thread");
    }

    #[test]
    fn test_duplicate_original() {
        let stream = ErrorStream::capture().expect("duplicate stderr");
        assert!(stream.duplicate_original().is_ok());
    }

    #[test]
    fn test_watcher_exit_display() {
        let exit = WatcherExit::Wait(io::Error::from(io::ErrorKind::Interrupted));
        assert!(exit.to_string().starts_with("failed to wait for watcher process"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_exited_watcher_is_never_armed() {
        init_logging();
        let lifecycle = lifecycle();
        let supervisor = thread::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            move || supervise(&lifecycle, None)
        });

        let child = Command::new("true").spawn().expect("spawn");
        wait_unreaped(&child);

        let (_read_end, write_end) = pipe().expect("pipe");
        let err = lifecycle.arm(child, write_end.into()).unwrap_err();
        assert!(matches!(err, StartError::WatcherExited));

        // The lifecycle thread is released without touching stderr
        supervisor.join().expect("lifecycle thread");
        assert_eq!(phase(&lifecycle), Phase::Exited);
        assert!(lifecycle.state.lock().stream.is_some());
        assert!(lifecycle.state.lock().child.is_none());
    }

    #[test]
    fn test_abandon_releases_lifecycle_thread() {
        init_logging();
        let lifecycle = lifecycle();
        let supervisor = thread::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            move || supervise(&lifecycle, None)
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(phase(&lifecycle), Phase::Launching);

        lifecycle.abandon();
        supervisor.join().expect("lifecycle thread");
        assert_eq!(phase(&lifecycle), Phase::Exited);
    }

    #[test]
    #[cfg(unix)]
    fn test_armed_watcher_death_restores_and_reports() {
        init_logging();
        let lifecycle = lifecycle();
        {
            let child = Command::new("sh")
                .args(["-c", "exit 7"])
                .spawn()
                .expect("spawn");
            let mut state = lifecycle.state.lock();
            state.child = Some(child);
            state.phase = Phase::Armed;
        }

        let (tx, rx) = mpsc::channel();
        supervise(
            &lifecycle,
            Some(Box::new(move |exit| {
                let _ = tx.send(exit);
            })),
        );

        let exit = rx.recv().expect("on_watcher_exited called");
        assert!(matches!(exit, WatcherExit::Exited(status) if status.code() == Some(7)));
        assert_eq!(phase(&lifecycle), Phase::Exited);
        assert!(lifecycle.state.lock().stream.is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_reap_kills_and_waits() {
        init_logging();
        let child = Command::new("sleep").arg("30").spawn().expect("spawn");
        let pid = child.id() as libc::pid_t;

        reap(child);

        // Reaped, so the PID no longer names a process (not even a zombie)
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::ESRCH)
        );
    }

    #[test]
    fn test_second_start_rejected() {
        init_logging();
        assert!(!STARTED.swap(true, Ordering::SeqCst));

        let result = start(Config::new().on_failure(|_| {}));
        assert!(matches!(result, Err(StartError::AlreadyStarted)));
        // A rejected start keeps the running watcher's claim
        assert!(STARTED.load(Ordering::SeqCst));

        STARTED.store(false, Ordering::SeqCst);
    }
}
