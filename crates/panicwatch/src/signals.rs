//! Signal suspension for the watcher process
//!
//! The watcher shares the application's process group, so a terminal
//! interrupt meant for the application would also reach it. It ignores
//! asynchronous signals for the whole capture and brings back the child-exit
//! disposition before running user callbacks, which may need to reap.

#[cfg(unix)]
mod unix {
    use std::{io, mem, ptr};

    /// Asynchronous signals the watcher must survive. Synchronous faults
    /// (SIGSEGV and friends) keep their dispositions.
    const SUSPENDED: &[libc::c_int] = &[
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGUSR1,
        libc::SIGUSR2,
        libc::SIGPIPE,
        libc::SIGALRM,
        libc::SIGCHLD,
        libc::SIGTSTP,
        libc::SIGTTIN,
        libc::SIGTTOU,
        libc::SIGWINCH,
        libc::SIGURG,
        libc::SIGVTALRM,
        libc::SIGPROF,
        libc::SIGXCPU,
        libc::SIGXFSZ,
        libc::SIGIO,
    ];

    /// Previous dispositions of the signals currently ignored
    pub struct SuspendedSignals {
        saved: Vec<(libc::c_int, libc::sigaction)>,
    }

    impl SuspendedSignals {
        /// Ignore every signal in the suspended set
        pub fn ignore_all() -> Self {
            let mut ignore: libc::sigaction = unsafe { mem::zeroed() };
            ignore.sa_sigaction = libc::SIG_IGN;
            unsafe { libc::sigemptyset(&mut ignore.sa_mask) };

            let mut saved = Vec::with_capacity(SUSPENDED.len());
            for &signal in SUSPENDED {
                let mut previous: libc::sigaction = unsafe { mem::zeroed() };
                if unsafe { libc::sigaction(signal, &ignore, &mut previous) } == 0 {
                    saved.push((signal, previous));
                } else {
                    log::debug!(
                        "Could not ignore signal {}: {}",
                        signal,
                        io::Error::last_os_error()
                    );
                }
            }

            log::trace!("Suspended {} signals", saved.len());
            Self { saved }
        }

        /// Restore the SIGCHLD disposition saved by [`Self::ignore_all`]
        pub fn restore_child_exit(&mut self) {
            self.restore(libc::SIGCHLD);
        }

        fn restore(&mut self, signal: libc::c_int) {
            let Some(index) = self.saved.iter().position(|(s, _)| *s == signal) else {
                return;
            };
            let (_, previous) = self.saved.swap_remove(index);
            if unsafe { libc::sigaction(signal, &previous, ptr::null_mut()) } != 0 {
                log::warn!(
                    "Could not restore signal {}: {}",
                    signal,
                    io::Error::last_os_error()
                );
            }
        }
    }

}

#[cfg(windows)]
mod windows {
    use winapi::shared::minwindef::{FALSE, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;

    /// Console control events are ignored while this is held
    pub struct SuspendedSignals {
        _private: (),
    }

    impl SuspendedSignals {
        /// Stop Ctrl+C and Ctrl+Break from terminating the process
        pub fn ignore_all() -> Self {
            if unsafe { SetConsoleCtrlHandler(None, TRUE) } == FALSE {
                log::debug!(
                    "Could not ignore console control events: {}",
                    std::io::Error::last_os_error()
                );
            }
            Self { _private: () }
        }

        /// Windows has no child-exit notification to restore
        pub fn restore_child_exit(&mut self) {}
    }
}

#[cfg(unix)]
pub(crate) use unix::SuspendedSignals;

#[cfg(windows)]
pub(crate) use windows::SuspendedSignals;
