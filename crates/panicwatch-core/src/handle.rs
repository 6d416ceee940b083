//! Standard error handle duplication and redirection
//!
//! The live standard error handle is process-wide OS state. Everything that
//! touches it goes through [`HandleDuplicator`], which has one backing
//! implementation per platform, selected at build time:
//!
//! - [`Dup2`] on POSIX targets (`fcntl(F_DUPFD_CLOEXEC)` + `dup2`)
//! - [`Dup3`] on Linux ARM targets (`dup3(fd, 2, 0)`)
//! - [`StdHandle`] on Windows (`DuplicateHandle` + `SetStdHandle`)
//!
//! All handles created here are close-on-exec (Unix) or non-inheritable
//! (Windows). They reach a spawned process only when the spawn primitive
//! installs them as that process's stdio.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub use std::os::unix::io::{BorrowedFd as BorrowedStream, OwnedFd as OwnedStream};
#[cfg(windows)]
pub use std::os::windows::io::{BorrowedHandle as BorrowedStream, OwnedHandle as OwnedStream};

/// Borrow an owned stream handle
pub fn borrow_stream(stream: &OwnedStream) -> BorrowedStream<'_> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsFd;
        stream.as_fd()
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsHandle;
        stream.as_handle()
    }
}

/// Duplicate and redirect OS-level stream handles
pub trait HandleDuplicator {
    /// Duplicate `handle` into a new handle referring to the same stream.
    ///
    /// The duplicate is independent of the original's lifetime and is not
    /// inherited by processes spawned later.
    fn duplicate(&self, handle: BorrowedStream<'_>) -> io::Result<OwnedStream>;

    /// Make `target` the process's standard error from this point forward.
    ///
    /// Ownership of `target` moves into the standard error slot. On failure
    /// the current standard error is left untouched and `target` is closed.
    fn redirect_stderr(&self, target: OwnedStream) -> io::Result<()>;

    /// Duplicate whatever handle is currently bound to standard error
    fn duplicate_stderr(&self) -> io::Result<OwnedStream> {
        let stderr = io::stderr();

        #[cfg(unix)]
        let handle = {
            use std::os::unix::io::AsFd;
            stderr.as_fd()
        };
        #[cfg(windows)]
        let handle = {
            use std::os::windows::io::AsHandle;
            stderr.as_handle()
        };

        self.duplicate(handle)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    /// POSIX duplication via `F_DUPFD_CLOEXEC` and `dup2`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Dup2;

    impl HandleDuplicator for Dup2 {
        fn duplicate(&self, handle: BorrowedStream<'_>) -> io::Result<OwnedStream> {
            dup_cloexec(handle.as_raw_fd())
        }

        fn redirect_stderr(&self, target: OwnedStream) -> io::Result<()> {
            if target.as_raw_fd() == libc::STDERR_FILENO {
                std::mem::forget(target);
                return Ok(());
            }
            retry_eintr(|| unsafe { libc::dup2(target.as_raw_fd(), libc::STDERR_FILENO) })?;
            // fd 2 now holds its own reference; `target` is closed on drop
            log::trace!("dup2({}, 2) done", target.as_raw_fd());
            Ok(())
        }
    }

    /// Linux variant using `dup3`, for targets whose syscall table has no
    /// plain `dup2`
    #[cfg(target_os = "linux")]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Dup3;

    #[cfg(target_os = "linux")]
    impl HandleDuplicator for Dup3 {
        fn duplicate(&self, handle: BorrowedStream<'_>) -> io::Result<OwnedStream> {
            dup_cloexec(handle.as_raw_fd())
        }

        fn redirect_stderr(&self, target: OwnedStream) -> io::Result<()> {
            // dup3 rejects oldfd == newfd
            if target.as_raw_fd() == libc::STDERR_FILENO {
                std::mem::forget(target);
                return Ok(());
            }
            retry_eintr(|| unsafe { libc::dup3(target.as_raw_fd(), libc::STDERR_FILENO, 0) })?;
            log::trace!("dup3({}, 2, 0) done", target.as_raw_fd());
            Ok(())
        }
    }

    /// Duplicate `fd` onto the lowest free descriptor with close-on-exec set
    fn dup_cloexec(fd: RawFd) -> io::Result<OwnedStream> {
        let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if new_fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(unsafe { OwnedStream::from_raw_fd(new_fd) })
        }
    }

    fn retry_eintr(mut call: impl FnMut() -> libc::c_int) -> io::Result<()> {
        loop {
            if call() >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Create an anonymous pipe, both ends close-on-exec
    ///
    /// Returns `(read_end, write_end)`.
    pub fn pipe() -> io::Result<(File, File)> {
        let mut fds = [0 as libc::c_int; 2];

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let read_end = unsafe { File::from_raw_fd(fds[0]) };
        let write_end = unsafe { File::from_raw_fd(fds[1]) };

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags == -1
                || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1
            {
                return Err(io::Error::last_os_error());
            }
        }

        Ok((read_end, write_end))
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows {
    use super::*;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, RawHandle};
    use std::ptr;
    use winapi::shared::minwindef::FALSE;
    use winapi::um::handleapi::DuplicateHandle;
    use winapi::um::namedpipeapi::CreatePipe;
    use winapi::um::processenv::SetStdHandle;
    use winapi::um::processthreadsapi::GetCurrentProcess;
    use winapi::um::winbase::STD_ERROR_HANDLE;
    use winapi::um::winnt::{DUPLICATE_SAME_ACCESS, HANDLE};

    /// Native handle duplication and standard handle reassignment
    #[derive(Debug, Default, Clone, Copy)]
    pub struct StdHandle;

    impl HandleDuplicator for StdHandle {
        fn duplicate(&self, handle: BorrowedStream<'_>) -> io::Result<OwnedStream> {
            let mut duplicated: HANDLE = ptr::null_mut();
            let ok = unsafe {
                let process = GetCurrentProcess();
                DuplicateHandle(
                    process,
                    handle.as_raw_handle() as HANDLE,
                    process,
                    &mut duplicated,
                    0,
                    FALSE,
                    DUPLICATE_SAME_ACCESS,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { OwnedStream::from_raw_handle(duplicated as RawHandle) })
        }

        fn redirect_stderr(&self, target: OwnedStream) -> io::Result<()> {
            let ok = unsafe { SetStdHandle(STD_ERROR_HANDLE, target.as_raw_handle() as HANDLE) };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            // The std handle slot does not duplicate; it owns `target` now.
            // The displaced handle stays open since other code may hold it.
            let _ = target.into_raw_handle();
            Ok(())
        }
    }

    /// Create an anonymous, non-inheritable pipe
    ///
    /// Returns `(read_end, write_end)`.
    pub fn pipe() -> io::Result<(File, File)> {
        let mut read: HANDLE = ptr::null_mut();
        let mut write: HANDLE = ptr::null_mut();
        let ok = unsafe { CreatePipe(&mut read, &mut write, ptr::null_mut(), 0) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok((
                File::from_raw_handle(read as RawHandle),
                File::from_raw_handle(write as RawHandle),
            ))
        }
    }
}

// ============================================================================
// Re-export the platform-specific implementation
// ============================================================================

#[cfg(unix)]
pub use unix::{pipe, Dup2};

#[cfg(target_os = "linux")]
pub use unix::Dup3;

#[cfg(windows)]
pub use windows::{pipe, StdHandle};

/// The duplicator for the build target
#[cfg(all(
    unix,
    not(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64")))
))]
pub type Platform = Dup2;

/// The duplicator for the build target
#[cfg(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64")))]
pub type Platform = Dup3;

/// The duplicator for the build target
#[cfg(windows)]
pub type Platform = StdHandle;

// ============================================================================
// Tests
// ============================================================================
