//! Watcher/application role detection
//!
//! The watcher is the same executable, started with the same arguments.
//! The only difference is one environment variable carrying a fixed secret,
//! so the role is decided exactly once, at [`crate::start`].

use std::env;
use std::ffi::OsStr;

/// Relaunch marker name
pub(crate) const MARKER_NAME: &str = "PANICWATCH_XkqVuiPZaKYxS3f2lHoYDTNfBPYNT24w";

/// Relaunch marker value
pub(crate) const MARKER_VALUE: &str = "zQXfl15CShjg5yQzEqoGAIgFeyXhlr9JQABuYCXm";

/// Which side of the relaunch this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The original application
    Application,
    /// The re-executed copy capturing the application's stderr
    Watcher,
}

impl Role {
    /// Determine the role of the current process
    pub fn detect() -> Self {
        Self::from_marker(env::var_os(MARKER_NAME).as_deref())
    }

    fn from_marker(value: Option<&OsStr>) -> Self {
        match value {
            Some(value) if value == MARKER_VALUE => Role::Watcher,
            _ => Role::Application,
        }
    }
}

/// Remove the marker so processes the watcher spawns don't inherit it
pub(crate) fn clear_marker() {
    env::remove_var(MARKER_NAME);
}
