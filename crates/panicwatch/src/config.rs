//! Configuration management
//!
//! [`WatchOptions`] holds the tunable buffer sizes and can be loaded from
//! TOML. [`Config`] adds the callbacks and is what [`crate::start`] takes.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use panicwatch_core::FailureRecord;

use crate::supervisor::WatcherExit;
use crate::watcher::WatcherError;

/// Default number of trailing stderr bytes retained for detection
pub const DEFAULT_CAPTURE_WINDOW_BYTES: usize = 20_000_000;

/// Default size of a single read from the captured stream
pub const DEFAULT_TEE_CHUNK_BYTES: usize = 100_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("capture_window_bytes must be greater than zero")]
    ZeroCaptureWindow,

    #[error("tee_chunk_bytes must be greater than zero")]
    ZeroTeeChunk,

    #[error("on_failure callback must be set")]
    MissingFailureCallback,
}

/// Buffer sizes used by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// How many of the newest stderr bytes are kept for detection. Too small
    /// a window loses the header of a long stack trace.
    pub capture_window_bytes: usize,
    /// Read size between the captured stream and the real stderr
    pub tee_chunk_bytes: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            capture_window_bytes: DEFAULT_CAPTURE_WINDOW_BYTES,
            tee_chunk_bytes: DEFAULT_TEE_CHUNK_BYTES,
        }
    }
}

impl WatchOptions {
    /// Parse options from TOML text; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&content)?;
        log::debug!("Loaded watch options from {}: {:?}", path.display(), options);
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_window_bytes == 0 {
            return Err(ConfigError::ZeroCaptureWindow);
        }
        if self.tee_chunk_bytes == 0 {
            return Err(ConfigError::ZeroTeeChunk);
        }
        Ok(())
    }
}

pub type FailureCallback = Box<dyn FnOnce(FailureRecord) + Send>;
pub type WatcherErrorCallback = Box<dyn FnOnce(WatcherError) + Send>;
pub type WatcherExitedCallback = Box<dyn FnOnce(WatcherExit) + Send>;

/// Everything [`crate::start`] needs
#[derive(Default)]
pub struct Config {
    pub options: WatchOptions,
    pub(crate) on_failure: Option<FailureCallback>,
    pub(crate) on_watcher_error: Option<WatcherErrorCallback>,
    pub(crate) on_watcher_exited: Option<WatcherExitedCallback>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn capture_window_bytes(mut self, bytes: usize) -> Self {
        self.options.capture_window_bytes = bytes;
        self
    }

    pub fn tee_chunk_bytes(mut self, bytes: usize) -> Self {
        self.options.tee_chunk_bytes = bytes;
        self
    }

    /// Called in the watcher process after the application dies, if a
    /// failure record was detected. Required.
    pub fn on_failure(mut self, callback: impl FnOnce(FailureRecord) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Called in the watcher process when capturing the stream fails
    pub fn on_watcher_error(mut self, callback: impl FnOnce(WatcherError) + Send + 'static) -> Self {
        self.on_watcher_error = Some(Box::new(callback));
        self
    }

    /// Called in the application process when the watcher dies first.
    ///
    /// Without it, watcher death terminates the application. Set it to shut
    /// down gracefully instead.
    pub fn on_watcher_exited(mut self, callback: impl FnOnce(WatcherExit) + Send + 'static) -> Self {
        self.on_watcher_exited = Some(Box::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.on_failure.is_none() {
            return Err(ConfigError::MissingFailureCallback);
        }
        self.options.validate()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("options", &self.options)
            .field("on_failure", &self.on_failure.is_some())
            .field("on_watcher_error", &self.on_watcher_error.is_some())
            .field("on_watcher_exited", &self.on_watcher_exited.is_some())
            .finish()
    }
}
