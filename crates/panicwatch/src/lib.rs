//! panicwatch: never miss a panic
//!
//! An unhandled panic kills the process and leaves nothing but text on
//! stderr. panicwatch re-executes the current binary as a silent watcher,
//! points stderr at a pipe the watcher reads, and forwards everything to the
//! real stderr while keeping the newest bytes. When the application dies, the
//! watcher looks for the last `panic: ` / `fatal error: ` record in what it
//! kept and hands it to your callback.
//!
//! The application doesn't change how it writes to stderr, handles signals
//! or manages descriptors.
//!
//! ```no_run
//! fn main() {
//!     panicwatch::hook::install();
//!
//!     let config = panicwatch::Config::new().on_failure(|record| {
//!         // Runs in the watcher, after the application is gone
//!         eprintln!("caught {}: {}", record.kind(), record.message());
//!     });
//!
//!     if let Err(e) = panicwatch::start(config) {
//!         eprintln!("running unwatched: {}", e);
//!     }
//!
//!     // application code
//! }
//! ```
//!
//! Everything before [`start`] runs twice, once in each process.

pub mod config;
pub mod hook;
mod role;
mod signals;
mod supervisor;
mod watcher;

pub use config::{Config, ConfigError, WatchOptions};
pub use role::Role;
pub use supervisor::{start, StartError, Watch, WatcherExit};
pub use watcher::{Watcher, WatcherError, EXIT_CLEAN, EXIT_IO_ERROR};

pub use panicwatch_core::{FailureError, FailureKind, FailureRecord, Frame, StackTrace};
