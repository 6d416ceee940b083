//! panicwatch-core: Building blocks for panicwatch
//!
//! This crate provides the pieces that don't involve process lifecycle:
//! - Standard error handle duplication and redirection per platform
//! - A fixed-capacity ring buffer for captured output
//! - Detection and decoding of the last fatal record in captured output
//! - Stack trace decoding for detected records

pub mod handle;
pub mod record;
pub mod ring_buffer;
pub mod trace;

pub use handle::{pipe, HandleDuplicator, OwnedStream, Platform};
pub use record::{find_last_record, FailureKind, FailureRecord};
pub use ring_buffer::RingBuffer;
pub use trace::{FailureError, Frame, StackTrace, TraceError};
