//! Stack trace decoding for fatal records
//!
//! Turns the text `"<kind>: <message>\n<stack>"` into a structured
//! [`StackTrace`]. Two frame shapes are understood:
//!
//! ```text
//!    3: app::worker::run
//!              at ./src/worker.rs:42:9
//! ```
//!
//! and
//!
//! ```text
//! main.executeCommand(0x7fff79030f93, 0x22)
//!         /src/cmd/test/test.go:83 +0x8d7
//! ```
//!
//! Lines that are neither frames nor locations (`stack backtrace:`,
//! `goroutine 1 [running]:`, notes) are kept as context.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::record::FailureKind;

/// Errors from decoding a stack trace
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("first line is not a panic or fatal error header")]
    MissingHeader,

    #[error("location on line {0} does not follow a frame")]
    OrphanLocation(usize),

    #[error("no stack frames found")]
    NoFrames,
}

/// One frame of a decoded stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.function)?;
        if let Some(ref file) = self.file {
            write!(f, " at {}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
            }
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

/// A decoded fatal failure with its frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub kind: FailureKind,
    pub message: String,
    /// Non-frame lines, in order
    pub context: Vec<String>,
    pub frames: Vec<Frame>,
}

struct Patterns {
    numbered_frame: Regex,
    at_location: Regex,
    tab_location: Regex,
    created_by: Regex,
    call_frame: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        numbered_frame: Regex::new(r"^\s*\d+: (.+)$").expect("valid pattern"),
        at_location: Regex::new(r"^\s+at (.+?):(\d+)(?::(\d+))?$").expect("valid pattern"),
        tab_location: Regex::new(r"^\t(.+?):(\d+)(?: \+0x[0-9a-fA-F]+)?$").expect("valid pattern"),
        created_by: Regex::new(r"^(created by .+?)(?: in goroutine \d+)?$").expect("valid pattern"),
        call_frame: Regex::new(r"^\S.*\)$").expect("valid pattern"),
    })
}

impl StackTrace {
    /// Decode `"<kind>: <message>\n<stack>"`
    pub fn parse(text: &str) -> Result<Self, TraceError> {
        let mut lines = text.lines();
        let header = lines.next().ok_or(TraceError::MissingHeader)?;
        let (kind, message) = FailureKind::ALL
            .into_iter()
            .find_map(|kind| {
                header
                    .strip_prefix(kind.header())
                    .map(|message| (kind, message.to_string()))
            })
            .ok_or(TraceError::MissingHeader)?;

        let p = patterns();
        let mut context = Vec::new();
        let mut frames: Vec<Frame> = Vec::new();
        // Whether the newest frame can still take a location line
        let mut open_frame = false;

        for (index, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let location = p
                .at_location
                .captures(line)
                .or_else(|| p.tab_location.captures(line));
            if let Some(caps) = location {
                let frame = match frames.last_mut() {
                    Some(frame) if open_frame => frame,
                    // index is 0-based from the line after the header
                    _ => return Err(TraceError::OrphanLocation(index + 2)),
                };
                frame.file = Some(caps[1].to_string());
                frame.line = caps[2].parse().ok();
                frame.column = caps.get(3).and_then(|m| m.as_str().parse().ok());
                open_frame = false;
                continue;
            }

            let function = p
                .numbered_frame
                .captures(line)
                .map(|caps| caps[1].trim().to_string())
                .or_else(|| p.created_by.captures(line).map(|caps| caps[1].to_string()))
                .or_else(|| {
                    (!line.ends_with(':') && p.call_frame.is_match(line)).then(|| line.to_string())
                });

            match function {
                Some(function) => {
                    frames.push(Frame {
                        function,
                        file: None,
                        line: None,
                        column: None,
                    });
                    open_frame = true;
                }
                None => {
                    context.push(line.to_string());
                    open_frame = false;
                }
            }
        }

        if frames.is_empty() {
            return Err(TraceError::NoFrames);
        }

        Ok(Self {
            kind,
            message,
            context,
            frames,
        })
    }
}

/// Error form of a fatal record
///
/// Displays as the failure message in both variants.
#[derive(Error, Debug)]
pub enum FailureError {
    #[error("{}", .0.message)]
    Traced(StackTrace),

    #[error("{0}")]
    Message(String),
}

impl FailureError {
    pub fn message(&self) -> &str {
        match self {
            FailureError::Traced(trace) => &trace.message,
            FailureError::Message(message) => message,
        }
    }

    pub fn stack_trace(&self) -> Option<&StackTrace> {
        match self {
            FailureError::Traced(trace) => Some(trace),
            FailureError::Message(_) => None,
        }
    }
}
