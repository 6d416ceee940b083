//! Fatal-record detection in captured stderr output
//!
//! A fatal record is a header line (`panic: <message>` or
//! `fatal error: <message>`), one or more line breaks, and a non-empty stack
//! running to the end of the output. Only the *last* header line counts:
//! anything earlier that merely looks like a header (user diagnostics that
//! happen to start with `panic: `) is ignored.

use std::fmt;
use std::sync::OnceLock;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::trace::{FailureError, StackTrace};

/// Separator between the header token and the message
const HEADER_SUFFIX: &str = ": ";

/// Class of unhandled fatal failure, distinguished by header token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "panic")]
    Panic,
    #[serde(rename = "fatal error")]
    FatalError,
}

impl FailureKind {
    pub const ALL: [FailureKind; 2] = [FailureKind::Panic, FailureKind::FatalError];

    /// The header token without its `": "` suffix
    pub fn token(self) -> &'static str {
        match self {
            FailureKind::Panic => "panic",
            FailureKind::FatalError => "fatal error",
        }
    }

    /// The full line prefix, e.g. `"panic: "`
    pub fn header(self) -> &'static str {
        match self {
            FailureKind::Panic => "panic: ",
            FailureKind::FatalError => "fatal error: ",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.token().as_bytes() == token)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A decoded fatal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    kind: FailureKind,
    message: String,
    stack: String,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: stack.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Convert into an error carrying a decoded stack trace.
    ///
    /// Falls back to a message-only error when the stack can't be decoded.
    pub fn as_error(&self) -> FailureError {
        let raw = format!("{}{}\n{}", self.kind.header(), self.message, self.stack);
        match StackTrace::parse(&raw) {
            Ok(trace) => FailureError::Traced(trace),
            Err(e) => {
                log::debug!("Stack of {} record not decodable: {}", self.kind, e);
                FailureError::Message(self.message.clone())
            }
        }
    }
}

/// Locate and decode the last fatal record in `buf`
pub fn find_last_record(buf: &[u8]) -> Option<FailureRecord> {
    let start = find_last_header(buf)?;
    parse_record(&buf[start..])
}

/// Byte offset of the start of the last line beginning with a header token
pub fn find_last_header(buf: &[u8]) -> Option<usize> {
    let mut end = buf.len();
    loop {
        let line_start = buf[..end]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);

        let line = &buf[line_start..end];
        if FailureKind::ALL
            .iter()
            .any(|kind| line.starts_with(kind.header().as_bytes()))
        {
            return Some(line_start);
        }

        if line_start == 0 {
            return None;
        }
        end = line_start - 1;
    }
}

/// Decode a record from `raw`, which must start at a header line.
///
/// Returns `None` when the capture is truncated or malformed.
pub fn parse_record(raw: &[u8]) -> Option<FailureRecord> {
    let caps = record_pattern().captures(raw)?;
    let kind = FailureKind::from_token(caps.get(1)?.as_bytes())?;
    let mut message = String::from_utf8_lossy(caps.get(2)?.as_bytes()).into_owned();
    let stack = String::from_utf8_lossy(caps.get(3)?.as_bytes()).into_owned();

    if kind == FailureKind::FatalError {
        // The runtime can fuse the header into its own message
        while let Some(rest) = message.strip_prefix(kind.header()) {
            message = rest.to_string();
        }
    }

    Some(FailureRecord {
        kind,
        message,
        stack,
    })
}

fn record_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let tokens = FailureKind::ALL
            .iter()
            .map(|kind| regex::escape(kind.token()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(
            r"(?s)\A({}){}([^\n]*?)\r?\n(?:\r?\n)*([^\r\n].*)\z",
            tokens, HEADER_SUFFIX
        );
        Regex::new(&pattern).expect("record pattern is valid")
    })
}
