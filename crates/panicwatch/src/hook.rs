//! Panic hook emitting records the watcher recognizes
//!
//! Rust's default hook prints `thread '..' panicked at ..` which carries no
//! record header. [`install`] replaces it with one that prints
//!
//! ```text
//! panic: <payload>
//!
//! thread '<name>' panicked at <file>:<line>:<col>
//! stack backtrace:
//!    0: ...
//! ```
//!
//! and [`fatal`] does the same with a `fatal error: ` header before aborting.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt::Display;
use std::io::{self, Write};
use std::thread;

use panicwatch_core::FailureKind;

/// Replace the panic hook with one that prints a failure record
pub fn install() {
    std::panic::set_hook(Box::new(|info| {
        let message = payload_message(info.payload());
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let context = format!("thread '{}' panicked at {}", thread_name(), location);
        let backtrace = Backtrace::force_capture();

        let mut stderr = io::stderr().lock();
        let _ = write_record(&mut stderr, FailureKind::Panic, &message, &context, &backtrace);
    }));
}

/// Report an irrecoverable fault and abort the process
pub fn fatal(message: &str) -> ! {
    let context = format!("thread '{}' [running]", thread_name());
    let backtrace = Backtrace::force_capture();

    let mut stderr = io::stderr().lock();
    let _ = write_record(&mut stderr, FailureKind::FatalError, message, &context, &backtrace);
    drop(stderr);

    std::process::abort()
}

fn thread_name() -> String {
    thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn write_record<W: Write>(
    out: &mut W,
    kind: FailureKind,
    message: &str,
    context: &str,
    backtrace: &dyn Display,
) -> io::Result<()> {
    write!(
        out,
        "{}{}\n\n{}\nstack backtrace:\n{}\n",
        kind.header(),
        message,
        context,
        backtrace
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use panicwatch_core::find_last_record;

    #[test]
    fn test_record_is_detected() {
        let mut out = Vec::new();
        write_record(
            &mut out,
            FailureKind::Panic,
            "wtf, unexpected panic!",
            "thread 'main' panicked at src/main.rs:1:1",
            &"   0: app::main\n             at ./src/main.rs:1:1",
        )
        .expect("write");

        let record = find_last_record(&out).expect("record");
        assert_eq!(record.kind(), FailureKind::Panic);
        assert_eq!(record.message(), "wtf, unexpected panic!");
        assert!(record
            .stack()
            .starts_with("thread 'main' panicked at src/main.rs:1:1\nstack backtrace:\n"));

        let err = record.as_error();
        let trace = err.stack_trace().expect("decodable");
        assert_eq!(trace.frames[0].function, "app::main");
        assert_eq!(trace.frames[0].line, Some(1));
    }

    #[test]
    fn test_fatal_record_is_detected() {
        let mut out = b"unrelated output\n".to_vec();
        write_record(
            &mut out,
            FailureKind::FatalError,
            "unrecoverable state",
            "thread 'main' [running]",
            &"disabled backtrace",
        )
        .expect("write");

        let record = find_last_record(&out).expect("record");
        assert_eq!(record.kind(), FailureKind::FatalError);
        assert_eq!(record.message(), "unrecoverable state");
    }

    #[test]
    fn test_payload_message() {
        assert_eq!(payload_message(&"static"), "static");
        assert_eq!(payload_message(&String::from("owned")), "owned");
        assert_eq!(payload_message(&42u8), "Box<dyn Any>");
    }
}
