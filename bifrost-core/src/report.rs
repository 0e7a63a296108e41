//! Structured error shipping. Everything lands in the tracing pipeline; an
//! external collector picks it up from there.

use std::fmt::Display;

/// Reports a recoverable error with its subject id. Never panics, never
/// blocks the caller.
pub fn error(subject: &str, err: &dyn Display) {
    tracing::error!(subject, error = %err, "reported error");
}

/// Reports an unexpected failure from a catch-all handler. The subscriber
/// loops call this so one poisoned event can't halt ingestion.
pub fn exception(context: &str, err: &dyn Display) {
    tracing::error!(context, error = %err, "unexpected exception");
}
