//! Observability for blockmirror
//!
//! Structured, synchronous logging. One log line per event, typed event
//! names, deterministic field ordering. The core never logs free-form
//! text; every log call names an [`Event`].

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};

/// Emit an event at INFO severity.
pub fn emit(event: Event, fields: &[(&str, &str)]) {
    Logger::info(event.name(), fields);
}

/// Emit an event at WARN severity.
pub fn emit_warn(event: Event, fields: &[(&str, &str)]) {
    Logger::warn(event.name(), fields);
}

/// Emit an event at ERROR severity.
pub fn emit_error(event: Event, fields: &[(&str, &str)]) {
    Logger::error(event.name(), fields);
}
