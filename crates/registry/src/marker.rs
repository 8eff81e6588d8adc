//! Completion marker carried by the last log entry of every finished task.
//!
//! Web clients detect the end of a run by matching these exact strings in
//! the newest entry, and pull the download location from the text after
//! [`RESULT_LOCATION_TOKEN`]. The registry also keeps an explicit status and
//! `result_url`, but the text must stay byte-for-byte stable.

use crate::record::LogEntry;

/// Phrase that ends a successful run.
pub const COMPLETION_PHRASE: &str = "PROCESO COMPLETADO EXITOSAMENTE.";

/// Phrase that ends a failed run.
pub const FAILURE_PHRASE: &str = "PROCESO FINALIZADO CON ERRORES";

/// Token that precedes the result location in a success message.
pub const RESULT_LOCATION_TOKEN: &str = "URL:";

/// `PROCESO COMPLETADO EXITOSAMENTE. URL:<result_url>`
pub fn success_message(result_url: &str) -> String {
    format!("{} {}{}", COMPLETION_PHRASE, RESULT_LOCATION_TOKEN, result_url)
}

/// `PROCESO FINALIZADO CON ERRORES: <reason>`
pub fn failure_message(reason: &str) -> String {
    format!("{}: {}", FAILURE_PHRASE, reason)
}

/// Text after the registry's `[<project>] ` prefix, or `None` when the
/// message does not carry that prefix.
pub fn message_body<'a>(project: &str, message: &'a str) -> Option<&'a str> {
    message
        .strip_prefix('[')?
        .strip_prefix(project)?
        .strip_prefix("] ")
}

/// True when the body of `message` opens with either terminal phrase.
///
/// Only the start of the body counts: references and project labels are
/// user text and may contain the phrases anywhere else.
pub fn is_terminal_message(project: &str, message: &str) -> bool {
    message_body(project, message)
        .map(|body| body.starts_with(COMPLETION_PHRASE) || body.starts_with(FAILURE_PHRASE))
        .unwrap_or(false)
}

/// Completion check shared by every read path: inspects only the most
/// recent entry of `entries`.
pub fn is_terminal_entry(project: &str, entries: &[LogEntry]) -> bool {
    entries
        .last()
        .map(|entry| is_terminal_message(project, &entry.message))
        .unwrap_or(false)
}

/// Extract the result location from a success message, if any.
pub fn result_location<'a>(project: &str, message: &'a str) -> Option<&'a str> {
    message_body(project, message)?
        .strip_prefix(COMPLETION_PHRASE)?
        .trim_start()
        .strip_prefix(RESULT_LOCATION_TOKEN)
        .map(str::trim)
        .filter(|location| !location.is_empty())
}
