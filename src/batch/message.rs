//! Batch messages.
//!
//! Everything a batch tells the user besides rows ends up as a
//! [`ResultMessage`]: rows-affected counts, driver output, driver errors and
//! the cancellation notice.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::source::DriverMessage;

/// Synthesized when a batch finishes without producing any message.
pub const SUCCESS_MESSAGE: &str = "Commands completed successfully.";

/// Reported when a batch stops because its query was canceled.
pub const CANCELLED_MESSAGE: &str = "Query was canceled by user";

/// Driver messages above this severity are errors.
pub const ERROR_SEVERITY_THRESHOLD: u8 = 10;

/// A message produced while a batch ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub batch_id: usize,
    pub is_error: bool,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl ResultMessage {
    pub fn info(batch_id: usize, message: impl Into<String>) -> Self {
        Self::new(batch_id, false, message)
    }

    pub fn error(batch_id: usize, message: impl Into<String>) -> Self {
        Self::new(batch_id, true, message)
    }

    fn new(batch_id: usize, is_error: bool, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            is_error,
            time: Utc::now(),
            message: message.into(),
        }
    }
}

/// Zero-based position of a batch within the submitted text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// How a driver-reported error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Reported as an error with number, level, state and line.
    Error,
    /// Reported as plain text.
    Informational,
    /// Not reported at all.
    Suppressed,
}

/// Classifies a driver-reported error by severity.
///
/// Severity above [`ERROR_SEVERITY_THRESHOLD`] is an error. Lower nonzero
/// severity with a nonzero number is informational. Everything else is
/// suppressed.
pub fn classify(message: &DriverMessage) -> Classification {
    if message.severity > ERROR_SEVERITY_THRESHOLD {
        Classification::Error
    } else if message.severity > 0 && message.code != 0 {
        Classification::Informational
    } else {
        Classification::Suppressed
    }
}

/// Formats an error-class driver message.
///
/// The driver's line is relative to the batch, so it is shifted by the
/// batch's starting line. An unknown line counts as the first one.
pub fn format_error(message: &DriverMessage, selection: &SelectionRange) -> String {
    let line = selection.start_line + message.line.max(1);
    let procedure = match &message.procedure {
        Some(procedure) if !procedure.is_empty() => format!("Procedure {}, ", procedure),
        _ => String::new(),
    };
    format!(
        "Msg {}, Level {}, State {}, {}Line {}\n{}",
        message.code, message.severity, message.state, procedure, line, message.message
    )
}

/// Text of a rows-affected notice.
pub fn rows_affected(count: u64) -> String {
    if count == 1 {
        "(1 row affected)".to_string()
    } else {
        format!("({} rows affected)", count)
    }
}

/// Formats a duration as `HH:MM:SS.mmm`.
pub fn format_elapsed(elapsed: TimeDelta) -> String {
    let ms = elapsed.num_milliseconds().max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}
