//! User-visible status lines.
//!
//! Diagnostics go through the `log` facade; the lines a person running a job
//! actually reads (waiting for device, device ready, why the job did not
//! complete) go through a [`StatusSink`] handed to each component when it is
//! built. Nothing here is process-global.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::constants::STATUS_PREFIX;

/// Destination for human-readable progress lines.
pub trait StatusSink: Send + Sync + std::fmt::Debug {
    /// Emit one line. Implementations must not fail.
    fn status(&self, line: &str);
}

/// Shared handle to a status sink.
pub type SharedStatus = Arc<dyn StatusSink>;

/// Writes `[android] <line>` to any writer (stdout by default).
pub struct ConsoleStatus {
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ConsoleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleStatus").finish_non_exhaustive()
    }
}

impl ConsoleStatus {
    /// Status lines on stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Status lines on an arbitrary writer.
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn status(&self, line: &str) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        // Multi-line output (adb chatter) keeps the prefix on the first line only.
        let _ = writeln!(out, "{}{}", STATUS_PREFIX, line.trim_end());
        let _ = out.flush();
    }
}

/// Discards every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn status(&self, _line: &str) {}
}

/// Keeps every line in memory. Used by tests and by callers that want to
/// attach the transcript to a report.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    lines: Mutex<Vec<String>>,
}

impl RecordingStatus {
    /// Snapshot of the lines seen so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl StatusSink for RecordingStatus {
    fn status(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Fixed wording for the status lines.
pub mod messages {
    use crate::error::{Error, ErrorKind};

    /// Emitted once per poll cycle while the coordinator has not answered.
    pub const WAITING_FOR_DEVICE: &str = "Waiting for a device from the farm...";

    /// Headline for a reservation payload that could not be understood.
    pub const FAILED_TO_PARSE_RESPONSE: &str = "Failed to parse the device farm response";

    /// A device was granted.
    pub fn device_ready(tag: Option<&str>) -> String {
        match tag {
            Some(tag) if !tag.is_empty() => format!("Device ready: {tag}"),
            _ => "Device ready".to_string(),
        }
    }

    /// The single line describing a terminal failure. Components return
    /// errors without reporting them; whoever ends the session emits this.
    pub fn failure(err: &Error) -> String {
        let headline = match err.kind() {
            ErrorKind::ConnectionFailure => "Device farm connection failed",
            ErrorKind::ReservationTimeout => "No device became available in time",
            ErrorKind::MalformedResponse => FAILED_TO_PARSE_RESPONSE,
            ErrorKind::CommandTimeout => "A device command timed out",
            ErrorKind::CommandExecutionFailure => "A device command failed",
            ErrorKind::InvalidAddress => "The device farm returned an invalid device address",
            ErrorKind::Io => "Local file error",
        };
        format!("{headline} ({})", err.message())
    }
}
