//! Error type shared by every device-farm component.
//!
//! A single [`Error`] carries an [`ErrorKind`] so call sites can match
//! exhaustively on what went wrong instead of downcasting. The kind also
//! decides how a failed session is reported (see [`ErrorKind::is_infrastructure`]).

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level connect error, malformed endpoint URL, or a missing
    /// handshake acknowledgment. Not retried here.
    ConnectionFailure,
    /// No device was granted within the overall wait budget.
    ReservationTimeout,
    /// The coordinator sent a payload that does not match the schema.
    /// Never retried.
    MalformedResponse,
    /// A single device command exceeded its deadline.
    CommandTimeout,
    /// A device command could not be launched or ended abnormally.
    CommandExecutionFailure,
    /// An address did not validate (bad IP literal or port).
    InvalidAddress,
    /// Local filesystem failure (spool files, artifacts).
    Io,
}

impl ErrorKind {
    /// Returns `true` for kinds that mean "the farm was unavailable" rather
    /// than "the job itself failed".
    #[must_use]
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure | Self::ReservationTimeout | Self::MalformedResponse
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionFailure => "connection failure",
            Self::ReservationTimeout => "reservation timeout",
            Self::MalformedResponse => "malformed response",
            Self::CommandTimeout => "command timeout",
            Self::CommandExecutionFailure => "command execution failure",
            Self::InvalidAddress => "invalid address",
            Self::Io => "i/o error",
        };
        f.write_str(name)
    }
}

/// Error returned by every fallible device-farm operation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// What went wrong.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable detail, without the kind prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailure, message)
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedResponse, message)
    }

    pub(crate) fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandExecutionFailure, message)
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, context).with_source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::new(ErrorKind::CommandTimeout, "adb devices after 15000ms");
        assert_eq!(err.to_string(), "command timeout: adb devices after 15000ms");
        assert_eq!(err.message(), "adb devices after 15000ms");
    }

    #[test]
    fn test_infrastructure_kinds() {
        assert!(ErrorKind::ConnectionFailure.is_infrastructure());
        assert!(ErrorKind::ReservationTimeout.is_infrastructure());
        assert!(ErrorKind::MalformedResponse.is_infrastructure());
        assert!(!ErrorKind::CommandTimeout.is_infrastructure());
        assert!(!ErrorKind::CommandExecutionFailure.is_infrastructure());
        assert!(!ErrorKind::InvalidAddress.is_infrastructure());
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "adb");
        let err = Error::io("spawning adb", io);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());
    }
}
