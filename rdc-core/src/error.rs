//! Domain-specific error types for the RDC session engine.
//!
//! All fallible operations return `Result<T, RdcError>`.
//! No panics on invalid input: every error is typed, and every error
//! maps onto exactly one user-facing [`ConnectionError`] code.

use std::time::Duration;
use thiserror::Error;

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, RdcError>;

// ── ConnectionError ──────────────────────────────────────────────

/// Terminal status of a connection attempt, as seen by the shell.
///
/// Set at most once per attempt; `None` means a clean disconnect (or
/// no attempt yet).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionError {
    #[default]
    None = 0,
    TimeOut = 1,
    HostResolution = 2,
    General = 3,
    Canceled = 4,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::TimeOut => write!(f, "timed out"),
            Self::HostResolution => write!(f, "host resolution failed"),
            Self::General => write!(f, "general failure"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

// ── RdcError ─────────────────────────────────────────────────────

/// The canonical error type for the session engine.
#[derive(Debug, Error)]
pub enum RdcError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The host name could not be resolved or the host was unreachable.
    #[error("cannot resolve or reach host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The connection attempt or main loop was interrupted externally.
    #[error("operation canceled")]
    Canceled,

    /// The peer closed the byte stream.
    #[error("connection closed by peer")]
    Closed,

    // ── Protocol Errors ──────────────────────────────────────────
    /// Wire data could not be decoded. Always fatal to the session.
    #[error("malformed input: {what}")]
    Malformed { what: &'static str },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer refused a negotiation step.
    #[error("negotiation rejected: {0}")]
    Rejected(String),

    /// A numeric value did not map to any known variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u32 },

    /// The peer requested a feature this client does not implement.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The MAC of an inbound packet did not match its content.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// A state machine transition was attempted from the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    // ── Local Errors ─────────────────────────────────────────────
    /// Persistent bitmap cache I/O failed.
    #[error("persistent cache: {0}")]
    PersistentCache(String),

    /// Invalid local configuration or argument.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RdcError {
    /// Shorthand for a [`RdcError::Malformed`] error.
    pub fn malformed(what: &'static str) -> Self {
        RdcError::Malformed { what }
    }

    /// The user-facing error code this error surfaces as.
    pub fn kind(&self) -> ConnectionError {
        match self {
            RdcError::HostResolution { .. } => ConnectionError::HostResolution,
            RdcError::Timeout(_) => ConnectionError::TimeOut,
            RdcError::Canceled => ConnectionError::Canceled,
            RdcError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                ConnectionError::TimeOut
            }
            _ => ConnectionError::General,
        }
    }
}

impl From<tokio::time::error::Elapsed> for RdcError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RdcError::Timeout(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RdcError::malformed("mcs header");
        assert!(e.to_string().contains("mcs header"));

        let e = RdcError::UnknownVariant {
            type_name: "pdu type",
            value: 0x2a,
        };
        assert!(e.to_string().contains("0x2a"));
    }

    #[test]
    fn kinds_map_onto_connection_errors() {
        assert_eq!(
            RdcError::Timeout(Duration::from_secs(1)).kind(),
            ConnectionError::TimeOut
        );
        assert_eq!(RdcError::Canceled.kind(), ConnectionError::Canceled);
        assert_eq!(
            RdcError::HostResolution {
                host: "nowhere".into(),
                reason: "nxdomain".into()
            }
            .kind(),
            ConnectionError::HostResolution
        );
        assert_eq!(RdcError::SignatureMismatch.kind(), ConnectionError::General);
        assert_eq!(RdcError::malformed("x").kind(), ConnectionError::General);
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RdcError = io_err.into();
        assert!(matches!(e, RdcError::Io(_)));
        assert_eq!(e.kind(), ConnectionError::General);
    }
}
