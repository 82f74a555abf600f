use std::io;
use thiserror::Error;

use crate::protocol::applemidi::ControlDecodeError;
use crate::protocol::rtp::RtpDecodeError;

/// Handshake stage that ran out of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Invitation on the control port
    ControlInvitation,
    /// Invitation on the data port
    DataInvitation,
    /// Initial clock synchronization
    ClockSync,
    /// Waiting for the initiator to open the data port or start clock sync
    PeerSetup,
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ControlInvitation => "control invitation",
            Self::DataInvitation => "data invitation",
            Self::ClockSync => "clock sync",
            Self::PeerSetup => "peer setup",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the MIDI network driver
#[derive(Debug, Error)]
pub enum MidiError {
    // ===== Recoverable protocol errors =====
    /// Malformed or out-of-sequence packet. The packet is dropped, the
    /// session is unaffected.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation
        message: String,
    },

    /// RTP packet could not be decoded
    #[error("RTP decode error: {0}")]
    Decode(#[from] RtpDecodeError),

    /// AppleMIDI control packet could not be decoded
    #[error("control packet error: {0}")]
    Control(#[from] ControlDecodeError),

    // ===== Session-ending errors =====
    /// Invitation or clock-sync retries were exhausted
    #[error("handshake timeout during {stage} after {attempts} attempts")]
    HandshakeTimeout {
        /// The stage that timed out
        stage: HandshakeStage,
        /// Number of attempts made
        attempts: u32,
    },

    /// The peer rejected our invitation
    #[error("invitation rejected by {peer}")]
    Rejected {
        /// The name or address of the peer
        peer: String,
    },

    // ===== Caller errors =====
    /// Caller misuse, e.g. enqueueing on a closed session
    #[error("invalid argument: {name} - {message}")]
    InvalidArgument {
        /// The name of the argument
        name: String,
        /// Description of the error
        message: String,
    },

    /// Allocation or capacity failure
    #[error("resource exhaustion: {message}")]
    ResourceExhaustion {
        /// Description of the exhausted resource
        message: String,
    },

    // ===== I/O Errors =====
    /// Socket error
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration could not be parsed
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Copyable classification of a [`MidiError`], used as the context's
/// last-error slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`MidiError::ProtocolViolation`]
    ProtocolViolation,
    /// See [`MidiError::HandshakeTimeout`]
    HandshakeTimeout,
    /// Invitation rejected
    Rejected,
    /// See [`MidiError::InvalidArgument`]
    InvalidArgument,
    /// See [`MidiError::ResourceExhaustion`]
    ResourceExhaustion,
    /// Socket or configuration I/O
    Io,
}

impl MidiError {
    /// Shorthand for a protocol violation
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Shorthand for an invalid argument
    pub fn invalid_argument(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolViolation { .. } | Self::Decode(_) | Self::Control(_) => {
                ErrorKind::ProtocolViolation
            }
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Self::Network(_) | Self::Config(_) => ErrorKind::Io,
        }
    }

    /// Check if the session survives this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::Decode(_) | Self::Control(_) | Self::Network(_)
        )
    }

    /// Check if this error terminates the session it occurred in
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::Rejected { .. })
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, MidiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MidiError::HandshakeTimeout {
            stage: HandshakeStage::ClockSync,
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "handshake timeout during clock sync after 4 attempts"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(MidiError::violation("bad").is_recoverable());
        assert!(!MidiError::violation("bad").ends_session());

        let timeout = MidiError::HandshakeTimeout {
            stage: HandshakeStage::ControlInvitation,
            attempts: 12,
        };
        assert!(timeout.ends_session());
        assert!(!timeout.is_recoverable());
        assert_eq!(timeout.kind(), ErrorKind::HandshakeTimeout);

        let misuse = MidiError::invalid_argument("session", "closed");
        assert!(!misuse.is_recoverable());
        assert!(!misuse.ends_session());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: MidiError = io_err.into();

        assert!(matches!(err, MidiError::Network(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_error_from_decode() {
        let err: MidiError = RtpDecodeError::InvalidVersion(1).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MidiError>();
    }
}
