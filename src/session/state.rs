use std::fmt;

use crate::error::{HandshakeStage, MidiError};

/// Which side opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the invitation
    Initiator,
    /// We accepted an invitation
    Responder,
}

/// AppleMIDI session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no invitation sent yet
    Idle,
    /// Invitation sent on the control port
    Inviting,
    /// Control invitation accepted, inviting the data port
    Invited,
    /// Waiting for a responder to receive an invitation
    Listening,
    /// Control invitation accepted, waiting for the data invitation
    AcceptingInvite,
    /// Both ports open, clock handshake in progress
    SyncPending,
    /// Steady state: MIDI flows in both directions
    Established,
    /// Bye sent, waiting for the grace period
    Ending,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Check if transition to new state is valid
    #[must_use]
    pub fn can_transition_to(&self, new_state: SessionState) -> bool {
        use SessionState::{
            AcceptingInvite, Closed, Ending, Established, Idle, Invited, Inviting, Listening,
            SyncPending,
        };

        match (self, new_state) {
            (Idle, Inviting)
            | (Inviting, Invited)
            | (Invited | AcceptingInvite, SyncPending)
            | (Listening, AcceptingInvite)
            | (SyncPending, Established)
            | (Inviting | Invited | AcceptingInvite | SyncPending | Established, Ending)
            | (
                Idle | Inviting | Invited | Listening | AcceptingInvite | SyncPending
                | Established | Ending,
                Closed,
            ) => true,

            _ => false,
        }
    }

    /// Is the handshake still running?
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SessionState::Inviting
                | SessionState::Invited
                | SessionState::AcceptingInvite
                | SessionState::SyncPending
        )
    }

    /// Is the session still valid (not closed)?
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a session reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local `end()` completed
    Ended,
    /// The peer sent bye
    PeerBye,
    /// The peer rejected our invitation
    Rejected,
    /// Invitation or initial clock sync retries ran out
    HandshakeTimeout {
        /// Stage that timed out
        stage: HandshakeStage,
        /// Attempts made
        attempts: u32,
    },
}

impl CloseReason {
    /// Error to surface for abnormal closes
    #[must_use]
    pub fn to_error(&self, peer: &str) -> Option<MidiError> {
        match self {
            Self::Ended | Self::PeerBye => None,
            Self::Rejected => Some(MidiError::Rejected {
                peer: peer.to_string(),
            }),
            Self::HandshakeTimeout { stage, attempts } => Some(MidiError::HandshakeTimeout {
                stage: *stage,
                attempts: *attempts,
            }),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ended => f.write_str("ended"),
            Self::PeerBye => f.write_str("peer sent bye"),
            Self::Rejected => f.write_str("rejected"),
            Self::HandshakeTimeout { stage, attempts } => {
                write!(f, "{stage} timed out after {attempts} attempts")
            }
        }
    }
}
