//! Driver events for application integration

use std::net::SocketAddr;

use crate::clock::ClockEstimate;
use crate::protocol::rtp::GapInfo;
use crate::session::{CloseReason, Role, SessionState};
use crate::types::SessionId;

/// Events emitted by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A session was created
    SessionStarted {
        /// Session ID
        session: SessionId,
        /// Peer control address
        peer: SocketAddr,
        /// Whether we invited or were invited
        role: Role,
    },

    /// Session state changed
    StateChanged {
        /// Session ID
        session: SessionId,
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },

    /// Handshake and first clock sync completed
    Established {
        /// Session ID
        session: SessionId,
        /// Announced peer name, or its address
        peer: String,
    },

    /// Session closed and removed from the driver
    SessionClosed {
        /// Session ID
        session: SessionId,
        /// Why it closed
        reason: CloseReason,
    },

    /// Inbound packets were lost
    SequenceGap {
        /// Session ID
        session: SessionId,
        /// The missing range
        gap: GapInfo,
    },

    /// A clock handshake completed
    ClockSynchronized {
        /// Session ID
        session: SessionId,
        /// New estimate
        estimate: ClockEstimate,
    },

    /// Resynchronization failed; peer timestamps are approximate
    ClockDegraded {
        /// Session ID
        session: SessionId,
    },
}

impl DriverEvent {
    /// Session the event is about
    #[must_use]
    pub fn session(&self) -> SessionId {
        match self {
            Self::SessionStarted { session, .. }
            | Self::StateChanged { session, .. }
            | Self::Established { session, .. }
            | Self::SessionClosed { session, .. }
            | Self::SequenceGap { session, .. }
            | Self::ClockSynchronized { session, .. }
            | Self::ClockDegraded { session } => *session,
        }
    }
}
