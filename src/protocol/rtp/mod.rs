//! RTP-MIDI data packets (RFC 6295 subset)
//!
//! Carries MIDI command lists on the session's data port. Each packet holds
//! a command section with delta-timed commands and, optionally, a minimal
//! recovery journal header. The sequence number is per session and wraps at
//! 16 bits.

#![allow(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(missing_docs)]

mod codec;
mod packet;
pub mod payload;
mod sequence;


pub use codec::RtpMidiCodec;
pub use packet::{DecodedPacket, PayloadType, RtpDecodeError, RtpHeader, RtpMidiPacket};
pub use payload::{JournalHeader, PayloadError, TimedCommand};
pub use sequence::{GapInfo, SequenceCheck, SequenceTracker};

/// Default AppleMIDI control port. The data port is always control + 1.
pub const DEFAULT_CONTROL_PORT: u16 = 5004;

/// Default AppleMIDI data port
pub const DEFAULT_DATA_PORT: u16 = DEFAULT_CONTROL_PORT + 1;
