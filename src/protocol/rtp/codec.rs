//! RTP-MIDI encoder/decoder for one session

use std::rc::Rc;

use bytes::Bytes;

use super::packet::{DecodedPacket, RtpDecodeError, RtpHeader, RtpMidiPacket};
use super::payload::{JournalHeader, PayloadError, TimedCommand};
use crate::midi::{MessageFormat, StandardFormat};

/// RTP-MIDI codec: owns the outbound sequence counter and SSRC of a session
pub struct RtpMidiCodec {
    /// Local synchronization source
    ssrc: u32,
    /// Sequence number of the next packet to send
    sequence: u16,
    /// Packets encoded so far
    packets_encoded: u64,
    /// Message formatter
    format: Rc<dyn MessageFormat>,
}

impl std::fmt::Debug for RtpMidiCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpMidiCodec")
            .field("ssrc", &self.ssrc)
            .field("sequence", &self.sequence)
            .field("packets_encoded", &self.packets_encoded)
            .finish_non_exhaustive()
    }
}

impl RtpMidiCodec {
    /// Create a codec with the standard MIDI formatter
    #[must_use]
    pub fn new(ssrc: u32, initial_sequence: u16) -> Self {
        Self::with_format(ssrc, initial_sequence, Rc::new(StandardFormat))
    }

    /// Create a codec with a custom formatter
    #[must_use]
    pub fn with_format(ssrc: u32, initial_sequence: u16, format: Rc<dyn MessageFormat>) -> Self {
        Self {
            ssrc,
            sequence: initial_sequence,
            packets_encoded: 0,
            format,
        }
    }

    /// Encode one packet using the current sequence number, then advance it.
    ///
    /// The sequence number only advances when encoding succeeds.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError` if the command list does not fit one packet.
    pub fn encode(
        &mut self,
        commands: &[TimedCommand],
        timestamp: u32,
        journal: Option<JournalHeader>,
    ) -> Result<Bytes, PayloadError> {
        let header = RtpHeader::new_midi(self.sequence, timestamp, self.ssrc);
        let packet = RtpMidiPacket::new(header, commands.to_vec()).with_journal(journal);
        let encoded = packet.encode(self.format.as_ref())?;

        self.sequence = self.sequence.wrapping_add(1);
        self.packets_encoded += 1;
        Ok(encoded)
    }

    /// Decode an inbound packet
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the RTP header is invalid.
    pub fn decode(&self, buf: &[u8]) -> Result<DecodedPacket, RtpDecodeError> {
        RtpMidiPacket::decode(buf, self.format.as_ref())
    }

    /// Sequence number the next packet will carry
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Sequence number of the last packet sent
    #[must_use]
    pub fn last_sent(&self) -> Option<u16> {
        (self.packets_encoded > 0).then(|| self.sequence.wrapping_sub(1))
    }

    /// Local SSRC
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Number of packets encoded
    #[must_use]
    pub fn packets_encoded(&self) -> u64 {
        self.packets_encoded
    }

    /// Message formatter
    #[must_use]
    pub fn format(&self) -> &dyn MessageFormat {
        self.format.as_ref()
    }
}
