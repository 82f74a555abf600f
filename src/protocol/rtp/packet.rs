use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::payload::{self, JournalHeader, PayloadError, TimedCommand};
use crate::midi::MessageFormat;

/// RTP payload types used by RTP-MIDI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// MIDI command payload (dynamic payload type 97)
    Midi = 0x61,
}

impl PayloadType {
    /// Parse from byte value
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x7F {
            0x61 => Some(Self::Midi),
            _ => None,
        }
    }
}

/// RTP header (12 bytes standard)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Version (2 bits, always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count (4 bits)
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: PayloadType,
    /// Sequence number (16 bits)
    pub sequence: u16,
    /// Timestamp (32 bits)
    pub timestamp: u32,
    /// Synchronization source ID (32 bits)
    pub ssrc: u32,
}

impl RtpHeader {
    /// Standard RTP header size
    pub const SIZE: usize = 12;

    /// Create a new MIDI packet header
    #[must_use]
    pub fn new_midi(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: true,
            payload_type: PayloadType::Midi,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Encode header to bytes
    #[must_use]
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];

        // Byte 0: V(2) | P(1) | X(1) | CC(4)
        buf[0] = (self.version << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.extension) << 4)
            | (self.csrc_count & 0x0F);

        // Byte 1: M(1) | PT(7)
        buf[1] = (u8::from(self.marker) << 7) | (self.payload_type as u8 & 0x7F);

        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Decode header from bytes
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if buffer is too small, the version is not 2
    /// or the payload type is not MIDI.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }

        let version = (buf[0] >> 6) & 0x03;
        if version != 2 {
            return Err(RtpDecodeError::InvalidVersion(version));
        }

        let payload_type_byte = buf[1] & 0x7F;
        let payload_type = PayloadType::from_byte(payload_type_byte)
            .ok_or(RtpDecodeError::UnknownPayloadType(payload_type_byte))?;

        Ok(Self {
            version,
            padding: (buf[0] >> 5) & 0x01 != 0,
            extension: (buf[0] >> 4) & 0x01 != 0,
            csrc_count: buf[0] & 0x0F,
            marker: (buf[1] >> 7) & 0x01 != 0,
            payload_type,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Offset of the payload, accounting for CSRC entries and a header
    /// extension
    fn payload_offset(&self, buf: &[u8]) -> Result<usize, RtpDecodeError> {
        let mut offset = Self::SIZE + 4 * usize::from(self.csrc_count);
        if self.extension {
            if buf.len() < offset + 4 {
                return Err(RtpDecodeError::BufferTooSmall {
                    needed: offset + 4,
                    have: buf.len(),
                });
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            offset += 4 + 4 * usize::from(words);
        }
        if buf.len() < offset {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: offset,
                have: buf.len(),
            });
        }
        Ok(offset)
    }
}

/// RTP decode errors. The packet is dropped; the session is unaffected.
#[derive(Debug, Error)]
pub enum RtpDecodeError {
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    #[error("unknown payload type: 0x{0:02x}")]
    UnknownPayloadType(u8),

    #[error("invalid padding length: {0}")]
    InvalidPadding(u8),
}

/// RTP-MIDI packet: header, MIDI command list and optional journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMidiPacket {
    /// Packet header
    pub header: RtpHeader,
    /// Commands in order, each with its delta time
    pub commands: Vec<TimedCommand>,
    /// Recovery journal header, if present
    pub journal: Option<JournalHeader>,
}

/// Result of decoding an RTP-MIDI packet.
///
/// A malformed command list does not fail the decode: `commands` holds what
/// was parsed before the fault and `fault` describes it.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    /// The decoded packet
    pub packet: RtpMidiPacket,
    /// Recoverable payload error that truncated parsing
    pub fault: Option<PayloadError>,
}

impl RtpMidiPacket {
    /// Create a new packet
    #[must_use]
    pub fn new(header: RtpHeader, commands: Vec<TimedCommand>) -> Self {
        Self {
            header,
            commands,
            journal: None,
        }
    }

    /// Attach a journal header
    #[must_use]
    pub fn with_journal(mut self, journal: Option<JournalHeader>) -> Self {
        self.journal = journal;
        self
    }

    /// Encode packet to bytes
    ///
    /// # Errors
    ///
    /// Returns `PayloadError` if the command section exceeds its length
    /// field or a delta time is out of range.
    pub fn encode(&self, format: &dyn MessageFormat) -> Result<Bytes, PayloadError> {
        let mut buf = BytesMut::with_capacity(RtpHeader::SIZE + 64);
        buf.put_slice(&self.header.encode());
        payload::encode_command_section(&self.commands, self.journal.is_some(), format, &mut buf)?;
        if let Some(journal) = &self.journal {
            journal.encode(&mut buf);
        }
        Ok(buf.freeze())
    }

    /// Decode packet from bytes
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the header is invalid. Payload problems are
    /// reported through [`DecodedPacket::fault`].
    pub fn decode(buf: &[u8], format: &dyn MessageFormat) -> Result<DecodedPacket, RtpDecodeError> {
        let header = RtpHeader::decode(buf)?;
        let offset = header.payload_offset(buf)?;

        let mut end = buf.len();
        if header.padding {
            let pad = buf[end - 1];
            if pad == 0 || usize::from(pad) > end - offset {
                return Err(RtpDecodeError::InvalidPadding(pad));
            }
            end -= usize::from(pad);
        }

        let decoded = payload::decode_payload(&buf[offset..end], format);
        Ok(DecodedPacket {
            packet: Self {
                header,
                commands: decoded.commands,
                journal: decoded.journal,
            },
            fault: decoded.fault,
        })
    }
}
