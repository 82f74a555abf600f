//! RTP-MIDI command section and minimal recovery journal
//!
//! ```text
//! command section header:  B | J | Z | P | LEN(4)   [LEN low byte if B]
//! command list:            [delta] cmd  delta cmd  delta cmd ...
//! journal header:          S | Y | A | H | TOTCHAN(4) | checkpoint(16)
//! ```
//!
//! Delta times use a variable-length encoding of up to four bytes with seven
//! value bits each. Only the journal header is produced and parsed; chapter
//! data from peers is skipped.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::midi::{FormatError, MessageFormat, MidiMessage, next_running_status};

const FLAG_B: u8 = 0x80;
const FLAG_J: u8 = 0x40;
const FLAG_Z: u8 = 0x20;

/// Largest delta time expressible in four bytes
pub const MAX_DELTA: u32 = 0x0FFF_FFFF;

/// Largest command section (12-bit length field)
pub const MAX_SECTION_LEN: usize = 0x0FFF;

/// A MIDI command with its delta time relative to the previous command
/// (or to the packet timestamp for the first one)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    /// Delta time in timestamp units
    pub delta: u32,
    /// The command
    pub message: MidiMessage,
}

impl TimedCommand {
    /// Create a new timed command
    #[must_use]
    pub fn new(delta: u32, message: MidiMessage) -> Self {
        Self { delta, message }
    }
}

/// Payload errors. Decoding keeps commands parsed before the fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("command section of {0} bytes exceeds the length field")]
    SectionTooLong(usize),

    #[error("delta time {0} out of range")]
    DeltaTooLarge(u32),

    #[error("payload truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("delta time longer than four bytes")]
    BadDelta,

    #[error("malformed command at offset {offset}: {source}")]
    Command {
        offset: usize,
        #[source]
        source: FormatError,
    },
}

/// Write a delta time in variable-length form
///
/// # Errors
///
/// Returns `PayloadError::DeltaTooLarge` above [`MAX_DELTA`].
pub fn encode_delta(value: u32, out: &mut BytesMut) -> Result<(), PayloadError> {
    if value > MAX_DELTA {
        return Err(PayloadError::DeltaTooLarge(value));
    }
    let mut started = false;
    for shift in [21u32, 14, 7] {
        let group = ((value >> shift) & 0x7F) as u8;
        if started || group != 0 {
            out.put_u8(group | 0x80);
            started = true;
        }
    }
    out.put_u8((value & 0x7F) as u8);
    Ok(())
}

/// Read a delta time. Returns the value and the number of bytes used.
///
/// # Errors
///
/// Returns `PayloadError` when the input ends early or the encoding runs
/// past four bytes.
pub fn decode_delta(buf: &[u8]) -> Result<(u32, usize), PayloadError> {
    let mut value = 0u32;
    for i in 0..4 {
        let b = *buf.get(i).ok_or(PayloadError::Truncated {
            needed: i + 1,
            have: buf.len(),
        })?;
        value = (value << 7) | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(PayloadError::BadDelta)
}

/// Minimal recovery journal header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// The journal only covers the single preceding packet
    pub single_packet_loss: bool,
    /// Sequence number of the last packet the peer acknowledged
    pub checkpoint: u16,
}

impl JournalHeader {
    /// Encoded size
    pub const SIZE: usize = 3;

    /// Write the header. No chapters follow.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(if self.single_packet_loss { 0x80 } else { 0x00 });
        out.put_u16(self.checkpoint);
    }

    /// Parse the header, ignoring any chapters after it
    ///
    /// # Errors
    ///
    /// Returns `PayloadError::Truncated` if fewer than three bytes remain.
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        if buf.len() < Self::SIZE {
            return Err(PayloadError::Truncated {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            single_packet_loss: buf[0] & 0x80 != 0,
            checkpoint: u16::from_be_bytes([buf[1], buf[2]]),
        })
    }
}

/// Encode a command section header and command list into `out`
///
/// # Errors
///
/// Returns `PayloadError` if a delta is out of range or the encoded list is
/// longer than [`MAX_SECTION_LEN`].
pub fn encode_command_section(
    commands: &[TimedCommand],
    journal: bool,
    format: &dyn MessageFormat,
    out: &mut BytesMut,
) -> Result<(), PayloadError> {
    let mut body = BytesMut::new();
    for command in commands {
        encode_delta(command.delta, &mut body)?;
        body.put_slice(&format.encode(&command.message));
    }
    let len = body.len();
    if len > MAX_SECTION_LEN {
        return Err(PayloadError::SectionTooLong(len));
    }

    let mut flags = 0u8;
    if journal {
        flags |= FLAG_J;
    }
    if !commands.is_empty() {
        flags |= FLAG_Z;
    }

    if len > 0x0F {
        out.put_u8(flags | FLAG_B | ((len >> 8) as u8 & 0x0F));
        out.put_u8((len & 0xFF) as u8);
    } else {
        out.put_u8(flags | len as u8);
    }
    out.put_slice(&body);
    Ok(())
}

/// Size of a command list entry on the wire (worst-case delta plus message)
#[must_use]
pub fn encoded_size(message: &MidiMessage) -> usize {
    4 + message.len()
}

/// Decoded RTP-MIDI payload
#[derive(Debug, Clone, Default)]
pub struct DecodedPayload {
    /// Commands parsed before any fault
    pub commands: Vec<TimedCommand>,
    /// Journal header, if present and intact
    pub journal: Option<JournalHeader>,
    /// The fault that stopped parsing
    pub fault: Option<PayloadError>,
}

/// Decode the payload that follows the RTP header
#[must_use]
pub fn decode_payload(buf: &[u8], format: &dyn MessageFormat) -> DecodedPayload {
    let mut decoded = DecodedPayload::default();

    let Some(&flags) = buf.first() else {
        decoded.fault = Some(PayloadError::Truncated { needed: 1, have: 0 });
        return decoded;
    };

    let (len, header_len) = if flags & FLAG_B != 0 {
        let Some(&low) = buf.get(1) else {
            decoded.fault = Some(PayloadError::Truncated { needed: 2, have: 1 });
            return decoded;
        };
        ((usize::from(flags & 0x0F) << 8) | usize::from(low), 2)
    } else {
        (usize::from(flags & 0x0F), 1)
    };

    let section_end = header_len + len;
    let truncated = section_end > buf.len();
    let section = &buf[header_len..section_end.min(buf.len())];

    decoded.fault = decode_commands(section, flags & FLAG_Z != 0, format, &mut decoded.commands);

    if truncated {
        decoded.fault.get_or_insert(PayloadError::Truncated {
            needed: section_end,
            have: buf.len(),
        });
        return decoded;
    }

    if flags & FLAG_J != 0 {
        match JournalHeader::decode(&buf[section_end..]) {
            Ok(journal) => decoded.journal = Some(journal),
            Err(e) => {
                decoded.fault.get_or_insert(e);
            }
        }
    }

    decoded
}

fn decode_commands(
    section: &[u8],
    first_has_delta: bool,
    format: &dyn MessageFormat,
    commands: &mut Vec<TimedCommand>,
) -> Option<PayloadError> {
    let mut pos = 0;
    let mut running = None;
    let mut first = true;

    while pos < section.len() {
        let delta = if first && !first_has_delta {
            0
        } else {
            match decode_delta(&section[pos..]) {
                Ok((delta, used)) => {
                    pos += used;
                    delta
                }
                Err(e) => return Some(e),
            }
        };
        first = false;

        if pos >= section.len() {
            return Some(PayloadError::Truncated {
                needed: pos + 1,
                have: section.len(),
            });
        }

        match format.decode(&section[pos..], running) {
            Ok((message, used)) => {
                running = next_running_status(running, message.status());
                pos += used;
                commands.push(TimedCommand::new(delta, message));
            }
            Err(source) => return Some(PayloadError::Command { offset: pos, source }),
        }
    }

    None
}
