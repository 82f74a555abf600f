//! Binary formatting of MIDI messages

use thiserror::Error;

use super::{MidiMessage, high_nibble, status};

/// MIDI formatting errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("empty input")]
    Empty,

    #[error("data byte 0x{0:02x} without a running status")]
    MissingStatus(u8),

    #[error("message with status 0x{status:02x} truncated: need {needed} bytes, have {have}")]
    Truncated { status: u8, needed: usize, have: usize },

    #[error("invalid data byte 0x{byte:02x} for status 0x{status:02x}")]
    InvalidDataByte { status: u8, byte: u8 },

    #[error("system exclusive interrupted by status 0x{0:02x}")]
    UnterminatedSysEx(u8),

    #[error("end of exclusive without start")]
    UnexpectedEndOfExclusive,

    #[error("status 0x{0:02x} is not a real-time message")]
    NotRealTime(u8),

    #[error("{extra} trailing bytes after message")]
    TrailingBytes { extra: usize },
}

/// Number of data bytes that follow `status`, or `None` for variable
/// length system exclusive.
#[must_use]
pub fn data_length(status_byte: u8) -> Option<usize> {
    match status_byte {
        status::SYSTEM_EXCLUSIVE => None,
        status::TIME_CODE_QUARTER_FRAME | status::SONG_SELECT => Some(1),
        status::SONG_POSITION_POINTER => Some(2),
        0xf4..=0xff => Some(0),
        _ => match high_nibble(status_byte) {
            status::PROGRAM_CHANGE | status::CHANNEL_PRESSURE => Some(1),
            _ => Some(2),
        },
    }
}

/// Running status after a message with `status_byte` has been seen.
///
/// Channel voice messages set it, system common messages cancel it and
/// real-time messages leave it untouched.
#[must_use]
pub fn next_running_status(current: Option<u8>, status_byte: u8) -> Option<u8> {
    match status_byte {
        0x80..=0xef => Some(status_byte),
        0xf0..=0xf7 => None,
        _ => current,
    }
}

/// Encoding and decoding of single MIDI messages.
///
/// The transport splits command sections with this trait, so alternative
/// message models can be plugged into the driver.
pub trait MessageFormat {
    /// Serialize one message
    fn encode(&self, message: &MidiMessage) -> Vec<u8>;

    /// Parse one message from the front of `buf`.
    ///
    /// `running_status` is the status to assume when `buf` starts with a data
    /// byte. Returns the message and the number of bytes consumed from `buf`.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if no complete message could be parsed.
    fn decode(
        &self,
        buf: &[u8],
        running_status: Option<u8>,
    ) -> Result<(MidiMessage, usize), FormatError>;
}

/// MIDI 1.0 byte stream format
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFormat;

impl StandardFormat {
    fn decode_sysex(buf: &[u8]) -> Result<(MidiMessage, usize), FormatError> {
        for (i, &b) in buf.iter().enumerate().skip(1) {
            match b {
                status::END_OF_EXCLUSIVE => {
                    return Ok((MidiMessage::from_raw(buf[..=i].to_vec()), i + 1));
                }
                0x80..=0xff => return Err(FormatError::UnterminatedSysEx(b)),
                _ => {}
            }
        }
        Err(FormatError::Truncated {
            status: status::SYSTEM_EXCLUSIVE,
            needed: buf.len() + 1,
            have: buf.len(),
        })
    }
}

impl MessageFormat for StandardFormat {
    fn encode(&self, message: &MidiMessage) -> Vec<u8> {
        message.as_bytes().to_vec()
    }

    fn decode(
        &self,
        buf: &[u8],
        running_status: Option<u8>,
    ) -> Result<(MidiMessage, usize), FormatError> {
        let first = *buf.first().ok_or(FormatError::Empty)?;

        let (status_byte, data) = if first < 0x80 {
            let status_byte = running_status
                .filter(|s| (0x80..0xf0).contains(s))
                .ok_or(FormatError::MissingStatus(first))?;
            (status_byte, buf)
        } else {
            (first, &buf[1..])
        };
        let implicit = first < 0x80;

        if status_byte == status::END_OF_EXCLUSIVE {
            return Err(FormatError::UnexpectedEndOfExclusive);
        }

        let Some(len) = data_length(status_byte) else {
            return Self::decode_sysex(buf);
        };

        if data.len() < len {
            return Err(FormatError::Truncated {
                status: status_byte,
                needed: len,
                have: data.len(),
            });
        }
        if let Some(&byte) = data[..len].iter().find(|b| **b >= 0x80) {
            return Err(FormatError::InvalidDataByte {
                status: status_byte,
                byte,
            });
        }

        let mut bytes = Vec::with_capacity(1 + len);
        bytes.push(status_byte);
        bytes.extend_from_slice(&data[..len]);
        let consumed = if implicit { len } else { len + 1 };
        Ok((MidiMessage::from_raw(bytes), consumed))
    }
}
