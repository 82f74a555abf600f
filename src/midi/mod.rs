//! MIDI 1.0 message model
//!
//! Raw MIDI messages as they travel inside RTP-MIDI command sections, the
//! status and channel constants of the MIDI 1.0 specification, and the
//! [`MessageFormat`] seam used by the transport to split a byte stream into
//! messages.

mod format;

#[cfg(test)]
mod tests;

pub use format::{FormatError, MessageFormat, StandardFormat, data_length, next_running_status};

/// Channel voice status nibbles (high nibble of the status byte)
pub mod status {
    /// Note Off
    pub const NOTE_OFF: u8 = 0x8;
    /// Note On
    pub const NOTE_ON: u8 = 0x9;
    /// Polyphonic Key Pressure (aftertouch)
    pub const POLYPHONIC_KEY_PRESSURE: u8 = 0xa;
    /// Control Change
    pub const CONTROL_CHANGE: u8 = 0xb;
    /// Program Change
    pub const PROGRAM_CHANGE: u8 = 0xc;
    /// Channel Pressure (aftertouch)
    pub const CHANNEL_PRESSURE: u8 = 0xd;
    /// Pitch Wheel Change
    pub const PITCH_WHEEL_CHANGE: u8 = 0xe;

    /// System Exclusive
    pub const SYSTEM_EXCLUSIVE: u8 = 0xf0;
    /// MIDI Time Code Quarter Frame
    pub const TIME_CODE_QUARTER_FRAME: u8 = 0xf1;
    /// Song Position Pointer
    pub const SONG_POSITION_POINTER: u8 = 0xf2;
    /// Song Select
    pub const SONG_SELECT: u8 = 0xf3;
    /// Undefined (reserved)
    pub const UNDEFINED0: u8 = 0xf4;
    /// Undefined (reserved)
    pub const UNDEFINED1: u8 = 0xf5;
    /// Tune Request
    pub const TUNE_REQUEST: u8 = 0xf6;
    /// End of Exclusive
    pub const END_OF_EXCLUSIVE: u8 = 0xf7;

    /// Timing Clock, sent 24 times per quarter note
    pub const TIMING_CLOCK: u8 = 0xf8;
    /// Undefined (reserved)
    pub const UNDEFINED2: u8 = 0xf9;
    /// Start
    pub const START: u8 = 0xfa;
    /// Continue
    pub const CONTINUE: u8 = 0xfb;
    /// Stop
    pub const STOP: u8 = 0xfc;
    /// Undefined (reserved)
    pub const UNDEFINED3: u8 = 0xfd;
    /// Active Sensing
    pub const ACTIVE_SENSING: u8 = 0xfe;
    /// Reset
    pub const RESET: u8 = 0xff;
}

/// MIDI channel values. Channels 1-16 map to 0x0-0xf.
pub mod channel {
    #![allow(missing_docs)]

    pub const CHANNEL_1: u8 = 0x0;
    pub const CHANNEL_2: u8 = 0x1;
    pub const CHANNEL_3: u8 = 0x2;
    pub const CHANNEL_4: u8 = 0x3;
    pub const CHANNEL_5: u8 = 0x4;
    pub const CHANNEL_6: u8 = 0x5;
    pub const CHANNEL_7: u8 = 0x6;
    pub const CHANNEL_8: u8 = 0x7;
    pub const CHANNEL_9: u8 = 0x8;
    pub const CHANNEL_10: u8 = 0x9;
    pub const CHANNEL_11: u8 = 0xa;
    pub const CHANNEL_12: u8 = 0xb;
    pub const CHANNEL_13: u8 = 0xc;
    pub const CHANNEL_14: u8 = 0xd;
    pub const CHANNEL_15: u8 = 0xe;
    pub const CHANNEL_16: u8 = 0xf;
    /// The device's base channel
    pub const CHANNEL_BASE: u8 = 0x10;
    /// All channels
    pub const CHANNEL_ALL: u8 = 0x1f;
}

/// Boolean "on" as a MIDI value
pub const MIDI_ON: u8 = 0x7f;
/// Boolean "off" as a MIDI value
pub const MIDI_OFF: u8 = 0x00;

/// Compose a byte from a high and a low nibble
#[must_use]
pub const fn nibble_value(high: u8, low: u8) -> u8 {
    (high << 4) | (low & 0x0f)
}

/// High nibble of a byte
#[must_use]
pub const fn high_nibble(b: u8) -> u8 {
    (b >> 4) & 0x0f
}

/// Low nibble of a byte
#[must_use]
pub const fn low_nibble(b: u8) -> u8 {
    b & 0x0f
}

/// Compose a 14-bit value from two 7-bit values
#[must_use]
pub const fn long_value(msb: u8, lsb: u8) -> u16 {
    (((msb & 0x7f) as u16) << 7) | (lsb & 0x7f) as u16
}

/// Lowest 7 bits of a 14-bit value
#[must_use]
pub const fn lsb(value: u16) -> u8 {
    (value & 0x7f) as u8
}

/// Upper 7 bits of a 14-bit value
#[must_use]
pub const fn msb(value: u16) -> u8 {
    ((value >> 7) & 0x7f) as u8
}

/// Interpret a MIDI value as a boolean (switch controllers)
#[must_use]
pub const fn as_bool(value: u8) -> u8 {
    if value >= 64 { MIDI_ON } else { MIDI_OFF }
}

/// A single MIDI message in wire form (status byte followed by data bytes).
///
/// System exclusive messages include both the leading `0xF0` and the
/// trailing `0xF7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiMessage {
    bytes: Vec<u8>,
}

impl MidiMessage {
    /// Build a message from raw bytes, validating them with the standard
    /// MIDI 1.0 length rules.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the bytes are not exactly one message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let (message, consumed) = StandardFormat.decode(bytes, None)?;
        if consumed != bytes.len() {
            return Err(FormatError::TrailingBytes {
                extra: bytes.len() - consumed,
            });
        }
        Ok(message)
    }

    /// Build a message from bytes already known to be well formed
    pub(crate) fn from_raw(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Note On
    #[must_use]
    pub fn note_on(channel: u8, key: u8, velocity: u8) -> Self {
        Self::channel_message(status::NOTE_ON, channel, &[key, velocity])
    }

    /// Note Off
    #[must_use]
    pub fn note_off(channel: u8, key: u8, velocity: u8) -> Self {
        Self::channel_message(status::NOTE_OFF, channel, &[key, velocity])
    }

    /// Polyphonic key pressure
    #[must_use]
    pub fn key_pressure(channel: u8, key: u8, pressure: u8) -> Self {
        Self::channel_message(status::POLYPHONIC_KEY_PRESSURE, channel, &[key, pressure])
    }

    /// Control Change
    #[must_use]
    pub fn control_change(channel: u8, control: u8, value: u8) -> Self {
        Self::channel_message(status::CONTROL_CHANGE, channel, &[control, value])
    }

    /// Program Change
    #[must_use]
    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::channel_message(status::PROGRAM_CHANGE, channel, &[program])
    }

    /// Channel pressure
    #[must_use]
    pub fn channel_pressure(channel: u8, pressure: u8) -> Self {
        Self::channel_message(status::CHANNEL_PRESSURE, channel, &[pressure])
    }

    /// Pitch wheel change with a 14-bit value (0x2000 is centered)
    #[must_use]
    pub fn pitch_wheel(channel: u8, value: u16) -> Self {
        Self::channel_message(status::PITCH_WHEEL_CHANGE, channel, &[lsb(value), msb(value)])
    }

    /// System exclusive message wrapping `payload` in `0xF0 .. 0xF7`.
    /// Payload bytes are masked to 7 bits.
    #[must_use]
    pub fn system_exclusive(payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(payload.len() + 2);
        bytes.push(status::SYSTEM_EXCLUSIVE);
        bytes.extend(payload.iter().map(|b| b & 0x7f));
        bytes.push(status::END_OF_EXCLUSIVE);
        Self { bytes }
    }

    /// Single-byte system real-time message (`0xF8..=0xFF`)
    ///
    /// # Errors
    ///
    /// Returns `FormatError::NotRealTime` for any other status.
    pub fn real_time(byte: u8) -> Result<Self, FormatError> {
        if byte < status::TIMING_CLOCK {
            return Err(FormatError::NotRealTime(byte));
        }
        Ok(Self { bytes: vec![byte] })
    }

    fn channel_message(kind: u8, channel: u8, data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(1 + data.len());
        bytes.push(nibble_value(kind, channel));
        bytes.extend(data.iter().map(|b| b & 0x7f));
        Self { bytes }
    }

    /// Status byte
    #[must_use]
    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    /// Channel (0-15) for channel voice messages
    #[must_use]
    pub fn channel(&self) -> Option<u8> {
        let byte = self.status();
        (byte < status::SYSTEM_EXCLUSIVE).then(|| low_nibble(byte))
    }

    /// Data bytes following the status byte
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes[1..]
    }

    /// Full wire representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// A message always carries at least its status byte
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check for a system exclusive message
    #[must_use]
    pub fn is_system_exclusive(&self) -> bool {
        self.status() == status::SYSTEM_EXCLUSIVE
    }

    /// Check for a system real-time message
    #[must_use]
    pub fn is_real_time(&self) -> bool {
        self.status() >= status::TIMING_CLOCK
    }
}

impl AsRef<[u8]> for MidiMessage {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
