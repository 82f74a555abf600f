use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{PROTOCOL_VERSION, SIGNATURE};

/// Two-letter control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `IN`: invitation
    Invitation,
    /// `OK`: invitation accepted
    Accepted,
    /// `NO`: invitation rejected
    Rejected,
    /// `BY`: end of session
    Bye,
    /// `CK`: clock synchronization
    ClockSync,
    /// `RS`: receiver feedback
    ReceiverFeedback,
}

impl Command {
    /// Wire code
    #[must_use]
    pub fn code(self) -> [u8; 2] {
        match self {
            Self::Invitation => *b"IN",
            Self::Accepted => *b"OK",
            Self::Rejected => *b"NO",
            Self::Bye => *b"BY",
            Self::ClockSync => *b"CK",
            Self::ReceiverFeedback => *b"RS",
        }
    }

    /// Parse a wire code. `AC` is accepted as an alias for `OK`.
    #[must_use]
    pub fn from_code(code: [u8; 2]) -> Option<Self> {
        match &code {
            b"IN" => Some(Self::Invitation),
            b"OK" | b"AC" => Some(Self::Accepted),
            b"NO" => Some(Self::Rejected),
            b"BY" => Some(Self::Bye),
            b"CK" => Some(Self::ClockSync),
            b"RS" => Some(Self::ReceiverFeedback),
            _ => None,
        }
    }
}

/// Body of `IN`, `OK`, `NO` and `BY` packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Protocol version (2)
    pub version: u32,
    /// Initiator token correlating an invitation with its answer
    pub token: u32,
    /// Sender SSRC
    pub ssrc: u32,
    /// Session name (invitation and acceptance only)
    pub name: Option<String>,
}

impl Exchange {
    /// Minimum encoded size after signature and command
    pub const SIZE: usize = 12;

    /// Exchange body with the current protocol version
    #[must_use]
    pub fn new(token: u32, ssrc: u32, name: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            ssrc,
            name,
        }
    }
}

/// Body of `CK` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncPacket {
    /// Sender SSRC
    pub ssrc: u32,
    /// Step of the exchange (0, 1 or 2)
    pub count: u8,
    /// Timestamp slots, in 100 microsecond ticks
    pub timestamps: [u64; 3],
}

impl ClockSyncPacket {
    /// Encoded size after signature and command
    pub const SIZE: usize = 32;
}

/// Body of `RS` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverFeedback {
    /// Sender SSRC
    pub ssrc: u32,
    /// Highest contiguous RTP sequence number received
    pub sequence: u16,
}

impl ReceiverFeedback {
    /// Encoded size after signature and command
    pub const SIZE: usize = 8;
}

/// Control packet decode errors
#[derive(Debug, Error)]
pub enum ControlDecodeError {
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("bad signature: 0x{0:04x}")]
    BadSignature(u16),

    #[error("unknown command: {0:02x?}")]
    UnknownCommand([u8; 2]),

    #[error("session name is not valid UTF-8")]
    InvalidName,
}

/// AppleMIDI control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// `IN`
    Invitation(Exchange),
    /// `OK`
    Accepted(Exchange),
    /// `NO`
    Rejected(Exchange),
    /// `BY`
    Bye(Exchange),
    /// `CK`
    ClockSync(ClockSyncPacket),
    /// `RS`
    ReceiverFeedback(ReceiverFeedback),
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ControlDecodeError> {
    if buf.len() < needed {
        return Err(ControlDecodeError::BufferTooSmall {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

impl ControlPacket {
    /// Command of this packet
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Self::Invitation(_) => Command::Invitation,
            Self::Accepted(_) => Command::Accepted,
            Self::Rejected(_) => Command::Rejected,
            Self::Bye(_) => Command::Bye,
            Self::ClockSync(_) => Command::ClockSync,
            Self::ReceiverFeedback(_) => Command::ReceiverFeedback,
        }
    }

    /// SSRC of the sender
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        match self {
            Self::Invitation(e) | Self::Accepted(e) | Self::Rejected(e) | Self::Bye(e) => e.ssrc,
            Self::ClockSync(ck) => ck.ssrc,
            Self::ReceiverFeedback(rs) => rs.ssrc,
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + ClockSyncPacket::SIZE);
        buf.put_u16(SIGNATURE);
        buf.put_slice(&self.command().code());

        match self {
            Self::Invitation(e) | Self::Accepted(e) | Self::Rejected(e) | Self::Bye(e) => {
                buf.put_u32(e.version);
                buf.put_u32(e.token);
                buf.put_u32(e.ssrc);
                if let Some(name) = &e.name {
                    buf.put_slice(name.as_bytes());
                    buf.put_u8(0);
                }
            }
            Self::ClockSync(ck) => {
                buf.put_u32(ck.ssrc);
                buf.put_u8(ck.count);
                buf.put_bytes(0, 3);
                for ts in ck.timestamps {
                    buf.put_u64(ts);
                }
            }
            Self::ReceiverFeedback(rs) => {
                buf.put_u32(rs.ssrc);
                buf.put_u16(rs.sequence);
                buf.put_u16(0);
            }
        }

        buf.freeze()
    }

    /// Decode from bytes
    ///
    /// # Errors
    ///
    /// Returns `ControlDecodeError` for short buffers, a wrong signature or
    /// an unknown command.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ControlDecodeError> {
        ensure(buf, 4)?;
        let signature = buf.get_u16();
        if signature != SIGNATURE {
            return Err(ControlDecodeError::BadSignature(signature));
        }
        let code = [buf.get_u8(), buf.get_u8()];
        let command = Command::from_code(code).ok_or(ControlDecodeError::UnknownCommand(code))?;

        match command {
            Command::ClockSync => {
                ensure(buf, ClockSyncPacket::SIZE)?;
                let ssrc = buf.get_u32();
                let count = buf.get_u8();
                buf.advance(3);
                let timestamps = [buf.get_u64(), buf.get_u64(), buf.get_u64()];
                Ok(Self::ClockSync(ClockSyncPacket {
                    ssrc,
                    count,
                    timestamps,
                }))
            }
            Command::ReceiverFeedback => {
                // Some peers omit the trailing padding
                ensure(buf, 6)?;
                let ssrc = buf.get_u32();
                let sequence = buf.get_u16();
                Ok(Self::ReceiverFeedback(ReceiverFeedback { ssrc, sequence }))
            }
            Command::Invitation | Command::Accepted | Command::Rejected | Command::Bye => {
                ensure(buf, Exchange::SIZE)?;
                let version = buf.get_u32();
                let token = buf.get_u32();
                let ssrc = buf.get_u32();
                let name = Self::decode_name(buf)?;
                let exchange = Exchange {
                    version,
                    token,
                    ssrc,
                    name,
                };
                Ok(match command {
                    Command::Invitation => Self::Invitation(exchange),
                    Command::Accepted => Self::Accepted(exchange),
                    Command::Rejected => Self::Rejected(exchange),
                    _ => Self::Bye(exchange),
                })
            }
        }
    }

    fn decode_name(buf: &[u8]) -> Result<Option<String>, ControlDecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = std::str::from_utf8(&buf[..end]).map_err(|_| ControlDecodeError::InvalidName)?;
        Ok(Some(name.to_string()))
    }
}
