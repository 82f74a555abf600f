//! AppleMIDI session control packets.
//!
//! Every control packet starts with the `0xFFFF` signature followed by a
//! two-letter command. Session exchange commands (`IN`, `OK`, `NO`, `BY`)
//! travel on both the control and the data port; `CK` and `RS` travel on
//! the data port only.
//!
//! ```text
//! exchange:  FFFF | cmd(2) | version(4) | token(4) | ssrc(4) | [name\0]
//! CK:        FFFF | "CK"   | ssrc(4) | count(1) | pad(3) | ts1(8) | ts2(8) | ts3(8)
//! RS:        FFFF | "RS"   | ssrc(4) | seq(2) | pad(2)
//! ```

mod packet;


pub use packet::{
    ClockSyncPacket, Command, ControlDecodeError, ControlPacket, Exchange, ReceiverFeedback,
};

/// Leading signature of every control packet
pub const SIGNATURE: u16 = 0xFFFF;

/// Protocol version carried in exchange packets
pub const PROTOCOL_VERSION: u32 = 2;

/// Check whether a datagram looks like a control packet rather than RTP
#[must_use]
pub fn is_control_packet(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0] == 0xFF && buf[1] == 0xFF
}
