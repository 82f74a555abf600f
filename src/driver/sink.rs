use crate::protocol::rtp::TimedCommand;
use crate::types::SessionId;

/// Receiver of inbound MIDI.
///
/// Called on the run loop thread once per received packet, with the packet's
/// RTP timestamp and its commands in order. Implemented for closures.
pub trait MidiSink {
    /// Handle the commands of one packet
    fn receive(&mut self, session: SessionId, timestamp: u32, commands: &[TimedCommand]);
}

impl<F> MidiSink for F
where
    F: FnMut(SessionId, u32, &[TimedCommand]),
{
    fn receive(&mut self, session: SessionId, timestamp: u32, commands: &[TimedCommand]) {
        self(session, timestamp, commands);
    }
}
