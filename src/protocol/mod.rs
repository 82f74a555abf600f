//! Wire protocols: AppleMIDI session control and RTP-MIDI data

pub mod applemidi;
pub mod rtp;
