//! # midikit
//!
//! MIDI over IP with the `AppleMIDI` / RTP-MIDI protocol family.
//!
//! ## Features
//!
//! - `AppleMIDI` session handshake (invite, accept, reject, bye)
//! - Clock synchronization with offset and latency estimation
//! - RTP-MIDI encoding with sequence tracking and a minimal journal
//! - Paced outbound message queue
//! - Single-threaded run loop driving sockets and timers
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use midikit::{Context, Driver, DriverConfig, MidiMessage, RunLoop, SessionId, TimedCommand};
//!
//! # fn example() -> Result<(), midikit::MidiError> {
//! let run_loop = RunLoop::new()?;
//! let ctx = Rc::new(Context::new(DriverConfig::default()));
//! let driver = Driver::bind(ctx, &run_loop)?;
//!
//! driver.set_sink(|session: SessionId, _timestamp: u32, commands: &[TimedCommand]| {
//!     for command in commands {
//!         println!("{session}: {:02x?}", command.message.as_bytes());
//!     }
//! });
//!
//! let session = driver.connect("192.168.1.20:5004".parse().unwrap())?;
//! driver.enqueue(session, MidiMessage::note_on(0, 60, 100))?;
//!
//! run_loop.run(Some(Duration::from_secs(10)));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Driver**: [`Driver`] - sockets, session table, queue and sink
//! - **Scheduling**: [`RunLoop`] - readiness and timer dispatch
//! - **Sessions**: [`session::Session`] - sans-IO `AppleMIDI` state machine
//! - **Wire formats**: [`protocol`] - control packets and RTP-MIDI

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
/// Error types
pub mod error;
/// Core types
pub mod types;

/// Testing utilities
pub mod testing;

pub mod clock;
pub mod context;
pub mod driver;
pub mod midi;
pub mod protocol;
pub mod queue;
pub mod runloop;
pub mod session;

// Re-exports
pub use clock::{Clock, ClockEstimate, SyncStatus};
pub use context::{Context, LogChannels};
pub use driver::{Driver, DriverEvent, MidiSink};
pub use error::{ErrorKind, MidiError, Result};
pub use midi::{MessageFormat, MidiMessage, StandardFormat};
pub use protocol::rtp::TimedCommand;
pub use runloop::{LoopHandle, RunLoop, RunOutcome};
pub use session::{CloseReason, SessionState};
pub use types::{DriverConfig, SessionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
///
/// Convenient re-exports
pub mod prelude {
    pub use crate::{
        Context, Driver, DriverConfig, DriverEvent, MidiError, MidiMessage, MidiSink, RunLoop,
        SessionId, SessionState, TimedCommand,
    };
}
