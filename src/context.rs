//! Driver context: configuration, log channels and the last-error slot
//!
//! Configured once at startup and shared by every component of a driver.

use std::cell::Cell;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, MidiError};
use crate::types::DriverConfig;

/// Set of enabled log channels
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogChannels(u8);

impl LogChannels {
    /// Per-packet protocol traces
    pub const DEVELOP: Self = Self(0x01);
    /// Debug messages
    pub const DEBUG: Self = Self(0x02);
    /// Informational messages and warnings
    pub const INFO: Self = Self(0x04);
    /// Errors
    pub const ERROR: Self = Self(0x08);
    /// Nothing
    pub const NONE: Self = Self(0x00);
    /// Everything
    pub const ALL: Self = Self(0x0f);

    /// Check whether every channel in `other` is enabled
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit mask
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for LogChannels {
    fn default() -> Self {
        Self::DEBUG | Self::INFO | Self::ERROR
    }
}

impl BitOr for LogChannels {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LogChannels {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for LogChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::DEVELOP, "DEVELOP"),
            (Self::DEBUG, "DEBUG"),
            (Self::INFO, "INFO"),
            (Self::ERROR, "ERROR"),
        ];
        let enabled: Vec<&str> = names
            .iter()
            .filter(|(channel, _)| self.contains(*channel))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "LogChannels({})", enabled.join(" | "))
    }
}

/// Shared driver context
#[derive(Debug)]
pub struct Context {
    config: DriverConfig,
    channels: LogChannels,
    last_error: Cell<Option<ErrorKind>>,
}

impl Context {
    /// Create a context with the default log channels
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            channels: LogChannels::default(),
            last_error: Cell::new(None),
        }
    }

    /// Replace the enabled log channels
    #[must_use]
    pub fn with_channels(mut self, channels: LogChannels) -> Self {
        self.channels = channels;
        self
    }

    /// Driver configuration
    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Enabled log channels
    #[must_use]
    pub fn channels(&self) -> LogChannels {
        self.channels
    }

    /// Check whether per-packet traces are wanted
    #[must_use]
    pub fn develop(&self) -> bool {
        self.channels.contains(LogChannels::DEVELOP)
    }

    /// Record `err` as the last error and log it on its channel
    pub fn report(&self, err: &MidiError) {
        let kind = err.kind();
        self.last_error.set(Some(kind));

        match kind {
            ErrorKind::ProtocolViolation | ErrorKind::InvalidArgument => {
                if self.channels.contains(LogChannels::DEBUG) {
                    debug!(error = %err, "dropped");
                }
            }
            ErrorKind::HandshakeTimeout | ErrorKind::Rejected => {
                if self.channels.contains(LogChannels::INFO) {
                    warn!(error = %err, "session failed");
                }
            }
            ErrorKind::ResourceExhaustion | ErrorKind::Io => {
                if self.channels.contains(LogChannels::ERROR) {
                    error!(error = %err, "driver error");
                }
            }
        }
    }

    /// Log an informational message on the INFO channel
    pub fn info(&self, message: &str) {
        if self.channels.contains(LogChannels::INFO) {
            info!("{message}");
        }
    }

    /// Kind of the most recently reported error
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.get()
    }

    /// Clear the last-error slot
    pub fn clear_error(&self) {
        self.last_error.set(None);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(DriverConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mask() {
        let channels = LogChannels::DEBUG | LogChannels::ERROR;
        assert!(channels.contains(LogChannels::DEBUG));
        assert!(!channels.contains(LogChannels::INFO));
        assert!(LogChannels::ALL.contains(channels));
        assert_eq!(format!("{channels:?}"), "LogChannels(DEBUG | ERROR)");
    }

    #[test]
    fn test_report_records_last_error() {
        let ctx = Context::default().with_channels(LogChannels::NONE);
        assert_eq!(ctx.last_error(), None);

        ctx.report(&MidiError::violation("bad signature"));
        assert_eq!(ctx.last_error(), Some(ErrorKind::ProtocolViolation));

        ctx.report(&MidiError::invalid_argument("session", "closed"));
        assert_eq!(ctx.last_error(), Some(ErrorKind::InvalidArgument));

        ctx.clear_error();
        assert_eq!(ctx.last_error(), None);
    }

    #[test]
    fn test_develop_channel() {
        assert!(!Context::default().develop());
        let ctx = Context::default().with_channels(LogChannels::ALL);
        assert!(ctx.develop());
    }
}
