use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MidiError, Result};
use crate::protocol::rtp::DEFAULT_CONTROL_PORT;
use crate::protocol::rtp::payload::MAX_SECTION_LEN;

/// Session name used when the host name is unavailable
const FALLBACK_NAME: &str = "midikit";

/// Configuration for the network driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name announced to peers (default: host name)
    pub session_name: String,

    /// Local address to bind (default: all interfaces)
    pub bind_address: IpAddr,

    /// Control port; the data port is this plus one (default: 5004).
    /// Zero picks a free pair.
    pub control_port: u16,

    /// Local SSRC (None = random)
    pub ssrc: Option<u32>,

    /// Accept unsolicited invitations (default: true)
    pub accept_invitations: bool,

    /// First invitation retry delay, doubled per attempt (default: 1 second)
    pub invitation_retry_delay: Duration,

    /// Upper bound for the invitation retry delay (default: 8 seconds)
    pub max_invitation_delay: Duration,

    /// Invitations sent before giving up (default: 12)
    pub max_invitation_retries: u32,

    /// How long a responder waits for the initiator to finish the
    /// handshake (default: 15 seconds)
    pub handshake_timeout: Duration,

    /// Interval between clock re-synchronizations (default: 30 seconds)
    pub sync_interval: Duration,

    /// Time to wait for a clock sync answer (default: 1 second)
    pub sync_timeout: Duration,

    /// Unanswered clock syncs tolerated before giving up (default: 3)
    pub max_sync_retries: u32,

    /// Interval between receiver feedback packets (default: 1 second)
    pub feedback_interval: Duration,

    /// Grace period after sending bye (default: 500ms)
    pub end_grace_period: Duration,

    /// Maximum MIDI command list size per packet in bytes (default: 1024)
    pub max_payload_size: usize,

    /// Maximum commands coalesced into one packet (default: 64)
    pub max_commands_per_tick: usize,

    /// Delay between queue flushes while a backlog remains (default: 1ms)
    pub flush_interval: Duration,

    /// Target time from enqueue to send (default: 5ms)
    pub latency_budget: Duration,
}

fn default_session_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            ssrc: None,
            accept_invitations: true,
            invitation_retry_delay: Duration::from_secs(1),
            max_invitation_delay: Duration::from_secs(8),
            max_invitation_retries: 12,
            handshake_timeout: Duration::from_secs(15),
            sync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(1),
            max_sync_retries: 3,
            feedback_interval: Duration::from_secs(1),
            end_grace_period: Duration::from_millis(500),
            max_payload_size: 1024,
            max_commands_per_tick: 64,
            flush_interval: Duration::from_millis(1),
            latency_budget: Duration::from_millis(5),
        }
    }
}

impl DriverConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Config` for malformed JSON and
    /// `MidiError::InvalidArgument` for out-of-range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Config` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.control_port == u16::MAX {
            return Err(MidiError::invalid_argument(
                "control_port",
                "no room for the data port",
            ));
        }
        if self.max_payload_size < 8 || self.max_payload_size > MAX_SECTION_LEN {
            return Err(MidiError::invalid_argument(
                "max_payload_size",
                format!("must be between 8 and {MAX_SECTION_LEN}"),
            ));
        }
        if self.max_commands_per_tick == 0 {
            return Err(MidiError::invalid_argument(
                "max_commands_per_tick",
                "must be at least 1",
            ));
        }
        if self.invitation_retry_delay.is_zero() || self.sync_timeout.is_zero() {
            return Err(MidiError::invalid_argument(
                "timeouts",
                "retry delays must be non-zero",
            ));
        }
        if self.session_name.contains('\0') {
            return Err(MidiError::invalid_argument(
                "session_name",
                "must not contain NUL",
            ));
        }
        Ok(())
    }

    /// Data port paired with `control_port`
    #[must_use]
    pub fn data_port(&self) -> u16 {
        self.control_port.wrapping_add(1)
    }
}

/// Builder for `DriverConfig`
#[derive(Debug, Clone, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// Set the announced session name
    #[must_use]
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.config.session_name = name.into();
        self
    }

    /// Set the local bind address
    #[must_use]
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    /// Set the control port (0 = any free pair)
    #[must_use]
    pub fn control_port(mut self, port: u16) -> Self {
        self.config.control_port = port;
        self
    }

    /// Use a fixed local SSRC
    #[must_use]
    pub fn ssrc(mut self, ssrc: u32) -> Self {
        self.config.ssrc = Some(ssrc);
        self
    }

    /// Accept or refuse unsolicited invitations
    #[must_use]
    pub fn accept_invitations(mut self, accept: bool) -> Self {
        self.config.accept_invitations = accept;
        self
    }

    /// Set invitation retry policy
    #[must_use]
    pub fn invitation_retries(mut self, delay: Duration, max_retries: u32) -> Self {
        self.config.invitation_retry_delay = delay;
        self.config.max_invitation_retries = max_retries;
        self
    }

    /// Set the invitation backoff cap
    #[must_use]
    pub fn max_invitation_delay(mut self, delay: Duration) -> Self {
        self.config.max_invitation_delay = delay;
        self
    }

    /// Set responder handshake timeout
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set clock re-synchronization interval
    #[must_use]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    /// Set clock sync timeout and retry count
    #[must_use]
    pub fn sync_retries(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.config.sync_timeout = timeout;
        self.config.max_sync_retries = max_retries;
        self
    }

    /// Set receiver feedback interval
    #[must_use]
    pub fn feedback_interval(mut self, interval: Duration) -> Self {
        self.config.feedback_interval = interval;
        self
    }

    /// Set grace period after bye
    #[must_use]
    pub fn end_grace_period(mut self, period: Duration) -> Self {
        self.config.end_grace_period = period;
        self
    }

    /// Set per-packet pacing limits
    #[must_use]
    pub fn pacing(mut self, max_payload_size: usize, max_commands_per_tick: usize) -> Self {
        self.config.max_payload_size = max_payload_size;
        self.config.max_commands_per_tick = max_commands_per_tick;
        self
    }

    /// Set flush interval
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set delivery latency budget
    #[must_use]
    pub fn latency_budget(mut self, budget: Duration) -> Self {
        self.config.latency_budget = budget;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> DriverConfig {
        self.config
    }
}
