//! Sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::performance::PerformanceProfile;

/// How broadcasts encode state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// Every broadcast carries the full snapshot
    #[default]
    Full,
    /// Broadcasts carry compacted structural changes
    Delta,
}

/// Tunables for a share session. Durations serialize as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum concurrent viewers per host
    pub viewer_cap: usize,
    /// Minimum gap between two connection-level broadcasts
    #[serde(with = "millis")]
    pub connection_throttle: Duration,
    /// Minimum gap between two session-level syncs
    #[serde(with = "millis")]
    pub session_throttle: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Pause between a viewer's link opening and its first state request
    #[serde(with = "millis")]
    pub viewer_warmup: Duration,
    /// Base backoff; attempt `n` waits `n × reconnect_delay`
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    #[serde(with = "millis")]
    pub cursor_interval: Duration,
    /// Pause before a viewer applies each inbound packet
    #[serde(with = "millis")]
    pub processing_delay: Duration,
    pub transmission: TransmissionMode,
    /// Run the domain compressor over outgoing snapshots
    pub compression: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            viewer_cap: 3,
            connection_throttle: Duration::from_millis(50),
            session_throttle: Duration::from_millis(150),
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            viewer_warmup: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            cursor_interval: Duration::from_millis(33),
            processing_delay: Duration::ZERO,
            transmission: TransmissionMode::Full,
            compression: false,
        }
    }
}

impl SyncConfig {
    pub fn with_viewer_cap(mut self, cap: usize) -> Self {
        self.viewer_cap = cap;
        self
    }

    pub fn with_throttles(mut self, connection: Duration, session: Duration) -> Self {
        self.connection_throttle = connection;
        self.session_throttle = session;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_viewer_warmup(mut self, warmup: Duration) -> Self {
        self.viewer_warmup = warmup;
        self
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn with_transmission(mut self, mode: TransmissionMode) -> Self {
        self.transmission = mode;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Overwrite the timing knobs with a performance profile.
    pub fn apply_profile(&mut self, profile: &PerformanceProfile) {
        self.connection_throttle = profile.throttle_interval;
        self.session_throttle = profile.session_throttle_interval;
        self.connect_timeout = profile.connect_timeout;
        self.processing_delay = profile.processing_delay;
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
