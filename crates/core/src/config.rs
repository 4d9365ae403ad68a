//! Runtime configuration
//!
//! Loaded from an optional TOML file. Every section and field has a default,
//! so an empty file (or no file) yields the stock timings.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::liveness::{LivenessThresholds, DEFAULT_PROBE_INTERVAL};
use crate::models::Settings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub heartbeat: HeartbeatConfig,
    pub relay: RelayConfig,
    pub transport: TransportConfig,
    pub session: SessionDefaults,
}

/// `[heartbeat]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub away_after_secs: u64,
    pub offline_after_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_PROBE_INTERVAL.as_secs(),
            away_after_secs: 15,
            offline_after_secs: 30,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn thresholds(&self) -> LivenessThresholds {
        LivenessThresholds {
            away_after: Duration::from_secs(self.away_after_secs),
            offline_after: Duration::from_secs(self.offline_after_secs),
        }
    }
}

/// `[relay]` section, only used by the room creator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Unconditional full-snapshot retransmission period
    pub snapshot_interval_secs: u64,
    /// Auto-reveal evaluation period
    pub reveal_tick_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5,
            reveal_tick_ms: 1000,
        }
    }
}

impl RelayConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    pub fn reveal_tick(&self) -> Duration {
        Duration::from_millis(self.reveal_tick_ms.max(10))
    }
}

/// `[transport]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the relay listens on
    pub listen: SocketAddr,
    pub handshake_timeout_secs: u64,
    pub connect_poll_interval_ms: u64,
    pub connect_max_polls: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
            handshake_timeout_secs: 10,
            connect_poll_interval_ms: 100,
            connect_max_polls: 100,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms.max(1))
    }
}

/// `[session]` section: settings for newly created rooms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub auto_reveal: bool,
    pub auto_reveal_duration: u32,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            auto_reveal: settings.auto_reveal,
            auto_reveal_duration: settings.auto_reveal_duration,
        }
    }
}

impl SessionDefaults {
    pub fn settings(&self) -> Settings {
        Settings {
            auto_reveal: self.auto_reveal,
            auto_reveal_duration: self.auto_reveal_duration,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
