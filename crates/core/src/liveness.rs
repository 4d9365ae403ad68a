//! Heartbeat liveness tracking
//!
//! Records when each remote identity last answered a probe. Status is
//! derived from the elapsed time on every read and never cached.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{ConnectionStatus, PeerId};

/// Probe interval used when no configuration overrides it
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Classification windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThresholds {
    /// Below this a peer is online
    pub away_after: Duration,
    /// Above this a peer is offline
    pub offline_after: Duration,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            away_after: Duration::from_secs(15),
            offline_after: Duration::from_secs(30),
        }
    }
}

/// Classify a peer from the time since its last reply
pub fn classify(elapsed: Duration, thresholds: &LivenessThresholds) -> ConnectionStatus {
    if elapsed < thresholds.away_after {
        ConnectionStatus::Online
    } else if elapsed <= thresholds.offline_after {
        ConnectionStatus::Away
    } else {
        ConnectionStatus::Offline
    }
}

/// Last-seen bookkeeping per remote identity
#[derive(Debug, Default)]
pub struct LivenessTracker {
    last_seen: HashMap<PeerId, DateTime<Utc>>,
    thresholds: LivenessThresholds,
}

impl LivenessTracker {
    pub fn new(thresholds: LivenessThresholds) -> Self {
        Self {
            last_seen: HashMap::new(),
            thresholds,
        }
    }

    /// Note a reply (or a freshly opened channel) from `peer`
    pub fn record(&mut self, peer: PeerId, at: DateTime<Utc>) {
        let entry = self.last_seen.entry(peer).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.last_seen.remove(&peer);
    }

    pub fn last_seen(&self, peer: PeerId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&peer).copied()
    }

    /// Unknown peers are offline
    pub fn status(&self, peer: PeerId, now: DateTime<Utc>) -> ConnectionStatus {
        match self.last_seen.get(&peer) {
            Some(seen) => {
                let elapsed = now
                    .signed_duration_since(*seen)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                classify(elapsed, &self.thresholds)
            }
            None => ConnectionStatus::Offline,
        }
    }
}
