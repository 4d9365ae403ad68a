//! Auto-reveal countdown rules
//!
//! The countdown runs while auto-reveal is enabled, the round is still open,
//! and exactly one of two or more players has yet to vote. Only the relay
//! evaluates these rules; replicas just read `countdown_start_time` to show
//! the remaining time.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::RoundStatus;
use crate::session::SessionState;

impl SessionState {
    fn countdown_should_run(&self) -> bool {
        if !self.settings.auto_reveal || self.status != RoundStatus::Voting {
            return false;
        }
        if self.players.len() < 2 {
            return false;
        }
        self.players.iter().filter(|p| !p.has_voted()).count() == 1
    }

    /// Start the countdown when its condition first holds, clear it when the
    /// condition no longer holds. A running countdown keeps its start time.
    pub fn refresh_countdown(&mut self, now: DateTime<Utc>) {
        if self.countdown_should_run() {
            if self.countdown_start_time.is_none() {
                self.countdown_start_time = Some(now.timestamp_millis());
            }
        } else {
            self.countdown_start_time = None;
        }
    }

    /// Time left before the automatic reveal, if a countdown is running
    pub fn countdown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.countdown_start_time?;
        let total_ms = i64::from(self.settings.auto_reveal_duration) * 1000;
        let elapsed_ms = now.timestamp_millis().saturating_sub(started).max(0);
        let left_ms = (total_ms - elapsed_ms).max(0);
        Some(Duration::from_millis(left_ms as u64))
    }

    pub fn countdown_expired(&self, now: DateTime<Utc>) -> bool {
        self.countdown_remaining(now)
            .is_some_and(|left| left.is_zero())
    }

    /// Reveal once the countdown has run out. Returns true if the round was revealed.
    pub fn tick_auto_reveal(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RoundStatus::Voting && self.countdown_expired(now) {
            self.reveal();
            true
        } else {
            false
        }
    }
}
