//! Canonical session state
//!
//! The relay owns the only authoritative `SessionState`. Every other
//! participant keeps a replica that is replaced wholesale whenever a snapshot
//! arrives, so the operations here are only ever run by a single writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::invariants::assert_session_invariants;
use crate::models::{ConnectionStatus, Participant, PeerId, RoundStatus, Settings, UserId};

/// Result of admitting a participant to the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new participant was appended
    Added,
    /// An existing participant with the same stable identity was re-attached
    Reattached,
}

/// Replicated game state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Roster in join order
    pub players: Vec<Participant>,
    pub status: RoundStatus,
    #[serde(flatten)]
    pub settings: Settings,
    /// Unix milliseconds at which the auto-reveal countdown started
    pub countdown_start_time: Option<i64>,
}

impl SessionState {
    pub fn new(settings: Settings) -> Self {
        Self {
            players: Vec::new(),
            status: RoundStatus::Voting,
            settings,
            countdown_start_time: None,
        }
    }

    /// Create the state for a fresh room with its creator as facilitator
    pub fn with_creator(
        transport_id: PeerId,
        user_id: UserId,
        name: String,
        settings: Settings,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self::new(settings);
        state.join(transport_id, user_id, name, now);
        state
    }

    pub fn participant(&self, peer: PeerId) -> Option<&Participant> {
        self.players.iter().find(|p| p.transport_id == peer)
    }

    fn participant_mut(&mut self, peer: PeerId) -> Option<&mut Participant> {
        self.players.iter_mut().find(|p| p.transport_id == peer)
    }

    pub fn participant_by_user(&self, user_id: UserId) -> Option<&Participant> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_by_name(&self, name: &str) -> Option<&Participant> {
        self.players
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Current facilitator
    pub fn host(&self) -> Option<&Participant> {
        self.players.iter().find(|p| p.is_host)
    }

    pub fn is_host(&self, peer: PeerId) -> bool {
        self.participant(peer).is_some_and(|p| p.is_host)
    }

    pub fn is_user_host(&self, user_id: UserId) -> bool {
        self.participant_by_user(user_id).is_some_and(|p| p.is_host)
    }

    /// Admit a participant. A stable identity that is already present is
    /// re-attached to the new transport id instead of being duplicated.
    pub fn join(
        &mut self,
        transport_id: PeerId,
        user_id: UserId,
        name: String,
        now: DateTime<Utc>,
    ) -> JoinOutcome {
        if let Some(existing) = self.players.iter_mut().find(|p| p.user_id == user_id) {
            debug!(user_id = %user_id, peer = %transport_id, "Duplicate join, re-attaching");
            existing.transport_id = transport_id;
            existing.connection_status = ConnectionStatus::Online;
            assert_session_invariants(self);
            return JoinOutcome::Reattached;
        }

        let mut participant = Participant::new(transport_id, user_id, name);
        participant.is_host = self.players.is_empty();
        self.players.push(participant);
        self.refresh_countdown(now);

        assert_session_invariants(self);
        JoinOutcome::Added
    }

    /// Re-attach a returning participant, located by stable identity only.
    /// Falls back to a plain join when the identity is unknown.
    pub fn rejoin(
        &mut self,
        transport_id: PeerId,
        user_id: UserId,
        name: String,
        now: DateTime<Utc>,
    ) -> JoinOutcome {
        match self.players.iter_mut().find(|p| p.user_id == user_id) {
            Some(existing) => {
                existing.transport_id = transport_id;
                existing.connection_status = ConnectionStatus::Online;
                if !name.trim().is_empty() {
                    existing.name = name;
                }
                assert_session_invariants(self);
                JoinOutcome::Reattached
            }
            None => self.join(transport_id, user_id, name, now),
        }
    }

    /// Set or clear a participant's vote. Returns false for unknown peers.
    pub fn cast_vote(&mut self, peer: PeerId, value: Option<String>, now: DateTime<Utc>) -> bool {
        let Some(participant) = self.participant_mut(peer) else {
            return false;
        };
        participant.vote = value;
        self.refresh_countdown(now);

        assert_session_invariants(self);
        true
    }

    pub fn reveal(&mut self) {
        self.status = RoundStatus::Revealed;
        self.countdown_start_time = None;
    }

    /// Return to voting without discarding votes
    pub fn hide(&mut self) {
        self.status = RoundStatus::Voting;
        self.countdown_start_time = None;
    }

    /// Start a new round
    pub fn reset(&mut self) {
        self.status = RoundStatus::Voting;
        self.countdown_start_time = None;
        for p in &mut self.players {
            p.vote = None;
        }
    }

    pub fn update_settings(&mut self, settings: Settings) {
        self.settings = settings;
        self.countdown_start_time = None;
    }

    fn assign_host(&mut self, target: PeerId) {
        for p in &mut self.players {
            p.is_host = p.transport_id == target;
        }
    }

    /// Make `target` the only facilitator. Returns false if it is not in the roster.
    pub fn transfer_host_to(&mut self, target: PeerId) -> bool {
        if self.participant(target).is_none() {
            return false;
        }
        self.assign_host(target);

        assert_session_invariants(self);
        true
    }

    /// Make the claimant the only facilitator
    pub fn claim_host(&mut self, claimant: PeerId) -> bool {
        if self.participant(claimant).is_none() {
            return false;
        }
        self.assign_host(claimant);

        assert_session_invariants(self);
        true
    }

    /// Hand facilitation to the first non-facilitator in roster order
    pub fn transfer_host(&mut self) -> Option<PeerId> {
        let next = self.players.iter().find(|p| !p.is_host)?.transport_id;
        self.assign_host(next);
        Some(next)
    }

    /// Drop a participant whose channel closed. If it was the facilitator,
    /// facilitation moves to the next participant in roster order.
    pub fn remove(&mut self, peer: PeerId, now: DateTime<Utc>) -> Option<Participant> {
        let index = self.players.iter().position(|p| p.transport_id == peer)?;
        let removed = self.players.remove(index);

        if removed.is_host && !self.players.is_empty() {
            self.transfer_host();
        }
        self.refresh_countdown(now);

        assert_session_invariants(self);
        Some(removed)
    }

    pub fn set_connection_status(&mut self, peer: PeerId, status: ConnectionStatus) -> bool {
        match self.participant_mut(peer) {
            Some(p) => {
                p.connection_status = status;
                true
            }
            None => false,
        }
    }

    /// Mean of the votes that are numbers; non-numeric cards are ignored
    pub fn average(&self) -> Option<f64> {
        let numbers: Vec<f64> = self
            .players
            .iter()
            .filter_map(|p| p.vote.as_deref())
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .collect();

        if numbers.is_empty() {
            None
        } else {
            Some(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
    }

    /// (voted, total)
    pub fn vote_count(&self) -> (usize, usize) {
        let voted = self.players.iter().filter(|p| p.has_voted()).count();
        (voted, self.players.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn room_with(names: &[&str]) -> (SessionState, Vec<PeerId>) {
        let mut state = SessionState::new(Settings::default());
        let peers: Vec<PeerId> = names
            .iter()
            .map(|name| {
                let peer = PeerId::new();
                state.join(peer, UserId::new(), name.to_string(), now());
                peer
            })
            .collect();
        (state, peers)
    }

    fn host_count(state: &SessionState) -> usize {
        state.players.iter().filter(|p| p.is_host).count()
    }

    #[test]
    fn test_first_join_becomes_host() {
        let (state, peers) = room_with(&["R1", "Bob"]);
        assert!(state.is_host(peers[0]));
        assert!(!state.is_host(peers[1]));
        assert_eq!(host_count(&state), 1);
    }

    #[test]
    fn test_repeated_join_is_deduplicated() {
        let mut state = SessionState::new(Settings::default());
        let user = UserId::new();

        state.join(PeerId::new(), user, "bob".into(), now());
        let second = PeerId::new();
        assert_eq!(
            state.join(second, user, "bob".into(), now()),
            JoinOutcome::Reattached
        );
        let third = PeerId::new();
        state.rejoin(third, user, "bobby".into(), now());
        state.join(PeerId::new(), UserId::new(), "carol".into(), now());
        state.rejoin(PeerId::new(), user, "bobby".into(), now());

        let entries: Vec<_> = state.players.iter().filter(|p| p.user_id == user).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "bobby");
        assert_eq!(state.players.len(), 2);
    }

    #[test]
    fn test_rejoin_locates_by_user_and_keeps_vote() {
        let mut state = SessionState::new(Settings::default());
        let user = UserId::new();
        let old_peer = PeerId::new();
        state.join(old_peer, user, "bob".into(), now());
        state.cast_vote(old_peer, Some("8".into()), now());
        state.set_connection_status(old_peer, ConnectionStatus::Offline);

        let new_peer = PeerId::new();
        assert_eq!(
            state.rejoin(new_peer, user, "bob".into(), now()),
            JoinOutcome::Reattached
        );

        assert!(state.participant(old_peer).is_none());
        let bob = state.participant(new_peer).unwrap();
        assert_eq!(bob.vote.as_deref(), Some("8"));
        assert_eq!(bob.connection_status, ConnectionStatus::Online);
    }

    #[test]
    fn test_rejoin_unknown_user_joins() {
        let (mut state, _) = room_with(&["R1"]);
        let outcome = state.rejoin(PeerId::new(), UserId::new(), "late".into(), now());
        assert_eq!(outcome, JoinOutcome::Added);
        assert_eq!(state.players.len(), 2);
    }

    #[test]
    fn test_vote_reveal_reset_scenario() {
        let (mut state, peers) = room_with(&["R1", "Bob"]);
        assert!(state.cast_vote(peers[0], Some("5".into()), now()));
        assert!(state.cast_vote(peers[1], Some("8".into()), now()));

        state.reveal();
        assert_eq!(state.status, RoundStatus::Revealed);
        assert_eq!(state.average(), Some(6.5));
        assert_eq!(state.vote_count(), (2, 2));

        state.reset();
        assert_eq!(state.status, RoundStatus::Voting);
        assert!(state.players.iter().all(|p| p.vote.is_none()));
    }

    #[test]
    fn test_hide_keeps_votes() {
        let (mut state, peers) = room_with(&["R1", "Bob"]);
        state.cast_vote(peers[0], Some("3".into()), now());
        state.reveal();
        state.hide();
        assert_eq!(state.status, RoundStatus::Voting);
        assert_eq!(state.participant(peers[0]).unwrap().vote.as_deref(), Some("3"));
    }

    #[test]
    fn test_vote_from_unknown_peer_rejected() {
        let (mut state, _) = room_with(&["R1"]);
        assert!(!state.cast_vote(PeerId::new(), Some("1".into()), now()));
    }

    #[test]
    fn test_average_ignores_non_numeric() {
        let (mut state, peers) = room_with(&["a", "b", "c"]);
        state.cast_vote(peers[0], Some("2".into()), now());
        state.cast_vote(peers[1], Some("?".into()), now());
        state.cast_vote(peers[2], Some("0.5".into()), now());
        assert_eq!(state.average(), Some(1.25));

        state.reset();
        assert_eq!(state.average(), None);
    }

    #[test]
    fn test_transfer_host_to_target() {
        let (mut state, peers) = room_with(&["R1", "Bob", "Carol"]);
        for target in &peers {
            assert!(state.transfer_host_to(*target));
            assert_eq!(host_count(&state), 1);
            assert!(state.is_host(*target));
        }
        assert!(!state.transfer_host_to(PeerId::new()));
        assert!(state.is_host(peers[2]));
    }

    #[test]
    fn test_claim_host() {
        let (mut state, peers) = room_with(&["R1", "Bob"]);
        assert!(state.claim_host(peers[1]));
        assert!(state.is_host(peers[1]));
        assert_eq!(host_count(&state), 1);
    }

    #[test]
    fn test_remove_host_transfers_in_roster_order() {
        let (mut state, peers) = room_with(&["R1", "Bob", "Carol"]);
        state.transfer_host_to(peers[1]);

        let removed = state.remove(peers[1], now()).unwrap();
        assert_eq!(removed.name, "Bob");
        assert_eq!(state.players.len(), 2);
        assert_eq!(host_count(&state), 1);
        assert!(state.is_host(peers[0]));
    }

    #[test]
    fn test_remove_non_host_keeps_host() {
        let (mut state, peers) = room_with(&["R1", "Bob"]);
        state.remove(peers[1], now());
        assert!(state.is_host(peers[0]));
        assert!(state.remove(peers[1], now()).is_none());
    }

    #[test]
    fn test_remove_last_participant() {
        let (mut state, peers) = room_with(&["solo"]);
        state.remove(peers[0], now());
        assert!(state.players.is_empty());
        assert!(state.host().is_none());
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let (state, _) = room_with(&["R1"]);
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("players").is_some());
        assert_eq!(value["status"], "voting");
        assert_eq!(value["autoReveal"], false);
        assert_eq!(value["autoRevealDuration"], 3);
        assert!(value["countdownStartTime"].is_null());
        assert_eq!(value["players"][0]["isHost"], true);

        let decoded: SessionState = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, state);
    }
}
