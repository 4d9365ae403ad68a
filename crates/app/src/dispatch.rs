//! Protocol dispatcher
//!
//! A handler table keyed by message tag. Each route names who may send the
//! message and which side of the room acts on it. Dispatch is pure: it
//! mutates the given state and reports what the caller must transmit.

use chrono::{DateTime, Utc};
use tally_core::{LivenessTracker, PeerId, SessionState, Settings, UserId};
use tally_net::{Envelope, MessageTag};
use tracing::debug;

/// Who may send a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Any open channel
    Any,
    /// A member of the roster
    Participant,
    /// The current facilitator
    Facilitator,
    /// The room's relay
    Relay,
}

/// Which side handles a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Relay,
    Replica,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub authority: Authority,
    pub side: Side,
}

/// The handler table
pub fn route(tag: MessageTag) -> Route {
    use Authority as A;
    use MessageTag as T;

    let (authority, side) = match tag {
        T::Join | T::Rejoin => (A::Any, Side::Relay),
        T::Vote | T::HostClaim => (A::Participant, Side::Relay),
        T::Reveal | T::Hide | T::Reset | T::HostTransfer | T::UpdateSettings => {
            (A::Facilitator, Side::Relay)
        }
        T::Ping | T::Pong => (A::Any, Side::Both),
        T::Welcome | T::UpdateState => (A::Relay, Side::Replica),
    };
    Route { authority, side }
}

/// What the caller has to do after dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Rebroadcast the canonical snapshot to every channel
    Broadcast,
    /// Unicast the snapshot as WELCOME to a peer that just attached
    Welcome(PeerId),
    /// Unicast an envelope
    Reply(PeerId, Envelope),
    /// The local replica was replaced by a snapshot
    Replaced,
}

/// Which side of the room this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Relay,
    Member,
}

fn authorized(state: &SessionState, sender: PeerId, relay: PeerId, authority: Authority) -> bool {
    match authority {
        Authority::Any => true,
        Authority::Participant => state.participant(sender).is_some(),
        Authority::Facilitator => state.is_host(sender),
        Authority::Relay => sender == relay,
    }
}

/// Apply a state-changing command from `sender`. Returns false if nothing changed.
fn apply_command(
    state: &mut SessionState,
    sender: PeerId,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> bool {
    match envelope {
        Envelope::Vote { value } => state.cast_vote(sender, value.clone(), now),
        Envelope::Reveal {} => {
            state.reveal();
            true
        }
        Envelope::Hide {} => {
            state.hide();
            true
        }
        Envelope::Reset {} => {
            state.reset();
            true
        }
        Envelope::UpdateSettings {
            auto_reveal,
            auto_reveal_duration,
        } => {
            state.update_settings(Settings {
                auto_reveal: *auto_reveal,
                auto_reveal_duration: *auto_reveal_duration,
            });
            true
        }
        Envelope::HostTransfer { new_host_identity } => state.transfer_host_to(*new_host_identity),
        Envelope::HostClaim {} => state.claim_host(sender),
        _ => false,
    }
}

/// A channel carries exactly one participant
fn bound_to_other_user(state: &SessionState, from: PeerId, user_id: UserId) -> bool {
    state
        .participant(from)
        .is_some_and(|p| p.user_id != user_id)
}

/// Handle a message arriving at the relay
pub fn dispatch_relay(
    state: &mut SessionState,
    liveness: &mut LivenessTracker,
    relay: PeerId,
    from: PeerId,
    envelope: Envelope,
    now: DateTime<Utc>,
) -> Vec<Effect> {
    let tag = envelope.tag();
    let route = route(tag);

    if route.side == Side::Replica {
        debug!(peer = %from, tag = %tag, "Dropping replica-only message at relay");
        return Vec::new();
    }
    if !authorized(state, from, relay, route.authority) {
        debug!(peer = %from, tag = %tag, "Dropping unauthorized message");
        return Vec::new();
    }

    if let Envelope::Join { user_id, .. } | Envelope::Rejoin { user_id, .. } = &envelope {
        if bound_to_other_user(state, from, *user_id) {
            debug!(peer = %from, user_id = %user_id, tag = %tag, "Channel already bound to another user");
            return Vec::new();
        }
    }

    match envelope {
        Envelope::Join { name, user_id } => {
            let outcome = state.join(from, user_id, name, now);
            debug!(peer = %from, user_id = %user_id, ?outcome, "Join accepted");
            vec![Effect::Broadcast, Effect::Welcome(from)]
        }
        Envelope::Rejoin { user_id, name } => {
            let outcome = state.rejoin(from, user_id, name, now);
            debug!(peer = %from, user_id = %user_id, ?outcome, "Rejoin accepted");
            vec![Effect::Broadcast, Effect::Welcome(from)]
        }
        Envelope::Ping { timestamp } => vec![Effect::Reply(from, Envelope::Pong { timestamp })],
        Envelope::Pong { .. } => {
            liveness.record(from, now);
            Vec::new()
        }
        command => {
            if apply_command(state, from, &command, now) {
                vec![Effect::Broadcast]
            } else {
                debug!(peer = %from, tag = %tag, "Command had no effect");
                Vec::new()
            }
        }
    }
}

/// Handle a message arriving at a member
pub fn dispatch_replica(
    replica: &mut SessionState,
    liveness: &mut LivenessTracker,
    relay: PeerId,
    from: PeerId,
    envelope: Envelope,
    now: DateTime<Utc>,
) -> Vec<Effect> {
    let tag = envelope.tag();
    let route = route(tag);

    if route.side == Side::Relay {
        debug!(peer = %from, tag = %tag, "Dropping relay-only message at member");
        return Vec::new();
    }
    if !authorized(replica, from, relay, route.authority) {
        debug!(peer = %from, tag = %tag, "Dropping unauthorized message");
        return Vec::new();
    }

    match envelope {
        Envelope::Welcome(snapshot) | Envelope::UpdateState(snapshot) => {
            *replica = snapshot;
            vec![Effect::Replaced]
        }
        Envelope::Ping { timestamp } => vec![Effect::Reply(from, Envelope::Pong { timestamp })],
        Envelope::Pong { .. } => {
            liveness.record(from, now);
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// A user action from the local console
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Vote(Option<String>),
    Reveal,
    Hide,
    Reset,
    TransferHost(UserId),
    ClaimHost,
    UpdateSettings(Settings),
}

impl Command {
    /// The wire form, resolved against the current roster
    pub fn to_envelope(&self, state: &SessionState) -> Option<Envelope> {
        let envelope = match self {
            Command::Vote(value) => Envelope::Vote {
                value: value.clone(),
            },
            Command::Reveal => Envelope::Reveal {},
            Command::Hide => Envelope::Hide {},
            Command::Reset => Envelope::Reset {},
            Command::TransferHost(user_id) => Envelope::HostTransfer {
                new_host_identity: state.participant_by_user(*user_id)?.transport_id,
            },
            Command::ClaimHost => Envelope::HostClaim {},
            Command::UpdateSettings(settings) => Envelope::update_settings(*settings),
        };
        Some(envelope)
    }
}

/// Outcome of a local action
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEffect {
    /// Relay: canonical state changed, rebroadcast
    Broadcast,
    /// Member: replica changed optimistically, forward the command to the relay
    Forward(Envelope),
}

/// Apply a local action. Authorization is checked before anything changes;
/// `None` means the action was refused or had no effect.
pub fn apply_local(
    state: &mut SessionState,
    role: Role,
    relay: PeerId,
    me: PeerId,
    command: &Command,
    now: DateTime<Utc>,
) -> Option<LocalEffect> {
    let envelope = command.to_envelope(state)?;
    let tag = envelope.tag();
    let route = route(tag);

    if !authorized(state, me, relay, route.authority) {
        debug!(tag = %tag, "Local action not permitted");
        return None;
    }
    if !apply_command(state, me, &envelope, now) {
        return None;
    }

    Some(match role {
        Role::Relay => LocalEffect::Broadcast,
        Role::Member => LocalEffect::Forward(envelope),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::RoundStatus;

    struct Room {
        state: SessionState,
        liveness: LivenessTracker,
        relay: PeerId,
    }

    impl Room {
        fn new() -> Self {
            let relay = PeerId::new();
            let state =
                SessionState::with_creator(relay, UserId::new(), "R1".into(), Settings::default(), Utc::now());
            Self {
                state,
                liveness: LivenessTracker::default(),
                relay,
            }
        }

        fn deliver(&mut self, from: PeerId, envelope: Envelope) -> Vec<Effect> {
            dispatch_relay(
                &mut self.state,
                &mut self.liveness,
                self.relay,
                from,
                envelope,
                Utc::now(),
            )
        }

        fn join(&mut self, name: &str) -> (PeerId, UserId) {
            let peer = PeerId::new();
            let user_id = UserId::new();
            self.deliver(
                peer,
                Envelope::Join {
                    name: name.into(),
                    user_id,
                },
            );
            (peer, user_id)
        }
    }

    #[test]
    fn test_every_tag_has_a_route() {
        assert_eq!(route(MessageTag::Reveal).authority, Authority::Facilitator);
        assert_eq!(route(MessageTag::HostClaim).authority, Authority::Participant);
        assert_eq!(route(MessageTag::Welcome).side, Side::Replica);
        assert_eq!(route(MessageTag::Ping).side, Side::Both);
        assert_eq!(route(MessageTag::Join).side, Side::Relay);
    }

    #[test]
    fn test_join_broadcasts_then_welcomes() {
        let mut room = Room::new();
        let peer = PeerId::new();
        let effects = room.deliver(
            peer,
            Envelope::Join {
                name: "Bob".into(),
                user_id: UserId::new(),
            },
        );
        assert_eq!(effects, vec![Effect::Broadcast, Effect::Welcome(peer)]);
        assert_eq!(room.state.players.len(), 2);
        assert!(!room.state.is_host(peer));
    }

    #[test]
    fn test_rejoin_reattaches_by_user() {
        let mut room = Room::new();
        let (old_peer, user_id) = room.join("Bob");
        let new_peer = PeerId::new();
        room.deliver(
            new_peer,
            Envelope::Rejoin {
                user_id,
                name: "Bob".into(),
            },
        );
        assert_eq!(room.state.players.len(), 2);
        assert!(room.state.participant(old_peer).is_none());
        assert!(room.state.participant(new_peer).is_some());
    }

    #[test]
    fn test_second_identity_on_a_bound_channel_is_dropped() {
        let mut room = Room::new();
        let (bob, bob_user) = room.join("Bob");

        let other = Envelope::Join {
            name: "Eve".into(),
            user_id: UserId::new(),
        };
        assert!(room.deliver(bob, other).is_empty());
        let other = Envelope::Rejoin {
            user_id: UserId::new(),
            name: "Mallory".into(),
        };
        assert!(room.deliver(bob, other).is_empty());
        assert_eq!(room.state.players.len(), 2);

        // The bound user may still re-announce itself
        let again = Envelope::Rejoin {
            user_id: bob_user,
            name: "Robert".into(),
        };
        assert_eq!(room.deliver(bob, again), vec![Effect::Broadcast, Effect::Welcome(bob)]);
        assert_eq!(room.state.players.len(), 2);

        // Closing the channel leaves no one behind
        assert!(room.state.remove(bob, Utc::now()).is_some());
        assert_eq!(room.state.players.len(), 1);
        assert!(room.state.participant(bob).is_none());
    }

    #[test]
    fn test_vote_from_stranger_is_dropped() {
        let mut room = Room::new();
        let effects = room.deliver(
            PeerId::new(),
            Envelope::Vote {
                value: Some("3".into()),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(room.state.vote_count(), (0, 1));
    }

    #[test]
    fn test_reveal_requires_facilitator() {
        let mut room = Room::new();
        let (bob, _) = room.join("Bob");

        assert!(room.deliver(bob, Envelope::Reveal {}).is_empty());
        assert_eq!(room.state.status, RoundStatus::Voting);

        assert_eq!(
            room.deliver(room.relay, Envelope::Reveal {}),
            vec![Effect::Broadcast]
        );
        assert_eq!(room.state.status, RoundStatus::Revealed);
    }

    #[test]
    fn test_host_transfer_and_claim() {
        let mut room = Room::new();
        let (bob, _) = room.join("Bob");
        let (carol, _) = room.join("Carol");

        // Only the facilitator can hand over
        assert!(room
            .deliver(bob, Envelope::HostTransfer { new_host_identity: bob })
            .is_empty());

        room.deliver(room.relay, Envelope::HostTransfer { new_host_identity: bob });
        assert!(room.state.is_host(bob));
        assert!(!room.state.is_host(room.relay));

        // Any participant may claim
        room.deliver(carol, Envelope::HostClaim {});
        assert!(room.state.is_host(carol));
        assert_eq!(room.state.players.iter().filter(|p| p.is_host).count(), 1);
    }

    #[test]
    fn test_transfer_to_unknown_target_is_ignored() {
        let mut room = Room::new();
        let effects = room.deliver(
            room.relay,
            Envelope::HostTransfer {
                new_host_identity: PeerId::new(),
            },
        );
        assert!(effects.is_empty());
        assert!(room.state.is_host(room.relay));
    }

    #[test]
    fn test_ping_is_answered_and_pong_recorded() {
        let mut room = Room::new();
        let (bob, _) = room.join("Bob");

        let effects = room.deliver(bob, Envelope::Ping { timestamp: 42 });
        assert_eq!(
            effects,
            vec![Effect::Reply(bob, Envelope::Pong { timestamp: 42 })]
        );

        assert!(room.liveness.last_seen(bob).is_none());
        room.deliver(bob, Envelope::Pong { timestamp: 42 });
        assert!(room.liveness.last_seen(bob).is_some());
    }

    #[test]
    fn test_relay_ignores_snapshots() {
        let mut room = Room::new();
        let (bob, _) = room.join("Bob");
        let before = room.state.clone();
        let effects = room.deliver(bob, Envelope::UpdateState(SessionState::default()));
        assert!(effects.is_empty());
        assert_eq!(room.state, before);
    }

    #[test]
    fn test_replica_accepts_snapshots_only_from_relay() {
        let room = Room::new();
        let mut replica = SessionState::default();
        let mut liveness = LivenessTracker::default();

        let forged = dispatch_replica(
            &mut replica,
            &mut liveness,
            room.relay,
            PeerId::new(),
            Envelope::UpdateState(room.state.clone()),
            Utc::now(),
        );
        assert!(forged.is_empty());
        assert!(replica.players.is_empty());

        let effects = dispatch_replica(
            &mut replica,
            &mut liveness,
            room.relay,
            room.relay,
            Envelope::Welcome(room.state.clone()),
            Utc::now(),
        );
        assert_eq!(effects, vec![Effect::Replaced]);
        assert_eq!(replica, room.state);
    }

    #[test]
    fn test_replica_drops_commands() {
        let room = Room::new();
        let mut replica = room.state.clone();
        let mut liveness = LivenessTracker::default();
        let effects = dispatch_replica(
            &mut replica,
            &mut liveness,
            room.relay,
            room.relay,
            Envelope::Reset {},
            Utc::now(),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_local_action_is_guarded() {
        let mut room = Room::new();
        let (bob, _) = room.join("Bob");
        let mut replica = room.state.clone();

        assert_eq!(
            apply_local(&mut replica, Role::Member, room.relay, bob, &Command::Reveal, Utc::now()),
            None
        );
        assert_eq!(replica.status, RoundStatus::Voting);

        let effect = apply_local(
            &mut replica,
            Role::Member,
            room.relay,
            bob,
            &Command::Vote(Some("8".into())),
            Utc::now(),
        );
        assert_eq!(
            effect,
            Some(LocalEffect::Forward(Envelope::Vote {
                value: Some("8".into())
            }))
        );
        assert_eq!(
            replica.participant(bob).and_then(|p| p.vote.clone()),
            Some("8".into())
        );
    }

    #[test]
    fn test_local_transfer_targets_current_transport_id() {
        let mut room = Room::new();
        let (bob, bob_user) = room.join("Bob");

        let effect = apply_local(
            &mut room.state,
            Role::Relay,
            room.relay,
            room.relay,
            &Command::TransferHost(bob_user),
            Utc::now(),
        );
        assert_eq!(effect, Some(LocalEffect::Broadcast));
        assert!(room.state.is_host(bob));

        assert_eq!(
            Command::TransferHost(bob_user).to_envelope(&room.state),
            Some(Envelope::HostTransfer {
                new_host_identity: bob
            })
        );
        assert_eq!(
            Command::TransferHost(UserId::new()).to_envelope(&room.state),
            None
        );
    }
}
