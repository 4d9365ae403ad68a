//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible session states during
//! development. These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::RoundStatus;
use crate::session::SessionState;

/// Validate that the roster and countdown are internally consistent
pub fn assert_session_invariants(state: &SessionState) {
    assert_unique_users(state);
    assert_single_host(state);
    assert_countdown_invariants(state);
}

/// At most one participant per stable identity
pub fn assert_unique_users(state: &SessionState) {
    let mut seen = HashSet::new();
    for p in &state.players {
        debug_assert!(
            seen.insert(p.user_id),
            "User {} appears more than once in the roster",
            p.user_id
        );
    }
}

/// Exactly one facilitator whenever the roster is non-empty
pub fn assert_single_host(state: &SessionState) {
    let host_count = state.players.iter().filter(|p| p.is_host).count();
    let expected = usize::from(!state.players.is_empty());
    debug_assert!(
        host_count == expected,
        "Roster of {} has {} hosts, expected {}",
        state.players.len(),
        host_count,
        expected
    );
}

/// A running countdown implies auto-reveal, an open round and exactly one
/// missing vote among two or more players
pub fn assert_countdown_invariants(state: &SessionState) {
    if state.countdown_start_time.is_none() {
        return;
    }

    debug_assert!(
        state.settings.auto_reveal,
        "Countdown running with auto-reveal disabled"
    );
    debug_assert!(
        state.status == RoundStatus::Voting,
        "Countdown running after reveal"
    );

    let unvoted = state.players.iter().filter(|p| p.vote.is_none()).count();
    debug_assert!(
        state.players.len() >= 2 && unvoted == 1,
        "Countdown running with {} of {} players unvoted",
        unvoted,
        state.players.len()
    );
}
