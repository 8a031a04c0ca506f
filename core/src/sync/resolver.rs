// Conflict resolution for concurrent messages.
//
// Both replicas must pick the same winner from the same pair, with no
// coordination — every rule here is a deterministic function of the two
// messages.

use crate::clock::{concurrent_tiebreak, Causality};
use crate::message::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Larger wall-clock `created_at` wins
    Latest,
    /// Causal order wins; concurrent pairs fall to the clock tie-breakers
    VectorClock,
    /// Reserved for content-level merge; currently falls back to VectorClock
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// Device that originated a message, recovered from the
/// `msg_{device}_{ts}_{rand}` id shape. Falls back to the sender identity
/// for foreign id formats.
fn origin_device(msg: &Message) -> &str {
    msg.id.split('_').nth(1).filter(|d| !d.is_empty()).unwrap_or(&msg.sender)
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ResolutionStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Pick the winner between a stored local message and an incoming remote
    /// one occupying the same logical slot.
    pub fn resolve(&self, local: &Message, remote: &Message) -> ConflictWinner {
        match self.strategy {
            ResolutionStrategy::Latest => Self::by_timestamp(local, remote),
            ResolutionStrategy::VectorClock | ResolutionStrategy::Merge => {
                Self::by_vector_clock(local, remote)
            }
        }
    }

    fn by_timestamp(local: &Message, remote: &Message) -> ConflictWinner {
        match local.created_at.cmp(&remote.created_at) {
            std::cmp::Ordering::Greater => ConflictWinner::Local,
            std::cmp::Ordering::Less => ConflictWinner::Remote,
            // Equal timestamps: fall back to the id so both sides agree
            std::cmp::Ordering::Equal => {
                if local.id > remote.id {
                    ConflictWinner::Local
                } else {
                    ConflictWinner::Remote
                }
            }
        }
    }

    fn by_vector_clock(local: &Message, remote: &Message) -> ConflictWinner {
        match local.vector_clock.compare(&remote.vector_clock) {
            Causality::After | Causality::Equal => ConflictWinner::Local,
            Causality::Before => ConflictWinner::Remote,
            Causality::Concurrent => {
                let order = concurrent_tiebreak(
                    (&local.vector_clock, local.created_at, origin_device(local)),
                    (&remote.vector_clock, remote.created_at, origin_device(remote)),
                );
                if order == std::cmp::Ordering::Greater {
                    ConflictWinner::Local
                } else {
                    ConflictWinner::Remote
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::message::{ContentType, MessageStatus};

    fn msg(id: &str, created_at: u64, vc: VectorClock) -> Message {
        Message {
            id: id.into(),
            session_id: "s1".into(),
            sender: "sender".into(),
            recipient: "peer".into(),
            content_type: ContentType::Text,
            ciphertext: vec![],
            created_at,
            vector_clock: vc,
            status: MessageStatus::Delivered,
            attempts: 0,
        }
    }

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        let mut clock = VectorClock::new();
        for (device, n) in entries {
            for _ in 0..*n {
                clock.increment(device);
            }
        }
        clock
    }

    #[test]
    fn test_latest_strategy_prefers_newer_timestamp() {
        let resolver = ConflictResolver::new(ResolutionStrategy::Latest);
        let local = msg("msg_d1_1_aa", 100, vc(&[("d1", 1)]));
        let remote = msg("msg_d2_2_bb", 200, vc(&[("d2", 1)]));
        assert_eq!(resolver.resolve(&local, &remote), ConflictWinner::Remote);
        assert_eq!(resolver.resolve(&remote, &local), ConflictWinner::Local);
    }

    #[test]
    fn test_vector_clock_strategy_prefers_causal_descendant() {
        let resolver = ConflictResolver::new(ResolutionStrategy::VectorClock);
        let ancestor = msg("msg_d1_1_aa", 999, vc(&[("d1", 1)]));
        let descendant = msg("msg_d2_2_bb", 1, vc(&[("d1", 1), ("d2", 1)]));
        // Causality beats wall clock
        assert_eq!(resolver.resolve(&ancestor, &descendant), ConflictWinner::Remote);
        assert_eq!(resolver.resolve(&descendant, &ancestor), ConflictWinner::Local);
    }

    #[test]
    fn test_concurrent_falls_to_sum_tiebreak() {
        let resolver = ConflictResolver::new(ResolutionStrategy::VectorClock);
        let small = msg("msg_d1_1_aa", 500, vc(&[("d1", 1)]));
        let big = msg("msg_d2_2_bb", 100, vc(&[("d2", 3)]));
        assert_eq!(resolver.resolve(&small, &big), ConflictWinner::Remote);
    }

    #[test]
    fn test_concurrent_equal_sum_falls_to_timestamp_then_device() {
        let resolver = ConflictResolver::new(ResolutionStrategy::VectorClock);
        let a = msg("msg_d1_1_aa", 200, vc(&[("d1", 2)]));
        let b = msg("msg_d2_2_bb", 100, vc(&[("d2", 2)]));
        assert_eq!(resolver.resolve(&a, &b), ConflictWinner::Local);

        let a = msg("msg_d1_1_aa", 100, vc(&[("d1", 2)]));
        let b = msg("msg_d2_2_bb", 100, vc(&[("d2", 2)]));
        // Same sum, same timestamp: d2 > d1 lexicographically
        assert_eq!(resolver.resolve(&a, &b), ConflictWinner::Remote);
    }

    #[test]
    fn test_resolution_is_symmetric_across_replicas() {
        let resolver = ConflictResolver::new(ResolutionStrategy::VectorClock);
        let a = msg("msg_d1_5_aa", 123, vc(&[("d1", 2), ("d2", 1)]));
        let b = msg("msg_d2_7_bb", 456, vc(&[("d1", 1), ("d2", 2)]));

        // Replica 1 holds a locally; replica 2 holds b locally. Same winner.
        let replica1 = resolver.resolve(&a, &b);
        let replica2 = resolver.resolve(&b, &a);
        let winner_is_a_on_1 = replica1 == ConflictWinner::Local;
        let winner_is_a_on_2 = replica2 == ConflictWinner::Remote;
        assert_eq!(winner_is_a_on_1, winner_is_a_on_2);
    }

    #[test]
    fn test_merge_falls_back_to_vector_clock() {
        let merge = ConflictResolver::new(ResolutionStrategy::Merge);
        let vclock = ConflictResolver::new(ResolutionStrategy::VectorClock);
        let a = msg("msg_d1_1_aa", 100, vc(&[("d1", 2)]));
        let b = msg("msg_d2_2_bb", 200, vc(&[("d2", 3)]));
        assert_eq!(merge.resolve(&a, &b), vclock.resolve(&a, &b));
    }
}
