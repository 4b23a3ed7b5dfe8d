//! Vector-clock algebra: per-peer logical counters used to detect causal
//! order between writes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

/// The result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Equal,
    Before,
    After,
    Concurrent,
}

/// A mapping from peer id to a monotonically non-decreasing counter.
/// Peers absent from the map are implicitly at counter zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a single peer's counter (zero if absent).
    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// Returns a new clock with `peer`'s counter incremented by one.
    pub fn increment(&self, peer: &str) -> Self {
        let mut next = self.clone();
        let entry = next.counters.entry(peer.to_string()).or_insert(0);
        *entry += 1;
        next
    }

    /// Element-wise maximum of two clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.counters.clone();
        for (peer, &count) in &other.counters {
            let entry = merged.entry(peer.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        Self { counters: merged }
    }

    /// Compares two clocks under the standard element-wise partial order.
    pub fn compare(&self, other: &Self) -> Ordering {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut peers: std::collections::HashSet<&String> = self.counters.keys().collect();
        peers.extend(other.counters.keys());

        for peer in peers {
            let a = self.get(peer);
            let b = other.get(peer);
            match a.cmp(&b) {
                CmpOrdering::Greater => self_greater = true,
                CmpOrdering::Less => other_greater = true,
                CmpOrdering::Equal => {}
            }
        }

        match (self_greater, other_greater) {
            (false, false) => Ordering::Equal,
            (true, false) => Ordering::After,
            (false, true) => Ordering::Before,
            (true, true) => Ordering::Concurrent,
        }
    }

    /// True iff `self` strictly happened before `other`.
    pub fn happens_before(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ordering::Before)
    }

    /// True iff `self` dominates (happened after or equals) `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ordering::After | Ordering::Equal)
    }

    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ordering::Concurrent)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock_from(pairs: &[(&str, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (peer, n) in pairs {
            for _ in 0..*n {
                c = c.increment(peer);
            }
        }
        c
    }

    #[test]
    fn compare_equal() {
        let v = clock_from(&[("a", 2), ("b", 1)]);
        assert_eq!(v.compare(&v), Ordering::Equal);
    }

    #[test]
    fn compare_before_after() {
        let v1 = clock_from(&[("a", 1)]);
        let v2 = v1.increment("a");
        assert_eq!(v1.compare(&v2), Ordering::Before);
        assert_eq!(v2.compare(&v1), Ordering::After);
    }

    #[test]
    fn compare_concurrent() {
        let v1 = clock_from(&[("a", 1)]);
        let v2 = clock_from(&[("b", 1)]);
        assert_eq!(v1.compare(&v2), Ordering::Concurrent);
    }

    #[test]
    fn missing_keys_are_zero() {
        let v1 = VectorClock::new();
        let v2 = clock_from(&[("a", 1)]);
        assert_eq!(v1.get("a"), 0);
        assert_eq!(v1.compare(&v2), Ordering::Before);
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::hash_map("[a-c]", 0u64..5, 0..3)
            .prop_map(|m| {
                let mut c = VectorClock::new();
                for (peer, n) in m {
                    for _ in 0..n {
                        c = c.increment(&peer);
                    }
                }
                c
            })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn merge_is_idempotent(a in arb_clock()) {
            prop_assert_eq!(a.merge(&a), a.clone());
        }

        #[test]
        fn merge_is_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        }

        #[test]
        fn compare_is_total(a in arb_clock(), b in arb_clock()) {
            let result = a.compare(&b);
            let reciprocal = b.compare(&a);
            match result {
                Ordering::Equal => prop_assert_eq!(reciprocal, Ordering::Equal),
                Ordering::Before => prop_assert_eq!(reciprocal, Ordering::After),
                Ordering::After => prop_assert_eq!(reciprocal, Ordering::Before),
                Ordering::Concurrent => prop_assert_eq!(reciprocal, Ordering::Concurrent),
            }
        }
    }
}
