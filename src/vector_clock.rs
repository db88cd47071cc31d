//! Vector-clock manager (spec §4.2): per-node logical time, merge-on-receive,
//! and causal comparison. Grounded on `infrastructure::replication::VectorClock`
//! in the teacher and `coordinator/vector_clock.py` in the original source.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// A mapping from node id to logical time. Missing keys read as zero;
/// two clocks produced by independent observers need not share a key set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    pub clocks: HashMap<String, u64>,
}

/// The causal relationship between two vector clocks (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockComparison {
    Before,
    After,
    Equal,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self { clocks: HashMap::new() }
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.clocks.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Elementwise max with `other`, mutating self in place.
    pub fn merge_max(&mut self, other: &VectorClock) {
        for (node_id, value) in &other.clocks {
            let entry = self.clocks.entry(node_id.clone()).or_insert(0);
            *entry = (*entry).max(*value);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockComparison {
        let mut nodes: HashSet<&str> = self.clocks.keys().map(|s| s.as_str()).collect();
        nodes.extend(other.clocks.keys().map(|s| s.as_str()));

        let mut a_gt = false;
        let mut b_gt = false;
        for node in nodes {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                a_gt = true;
            } else if b > a {
                b_gt = true;
            }
        }

        match (a_gt, b_gt) {
            (false, false) => ClockComparison::Equal,
            (true, false) => ClockComparison::After,
            (false, true) => ClockComparison::Before,
            (true, true) => ClockComparison::Concurrent,
        }
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockComparison::Concurrent
    }
}

/// Anything that needs to be sorted in causal order must expose these two
/// fields; `causal_sort` and `detect_conflicts` work against the trait so
/// the event bus (§4.5) and tests can feed in their own record types.
pub trait CausalEvent {
    fn vector_clock(&self) -> &VectorClock;
    fn timestamp_millis(&self) -> i64;
    fn event_id(&self) -> &str;
}

/// Maintains `node_clocks: node_id -> VectorClock` and the set of known
/// node ids (spec §4.2). Readers obtain a snapshot (clone) under the lock;
/// no suspension point is ever reached while the lock is held.
#[derive(Debug, Default)]
pub struct VectorClockManager {
    node_clocks: RwLock<HashMap<String, VectorClock>>,
}

impl VectorClockManager {
    pub fn new() -> Self {
        Self { node_clocks: RwLock::new(HashMap::new()) }
    }

    /// Adds `node_id` to the known set, initializes its own clock to
    /// `{node_id: 1, ...others: 0}`, and extends every other node's clock
    /// with `node_id: 0`. Idempotent: re-registering returns the existing
    /// clock unchanged.
    pub fn register(&self, node_id: &str) -> VectorClock {
        let mut clocks = self.node_clocks.write().unwrap();
        if let Some(existing) = clocks.get(node_id) {
            return existing.clone();
        }

        let mut new_clock = VectorClock::new();
        for existing_id in clocks.keys() {
            new_clock.clocks.insert(existing_id.clone(), 0);
        }
        new_clock.increment(node_id);

        for clock in clocks.values_mut() {
            clock.clocks.entry(node_id.to_string()).or_insert(0);
        }

        clocks.insert(node_id.to_string(), new_clock.clone());
        new_clock
    }

    /// Increments `node_clocks[node_id][node_id]`. Used when that node
    /// originates an event. Registers the node first if unknown.
    pub fn increment_local(&self, node_id: &str) -> VectorClock {
        let mut clocks = self.node_clocks.write().unwrap();
        let clock = clocks.entry(node_id.to_string()).or_insert_with(VectorClock::new);
        clock.increment(node_id);
        clock.clone()
    }

    /// Elementwise max of receiver and sender, then increments the
    /// receiver's own entry by 1.
    pub fn merge_on_receive(&self, receiver_id: &str, sender_clock: &VectorClock) -> VectorClock {
        let mut clocks = self.node_clocks.write().unwrap();
        let clock = clocks.entry(receiver_id.to_string()).or_insert_with(VectorClock::new);
        clock.merge_max(sender_clock);
        clock.increment(receiver_id);
        clock.clone()
    }

    pub fn get_clock(&self, node_id: &str) -> Option<VectorClock> {
        self.node_clocks.read().unwrap().get(node_id).cloned()
    }

    pub fn compare(&self, a: &VectorClock, b: &VectorClock) -> ClockComparison {
        a.compare(b)
    }

    pub fn known_nodes(&self) -> Vec<String> {
        self.node_clocks.read().unwrap().keys().cloned().collect()
    }

    pub fn remove_node(&self, node_id: &str) {
        self.node_clocks.write().unwrap().remove(node_id);
    }

    /// Total order obtained by `compare`; concurrent pairs are broken by
    /// physical timestamp then event_id (deterministic, total).
    pub fn causal_sort<T: CausalEvent>(&self, mut events: Vec<T>) -> Vec<T> {
        events.sort_by(|a, b| match a.vector_clock().compare(b.vector_clock()) {
            ClockComparison::Before => std::cmp::Ordering::Less,
            ClockComparison::After => std::cmp::Ordering::Greater,
            ClockComparison::Equal => a
                .timestamp_millis()
                .cmp(&b.timestamp_millis())
                .then_with(|| a.event_id().cmp(b.event_id())),
            ClockComparison::Concurrent => a
                .timestamp_millis()
                .cmp(&b.timestamp_millis())
                .then_with(|| a.event_id().cmp(b.event_id())),
        });
        events
    }

    /// Returns pairs of events whose clocks are `concurrent`, restricted to
    /// the supplied window (already filtered to a single `file_id` by the
    /// caller).
    pub fn detect_conflicts<T: CausalEvent>(&self, events_window: &[T]) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..events_window.len() {
            for j in (i + 1)..events_window.len() {
                if events_window[i].vector_clock().is_concurrent_with(events_window[j].vector_clock()) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_twice_is_idempotent() {
        let mgr = VectorClockManager::new();
        let first = mgr.register("n1");
        let second = mgr.register("n1");
        assert_eq!(first, second);
        assert_eq!(first.get("n1"), 1);
    }

    #[test]
    fn register_extends_existing_clocks() {
        let mgr = VectorClockManager::new();
        mgr.register("n1");
        mgr.register("n2");
        let n1_clock = mgr.get_clock("n1").unwrap();
        assert_eq!(n1_clock.get("n2"), 0);
        let n2_clock = mgr.get_clock("n2").unwrap();
        assert_eq!(n2_clock.get("n1"), 0);
        assert_eq!(n2_clock.get("n2"), 1);
    }

    #[test]
    fn increment_local_strictly_increases() {
        let mgr = VectorClockManager::new();
        mgr.register("n1");
        let before = mgr.get_clock("n1").unwrap().get("n1");
        let after = mgr.increment_local("n1").get("n1");
        assert!(after > before);
    }

    #[test]
    fn compare_is_total_and_antisymmetric() {
        let mut a = VectorClock::new();
        a.clocks.insert("n1".into(), 2);
        let mut b = VectorClock::new();
        b.clocks.insert("n1".into(), 1);

        assert_eq!(a.compare(&b), ClockComparison::After);
        assert_eq!(b.compare(&a), ClockComparison::Before);
        assert_eq!(a.compare(&a), ClockComparison::Equal);
    }

    #[test]
    fn concurrent_when_neither_dominates() {
        let mut a = VectorClock::new();
        a.clocks.insert("n1".into(), 1);
        let mut b = VectorClock::new();
        b.clocks.insert("n2".into(), 1);

        assert_eq!(a.compare(&b), ClockComparison::Concurrent);
        assert!(a.is_concurrent_with(&b));
    }

    #[test]
    fn merge_on_receive_dominates_sender() {
        let mgr = VectorClockManager::new();
        mgr.register("n1");
        mgr.register("n2");

        let mut sender_clock = VectorClock::new();
        sender_clock.clocks.insert("n2".into(), 5);

        let merged = mgr.merge_on_receive("n1", &sender_clock);
        assert!(merged.get("n2") >= sender_clock.get("n2"));
        assert!(merged.get("n1") >= 1);
    }
}
