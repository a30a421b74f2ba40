//! Desired and acknowledged room membership.
//!
//! The desired set survives reconnects and is replayed on every `Connected`
//! transition. The acknowledged set mirrors what the server confirmed for the
//! current generation and is cleared when that generation ends.

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Rooms {
    desired: Vec<String>,
    acknowledged: HashSet<String>,
}

/// Thread-safe room membership.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: Mutex<Rooms>,
}

impl RoomRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `room` to the desired set. Returns `false` if already present.
    pub fn join(&self, room: &str) -> bool {
        let mut rooms = self.inner.lock();
        if rooms.desired.iter().any(|r| r == room) {
            return false;
        }
        rooms.desired.push(room.to_owned());
        true
    }

    /// Remove `room` from the desired set. Returns `false` if absent.
    pub fn leave(&self, room: &str) -> bool {
        let mut rooms = self.inner.lock();
        let before = rooms.desired.len();
        rooms.desired.retain(|r| r != room);
        let _ = rooms.acknowledged.remove(room);
        rooms.desired.len() != before
    }

    /// Desired rooms in insertion order, copied out so callers iterate
    /// without holding the lock.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().desired.clone()
    }

    /// Whether `room` is desired.
    pub fn contains(&self, room: &str) -> bool {
        self.inner.lock().desired.iter().any(|r| r == room)
    }

    /// Number of desired rooms.
    pub fn len(&self) -> usize {
        self.inner.lock().desired.len()
    }

    /// Whether no room is desired.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().desired.is_empty()
    }

    /// Record a server `room_joined`.
    pub fn mark_acknowledged(&self, room: &str) {
        let _ = self.inner.lock().acknowledged.insert(room.to_owned());
    }

    /// Record a server `room_left`.
    pub fn mark_released(&self, room: &str) {
        let _ = self.inner.lock().acknowledged.remove(room);
    }

    /// Whether the server confirmed `room` in the current generation.
    pub fn is_acknowledged(&self, room: &str) -> bool {
        self.inner.lock().acknowledged.contains(room)
    }

    /// Forget all confirmations. Called when a generation ends.
    pub fn clear_acknowledged(&self) {
        self.inner.lock().acknowledged.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn join_keeps_insertion_order_and_ignores_duplicates() {
        let rooms = RoomRegistry::new();
        assert!(rooms.join("b"));
        assert!(rooms.join("a"));
        assert!(!rooms.join("b"));
        assert_eq!(rooms.snapshot(), vec!["b", "a"]);
        assert_eq!(rooms.len(), 2);
    }

    #[test]
    fn leave_removes_desired_and_ack() {
        let rooms = RoomRegistry::new();
        let _ = rooms.join("r1");
        rooms.mark_acknowledged("r1");
        assert!(rooms.leave("r1"));
        assert!(!rooms.leave("r1"));
        assert!(!rooms.contains("r1"));
        assert!(!rooms.is_acknowledged("r1"));
        assert!(rooms.is_empty());
    }

    #[test]
    fn acknowledgements_are_per_generation() {
        let rooms = RoomRegistry::new();
        let _ = rooms.join("r1");
        rooms.mark_acknowledged("r1");
        assert!(rooms.is_acknowledged("r1"));
        rooms.clear_acknowledged();
        assert!(!rooms.is_acknowledged("r1"));
        assert!(rooms.contains("r1"));

        rooms.mark_acknowledged("r1");
        rooms.mark_released("r1");
        assert!(!rooms.is_acknowledged("r1"));
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let rooms = RoomRegistry::new();
        let _ = rooms.join("r1");
        let snapshot = rooms.snapshot();
        let _ = rooms.join("r2");
        let _ = rooms.leave("r1");
        assert_eq!(snapshot, vec!["r1"]);
    }

    #[test]
    fn concurrent_mutation() {
        let rooms = Arc::new(RoomRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let rooms = Arc::clone(&rooms);
                thread::spawn(move || {
                    for i in 0..100 {
                        let _ = rooms.join(&format!("room-{}", i % 10));
                        let _ = rooms.snapshot();
                        if t % 2 == 0 {
                            let _ = rooms.leave(&format!("room-{}", (i + 5) % 10));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = rooms.snapshot();
        let unique: HashSet<_> = snapshot.iter().collect();
        assert_eq!(unique.len(), snapshot.len());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Leave(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..8).prop_map(Op::Join), (0u8..8).prop_map(Op::Leave)]
    }

    proptest! {
        #[test]
        fn snapshot_matches_a_simple_model(ops in proptest::collection::vec(op(), 0..64)) {
            let rooms = RoomRegistry::new();
            let mut model: Vec<String> = Vec::new();
            for op in ops {
                match op {
                    Op::Join(n) => {
                        let room = format!("room-{n}");
                        let added = rooms.join(&room);
                        prop_assert_eq!(added, !model.contains(&room));
                        if added {
                            model.push(room);
                        }
                    }
                    Op::Leave(n) => {
                        let room = format!("room-{n}");
                        let removed = rooms.leave(&room);
                        prop_assert_eq!(removed, model.contains(&room));
                        model.retain(|r| r != &room);
                    }
                }
            }
            prop_assert_eq!(rooms.snapshot(), model);
        }
    }
}
