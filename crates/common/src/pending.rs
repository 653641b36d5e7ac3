//! The pending-request table.
//!
//! Maps an in-flight submit's `seqnum` to the raw endpoint it targets, so
//! that a later CMD_UNLINK can find and cancel it, and so that a completing
//! URB can be routed back to the endpoint reply queue it belongs to. The
//! table is the single source of truth for "has this request already been
//! resolved" — completion and unlink race to remove the same entry, and
//! exactly one of them wins (spec.md §4.6).
//!
//! Kept deliberately synchronous: lookups and removals are single
//! `HashMap` operations under a `std::sync::Mutex`, never held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::Mutex;

/// The raw endpoint (device + direction + endpoint number) a pending
/// submit targets, packed the way the basic header carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEndpoint {
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

/// Outcome of racing a completion against an unlink for the same seqnum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// This caller is the first (and only) one to observe the entry; it
    /// owns sending the reply.
    Removed(RawEndpoint),
    /// Someone already removed this seqnum; this caller has nothing to do.
    AlreadyGone,
}

#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<u32, RawEndpoint>>,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a submit as pending. Returns `false` if `seqnum` was
    /// already registered (a protocol violation: the client reused a
    /// seqnum that hasn't been retired yet).
    pub fn insert(&self, seqnum: u32, endpoint: RawEndpoint) -> bool {
        let mut table = self.inner.lock().expect("pending table poisoned");
        match table.entry(seqnum) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(endpoint);
                true
            }
        }
    }

    /// Remove `seqnum`, reporting whether this call is the one that
    /// actually took it out of the table. Both the URB-completion path
    /// and the UNLINK path call this with the same seqnum; exactly one
    /// gets `Removed`.
    pub fn remove(&self, seqnum: u32) -> RemoveOutcome {
        let mut table = self.inner.lock().expect("pending table poisoned");
        match table.remove(&seqnum) {
            Some(endpoint) => RemoveOutcome::Removed(endpoint),
            None => RemoveOutcome::AlreadyGone,
        }
    }

    /// Look up the endpoint for a pending seqnum without removing it.
    pub fn peek(&self, seqnum: u32) -> Option<RawEndpoint> {
        let table = self.inner.lock().expect("pending table poisoned");
        table.get(&seqnum).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(n: u32) -> RawEndpoint {
        RawEndpoint {
            devid: 1,
            direction: 0,
            ep: n,
        }
    }

    #[test]
    fn insert_then_remove_roundtrips() {
        let table = PendingTable::new();
        assert!(table.insert(1, ep(2)));
        assert_eq!(table.remove(1), RemoveOutcome::Removed(ep(2)));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_seqnum_is_rejected() {
        let table = PendingTable::new();
        assert!(table.insert(1, ep(2)));
        assert!(!table.insert(1, ep(3)));
    }

    #[test]
    fn second_remove_sees_already_gone() {
        let table = PendingTable::new();
        table.insert(5, ep(1));
        assert_eq!(table.remove(5), RemoveOutcome::Removed(ep(1)));
        assert_eq!(table.remove(5), RemoveOutcome::AlreadyGone);
    }

    #[test]
    fn unknown_seqnum_is_already_gone() {
        let table = PendingTable::new();
        assert_eq!(table.remove(404), RemoveOutcome::AlreadyGone);
    }

    #[test]
    fn peek_does_not_consume() {
        let table = PendingTable::new();
        table.insert(9, ep(4));
        assert_eq!(table.peek(9), Some(ep(4)));
        assert_eq!(table.peek(9), Some(ep(4)));
        assert_eq!(table.remove(9), RemoveOutcome::Removed(ep(4)));
        assert_eq!(table.peek(9), None);
    }

    #[test]
    fn completion_unlink_race_has_exactly_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(PendingTable::new());
        table.insert(1, ep(1));

        let a = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.remove(1))
        };
        let b = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.remove(1))
        };

        let results = [a.join().unwrap(), b.join().unwrap()];
        let removed_count = results
            .iter()
            .filter(|r| matches!(r, RemoveOutcome::Removed(_)))
            .count();
        let gone_count = results
            .iter()
            .filter(|r| matches!(r, RemoveOutcome::AlreadyGone))
            .count();
        assert_eq!(removed_count, 1);
        assert_eq!(gone_count, 1);
    }
}
