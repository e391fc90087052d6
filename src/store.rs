use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::models::Snapshot;

/// Applied-sequence value once a domain has been stopped. Every later
/// completion compares below it and is discarded.
const STOPPED: u64 = u64::MAX;

/// Per-domain publication point. Holds the current snapshot and the sequence
/// gate deciding which fetch completions may replace it.
pub(crate) struct DomainSlot {
    tx: watch::Sender<Arc<Snapshot>>,
    next_seq: AtomicU64,
    applied: Mutex<u64>,
}

impl DomainSlot {
    fn new(domain: &str) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::empty(domain)));
        Self {
            tx,
            next_seq: AtomicU64::new(1),
            applied: Mutex::new(0),
        }
    }

    /// Hands out the sequence number for a new fetch.
    pub(crate) fn issue(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Replaces the snapshot with `build(current)` unless `seq` is not newer
    /// than the last applied completion (or the domain is stopped).
    pub(crate) fn apply<F>(&self, seq: u64, build: F) -> bool
    where
        F: FnOnce(&Snapshot) -> Snapshot,
    {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if seq <= *applied {
            return false;
        }
        let next = build(&self.tx.borrow());
        *applied = seq;
        self.tx.send_replace(Arc::new(next));
        true
    }

    pub(crate) fn close(&self) {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = STOPPED;
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) == STOPPED
    }

    fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

/// Read side of the engine: the latest snapshot per domain, swapped whole.
/// Cloning is cheap and every clone sees the same domains.
#[derive(Clone)]
pub struct SnapshotStore {
    slots: Arc<HashMap<String, Arc<DomainSlot>>>,
}

impl SnapshotStore {
    pub(crate) fn new<'a>(domains: impl IntoIterator<Item = &'a str>) -> Self {
        let slots = domains
            .into_iter()
            .map(|name| (name.to_string(), Arc::new(DomainSlot::new(name))))
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    pub(crate) fn slot(&self, domain: &str) -> Option<Arc<DomainSlot>> {
        self.slots.get(domain).cloned()
    }

    pub fn snapshot(&self, domain: &str) -> Option<Arc<Snapshot>> {
        self.slots.get(domain).map(|slot| slot.current())
    }

    pub fn subscribe(&self, domain: &str) -> Option<watch::Receiver<Arc<Snapshot>>> {
        self.slots.get(domain).map(|slot| slot.subscribe())
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_seq(seq: u64) -> impl FnOnce(&Snapshot) -> Snapshot {
        move |current| Snapshot {
            seq,
            stale: false,
            ..current.clone()
        }
    }

    #[test]
    fn starts_empty_and_stale() {
        let store = SnapshotStore::new(["live-sessions"]);
        let snap = store.snapshot("live-sessions").unwrap();
        assert_eq!(snap.seq, 0);
        assert!(snap.stale);
        assert!(snap.aggregates.is_empty());
        assert!(store.snapshot("unknown").is_none());
    }

    #[test]
    fn late_completion_with_lower_sequence_is_discarded() {
        let store = SnapshotStore::new(["live-sessions"]);
        let slot = store.slot("live-sessions").unwrap();
        assert!(slot.apply(6, with_seq(6)));
        assert!(!slot.apply(5, with_seq(5)));
        assert_eq!(store.snapshot("live-sessions").unwrap().seq, 6);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let store = SnapshotStore::new(["d"]);
        let slot = store.slot("d").unwrap();
        let a = slot.issue();
        let b = slot.issue();
        assert!(b > a);
    }

    #[test]
    fn closing_blocks_all_further_writes() {
        let store = SnapshotStore::new(["d"]);
        let slot = store.slot("d").unwrap();
        let seq = slot.issue();
        slot.close();
        slot.close();
        assert!(slot.is_closed());
        assert!(!slot.apply(seq, with_seq(seq)));
        assert_eq!(store.snapshot("d").unwrap().seq, 0);
    }

    #[test]
    fn readers_keep_their_view_after_a_swap() {
        let store = SnapshotStore::new(["d"]);
        let slot = store.slot("d").unwrap();
        let before = store.snapshot("d").unwrap();
        let mut rx = store.subscribe("d").unwrap();
        slot.apply(1, with_seq(1));
        assert_eq!(before.seq, 0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().seq, 1);
    }
}
