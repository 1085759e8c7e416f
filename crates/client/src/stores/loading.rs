//! Registry of event ids with a subscribe/unsubscribe request in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Set of pending event ids, observable through a watch channel.
///
/// Each registration gets a ticket. Only the holder of the latest ticket for
/// an id can clear it, so an older request settling late never hides a newer
/// one that is still pending.
#[derive(Clone)]
pub struct LoadingRegistry {
    pending: Arc<watch::Sender<BTreeMap<i64, u64>>>,
    next_ticket: Arc<AtomicU64>,
}

impl Default for LoadingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self {
            pending: Arc::new(tx),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mark `event_id` as in flight and return the ticket that clears it.
    pub fn begin(&self, event_id: i64) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.pending.send_modify(|pending| {
            pending.insert(event_id, ticket);
        });
        ticket
    }

    /// Clear `event_id` if `ticket` is still the latest registration for it.
    ///
    /// Returns `false` when a newer request for the same id took over.
    pub fn finish(&self, event_id: i64, ticket: u64) -> bool {
        self.pending.send_if_modified(|pending| {
            if pending.get(&event_id) == Some(&ticket) {
                pending.remove(&event_id);
                true
            } else {
                false
            }
        })
    }

    pub fn contains(&self, event_id: i64) -> bool {
        self.pending.borrow().contains_key(&event_id)
    }

    pub fn ids(&self) -> BTreeSet<i64> {
        self.pending.borrow().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.pending.send_if_modified(|pending| {
            let changed = !pending.is_empty();
            pending.clear();
            changed
        });
    }

    /// Observe registry changes.
    pub fn watch(&self) -> watch::Receiver<BTreeMap<i64, u64>> {
        self.pending.subscribe()
    }
}
