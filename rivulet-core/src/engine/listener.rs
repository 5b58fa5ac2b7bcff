//! Listener Registry
//!
//! Subscriptions live here: a sharded map from target to listener entries,
//! shared between the engine (which registers, unregisters, and cleans up
//! after destroyed instances) and the dispatcher thread (which delivers).
//!
//! # Unsubscribe Guarantees
//!
//! Once `unsubscribe` returns, the callback will not run again. Two pieces
//! cooperate:
//!
//! - an `alive` flag, checked under the entry's delivery lock right before
//!   the callback runs, stops every delivery that has not started yet;
//! - the delivery lock itself lets the unsubscriber wait out a callback
//!   already in flight on the dispatcher thread. The engine skips that wait
//!   when unsubscribe is called *from* the dispatcher thread (i.e. from
//!   inside a callback), where the in-flight delivery is the caller itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::engine::dispatch::NodeEvent;
use crate::graph::{EngineId, Target};

/// Identifies one subscription within its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(u64);

/// Returned by `subscribe`; pass to `unsubscribe` to stop deliveries.
#[derive(Debug, Clone, Copy)]
pub struct ListenerHandle {
    pub(crate) engine: EngineId,
    pub(crate) id: ListenerId,
}

type Callback = Box<dyn Fn(&NodeEvent) + Send + Sync>;

pub(crate) struct ListenerEntry {
    target: Target,
    callback: Callback,
    /// First pass batch this listener may receive. Batches fenced before
    /// registration are already reflected in the catch-up event.
    pub(crate) min_seq: u64,
    alive: AtomicBool,
    /// Held for the duration of each callback invocation.
    delivering: Mutex<()>,
}

impl ListenerEntry {
    /// Invoke the callback unless the listener has been unsubscribed.
    pub(crate) fn deliver(&self, event: &NodeEvent) {
        let _in_flight = self.delivering.lock();
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        (self.callback)(event);
    }

    /// Block until no delivery is in flight. Only meaningful after the
    /// entry has been killed; must not be called on the dispatcher thread.
    pub(crate) fn wait_out_delivery(&self) {
        drop(self.delivering.lock());
    }
}

/// All subscriptions of one engine.
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: DashMap<ListenerId, Arc<ListenerEntry>>,
    by_target: DashMap<Target, SmallVec<[ListenerId; 2]>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        ListenerRegistry {
            next_id: AtomicU64::new(0),
            entries: DashMap::new(),
            by_target: DashMap::new(),
        }
    }

    pub(crate) fn register(
        &self,
        target: Target,
        callback: Callback,
        min_seq: u64,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(ListenerEntry {
            target: target.clone(),
            callback,
            min_seq,
            alive: AtomicBool::new(true),
            delivering: Mutex::new(()),
        });
        self.entries.insert(id, entry);
        self.by_target.entry(target).or_default().push(id);
        id
    }

    /// Snapshot the entries listening to one target. Cloned out so no map
    /// shard stays locked while callbacks run.
    pub(crate) fn listeners_for(&self, target: &Target) -> SmallVec<[Arc<ListenerEntry>; 2]> {
        let ids = match self.by_target.get(target) {
            Some(ids) => ids.clone(),
            None => return SmallVec::new(),
        };
        ids.iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.value().clone()))
            .collect()
    }

    pub(crate) fn get(&self, id: ListenerId) -> Option<Arc<ListenerEntry>> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    /// Kill and remove one listener. Idempotent; returns the entry so the
    /// caller can wait out an in-flight delivery.
    pub(crate) fn remove(&self, id: ListenerId) -> Option<Arc<ListenerEntry>> {
        let (_, entry) = self.entries.remove(&id)?;
        entry.alive.store(false, Ordering::Release);
        if let Some(mut ids) = self.by_target.get_mut(&entry.target) {
            ids.retain(|other| *other != id);
        }
        Some(entry)
    }

    /// Kill every listener bound to a destroyed target.
    pub(crate) fn remove_target(&self, target: &Target) {
        let ids = match self.by_target.remove(target) {
            Some((_, ids)) => ids,
            None => return,
        };
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.alive.store(false, Ordering::Release);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
