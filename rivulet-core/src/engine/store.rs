//! Node Store
//!
//! The committed value table: one slot per target, the group membership
//! table behind keyed instances, and the engine clock.
//!
//! # How Commits Work
//!
//! A recompute pass never writes here directly. It buffers its slot writes,
//! instance removals, and membership updates in a [`StoreDelta`] and applies
//! the whole thing with [`Store::apply`] under one exclusive lock
//! acquisition. Readers holding the shared lock therefore see either the
//! full pre-pass state or the full post-pass state, never a half-committed
//! mix, and the clock advances in the same acquisition as the slots it
//! stamps.

use indexmap::IndexMap;

use crate::graph::{GroupId, NodeId, Target};
use crate::value::{KeyList, Timestamp, ValueSlot};

/// Committed engine state: value slots, keyed membership, and the clock.
pub(crate) struct Store {
    /// Value slot per target. Unset slots are simply absent.
    slots: IndexMap<Target, ValueSlot>,
    /// Committed key membership per group, in key order.
    memberships: IndexMap<GroupId, KeyList>,
    /// Timestamp of the last pass that changed anything.
    clock: Timestamp,
}

/// Buffered writes from one recompute pass.
#[derive(Default)]
pub(crate) struct StoreDelta {
    /// Slots written this pass, including keyed instances and aggregates.
    pub(crate) writes: IndexMap<Target, ValueSlot>,
    /// Instance slots destroyed by key removal.
    pub(crate) removals: Vec<Target>,
    /// Groups whose membership changed, with the new key order.
    pub(crate) memberships: IndexMap<GroupId, KeyList>,
}

impl StoreDelta {
    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.removals.is_empty() && self.memberships.is_empty()
    }
}

impl Store {
    pub(crate) fn new() -> Self {
        Store {
            slots: IndexMap::new(),
            memberships: IndexMap::new(),
            clock: Timestamp::ZERO,
        }
    }

    /// Timestamp of the last committed change.
    pub(crate) fn now(&self) -> Timestamp {
        self.clock
    }

    pub(crate) fn slot(&self, target: &Target) -> Option<&ValueSlot> {
        self.slots.get(target)
    }

    /// The slot for a target, `Unset` when nothing has been committed.
    pub(crate) fn lookup(&self, target: &Target) -> ValueSlot {
        self.slots.get(target).cloned().unwrap_or(ValueSlot::Unset)
    }

    /// Committed key membership of a group, empty before its first pass.
    pub(crate) fn membership(&self, group: GroupId) -> KeyList {
        self.memberships.get(&group).cloned().unwrap_or_default()
    }

    /// Whether an instance address currently exists: its key is a member of
    /// the group's committed key list, even if the instance has no value yet.
    pub(crate) fn instance_exists(&self, target: &Target) -> bool {
        match target {
            Target::Instance(group, key) => self
                .memberships
                .get(group)
                .map(|keys| keys.contains(key))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Seed a key-list input with the empty list at timestamp zero, so the
    /// list is readable before any transaction touches it.
    pub(crate) fn seed_key_list(&mut self, node: NodeId) {
        self.slots.insert(
            Target::Node(node),
            ValueSlot::Ok {
                value: crate::value::Payload::new(KeyList::default()),
                timestamp: Timestamp::ZERO,
            },
        );
    }

    /// Commit one pass: apply every buffered write and advance the clock.
    pub(crate) fn apply(&mut self, delta: StoreDelta, clock: Timestamp) {
        for target in &delta.removals {
            self.slots.shift_remove(target);
        }
        for (target, slot) in delta.writes {
            self.slots.insert(target, slot);
        }
        for (group, keys) in delta.memberships {
            self.memberships.insert(group, keys);
        }
        self.clock = clock;
    }
}
