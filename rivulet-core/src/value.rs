//! Values, Keys, and Timestamps
//!
//! This module defines the leaf vocabulary of the engine: the logical clock,
//! the type-erased payloads carried by nodes, the keys that parameterize
//! keyed groups, and the tri-state value slot the store holds per node.
//!
//! # Type Erasure
//!
//! Payload types are opaque to the engine. A [`Payload`] is a shared
//! `Arc<dyn Any>` handle tagged with its type name for diagnostics; the
//! equality capability needed for value-based cutoff is not stored here but
//! captured per node at declaration time. Keys get the same treatment plus
//! dynamic `Eq`/`Hash`, so key lists can hold any sensible key type while
//! the engine compares keys strictly by value.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

/// A per-engine logical clock value: the number of the pass that last
/// changed something.
///
/// Timestamps are engine-local. They start at [`Timestamp::ZERO`] and bump
/// by one for every pass that changes at least one value; a pass in which
/// every recompute cut off leaves the clock untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub(crate) i64);

impl Timestamp {
    /// The reserved catch-up sentinel delivered with a listener's initial
    /// event, ordered before every real pass number.
    pub const CATCH_UP: Timestamp = Timestamp(-1);

    /// The clock of an engine that has not committed a changing pass yet.
    pub const ZERO: Timestamp = Timestamp(0);

    /// The number the next changing pass will commit under.
    pub(crate) fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }

    /// Whether this is the catch-up sentinel rather than a real pass number.
    pub fn is_catch_up(self) -> bool {
        self.0 < 0
    }

    /// Raw counter value.
    pub fn raw(self) -> i64 {
        self.0
    }
}

/// A type-erased, shared value produced by an input setter or a compute
/// function.
///
/// Cloning a payload clones the handle, not the value. The concrete type is
/// recovered by the collaborator that declared the node, via
/// [`Payload::downcast_ref`].
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a concrete value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Payload {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the concrete value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Clone the concrete value out of the handle, if it is a `T`.
    pub fn extract<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// The concrete type's name, for error messages.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// `TypeId` of the wrapped value (not of the `Arc` handle).
    pub(crate) fn inner_type_id(&self) -> std::any::TypeId {
        let value: &(dyn Any + Send + Sync) = self.value.as_ref();
        value.type_id()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.type_name)
            .finish()
    }
}

/// Object-safe facet of key types. Implemented for every
/// `Eq + Hash + Debug + Send + Sync` type via the blanket impl below.
trait DynKey: Any + Send + Sync {
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn dyn_type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<K> DynKey for K
where
    K: Any + Eq + Hash + fmt::Debug + Send + Sync,
{
    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        other.as_any().downcast_ref::<K>() == Some(self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }

    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }

    fn dyn_type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type-erased key naming one instance of a keyed group.
///
/// Keys are compared by value equality (two keys of different concrete
/// types are never equal), never by identity.
#[derive(Clone)]
pub struct Key(Arc<dyn DynKey>);

impl Key {
    /// Wrap a concrete key.
    pub fn new<K>(key: K) -> Self
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        Key(Arc::new(key))
    }

    /// Borrow the concrete key, if it is a `K`.
    pub fn downcast_ref<K: Any>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }

    pub(crate) fn type_name_of(&self) -> &'static str {
        self.0.dyn_type_name()
    }

    /// The `TypeId` of the wrapped key, not of the wrapper.
    pub(crate) fn inner_type_id(&self) -> std::any::TypeId {
        self.0.as_any().type_id()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dyn_debug(f)
    }
}

/// The payload of a key-list node: an insertion-ordered set of keys.
///
/// Duplicates are dropped on entry (first occurrence keeps its position),
/// removing a key forfeits its position, and wholesale replacement resets
/// the order. Equality is order-sensitive: a reorder counts as a change so
/// that full outputs downstream rebuild in the new order.
#[derive(Clone, Debug, Default)]
pub struct KeyList {
    keys: IndexSet<Key>,
}

impl KeyList {
    /// The empty key list.
    pub fn new() -> Self {
        KeyList {
            keys: IndexSet::new(),
        }
    }

    /// Build a key list from concrete keys, dropping duplicates.
    pub fn from_keys<K, I>(keys: I) -> Self
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
        I: IntoIterator<Item = K>,
    {
        KeyList {
            keys: keys.into_iter().map(Key::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    /// Iterate the keys in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.keys.iter()
    }

    /// Clone the keys out as their concrete type, in list order.
    pub fn keys<K: Any + Clone>(&self) -> anyhow::Result<Vec<K>> {
        self.keys
            .iter()
            .map(|k| {
                k.downcast_ref::<K>().cloned().ok_or_else(|| {
                    anyhow::anyhow!(
                        "key {:?} is not a {}",
                        k,
                        std::any::type_name::<K>()
                    )
                })
            })
            .collect()
    }

    /// Copy with `key` appended; unchanged if already present.
    pub(crate) fn with_added(&self, key: Key) -> KeyList {
        let mut keys = self.keys.clone();
        keys.insert(key);
        KeyList { keys }
    }

    /// Copy without `key`; unchanged if absent. The remaining keys keep
    /// their relative order.
    pub(crate) fn with_removed(&self, key: &Key) -> KeyList {
        let mut keys = self.keys.clone();
        keys.shift_remove(key);
        KeyList { keys }
    }
}

impl PartialEq for KeyList {
    fn eq(&self, other: &Self) -> bool {
        // IndexSet's own == ignores order; key lists must not.
        self.keys.len() == other.keys.len()
            && self.keys.iter().zip(other.keys.iter()).all(|(a, b)| a == b)
    }
}

impl Eq for KeyList {}

/// The tri-state value cell the store holds for every node.
#[derive(Clone, Debug)]
pub enum ValueSlot {
    /// Never computed: the node is new, or some dependency has no value yet.
    Unset,
    /// A committed value and the pass that produced it.
    Ok {
        value: Payload,
        timestamp: Timestamp,
    },
    /// A committed failure and the pass that produced it.
    Failed {
        failure: NodeFailure,
        timestamp: Timestamp,
    },
}

impl ValueSlot {
    /// The pass that committed this slot, if any.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            ValueSlot::Unset => None,
            ValueSlot::Ok { timestamp, .. } | ValueSlot::Failed { timestamp, .. } => {
                Some(*timestamp)
            }
        }
    }

    /// The committed value, if this slot holds one.
    pub fn value(&self) -> Option<&Payload> {
        match self {
            ValueSlot::Ok { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The committed failure, if this slot holds one.
    pub fn failure(&self) -> Option<&NodeFailure> {
        match self {
            ValueSlot::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, ValueSlot::Unset)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ValueSlot::Ok { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ValueSlot::Failed { .. })
    }
}

/// One originating error inside a [`NodeFailure`]: the label of the node
/// whose compute function failed, and the error it returned.
#[derive(Clone, Debug)]
pub struct FailureSource {
    /// Human-readable label of the originating node, e.g. `parse[lib.rvt]`.
    pub node: String,
    /// The originating error, shared so propagation never copies it.
    pub error: Arc<anyhow::Error>,
}

/// Why a node is `Failed`: the set of originating errors upstream of it.
///
/// When several failed dependencies converge on one dependent, their
/// origins are merged and de-duplicated by node label, so a terminal
/// diagnostic node sees every independent root cause exactly once.
#[derive(Clone, Debug)]
pub struct NodeFailure {
    sources: SmallVec<[FailureSource; 1]>,
}

impl NodeFailure {
    /// A failure originating at `node`.
    pub(crate) fn from_error(node: impl Into<String>, error: anyhow::Error) -> Self {
        NodeFailure {
            sources: smallvec::smallvec![FailureSource {
                node: node.into(),
                error: Arc::new(error),
            }],
        }
    }

    /// Merge upstream failures, keeping the first occurrence per origin.
    pub(crate) fn merged<'a, I>(failures: I) -> Self
    where
        I: IntoIterator<Item = &'a NodeFailure>,
    {
        let mut sources: SmallVec<[FailureSource; 1]> = SmallVec::new();
        for failure in failures {
            for source in &failure.sources {
                if !sources.iter().any(|s| s.node == source.node) {
                    sources.push(source.clone());
                }
            }
        }
        NodeFailure { sources }
    }

    /// Every originating error, earliest first.
    pub fn sources(&self) -> &[FailureSource] {
        &self.sources
    }

    /// The first originating error.
    pub fn primary(&self) -> &FailureSource {
        &self.sources[0]
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", source.node, source.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for NodeFailure {}

/// The dependency values a compute function sees, in declared order, plus
/// the instance key when the node belongs to a keyed group.
///
/// # Example
///
/// ```rust,ignore
/// let b = engine.declare_computed("b", &[a.clone()], |inputs: &Inputs| {
///     Ok(inputs.get::<i64>(0)? * 2)
/// })?;
/// ```
pub struct Inputs<'a> {
    values: &'a [Payload],
    key: Option<&'a Key>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(values: &'a [Payload], key: Option<&'a Key>) -> Self {
        Inputs { values, key }
    }

    /// Number of dependencies, matching the declared order.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow dependency `index` as a `T`.
    pub fn get<T: Any>(&self, index: usize) -> anyhow::Result<&T> {
        let payload = self
            .values
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no dependency at index {index}"))?;
        payload.downcast_ref::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "dependency {index} is a `{}`, not a `{}`",
                payload.type_name(),
                std::any::type_name::<T>()
            )
        })
    }

    /// Clone dependency `index` out as a `T`.
    pub fn extract<T: Any + Clone>(&self, index: usize) -> anyhow::Result<T> {
        self.get::<T>(index).cloned()
    }

    /// Raw payload of dependency `index`.
    pub fn payload(&self, index: usize) -> Option<&Payload> {
        self.values.get(index)
    }

    /// The instance key as a `K`. Errors for non-keyed nodes.
    pub fn key<K: Any>(&self) -> anyhow::Result<&K> {
        let key = self
            .key
            .ok_or_else(|| anyhow::anyhow!("this node is not a keyed instance"))?;
        key.downcast_ref::<K>().ok_or_else(|| {
            anyhow::anyhow!(
                "instance key {:?} is a `{}`, not a `{}`",
                key,
                key.type_name_of(),
                std::any::type_name::<K>()
            )
        })
    }
}

/// The full-output payload of a keyed group: every instance value, in the
/// key list's current order.
#[derive(Clone, Debug)]
pub struct KeyedValues {
    entries: Vec<(Key, Payload)>,
}

impl KeyedValues {
    pub(crate) fn new(entries: Vec<(Key, Payload)>) -> Self {
        KeyedValues { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Payload)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// The value for `key`, if that key is present.
    pub fn get(&self, key: &Key) -> Option<&Payload> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Clone the values out as their concrete type, in key order.
    pub fn values<T: Any + Clone>(&self) -> anyhow::Result<Vec<T>> {
        self.entries
            .iter()
            .map(|(k, v)| {
                v.extract::<T>().ok_or_else(|| {
                    anyhow::anyhow!(
                        "value for key {:?} is a `{}`, not a `{}`",
                        k,
                        v.type_name(),
                        std::any::type_name::<T>()
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_orders_before_real_timestamps() {
        assert!(Timestamp::CATCH_UP < Timestamp::ZERO);
        assert!(Timestamp::ZERO < Timestamp::ZERO.next());
        assert!(Timestamp::CATCH_UP.is_catch_up());
        assert!(!Timestamp::ZERO.is_catch_up());
    }

    #[test]
    fn payload_downcasts_to_its_concrete_type() {
        let payload = Payload::new(42i64);
        assert_eq!(payload.downcast_ref::<i64>(), Some(&42));
        assert_eq!(payload.downcast_ref::<String>(), None);
        assert_eq!(payload.extract::<i64>(), Some(42));
        assert!(payload.type_name().contains("i64"));
    }

    #[test]
    fn keys_compare_by_value_not_identity() {
        let a = Key::new(String::from("lib.rvt"));
        let b = Key::new(String::from("lib.rvt"));
        let c = Key::new(String::from("main.rvt"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keys_of_different_types_are_never_equal() {
        let a = Key::new(1i64);
        let b = Key::new(1i32);
        assert_ne!(a, b);
    }

    #[test]
    fn key_list_drops_duplicates_and_keeps_order() {
        let list = KeyList::from_keys(vec![1, 3, 2, 3, 4, 4, 1]);
        assert_eq!(list.keys::<i32>().unwrap(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn removed_keys_forfeit_their_position() {
        let list = KeyList::from_keys(vec![3, 4, 6, 5]);
        let list = list.with_removed(&Key::new(4));
        assert_eq!(list.keys::<i32>().unwrap(), vec![3, 6, 5]);
        let list = list.with_added(Key::new(4));
        assert_eq!(list.keys::<i32>().unwrap(), vec![3, 6, 5, 4]);
    }

    #[test]
    fn key_list_equality_is_order_sensitive() {
        let a = KeyList::from_keys(vec![1, 2, 3]);
        let b = KeyList::from_keys(vec![3, 2, 1]);
        let c = KeyList::from_keys(vec![1, 2, 3]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn typed_key_extraction_rejects_the_wrong_type() {
        let list = KeyList::from_keys(vec![String::from("a")]);
        assert!(list.keys::<i32>().is_err());
    }

    #[test]
    fn inputs_downcast_by_declared_position() {
        let values = vec![Payload::new(2i64), Payload::new(String::from("src"))];
        let inputs = Inputs::new(&values, None);
        assert_eq!(*inputs.get::<i64>(0).unwrap(), 2);
        assert_eq!(inputs.get::<String>(1).unwrap(), "src");
        assert!(inputs.get::<i64>(1).is_err());
        assert!(inputs.get::<i64>(2).is_err());
        assert!(inputs.key::<String>().is_err());
    }

    #[test]
    fn inputs_expose_the_instance_key() {
        let values = vec![Payload::new(1i64)];
        let key = Key::new(String::from("lib.rvt"));
        let inputs = Inputs::new(&values, Some(&key));
        assert_eq!(inputs.key::<String>().unwrap(), "lib.rvt");
        assert!(inputs.key::<i64>().is_err());
    }

    #[test]
    fn keyed_values_extract_in_key_order() {
        let entries = vec![
            (Key::new(3), Payload::new(6i64)),
            (Key::new(1), Payload::new(2i64)),
            (Key::new(2), Payload::new(4i64)),
        ];
        let full = KeyedValues::new(entries);
        assert_eq!(full.values::<i64>().unwrap(), vec![6, 2, 4]);
        assert_eq!(
            full.get(&Key::new(1)).and_then(|p| p.extract::<i64>()),
            Some(2)
        );
        assert!(full.get(&Key::new(9)).is_none());
    }

    #[test]
    fn merged_failures_deduplicate_by_origin() {
        let f1 = NodeFailure::from_error("b", anyhow::anyhow!("boom"));
        let f2 = NodeFailure::from_error("b", anyhow::anyhow!("boom again"));
        let f3 = NodeFailure::from_error("c", anyhow::anyhow!("crash"));
        let merged = NodeFailure::merged([&f1, &f2, &f3]);
        let origins: Vec<&str> = merged.sources().iter().map(|s| s.node.as_str()).collect();
        assert_eq!(origins, vec!["b", "c"]);
        assert_eq!(merged.primary().node, "b");
    }
}
