//! Topology
//!
//! The static dependency graph: named nodes, keyed groups, and the edges
//! implied by their declared dependency lists.
//!
//! # How Declarations Work
//!
//! 1. Declaration order must be dependency-first: a declaration can only
//!    reference nodes and groups that already exist, which rules out cycles
//!    structurally; there is never a forward edge to declare.
//!
//! 2. Each declaration is validated all-or-nothing: duplicate name, unknown
//!    dependency, or a keyed dependency driven by the wrong key list leaves
//!    the tables untouched.
//!
//! 3. Kahn's algorithm re-verifies acyclicity after every extension. Given
//!    rule 1 the check cannot fail; it exists so that a broken internal
//!    invariant surfaces as `CyclicDependency` instead of a wedged pass.
//!
//! Declaration order doubles as the topological order: a recompute pass
//! walks the entry list front to back, and every dependency is finalized
//! before its dependents are visited. Keyed instances occupy their group's
//! position in that order.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};

use crate::error::EngineError;
use crate::graph::node::{GroupDep, GroupId, GroupRecord, NodeId, NodeRecord, Target};

/// An entry in the global declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TopoEntry {
    Node(NodeId),
    Group(GroupId),
}

/// The static dependency graph of one engine.
pub(crate) struct Topology {
    /// Named nodes in declaration order, keyed by name.
    nodes: IndexMap<String, NodeRecord>,
    /// Keyed groups in declaration order, keyed by name.
    groups: IndexMap<String, GroupRecord>,
    /// Global declaration order across nodes and groups.
    order: Vec<TopoEntry>,
    /// Direct dependents per entry (edges dependency → dependent).
    dependents: IndexMap<TopoEntry, Vec<TopoEntry>>,
}

impl Topology {
    pub(crate) fn new() -> Self {
        Topology {
            nodes: IndexMap::new(),
            groups: IndexMap::new(),
            order: Vec::new(),
            dependents: IndexMap::new(),
        }
    }

    /// Add a named node. Errors leave the topology unchanged.
    pub(crate) fn declare_node(&mut self, record: NodeRecord) -> Result<NodeId, EngineError> {
        self.check_name_free(&record.name)?;
        for dep in &record.deps {
            self.check_target_exists(dep, &record.name)?;
        }

        let id = NodeId(self.nodes.len() as u32);
        let entry = TopoEntry::Node(id);
        let name = record.name.clone();
        self.nodes.insert(name.clone(), record);
        self.order.push(entry);

        if !self.verify_acyclic() {
            self.nodes.pop();
            self.order.pop();
            return Err(EngineError::CyclicDependency { name });
        }

        let dep_entries: Vec<TopoEntry> = self
            .node(id)
            .deps
            .iter()
            .map(Self::entry_of_target)
            .collect();
        for dep_entry in dep_entries {
            self.add_edge(dep_entry, entry);
        }
        Ok(id)
    }

    /// Add a keyed group. Errors leave the topology unchanged.
    pub(crate) fn declare_group(&mut self, record: GroupRecord) -> Result<GroupId, EngineError> {
        self.check_name_free(&record.name)?;
        let key_list = self
            .get_node(record.key_list)
            .ok_or_else(|| EngineError::UnknownNode {
                name: format!("{:?}", record.key_list),
            })?;
        if !key_list.kind.is_key_list() {
            return Err(EngineError::NotAKeyList {
                name: key_list.name.clone(),
            });
        }
        for dep in &record.deps {
            match dep {
                GroupDep::Static(target) => {
                    self.check_target_exists(target, &record.name)?;
                }
                GroupDep::SameKey(other) => {
                    let other_record =
                        self.get_group(*other)
                            .ok_or_else(|| EngineError::UnknownNode {
                                name: format!("{:?}", other),
                            })?;
                    if other_record.key_list != record.key_list {
                        return Err(EngineError::KeyListMismatch {
                            group: record.name.clone(),
                            dep: other_record.name.clone(),
                        });
                    }
                }
            }
        }

        let id = GroupId(self.groups.len() as u32);
        let entry = TopoEntry::Group(id);
        let name = record.name.clone();
        self.groups.insert(name.clone(), record);
        self.order.push(entry);

        if !self.verify_acyclic() {
            self.groups.pop();
            self.order.pop();
            return Err(EngineError::CyclicDependency { name });
        }

        let mut dep_entries = vec![TopoEntry::Node(self.group(id).key_list)];
        for dep in &self.group(id).deps {
            dep_entries.push(match dep {
                GroupDep::Static(target) => Self::entry_of_target(target),
                GroupDep::SameKey(other) => TopoEntry::Group(*other),
            });
        }
        for dep_entry in dep_entries {
            self.add_edge(dep_entry, entry);
        }
        Ok(id)
    }

    /// The record behind a node id minted by this topology.
    pub(crate) fn node(&self, id: NodeId) -> &NodeRecord {
        self.get_node(id).expect("node id minted by this topology")
    }

    pub(crate) fn get_node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get_index(id.0 as usize).map(|(_, record)| record)
    }

    /// The record behind a group id minted by this topology.
    pub(crate) fn group(&self, id: GroupId) -> &GroupRecord {
        self.get_group(id).expect("group id minted by this topology")
    }

    pub(crate) fn get_group(&self, id: GroupId) -> Option<&GroupRecord> {
        self.groups
            .get_index(id.0 as usize)
            .map(|(_, record)| record)
    }

    /// Global declaration order (which is a topological order).
    pub(crate) fn entries(&self) -> &[TopoEntry] {
        &self.order
    }

    /// Transitive dependent closure of `roots`, roots included.
    ///
    /// The result is a membership set; walking `entries()` filtered by it
    /// yields the closure in topological order.
    pub(crate) fn dirty_closure<I>(&self, roots: I) -> IndexSet<TopoEntry>
    where
        I: IntoIterator<Item = TopoEntry>,
    {
        let mut closure: IndexSet<TopoEntry> = IndexSet::new();
        let mut queue: VecDeque<TopoEntry> = roots.into_iter().collect();
        while let Some(entry) = queue.pop_front() {
            if !closure.insert(entry) {
                continue;
            }
            if let Some(dependents) = self.dependents.get(&entry) {
                queue.extend(dependents.iter().copied());
            }
        }
        closure
    }

    /// Human-readable label for any target, for errors and failure values.
    pub(crate) fn label(&self, target: &Target) -> String {
        match target {
            Target::Node(id) => match self.get_node(*id) {
                Some(record) => record.name.clone(),
                None => format!("{:?}", id),
            },
            Target::Instance(group, key) => match self.get_group(*group) {
                Some(record) => format!("{}[{:?}]", record.name, key),
                None => format!("{:?}[{:?}]", group, key),
            },
            Target::FullOutput(group) => match self.get_group(*group) {
                Some(record) => format!("{}[*]", record.name),
                None => format!("{:?}[*]", group),
            },
        }
    }

    /// Multi-line rendering of the whole graph, for debugging.
    pub(crate) fn describe(&self) -> String {
        let mut out = String::new();
        for entry in &self.order {
            match entry {
                TopoEntry::Node(id) => {
                    let record = self.node(*id);
                    out.push_str(&record.name);
                    out.push_str(": ");
                    out.push_str(match record.kind {
                        crate::graph::node::NodeKind::Input => "input",
                        crate::graph::node::NodeKind::KeyListInput => "key list input",
                        crate::graph::node::NodeKind::Computed => "computed",
                        crate::graph::node::NodeKind::KeyListComputed => "computed key list",
                    });
                    if !record.deps.is_empty() {
                        let deps: Vec<String> =
                            record.deps.iter().map(|d| self.label(d)).collect();
                        out.push_str(" <- ");
                        out.push_str(&deps.join(", "));
                    }
                    if record.catch.is_some() {
                        out.push_str(" (catching)");
                    }
                }
                TopoEntry::Group(id) => {
                    let record = self.group(*id);
                    out.push_str(&record.name);
                    out.push_str(": keyed over ");
                    out.push_str(&self.node(record.key_list).name);
                    if !record.deps.is_empty() {
                        let deps: Vec<String> = record
                            .deps
                            .iter()
                            .map(|d| match d {
                                GroupDep::Static(target) => self.label(target),
                                GroupDep::SameKey(other) => {
                                    format!("{}[key]", self.group(*other).name)
                                }
                            })
                            .collect();
                        out.push_str(" <- ");
                        out.push_str(&deps.join(", "));
                    }
                    if record.catch.is_some() {
                        out.push_str(" (catching)");
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    fn check_name_free(&self, name: &str) -> Result<(), EngineError> {
        if self.nodes.contains_key(name) || self.groups.contains_key(name) {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_target_exists(&self, target: &Target, declaring: &str) -> Result<(), EngineError> {
        let exists = match target {
            Target::Node(id) => self.get_node(*id).is_some(),
            Target::Instance(group, _) | Target::FullOutput(group) => {
                self.get_group(*group).is_some()
            }
        };
        if exists {
            Ok(())
        } else {
            Err(EngineError::UnknownNode {
                name: format!("dependency {target:?} of `{declaring}`"),
            })
        }
    }

    fn entry_of_target(target: &Target) -> TopoEntry {
        match target {
            Target::Node(id) => TopoEntry::Node(*id),
            Target::Instance(group, _) | Target::FullOutput(group) => TopoEntry::Group(*group),
        }
    }

    fn add_edge(&mut self, dependency: TopoEntry, dependent: TopoEntry) {
        let list = self.dependents.entry(dependency).or_default();
        if !list.contains(&dependent) {
            list.push(dependent);
        }
    }

    /// Direct dependency entries of one entry, deduplicated.
    fn dep_entries_of(&self, entry: TopoEntry) -> IndexSet<TopoEntry> {
        let mut deps = IndexSet::new();
        match entry {
            TopoEntry::Node(id) => {
                for target in &self.node(id).deps {
                    deps.insert(Self::entry_of_target(target));
                }
            }
            TopoEntry::Group(id) => {
                let record = self.group(id);
                deps.insert(TopoEntry::Node(record.key_list));
                for dep in &record.deps {
                    deps.insert(match dep {
                        GroupDep::Static(target) => Self::entry_of_target(target),
                        GroupDep::SameKey(other) => TopoEntry::Group(*other),
                    });
                }
            }
        }
        deps
    }

    /// Kahn's algorithm over the full entry set.
    fn verify_acyclic(&self) -> bool {
        let mut in_degree: IndexMap<TopoEntry, usize> = IndexMap::new();
        let mut forward: IndexMap<TopoEntry, Vec<TopoEntry>> = IndexMap::new();
        for &entry in &self.order {
            in_degree.entry(entry).or_insert(0);
            for dep in self.dep_entries_of(entry) {
                *in_degree.entry(entry).or_insert(0) += 1;
                forward.entry(dep).or_default().push(entry);
            }
        }

        let mut queue: VecDeque<TopoEntry> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&entry, _)| entry)
            .collect();
        let mut processed = 0usize;
        while let Some(entry) = queue.pop_front() {
            processed += 1;
            if let Some(dependents) = forward.get(&entry) {
                for dependent in dependents.clone() {
                    let degree = in_degree
                        .get_mut(&dependent)
                        .expect("dependent present in degree map");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        processed == self.order.len()
    }
}
