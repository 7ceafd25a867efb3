//! Per-entity arena and stop-the-world mark-and-sweep collection.
//!
//! The manager owns every node of one entity. Nodes are slots in a vector,
//! addressed by [`NodeId`]; freed slots go on a free list and are reused by
//! later allocations. Liveness is decided solely by the collector: it marks
//! from the registered roots (the entity root plus any transient references
//! kept by running interpreters) and sweeps everything else.
//!
//! All access goes through short-lived accessor calls that copy scalars or
//! child-id vectors out; no lock is held across recursion, so the write lock
//! taken by the sweep is the stop-the-world point and collection may run at
//! any safe point without deadlocking an evaluation in progress.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::intern::{self, SymbolId};
use crate::node::{
    Node, NodeId, NodeKind, FLAG_CONCURRENCY, FLAG_IDEMPOTENT, FLAG_MARKED, FLAG_NEED_CYCLE_CHECK,
};
use crate::value::{EvalResult, Immediate};

/// Collection is first considered once this many nodes are in use.
const MIN_COLLECT_THRESHOLD: usize = 4096;

struct NodeStore {
    nodes: Vec<Node>,
    free: Vec<u32>,
    /// Transient GC roots (stack nodes, in-flight results) with a keep count.
    kept: HashMap<u32, u32>,
    root: Option<NodeId>,
    /// High-water mark: collect when used nodes exceed this.
    collect_threshold: usize,
}

/// Arena plus collector for a single entity.
pub struct NodeManager {
    store: RwLock<NodeStore>,
}

impl NodeManager {
    pub fn new() -> NodeManager {
        NodeManager {
            store: RwLock::new(NodeStore {
                nodes: Vec::new(),
                free: Vec::new(),
                kept: HashMap::new(),
                root: None,
                collect_threshold: MIN_COLLECT_THRESHOLD,
            }),
        }
    }

    // -- Allocation --

    pub fn alloc(&self, kind: NodeKind) -> NodeId {
        let mut store = self.store.write().unwrap();
        store.alloc(Node::new(kind))
    }

    pub fn alloc_number(&self, value: f64) -> NodeId {
        let mut node = Node::new(NodeKind::Number);
        node.number = value;
        self.store.write().unwrap().alloc(node)
    }

    /// Allocates a string/symbol node, taking ownership of an existing pool
    /// reference instead of creating a new one.
    pub fn alloc_with_handoff(&self, kind: NodeKind, sid: SymbolId) -> NodeId {
        debug_assert!(kind.uses_string_payload());
        let mut node = Node::new(kind);
        node.symbol = sid;
        self.store.write().unwrap().alloc(node)
    }

    pub fn alloc_string(&self, s: &str) -> NodeId {
        self.alloc_with_handoff(NodeKind::String, intern::intern(s))
    }

    pub fn alloc_symbol(&self, s: &str) -> NodeId {
        self.alloc_with_handoff(NodeKind::Symbol, intern::intern(s))
    }

    pub fn alloc_boolean(&self, v: bool) -> NodeId {
        self.alloc(if v { NodeKind::True } else { NodeKind::False })
    }

    /// Shallow copy: same kind, payload, metadata, and child ids. New intern
    /// references are created for every id the copy holds.
    pub fn copy_node(&self, id: NodeId) -> NodeId {
        let pool = intern::pool();
        let mut store = self.store.write().unwrap();
        let src = &store.nodes[id.index()];
        let copy = Node {
            kind: src.kind,
            number: src.number,
            symbol: pool.add_ref(src.symbol),
            ordered: src.ordered.clone(),
            mapped: {
                let mut m = HashMap::with_capacity(src.mapped.len());
                for (&k, &v) in &src.mapped {
                    m.insert(pool.add_ref(k), v);
                }
                m
            },
            labels: src.labels.iter().map(|&l| pool.add_ref(l)).collect(),
            comment: pool.add_ref(src.comment),
            flags: src.flags & !FLAG_MARKED,
        };
        store.alloc(copy)
    }

    pub fn used_nodes(&self) -> usize {
        let store = self.store.read().unwrap();
        store.nodes.len() - store.free.len()
    }

    // -- Roots --

    pub fn set_root(&self, root: Option<NodeId>) {
        self.store.write().unwrap().root = root;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.store.read().unwrap().root
    }

    /// Registers a transient GC root for the duration of an evaluation.
    pub fn keep_node_reference(&self, id: NodeId) {
        let mut store = self.store.write().unwrap();
        *store.kept.entry(id.0).or_insert(0) += 1;
    }

    pub fn free_node_reference(&self, id: NodeId) {
        let mut store = self.store.write().unwrap();
        match store.kept.get_mut(&id.0) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                store.kept.remove(&id.0);
            }
            None => debug_assert!(false, "free_node_reference without keep"),
        }
    }

    pub fn keep_node_references(&self, ids: &[NodeId]) {
        for &id in ids {
            self.keep_node_reference(id);
        }
    }

    pub fn free_node_references(&self, ids: &[NodeId]) {
        for &id in ids {
            self.free_node_reference(id);
        }
    }

    // -- Eager release --

    /// Returns a single slot to the free list. Legal only when the caller
    /// can prove nothing else references the node.
    pub fn free_node(&self, id: NodeId) {
        let mut store = self.store.write().unwrap();
        store.destroy(id);
    }

    /// Eagerly frees a whole subtree. Cycles are tolerated; nodes reachable
    /// from outside the subtree must not exist (caller's proof).
    pub fn free_node_tree(&self, id: NodeId) {
        let mut store = self.store.write().unwrap();
        let mut to_free: Vec<NodeId> = Vec::new();
        let mut seen: HashMap<u32, ()> = HashMap::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if seen.insert(cur.0, ()).is_some() {
                continue;
            }
            let node = &store.nodes[cur.index()];
            if node.kind == NodeKind::Deallocated {
                continue;
            }
            stack.extend(node.ordered.iter().copied());
            stack.extend(node.mapped.values().copied());
            to_free.push(cur);
        }
        for n in to_free {
            store.destroy(n);
        }
    }

    /// Frees the result's subtree only when the reference is unique.
    pub fn free_node_tree_if_possible(&self, result: &EvalResult) {
        if let Immediate::Node(id) = result.value {
            if result.unique {
                self.free_node_tree(id);
            }
        }
    }

    // -- Collection --

    /// Runs a collection cycle when used nodes exceed the high-water mark.
    /// May only be called at safe points.
    pub fn collect_garbage_if_needed(&self) {
        let needed = {
            let store = self.store.read().unwrap();
            store.nodes.len() - store.free.len() > store.collect_threshold
        };
        if needed {
            self.collect_garbage();
        }
    }

    /// Stop-the-world mark and sweep.
    pub fn collect_garbage(&self) {
        let mut store = self.store.write().unwrap();

        // Mark phase: descend only into nodes not yet marked.
        let mut stack: Vec<NodeId> = Vec::new();
        if let Some(root) = store.root {
            stack.push(root);
        }
        stack.extend(store.kept.keys().map(|&i| NodeId(i)));
        while let Some(id) = stack.pop() {
            let node = &mut store.nodes[id.index()];
            if node.flags & FLAG_MARKED != 0 {
                continue;
            }
            node.flags |= FLAG_MARKED;
            let node = &store.nodes[id.index()];
            stack.extend(node.ordered.iter().copied());
            stack.extend(node.mapped.values().copied());
        }

        // Sweep phase: destroy unmarked slots, clear marks on survivors.
        let before = store.nodes.len() - store.free.len();
        for idx in 0..store.nodes.len() {
            let node = &mut store.nodes[idx];
            if node.kind == NodeKind::Deallocated {
                continue;
            }
            if node.flags & FLAG_MARKED != 0 {
                node.flags &= !FLAG_MARKED;
            } else {
                store.destroy(NodeId(idx as u32));
            }
        }

        let used = store.nodes.len() - store.free.len();
        store.collect_threshold = (used * 2).max(MIN_COLLECT_THRESHOLD);
        log::debug!("collected {} nodes, {} in use", before - used, used);
    }

    // -- Scalar accessors --

    pub fn kind_of(&self, id: NodeId) -> NodeKind {
        self.store.read().unwrap().nodes[id.index()].kind
    }

    pub fn number_of(&self, id: NodeId) -> f64 {
        self.store.read().unwrap().nodes[id.index()].number
    }

    /// The string payload id. No reference is created.
    pub fn symbol_of(&self, id: NodeId) -> SymbolId {
        self.store.read().unwrap().nodes[id.index()].symbol
    }

    pub fn set_number(&self, id: NodeId, v: f64) {
        self.store.write().unwrap().nodes[id.index()].number = v;
    }

    /// Takes the string payload out of a node, transferring its reference to
    /// the caller. The node is left with no string payload.
    pub fn take_symbol(&self, id: NodeId) -> SymbolId {
        let mut store = self.store.write().unwrap();
        std::mem::replace(&mut store.nodes[id.index()].symbol, SymbolId::NONE)
    }

    /// Replaces the string payload, taking ownership of `sid`'s reference
    /// and releasing the previous one.
    pub fn set_symbol_handoff(&self, id: NodeId, sid: SymbolId) {
        let old = {
            let mut store = self.store.write().unwrap();
            std::mem::replace(&mut store.nodes[id.index()].symbol, sid)
        };
        intern::pool().release(old);
    }

    /// Retypes a node in place. Child containers are converted when the new
    /// kind stores them differently; scalar payloads survive only when the
    /// new kind uses them.
    pub fn set_kind(&self, id: NodeId, kind: NodeKind) {
        let released = {
            let mut store = self.store.write().unwrap();
            let node = &mut store.nodes[id.index()];
            let old_kind = node.kind;
            node.kind = kind;
            if kind.uses_mapped_children() && old_kind.uses_ordered_children() {
                // Pairwise [k1 v1 k2 v2 ...]; an odd trailing key maps to itself.
                let ordered = std::mem::take(&mut node.ordered);
                let mut pending: Vec<(NodeId, NodeId)> = Vec::new();
                let mut iter = ordered.into_iter();
                while let Some(k) = iter.next() {
                    let v = iter.next().unwrap_or(k);
                    pending.push((k, v));
                }
                for (knode, vnode) in pending {
                    let key_text = store.node_to_key_string(knode);
                    let sid = intern::intern(&key_text);
                    if store.nodes[id.index()].mapped.insert(sid, vnode).is_some() {
                        intern::pool().release(sid);
                    }
                }
                Vec::new()
            } else if kind.uses_ordered_children() && old_kind.uses_mapped_children() {
                let mapped = std::mem::take(&mut node.mapped);
                let mut entries: Vec<(SymbolId, NodeId)> = mapped.into_iter().collect();
                entries.sort_by(|a, b| intern::text(a.0).cmp(&intern::text(b.0)));
                let released: Vec<SymbolId> = entries.iter().map(|&(k, _)| k).collect();
                node.ordered = entries.into_iter().map(|(_, v)| v).collect();
                released
            } else if kind.is_immediate() {
                node.ordered.clear();
                let mapped = std::mem::take(&mut node.mapped);
                mapped.into_keys().collect()
            } else {
                Vec::new()
            }
        };
        let pool = intern::pool();
        for sid in released {
            pool.release(sid);
        }
    }

    // -- Flags --

    pub fn need_cycle_check(&self, id: NodeId) -> bool {
        self.store.read().unwrap().nodes[id.index()].need_cycle_check()
    }

    pub fn set_need_cycle_check(&self, id: NodeId, on: bool) {
        self.store.write().unwrap().nodes[id.index()].set_flag(FLAG_NEED_CYCLE_CHECK, on);
    }

    pub fn is_idempotent(&self, id: NodeId) -> bool {
        self.store.read().unwrap().nodes[id.index()].is_idempotent()
    }

    pub fn set_idempotent(&self, id: NodeId, on: bool) {
        self.store.write().unwrap().nodes[id.index()].set_flag(FLAG_IDEMPOTENT, on);
    }

    pub fn concurrency_requested(&self, id: NodeId) -> bool {
        self.store.read().unwrap().nodes[id.index()].concurrency_requested()
    }

    pub fn set_concurrency_requested(&self, id: NodeId, on: bool) {
        self.store.write().unwrap().nodes[id.index()].set_flag(FLAG_CONCURRENCY, on);
    }

    // -- Ordered children --

    pub fn child_count(&self, id: NodeId) -> usize {
        self.store.read().unwrap().nodes[id.index()].ordered.len()
    }

    pub fn child(&self, id: NodeId, i: usize) -> Option<NodeId> {
        self.store.read().unwrap().nodes[id.index()].ordered.get(i).copied()
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.store.read().unwrap().nodes[id.index()].ordered.clone()
    }

    pub fn push_child(&self, id: NodeId, child: NodeId) {
        self.store.write().unwrap().nodes[id.index()].ordered.push(child);
    }

    pub fn pop_child(&self, id: NodeId) -> Option<NodeId> {
        self.store.write().unwrap().nodes[id.index()].ordered.pop()
    }

    pub fn set_child(&self, id: NodeId, i: usize, child: NodeId) {
        self.store.write().unwrap().nodes[id.index()].ordered[i] = child;
    }

    pub fn insert_child(&self, id: NodeId, i: usize, child: NodeId) {
        self.store.write().unwrap().nodes[id.index()].ordered.insert(i, child);
    }

    pub fn remove_child(&self, id: NodeId, i: usize) -> NodeId {
        self.store.write().unwrap().nodes[id.index()].ordered.remove(i)
    }

    pub fn set_children(&self, id: NodeId, children: Vec<NodeId>) {
        self.store.write().unwrap().nodes[id.index()].ordered = children;
    }

    // -- Mapped children --

    pub fn mapped_len(&self, id: NodeId) -> usize {
        self.store.read().unwrap().nodes[id.index()].mapped.len()
    }

    pub fn mapped_get(&self, id: NodeId, key: SymbolId) -> Option<NodeId> {
        self.store.read().unwrap().nodes[id.index()].mapped.get(&key).copied()
    }

    pub fn mapped_entries(&self, id: NodeId) -> Vec<(SymbolId, NodeId)> {
        self.store.read().unwrap().nodes[id.index()]
            .mapped
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect()
    }

    /// Entries sorted by key text, for deterministic iteration.
    pub fn mapped_entries_sorted(&self, id: NodeId) -> Vec<(SymbolId, NodeId)> {
        let mut entries = self.mapped_entries(id);
        entries.sort_by(|a, b| intern::text(a.0).cmp(&intern::text(b.0)));
        entries
    }

    /// Inserts or replaces. Takes ownership of `key`'s reference; when the
    /// key already exists the incoming reference is released instead.
    pub fn set_mapped_child(&self, id: NodeId, key: SymbolId, child: NodeId) {
        let duplicate = {
            let mut store = self.store.write().unwrap();
            let node = &mut store.nodes[id.index()];
            node.mapped.insert(key, child).is_some()
        };
        if duplicate {
            intern::pool().release(key);
        }
    }

    pub fn remove_mapped_child(&self, id: NodeId, key: SymbolId) -> Option<NodeId> {
        let removed = {
            let mut store = self.store.write().unwrap();
            store.nodes[id.index()].mapped.remove(&key)
        };
        if removed.is_some() {
            intern::pool().release(key);
        }
        removed
    }

    // -- Labels and comments --

    pub fn labels_of(&self, id: NodeId) -> Vec<SymbolId> {
        self.store.read().unwrap().nodes[id.index()].labels.clone()
    }

    /// Replaces the label set, taking ownership of the new references.
    pub fn set_labels_handoff(&self, id: NodeId, labels: Vec<SymbolId>) {
        let old = {
            let mut store = self.store.write().unwrap();
            std::mem::replace(&mut store.nodes[id.index()].labels, labels)
        };
        let pool = intern::pool();
        for l in old {
            pool.release(l);
        }
    }

    pub fn add_label(&self, id: NodeId, label: &str) {
        let sid = intern::intern(label);
        self.store.write().unwrap().nodes[id.index()].labels.push(sid);
    }

    pub fn comment_of(&self, id: NodeId) -> SymbolId {
        self.store.read().unwrap().nodes[id.index()].comment
    }

    pub fn set_comment_handoff(&self, id: NodeId, comment: SymbolId) {
        let old = {
            let mut store = self.store.write().unwrap();
            std::mem::replace(&mut store.nodes[id.index()].comment, comment)
        };
        intern::pool().release(old);
    }

    /// Clears labels and comment, releasing their references.
    pub fn clear_metadata(&self, id: NodeId) {
        self.set_labels_handoff(id, Vec::new());
        self.set_comment_handoff(id, SymbolId::NONE);
    }

    /// Read access to a node for callers that need more than one field.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> R {
        let store = self.store.read().unwrap();
        f(&store.nodes[id.index()])
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore {
    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                NodeId(idx)
            }
            None => {
                let idx = self.nodes.len();
                if idx > u32::MAX as usize {
                    log::error!("node arena exhausted");
                    std::process::abort();
                }
                self.nodes.push(node);
                NodeId(idx as u32)
            }
        }
    }

    fn destroy(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.index()];
        if node.kind == NodeKind::Deallocated {
            return;
        }
        node.release_intern_refs();
        node.kind = NodeKind::Deallocated;
        node.flags = 0;
        self.free.push(id.0);
    }

    fn node_to_key_string(&self, id: NodeId) -> String {
        let node = &self.nodes[id.index()];
        match node.kind {
            NodeKind::String | NodeKind::Symbol => intern::text(node.symbol),
            NodeKind::Number => format!("{}", node.number),
            other => other.name().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_slots() {
        let nm = NodeManager::new();
        let a = nm.alloc(NodeKind::List);
        nm.free_node(a);
        let b = nm.alloc(NodeKind::Seq);
        assert_eq!(a, b);
        assert_eq!(nm.kind_of(b), NodeKind::Seq);
    }

    #[test]
    fn collect_frees_unreachable() {
        let nm = NodeManager::new();
        let root = nm.alloc(NodeKind::List);
        let kept_child = nm.alloc_number(1.0);
        nm.push_child(root, kept_child);
        let garbage = nm.alloc_number(2.0);
        nm.set_root(Some(root));

        nm.collect_garbage();
        assert_eq!(nm.kind_of(root), NodeKind::List);
        assert_eq!(nm.kind_of(kept_child), NodeKind::Number);
        assert_eq!(nm.kind_of(garbage), NodeKind::Deallocated);
        assert_eq!(nm.used_nodes(), 2);
    }

    #[test]
    fn kept_references_survive_collection() {
        let nm = NodeManager::new();
        let floating = nm.alloc_number(7.0);
        nm.keep_node_reference(floating);
        nm.collect_garbage();
        assert_eq!(nm.kind_of(floating), NodeKind::Number);

        nm.free_node_reference(floating);
        nm.collect_garbage();
        assert_eq!(nm.kind_of(floating), NodeKind::Deallocated);
    }

    #[test]
    fn collect_handles_cycles() {
        let nm = NodeManager::new();
        let a = nm.alloc(NodeKind::List);
        let b = nm.alloc(NodeKind::List);
        nm.push_child(a, b);
        nm.push_child(b, a);
        nm.set_need_cycle_check(a, true);
        nm.set_need_cycle_check(b, true);

        // Reachable cycle survives.
        nm.set_root(Some(a));
        nm.collect_garbage();
        assert_eq!(nm.kind_of(a), NodeKind::List);
        assert_eq!(nm.kind_of(b), NodeKind::List);

        // Unreachable cycle is reclaimed.
        nm.set_root(None);
        nm.collect_garbage();
        assert_eq!(nm.kind_of(a), NodeKind::Deallocated);
        assert_eq!(nm.kind_of(b), NodeKind::Deallocated);
    }

    #[test]
    fn free_node_tree_if_possible_respects_uniqueness() {
        let nm = NodeManager::new();
        let list = nm.alloc(NodeKind::List);
        let child = nm.alloc_number(1.0);
        nm.push_child(list, child);

        let shared = EvalResult::node(list, false);
        nm.free_node_tree_if_possible(&shared);
        assert_eq!(nm.kind_of(list), NodeKind::List);

        let unique = EvalResult::node(list, true);
        nm.free_node_tree_if_possible(&unique);
        assert_eq!(nm.kind_of(list), NodeKind::Deallocated);
        assert_eq!(nm.kind_of(child), NodeKind::Deallocated);
    }

    #[test]
    fn retype_list_to_assoc_pairs_children() {
        let nm = NodeManager::new();
        let list = nm.alloc(NodeKind::List);
        let k = nm.alloc_string("x");
        let v = nm.alloc_number(3.0);
        nm.push_child(list, k);
        nm.push_child(list, v);

        nm.set_kind(list, NodeKind::Assoc);
        assert_eq!(nm.kind_of(list), NodeKind::Assoc);
        let sid = intern::pool().id_if_exists("x").unwrap();
        assert_eq!(nm.mapped_get(list, sid), Some(v));
    }
}
