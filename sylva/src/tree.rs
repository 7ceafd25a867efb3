//! Whole-tree operations: copying, structural comparison, and the merge
//! family (intersect, union, difference, mix, mutate).
//!
//! Every routine here is cycle-safe: traversals carry a visited map keyed by
//! source node id, and copies reproduce self-references by re-linking to the
//! already-copied node and setting its cycle flag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::node_manager::NodeManager;
use crate::rand::RandomStream;

// ---------------------------------------------------------------------------
// Copying
// ---------------------------------------------------------------------------

/// Deep copy within one manager, preserving labels, comments, flags, and
/// self-references.
pub fn deep_copy(manager: &Arc<NodeManager>, node: NodeId) -> NodeId {
    deep_copy_between(manager, manager, node)
}

/// Deep copy from one arena into another (possibly the same one).
pub fn deep_copy_between(
    src: &Arc<NodeManager>,
    dst: &Arc<NodeManager>,
    node: NodeId,
) -> NodeId {
    let mut copied: HashMap<NodeId, NodeId> = HashMap::new();
    copy_rec(src, dst, node, &mut copied)
}

fn copy_rec(
    src: &Arc<NodeManager>,
    dst: &Arc<NodeManager>,
    node: NodeId,
    copied: &mut HashMap<NodeId, NodeId>,
) -> NodeId {
    if let Some(&existing) = copied.get(&node) {
        dst.set_need_cycle_check(existing, true);
        return existing;
    }

    let kind = src.kind_of(node);
    let new_node = if Arc::ptr_eq(src, dst) {
        // Same arena: shallow copy carries payload, metadata, and child ids;
        // the children are then replaced with their own copies below.
        src.copy_node(node)
    } else {
        let n = dst.alloc(kind);
        let pool = intern::pool();
        dst.set_number(n, src.number_of(node));
        let sym = src.symbol_of(node);
        if !sym.is_none() {
            dst.set_symbol_handoff(n, pool.add_ref(sym));
        }
        let labels: Vec<SymbolId> = src
            .labels_of(node)
            .into_iter()
            .map(|l| pool.add_ref(l))
            .collect();
        dst.set_labels_handoff(n, labels);
        let comment = src.comment_of(node);
        if !comment.is_none() {
            dst.set_comment_handoff(n, pool.add_ref(comment));
        }
        dst.set_need_cycle_check(n, src.need_cycle_check(node));
        dst.set_idempotent(n, src.is_idempotent(node));
        dst.set_concurrency_requested(n, src.concurrency_requested(node));
        n
    };
    copied.insert(node, new_node);

    if kind.uses_mapped_children() {
        let pool = intern::pool();
        for (key, value) in src.mapped_entries(node) {
            let new_value = copy_rec(src, dst, value, copied);
            dst.set_mapped_child(new_node, pool.add_ref(key), new_value);
        }
    } else {
        let children = src.children_of(node);
        if Arc::ptr_eq(src, dst) {
            // copy_node already duplicated the child id list; replace slots.
            for (i, child) in children.into_iter().enumerate() {
                let new_child = copy_rec(src, dst, child, copied);
                dst.set_child(new_node, i, new_child);
            }
        } else {
            for child in children {
                let new_child = copy_rec(src, dst, child, copied);
                dst.push_child(new_node, new_child);
            }
        }
    }
    new_node
}

// ---------------------------------------------------------------------------
// Size and equality
// ---------------------------------------------------------------------------

/// Number of nodes in the tree (each shared node counted once).
pub fn total_size(manager: &Arc<NodeManager>, node: NodeId) -> usize {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        stack.extend(manager.children_of(id));
        stack.extend(manager.mapped_entries(id).into_iter().map(|(_, v)| v));
    }
    seen.len()
}

/// Structural equality of two trees: kinds, payloads, child shape. Labels
/// and comments do not participate.
pub fn deep_equal(
    mgr_a: &Arc<NodeManager>,
    a: NodeId,
    mgr_b: &Arc<NodeManager>,
    b: NodeId,
) -> bool {
    let mut visited: HashSet<(NodeId, NodeId)> = HashSet::new();
    equal_rec(mgr_a, a, mgr_b, b, &mut visited)
}

fn equal_rec(
    mgr_a: &Arc<NodeManager>,
    a: NodeId,
    mgr_b: &Arc<NodeManager>,
    b: NodeId,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> bool {
    // A revisited pair is part of a cycle being compared above us.
    if !visited.insert((a, b)) {
        return true;
    }
    let ka = mgr_a.kind_of(a);
    let kb = mgr_b.kind_of(b);
    if ka != kb {
        return false;
    }
    match ka {
        NodeKind::Number => {
            let (x, y) = (mgr_a.number_of(a), mgr_b.number_of(b));
            x == y || (x.is_nan() && y.is_nan())
        }
        NodeKind::String | NodeKind::Symbol => {
            intern::text(mgr_a.symbol_of(a)) == intern::text(mgr_b.symbol_of(b))
        }
        _ if ka.uses_mapped_children() => {
            let ea = mgr_a.mapped_entries_sorted(a);
            let eb = mgr_b.mapped_entries_sorted(b);
            if ea.len() != eb.len() {
                return false;
            }
            ea.iter().zip(&eb).all(|(&(ka_, va), &(kb_, vb))| {
                intern::text(ka_) == intern::text(kb_)
                    && equal_rec(mgr_a, va, mgr_b, vb, visited)
            })
        }
        _ => {
            let ca = mgr_a.children_of(a);
            let cb = mgr_b.children_of(b);
            ca.len() == cb.len()
                && ca
                    .iter()
                    .zip(&cb)
                    .all(|(&x, &y)| equal_rec(mgr_a, x, mgr_b, y, visited))
        }
    }
}

/// Count of structurally matching nodes between two trees, matching ordered
/// children pairwise and mapped children by key.
pub fn commonality(
    mgr_a: &Arc<NodeManager>,
    a: NodeId,
    mgr_b: &Arc<NodeManager>,
    b: NodeId,
) -> f64 {
    let mut visited: HashSet<(NodeId, NodeId)> = HashSet::new();
    commonality_rec(mgr_a, a, mgr_b, b, &mut visited)
}

fn commonality_rec(
    mgr_a: &Arc<NodeManager>,
    a: NodeId,
    mgr_b: &Arc<NodeManager>,
    b: NodeId,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> f64 {
    if !visited.insert((a, b)) {
        return 0.0;
    }
    let ka = mgr_a.kind_of(a);
    let kb = mgr_b.kind_of(b);
    if ka != kb {
        return 0.0;
    }
    let mut score = match ka {
        NodeKind::Number => {
            let (x, y) = (mgr_a.number_of(a), mgr_b.number_of(b));
            if x == y || (x.is_nan() && y.is_nan()) {
                1.0
            } else {
                return 0.0;
            }
        }
        NodeKind::String | NodeKind::Symbol => {
            if intern::text(mgr_a.symbol_of(a)) == intern::text(mgr_b.symbol_of(b)) {
                1.0
            } else {
                return 0.0;
            }
        }
        _ => 1.0,
    };
    if ka.uses_mapped_children() {
        for (key, va) in mgr_a.mapped_entries(a) {
            if let Some(vb) = lookup_by_text(mgr_b, b, key) {
                score += commonality_rec(mgr_a, va, mgr_b, vb, visited);
            }
        }
    } else {
        for (ca, cb) in mgr_a.children_of(a).into_iter().zip(mgr_b.children_of(b)) {
            score += commonality_rec(mgr_a, ca, mgr_b, cb, visited);
        }
    }
    score
}

fn lookup_by_text(mgr: &Arc<NodeManager>, assoc: NodeId, key: SymbolId) -> Option<NodeId> {
    if let Some(v) = mgr.mapped_get(assoc, key) {
        return Some(v);
    }
    // Cross-pool lookups resolve by text.
    let text = intern::text(key);
    mgr.mapped_entries(assoc)
        .into_iter()
        .find(|&(k, _)| intern::text(k) == text)
        .map(|(_, v)| v)
}

/// Tree edit distance derived from commonality: nodes present in either
/// tree but not in the shared structure.
pub fn edit_distance(
    mgr_a: &Arc<NodeManager>,
    a: NodeId,
    mgr_b: &Arc<NodeManager>,
    b: NodeId,
) -> f64 {
    let common = commonality(mgr_a, a, mgr_b, b);
    total_size(mgr_a, a) as f64 + total_size(mgr_b, b) as f64 - 2.0 * common
}

// ---------------------------------------------------------------------------
// Merge family
// ---------------------------------------------------------------------------

/// The shared structure of two trees: nodes where both agree, null where
/// they diverge.
pub fn intersect(mgr: &Arc<NodeManager>, a: NodeId, b: NodeId) -> NodeId {
    let mut visited = HashSet::new();
    intersect_rec(mgr, a, b, &mut visited)
}

fn intersect_rec(
    mgr: &Arc<NodeManager>,
    a: NodeId,
    b: NodeId,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> NodeId {
    if !visited.insert((a, b)) {
        return mgr.alloc(NodeKind::Null);
    }
    let ka = mgr.kind_of(a);
    if ka != mgr.kind_of(b) {
        return mgr.alloc(NodeKind::Null);
    }
    match ka {
        NodeKind::Number if mgr.number_of(a) != mgr.number_of(b) => mgr.alloc(NodeKind::Null),
        NodeKind::String | NodeKind::Symbol
            if intern::text(mgr.symbol_of(a)) != intern::text(mgr.symbol_of(b)) =>
        {
            mgr.alloc(NodeKind::Null)
        }
        _ if ka.uses_mapped_children() => {
            let out = mgr.alloc(NodeKind::Assoc);
            for (key, va) in mgr.mapped_entries(a) {
                if let Some(vb) = mgr.mapped_get(b, key) {
                    let merged = intersect_rec(mgr, va, vb, visited);
                    mgr.set_mapped_child(out, intern::pool().add_ref(key), merged);
                }
            }
            out
        }
        _ if ka.uses_ordered_children() => {
            let out = mgr.alloc(ka);
            for (ca, cb) in mgr.children_of(a).into_iter().zip(mgr.children_of(b)) {
                let merged = intersect_rec(mgr, ca, cb, visited);
                mgr.push_child(out, merged);
            }
            out
        }
        _ => deep_copy(mgr, a),
    }
}

/// Union of two trees: `a`'s structure, with `b`'s additions grafted in.
pub fn union_trees(mgr: &Arc<NodeManager>, a: NodeId, b: NodeId) -> NodeId {
    let mut visited = HashSet::new();
    union_rec(mgr, a, b, &mut visited)
}

fn union_rec(
    mgr: &Arc<NodeManager>,
    a: NodeId,
    b: NodeId,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> NodeId {
    if !visited.insert((a, b)) {
        return deep_copy(mgr, a);
    }
    let ka = mgr.kind_of(a);
    if ka != mgr.kind_of(b) {
        return deep_copy(mgr, a);
    }
    if ka.uses_mapped_children() {
        let out = mgr.alloc(NodeKind::Assoc);
        let pool = intern::pool();
        let b_entries: Vec<(SymbolId, NodeId)> = mgr.mapped_entries(b);
        for (key, va) in mgr.mapped_entries(a) {
            let merged = match mgr.mapped_get(b, key) {
                Some(vb) => union_rec(mgr, va, vb, visited),
                None => deep_copy(mgr, va),
            };
            mgr.set_mapped_child(out, pool.add_ref(key), merged);
        }
        for (key, vb) in b_entries {
            if mgr.mapped_get(a, key).is_none() {
                mgr.set_mapped_child(out, pool.add_ref(key), deep_copy(mgr, vb));
            }
        }
        out
    } else if ka.uses_ordered_children() {
        let out = mgr.alloc(ka);
        let ca = mgr.children_of(a);
        let cb = mgr.children_of(b);
        for i in 0..ca.len().max(cb.len()) {
            let merged = match (ca.get(i), cb.get(i)) {
                (Some(&x), Some(&y)) => union_rec(mgr, x, y, visited),
                (Some(&x), None) => deep_copy(mgr, x),
                (None, Some(&y)) => deep_copy(mgr, y),
                (None, None) => unreachable!(),
            };
            mgr.push_child(out, merged);
        }
        out
    } else {
        deep_copy(mgr, a)
    }
}

/// Where `b` differs from `a`: null where the trees agree, `b`'s subtree
/// where they do not. Applying the result over `a` reconstructs `b`'s
/// divergences.
pub fn difference(mgr: &Arc<NodeManager>, a: NodeId, b: NodeId) -> NodeId {
    let mut visited = HashSet::new();
    difference_rec(mgr, a, b, &mut visited)
}

fn difference_rec(
    mgr: &Arc<NodeManager>,
    a: NodeId,
    b: NodeId,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> NodeId {
    if !visited.insert((a, b)) {
        return mgr.alloc(NodeKind::Null);
    }
    if deep_equal(mgr, a, mgr, b) {
        return mgr.alloc(NodeKind::Null);
    }
    let ka = mgr.kind_of(a);
    if ka != mgr.kind_of(b) {
        return deep_copy(mgr, b);
    }
    if ka.uses_mapped_children() {
        let out = mgr.alloc(NodeKind::Assoc);
        for (key, vb) in mgr.mapped_entries(b) {
            match mgr.mapped_get(a, key) {
                Some(va) if deep_equal(mgr, va, mgr, vb) => {}
                Some(va) => {
                    let d = difference_rec(mgr, va, vb, visited);
                    mgr.set_mapped_child(out, intern::pool().add_ref(key), d);
                }
                None => {
                    let c = deep_copy(mgr, vb);
                    mgr.set_mapped_child(out, intern::pool().add_ref(key), c);
                }
            }
        }
        out
    } else if ka.uses_ordered_children() {
        let out = mgr.alloc(ka);
        let ca = mgr.children_of(a);
        for (i, cb) in mgr.children_of(b).into_iter().enumerate() {
            let d = match ca.get(i) {
                Some(&x) => difference_rec(mgr, x, cb, visited),
                None => deep_copy(mgr, cb),
            };
            mgr.push_child(out, d);
        }
        out
    } else {
        deep_copy(mgr, b)
    }
}

/// Structural blend: each position keeps `a`'s subtree with probability
/// `fraction_a`, otherwise takes `b`'s. Deterministic given the stream.
pub fn mix(
    mgr: &Arc<NodeManager>,
    a: NodeId,
    b: NodeId,
    fraction_a: f64,
    rand: &mut RandomStream,
) -> NodeId {
    let ka = mgr.kind_of(a);
    if ka != mgr.kind_of(b) {
        let take_a = rand.next_double() < fraction_a;
        return deep_copy(mgr, if take_a { a } else { b });
    }
    if ka.uses_mapped_children() {
        let out = mgr.alloc(NodeKind::Assoc);
        let pool = intern::pool();
        for (key, va) in mgr.mapped_entries_sorted(a) {
            let merged = match mgr.mapped_get(b, key) {
                Some(vb) => mix(mgr, va, vb, fraction_a, rand),
                None if rand.next_double() < fraction_a => deep_copy(mgr, va),
                None => continue,
            };
            mgr.set_mapped_child(out, pool.add_ref(key), merged);
        }
        for (key, vb) in mgr.mapped_entries_sorted(b) {
            if mgr.mapped_get(a, key).is_none() && rand.next_double() >= fraction_a {
                mgr.set_mapped_child(out, pool.add_ref(key), deep_copy(mgr, vb));
            }
        }
        out
    } else if ka.uses_ordered_children() {
        let out = mgr.alloc(ka);
        let ca = mgr.children_of(a);
        let cb = mgr.children_of(b);
        for i in 0..ca.len().max(cb.len()) {
            let merged = match (ca.get(i), cb.get(i)) {
                (Some(&x), Some(&y)) => mix(mgr, x, y, fraction_a, rand),
                (Some(&x), None) if rand.next_double() < fraction_a => deep_copy(mgr, x),
                (None, Some(&y)) if rand.next_double() >= fraction_a => deep_copy(mgr, y),
                _ => continue,
            };
            mgr.push_child(out, merged);
        }
        out
    } else {
        let take_a = rand.next_double() < fraction_a;
        deep_copy(mgr, if take_a { a } else { b })
    }
}

/// Label-oriented blend: a copy of `a` in which each node sharing a label
/// with `b` is swapped for `b`'s labeled subtree with probability
/// `1 - fraction_a`.
pub fn mix_labels(
    mgr: &Arc<NodeManager>,
    a: NodeId,
    b: NodeId,
    fraction_a: f64,
    rand: &mut RandomStream,
) -> NodeId {
    let b_labels = collect_labels(mgr, b);
    let out = deep_copy(mgr, a);
    let mut seen = HashSet::new();
    let mut stack = vec![out];
    let mut swaps: Vec<(NodeId, usize, NodeId)> = Vec::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let children = mgr.children_of(id);
        for (i, child) in children.iter().enumerate() {
            let has_shared_label = mgr
                .labels_of(*child)
                .iter()
                .any(|l| b_labels.contains_key(l));
            if has_shared_label && rand.next_double() >= fraction_a {
                let label = mgr
                    .labels_of(*child)
                    .into_iter()
                    .find(|l| b_labels.contains_key(l))
                    .expect("label vanished between checks");
                swaps.push((id, i, b_labels[&label]));
            } else {
                stack.push(*child);
            }
        }
    }
    for (parent, index, source) in swaps {
        let replacement = deep_copy(mgr, source);
        mgr.set_child(parent, index, replacement);
    }
    out
}

fn collect_labels(mgr: &Arc<NodeManager>, root: NodeId) -> HashMap<SymbolId, NodeId> {
    let mut out = HashMap::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for label in mgr.labels_of(id) {
            out.entry(label).or_insert(id);
        }
        stack.extend(mgr.children_of(id));
        stack.extend(mgr.mapped_entries(id).into_iter().map(|(_, v)| v));
    }
    out
}

/// Random mutation of a tree copy: numbers are perturbed, booleans flipped,
/// and list children occasionally dropped or duplicated, each with
/// probability `rate` per node.
pub fn mutate(
    mgr: &Arc<NodeManager>,
    node: NodeId,
    rate: f64,
    rand: &mut RandomStream,
) -> NodeId {
    let out = deep_copy(mgr, node);
    let mut seen = HashSet::new();
    let mut stack = vec![out];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if rand.next_double() < rate {
            match mgr.kind_of(id) {
                NodeKind::Number => {
                    let v = mgr.number_of(id);
                    let scale = if v == 0.0 { 1.0 } else { v.abs() };
                    mgr.set_number(id, v + (rand.next_double() - 0.5) * scale);
                }
                NodeKind::True => mgr.set_kind(id, NodeKind::False),
                NodeKind::False => mgr.set_kind(id, NodeKind::True),
                NodeKind::List => {
                    let count = mgr.child_count(id);
                    if count > 0 {
                        let i = rand.next_index(count);
                        if rand.next_double() < 0.5 {
                            mgr.remove_child(id, i);
                        } else {
                            let dup = mgr.child(id, i).expect("index in bounds");
                            let copy = deep_copy(mgr, dup);
                            mgr.insert_child(id, i, copy);
                        }
                    }
                }
                _ => {}
            }
        }
        stack.extend(mgr.children_of(id));
        stack.extend(mgr.mapped_entries(id).into_iter().map(|(_, v)| v));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn build(text: &str) -> (Arc<NodeManager>, NodeId) {
        let m = Arc::new(NodeManager::new());
        let n = parse(text, &m, "test", false).unwrap();
        (m, n)
    }

    #[test]
    fn deep_copy_is_equal_but_distinct() {
        let (m, n) = build("(list 1 (assoc x 2) \"s\")");
        let c = deep_copy(&m, n);
        assert_ne!(n, c);
        assert!(deep_equal(&m, n, &m, c));
    }

    #[test]
    fn deep_copy_preserves_cycles() {
        let m = Arc::new(NodeManager::new());
        let a = m.alloc(NodeKind::List);
        m.push_child(a, a);
        m.set_need_cycle_check(a, true);
        let c = deep_copy(&m, a);
        assert_eq!(m.child(c, 0), Some(c));
        assert!(m.need_cycle_check(c));
    }

    #[test]
    fn copy_between_arenas() {
        let (src, n) = build("(+ 1 2)");
        let dst = Arc::new(NodeManager::new());
        let c = deep_copy_between(&src, &dst, n);
        assert!(deep_equal(&src, n, &dst, c));
    }

    #[test]
    fn total_size_counts_each_node_once() {
        let (m, n) = build("(list 1 2 3)");
        assert_eq!(total_size(&m, n), 4);
        let cyc = m.alloc(NodeKind::List);
        m.push_child(cyc, cyc);
        assert_eq!(total_size(&m, cyc), 1);
    }

    #[test]
    fn commonality_and_edit_distance() {
        let (m, a) = build("(list 1 2 3)");
        let b = parse("(list 1 2 4)", &m, "test", false).unwrap();
        assert_eq!(commonality(&m, a, &m, b), 3.0);
        assert_eq!(edit_distance(&m, a, &m, b), 2.0);
        assert_eq!(edit_distance(&m, a, &m, a), 0.0);
    }

    #[test]
    fn intersect_keeps_agreement() {
        let (m, a) = build("(assoc x 1 y 2)");
        let b = parse("(assoc x 1 y 3)", &m, "test", false).unwrap();
        let i = intersect(&m, a, b);
        let x = intern::intern("x");
        let y = intern::intern("y");
        assert_eq!(m.number_of(m.mapped_get(i, x).unwrap()), 1.0);
        assert_eq!(m.kind_of(m.mapped_get(i, y).unwrap()), NodeKind::Null);
        intern::pool().release(x);
        intern::pool().release(y);
    }

    #[test]
    fn union_grafts_additions() {
        let (m, a) = build("(assoc x 1)");
        let b = parse("(assoc y 2)", &m, "test", false).unwrap();
        let u = union_trees(&m, a, b);
        assert_eq!(m.mapped_len(u), 2);
    }

    #[test]
    fn mix_is_deterministic() {
        let (m, a) = build("(list 1 2 3 4)");
        let b = parse("(list 5 6 7 8)", &m, "test", false).unwrap();
        let mut r1 = RandomStream::seeded("mix");
        let mut r2 = RandomStream::seeded("mix");
        let m1 = mix(&m, a, b, 0.5, &mut r1);
        let m2 = mix(&m, a, b, 0.5, &mut r2);
        assert!(deep_equal(&m, m1, &m, m2));
    }

    #[test]
    fn mutate_changes_something_at_full_rate() {
        let (m, a) = build("(list 1 2 3)");
        let mut r = RandomStream::seeded("mut");
        let out = mutate(&m, a, 1.0, &mut r);
        assert!(!deep_equal(&m, a, &m, out));
    }
}
