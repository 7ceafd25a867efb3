//! Node metadata opcodes (labels, comments, concurrency, value) and the
//! tree-merge family.

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::rand::RandomStream;
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Labels and comments
    // -----------------------------------------------------------------------

    /// `(get_labels x)` — the value's labels as a list of strings.
    pub(crate) fn op_get_labels(&mut self, n: NodeId) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let out = self.manager.alloc(NodeKind::List);
        if let Some(id) = result.node_id() {
            for label in self.manager.labels_of(id) {
                let node = self
                    .manager
                    .alloc_with_handoff(NodeKind::String, intern::pool().add_ref(label));
                self.manager.push_child(out, node);
            }
        }
        self.free_result(result);
        EvalResult::node(out, true)
    }

    /// `(get_all_labels x)` — label name to labeled node over the whole
    /// tree.
    pub(crate) fn op_get_all_labels(&mut self, n: NodeId) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let out = self.manager.alloc(NodeKind::Assoc);
        if let Some(id) = result.node_id() {
            let mut seen = std::collections::HashSet::new();
            let mut stack = vec![id];
            while let Some(cur) = stack.pop() {
                if !seen.insert(cur) {
                    continue;
                }
                for label in self.manager.labels_of(cur) {
                    self.manager
                        .set_mapped_child(out, intern::pool().add_ref(label), cur);
                }
                stack.extend(self.manager.children_of(cur));
                stack.extend(self.manager.mapped_entries(cur).into_iter().map(|(_, v)| v));
            }
        }
        // The assoc aliases into the inspected tree, so the result is
        // shared and the inspected tree must stay alive.
        self.manager.set_need_cycle_check(out, true);
        EvalResult::node(out, false)
    }

    /// `(set_labels x labels)` — a copy of the value carrying the new label
    /// set.
    pub(crate) fn op_set_labels(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let labels = self.string_list(children.get(1).copied());

        let (node, unique) = self.result_to_node_always(value);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        let label_ids = labels.iter().map(|l| intern::intern(l)).collect();
        self.manager.set_labels_handoff(target, label_ids);
        self.refresh_entity_labels();
        EvalResult::node(target, true)
    }

    /// `(zip_labels labels values)` — a copy of the value list with the
    /// labels applied elementwise.
    pub(crate) fn op_zip_labels(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let labels = self.string_list(children.first().copied());
        let values = self.interpret(children.get(1).copied(), false);

        let (node, unique) = self.result_to_node_always(values);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        for (i, label) in labels.iter().enumerate() {
            if let Some(child) = self.manager.child(target, i) {
                self.manager.add_label(child, label);
            }
        }
        self.refresh_entity_labels();
        EvalResult::node(target, true)
    }

    /// `(get_comments x)` — the comment text, null when absent.
    pub(crate) fn op_get_comments(&mut self, n: NodeId) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let comment = match result.node_id() {
            Some(id) => self.manager.comment_of(id),
            None => crate::intern::SymbolId::NONE,
        };
        self.free_result(result);
        if comment.is_none() {
            EvalResult::NULL
        } else {
            EvalResult::string(intern::pool().add_ref(comment))
        }
    }

    /// `(set_comments x text)` — a copy carrying the new comment.
    pub(crate) fn op_set_comments(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let comment = self.interpret_into_string(children.get(1).copied());

        let (node, unique) = self.result_to_node_always(value);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        match comment {
            Some(text) => self
                .manager
                .set_comment_handoff(target, intern::intern(&text)),
            None => self
                .manager
                .set_comment_handoff(target, crate::intern::SymbolId::NONE),
        }
        EvalResult::node(target, true)
    }

    /// `(get_concurrency x)`.
    pub(crate) fn op_get_concurrency(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let requested = result
            .node_id()
            .map(|id| self.manager.concurrency_requested(id))
            .unwrap_or(false);
        self.free_result(result);
        self.boolean_result(requested, immediate_ok)
    }

    /// `(set_concurrency x on)` — a copy with the concurrency request
    /// toggled.
    pub(crate) fn op_set_concurrency(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let on = self.interpret_into_bool(children.get(1).copied(), false);

        let (node, unique) = self.result_to_node_always(value);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        self.manager.set_concurrency_requested(target, on);
        EvalResult::node(target, true)
    }

    /// `(get_value x)` — the value stripped of labels and comments.
    pub(crate) fn op_get_value(&mut self, n: NodeId) -> EvalResult {
        let value = self.interpret(self.manager.child(n, 0), false);
        let (node, unique) = self.result_to_node_always(value);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        self.manager.clear_metadata(target);
        EvalResult::node(target, true)
    }

    /// `(set_value target source)` — the target's metadata wrapped around
    /// the source's value.
    pub(crate) fn op_set_value(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let target = self.interpret(children.first().copied(), false);
        self.protect(&target);
        let source = self.interpret(children.get(1).copied(), false);
        let (source_node, source_unique) = self.result_to_node_always(source);
        self.unprotect(&target);

        let (target_node, _) = self.result_to_node_always(target);
        let out = if source_unique {
            source_node
        } else {
            tree::deep_copy(&self.manager, source_node)
        };
        let pool = intern::pool();
        let labels = self
            .manager
            .labels_of(target_node)
            .into_iter()
            .map(|l| pool.add_ref(l))
            .collect();
        self.manager.set_labels_handoff(out, labels);
        let comment = self.manager.comment_of(target_node);
        self.manager.set_comment_handoff(out, pool.add_ref(comment));
        EvalResult::node(out, true)
    }

    // -----------------------------------------------------------------------
    // Tree merging
    // -----------------------------------------------------------------------

    /// `(total_size x)` — node count of the tree.
    pub(crate) fn op_total_size(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let size = match result.node_id() {
            Some(id) => tree::total_size(&self.manager, id) as f64,
            None => 0.0,
        };
        self.free_result(result);
        self.number_result(size, immediate_ok)
    }

    /// `(mutate tree rate?)` — a randomly perturbed copy.
    pub(crate) fn op_mutate(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let rate = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|r| !r.is_nan() && *r >= 0.0)
            .unwrap_or(1e-5);
        let Some(id) = value.node_id() else {
            self.free_result(value);
            return EvalResult::NULL;
        };
        self.protect(&value);
        let mut stream = self.scratch_stream();
        let mutated = tree::mutate(&self.manager, id, rate, &mut stream);
        self.unprotect(&value);
        self.free_result(value);
        EvalResult::node(mutated, true)
    }

    /// `(commonality a b)` — count of shared structure.
    pub(crate) fn op_commonality(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let (a, b) = self.two_trees(n);
        let value = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => tree::commonality(&self.manager, x, &self.manager, y),
            _ => 0.0,
        };
        self.free_two(a, b);
        self.number_result(value, immediate_ok)
    }

    /// `(edit_distance a b)`.
    pub(crate) fn op_edit_distance(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let (a, b) = self.two_trees(n);
        let value = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => tree::edit_distance(&self.manager, x, &self.manager, y),
            (None, None) => 0.0,
            (Some(x), None) | (None, Some(x)) => tree::total_size(&self.manager, x) as f64,
        };
        self.free_two(a, b);
        self.number_result(value, immediate_ok)
    }

    pub(crate) fn op_intersect(&mut self, n: NodeId) -> EvalResult {
        let (a, b) = self.two_trees(n);
        let result = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => {
                EvalResult::node(tree::intersect(&self.manager, x, y), true)
            }
            _ => EvalResult::NULL,
        };
        self.free_two(a, b);
        result
    }

    pub(crate) fn op_union(&mut self, n: NodeId) -> EvalResult {
        let (a, b) = self.two_trees(n);
        let result = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => {
                EvalResult::node(tree::union_trees(&self.manager, x, y), true)
            }
            (Some(x), None) | (None, Some(x)) => {
                EvalResult::node(tree::deep_copy(&self.manager, x), true)
            }
            (None, None) => EvalResult::NULL,
        };
        self.free_two(a, b);
        result
    }

    pub(crate) fn op_difference(&mut self, n: NodeId) -> EvalResult {
        let (a, b) = self.two_trees(n);
        let result = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => {
                EvalResult::node(tree::difference(&self.manager, x, y), true)
            }
            (None, Some(y)) => EvalResult::node(tree::deep_copy(&self.manager, y), true),
            _ => EvalResult::NULL,
        };
        self.free_two(a, b);
        result
    }

    /// `(mix a b fraction?)` — structural blend keeping each of `a`'s
    /// positions with the given probability.
    pub(crate) fn op_mix(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let a = self.interpret(children.first().copied(), false);
        self.protect(&a);
        let b = self.interpret(children.get(1).copied(), false);
        self.protect(&b);
        let fraction = children
            .get(2)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|f| !f.is_nan())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let result = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => {
                let mut stream = self.scratch_stream();
                EvalResult::node(tree::mix(&self.manager, x, y, fraction, &mut stream), true)
            }
            (Some(x), None) | (None, Some(x)) => {
                EvalResult::node(tree::deep_copy(&self.manager, x), true)
            }
            (None, None) => EvalResult::NULL,
        };
        self.unprotect(&b);
        self.unprotect(&a);
        self.free_result(b);
        self.free_result(a);
        result
    }

    /// `(mix_labels a b fraction?)` — blend driven by shared labels.
    pub(crate) fn op_mix_labels(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let a = self.interpret(children.first().copied(), false);
        self.protect(&a);
        let b = self.interpret(children.get(1).copied(), false);
        self.protect(&b);
        let fraction = children
            .get(2)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|f| !f.is_nan())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let result = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y)) => {
                let mut stream = self.scratch_stream();
                EvalResult::node(
                    tree::mix_labels(&self.manager, x, y, fraction, &mut stream),
                    true,
                )
            }
            (Some(x), None) | (None, Some(x)) => {
                EvalResult::node(tree::deep_copy(&self.manager, x), true)
            }
            (None, None) => EvalResult::NULL,
        };
        self.unprotect(&b);
        self.unprotect(&a);
        self.free_result(b);
        self.free_result(a);
        result
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn two_trees(&mut self, n: NodeId) -> (EvalResult, EvalResult) {
        let children = self.manager.children_of(n);
        let a = self.interpret(children.first().copied(), false);
        self.protect(&a);
        let b = self.interpret(children.get(1).copied(), false);
        self.protect(&b);
        (a, b)
    }

    fn free_two(&mut self, a: EvalResult, b: EvalResult) {
        self.unprotect(&b);
        self.unprotect(&a);
        self.free_result(b);
        self.free_result(a);
    }

    /// Evaluates a node to a list of strings.
    pub(crate) fn string_list(&mut self, node: Option<NodeId>) -> Vec<String> {
        let result = self.interpret(node, false);
        let out = match result.value {
            Immediate::Str(sid) => vec![intern::text(sid)],
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::List => self
                .manager
                .children_of(id)
                .into_iter()
                .filter_map(|c| self.node_to_string(c))
                .collect(),
            Immediate::Node(id) => self.node_to_string(id).into_iter().collect(),
            _ => Vec::new(),
        };
        self.free_result(result);
        out
    }

    /// Rebuilds the entity's label index after a label mutation.
    pub(crate) fn refresh_entity_labels(&mut self) {
        self.note_side_effect();
        if let Some(entity) = &self.entity {
            entity.rebuild_label_index();
        }
    }

    /// A deterministic scratch stream for stochastic tree operations,
    /// advanced off the interpreter's stream so successive calls differ.
    pub(crate) fn scratch_stream(&mut self) -> RandomStream {
        let draw = self.next_rand_double();
        RandomStream::seeded(&format!("scratch-{:x}", draw.to_bits()))
    }
}
