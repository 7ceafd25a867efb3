//! Associative-array opcodes.

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    /// `(indices coll)` — an assoc's keys, or a list's index numbers.
    pub(crate) fn op_indices(&mut self, n: NodeId) -> EvalResult {
        let arg = self.interpret(self.manager.child(n, 0), false);
        let out = self.manager.alloc(NodeKind::List);
        match arg.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => {
                for (key, _) in self.manager.mapped_entries_sorted(id) {
                    let node = self
                        .manager
                        .alloc_with_handoff(NodeKind::String, intern::pool().add_ref(key));
                    self.manager.push_child(out, node);
                }
            }
            Some(id) => {
                for i in 0..self.manager.child_count(id) {
                    let node = self.manager.alloc_number(i as f64);
                    self.manager.push_child(out, node);
                }
            }
            None => {}
        }
        self.free_result(arg);
        EvalResult::node(out, true)
    }

    /// `(values coll only_unique?)` — element values; with the flag set,
    /// structural duplicates collapse.
    pub(crate) fn op_values(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let only_unique = self.interpret_into_bool(children.get(1).copied(), false);
        let arg = self.interpret(children.first().copied(), false);

        let elements: Vec<NodeId> = match arg.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => self
                .manager
                .mapped_entries_sorted(id)
                .into_iter()
                .map(|(_, v)| v)
                .collect(),
            Some(id) => self.manager.children_of(id),
            None => Vec::new(),
        };

        let out = self.manager.alloc(NodeKind::List);
        let mut kept: Vec<NodeId> = Vec::new();
        for element in elements {
            if only_unique
                && kept
                    .iter()
                    .any(|&seen| tree::deep_equal(&self.manager, seen, &self.manager, element))
            {
                continue;
            }
            kept.push(element);
            let copied = if arg.unique {
                element
            } else {
                tree::deep_copy(&self.manager, element)
            };
            self.manager.push_child(out, copied);
        }
        if arg.unique {
            // Ownership of the kept elements moved into the output.
            if let Some(id) = arg.node_id() {
                self.manager.free_node(id);
            }
        }
        EvalResult::node(out, true)
    }

    /// `(contains_index coll key)` — membership by key or index.
    pub(crate) fn op_contains_index(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let arg = self.interpret(children.first().copied(), false);
        self.protect(&arg);
        let found = match arg.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => {
                let key = self.interpret_into_string_id_if_exists(children.get(1).copied());
                !key.is_none() && self.manager.mapped_get(id, key).is_some()
            }
            Some(id) => {
                let index = self.interpret_into_number(children.get(1).copied());
                !index.is_nan() && index >= 0.0 && (index as usize) < self.manager.child_count(id)
            }
            None => false,
        };
        self.unprotect(&arg);
        self.free_result(arg);
        self.boolean_result(found, immediate_ok)
    }

    /// `(contains_value coll value)` — membership by structural equality;
    /// for strings, substring containment.
    pub(crate) fn op_contains_value(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let arg = self.interpret(children.first().copied(), false);
        self.protect(&arg);
        let value = self.interpret(children.get(1).copied(), false);
        self.protect(&value);

        let found = match arg.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::String => {
                let hay = intern::text(self.manager.symbol_of(id));
                match self.value_to_string(&value) {
                    Some(needle) => hay.contains(&needle),
                    None => false,
                }
            }
            Some(id) => {
                let (needle, _) = match value.value {
                    Immediate::Node(v) => (Some(v), false),
                    _ => (None, false),
                };
                let elements: Vec<NodeId> = match self.manager.kind_of(id) {
                    NodeKind::Assoc => self
                        .manager
                        .mapped_entries(id)
                        .into_iter()
                        .map(|(_, v)| v)
                        .collect(),
                    _ => self.manager.children_of(id),
                };
                match needle {
                    Some(needle) => elements
                        .iter()
                        .any(|&e| tree::deep_equal(&self.manager, e, &self.manager, needle)),
                    None => {
                        let target = self.value_to_number(&value);
                        let text = self.value_to_string(&value);
                        elements.iter().any(|&e| match self.manager.kind_of(e) {
                            NodeKind::Number => self.manager.number_of(e) == target,
                            NodeKind::String | NodeKind::Symbol => {
                                Some(intern::text(self.manager.symbol_of(e))) == text
                            }
                            NodeKind::Null => value.is_null(),
                            _ => false,
                        })
                    }
                }
            }
            None => false,
        };

        self.unprotect(&value);
        self.unprotect(&arg);
        self.free_result(value);
        self.free_result(arg);
        self.boolean_result(found, immediate_ok)
    }

    /// `(remove coll key-or-list)` — a copy without the named keys or
    /// indices.
    pub(crate) fn op_remove(&mut self, n: NodeId) -> EvalResult {
        self.remove_or_keep(n, false)
    }

    /// `(keep coll key-or-list)` — a copy with only the named keys or
    /// indices.
    pub(crate) fn op_keep(&mut self, n: NodeId) -> EvalResult {
        self.remove_or_keep(n, true)
    }

    fn remove_or_keep(&mut self, n: NodeId, keep: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let arg = self.interpret(children.first().copied(), false);
        let Some(coll) = arg.node_id() else {
            self.free_result(arg);
            return EvalResult::NULL;
        };
        self.protect(&arg);

        let selector = self.interpret(children.get(1).copied(), false);
        self.protect(&selector);
        let keys: Vec<SelectorKey> = self.selector_keys(&selector);

        let result = if self.manager.kind_of(coll) == NodeKind::Assoc {
            let out = self.manager.alloc(NodeKind::Assoc);
            for (key, value) in self.manager.mapped_entries_sorted(coll) {
                let named = keys.iter().any(|k| match k {
                    SelectorKey::Text(text) => *text == intern::text(key),
                    SelectorKey::Index(_) => false,
                });
                if named == keep {
                    let copied = tree::deep_copy(&self.manager, value);
                    self.manager
                        .set_mapped_child(out, intern::pool().add_ref(key), copied);
                }
            }
            EvalResult::node(out, true)
        } else {
            let out = self.manager.alloc(NodeKind::List);
            for (i, value) in self.manager.children_of(coll).into_iter().enumerate() {
                let named = keys.iter().any(|k| match k {
                    SelectorKey::Index(idx) => *idx == i,
                    SelectorKey::Text(_) => false,
                });
                if named == keep {
                    let copied = tree::deep_copy(&self.manager, value);
                    self.manager.push_child(out, copied);
                }
            }
            EvalResult::node(out, true)
        };

        self.unprotect(&selector);
        self.unprotect(&arg);
        self.free_result(selector);
        self.free_result(arg);
        result
    }

    fn selector_keys(&mut self, selector: &EvalResult) -> Vec<SelectorKey> {
        let single = |this: &Self, id: NodeId| match this.manager.kind_of(id) {
            NodeKind::Number => {
                let v = this.manager.number_of(id);
                if v >= 0.0 && !v.is_nan() {
                    Some(SelectorKey::Index(v as usize))
                } else {
                    None
                }
            }
            NodeKind::String | NodeKind::Symbol => Some(SelectorKey::Text(intern::text(
                this.manager.symbol_of(id),
            ))),
            _ => None,
        };
        match selector.value {
            Immediate::Number(v) if v >= 0.0 && !v.is_nan() => {
                vec![SelectorKey::Index(v as usize)]
            }
            Immediate::Str(sid) => vec![SelectorKey::Text(intern::text(sid))],
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::List => self
                .manager
                .children_of(id)
                .into_iter()
                .filter_map(|c| single(self, c))
                .collect(),
            Immediate::Node(id) => single(self, id).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// `(associate k v k v ...)` — builds an assoc; each value sees the
    /// assoc under construction and its key on the construction stack.
    pub(crate) fn op_associate(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let out = self.manager.alloc(NodeKind::Assoc);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);

        let mut any_side_effect = false;
        let mut i = 0;
        while i + 1 < children.len() {
            let key = self.interpret_into_string_id_with_reference(Some(children[i]));
            if key.is_none() {
                i += 2;
                continue;
            }
            self.push_construction_context(
                Some(out),
                true,
                Immediate::Str(intern::pool().add_ref(key)),
                None,
            );
            let value = self.interpret(Some(children[i + 1]), false);
            any_side_effect |= self.pop_construction_context();
            let (node, _) = self.result_to_node_always(value);
            self.manager.set_mapped_child(out, key, node);
            i += 2;
        }
        if any_side_effect {
            self.manager.set_need_cycle_check(out, true);
        }

        self.unprotect(&keep);
        EvalResult::node(out, true)
    }

    /// `(zip keys values?)` or `(zip fn keys values)` — pairs two lists
    /// into an assoc; the function arbitrates key collisions between the
    /// existing value (`previous_result`) and the incoming one
    /// (`current_value`).
    pub(crate) fn op_zip(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = children
            .first()
            .copied()
            .filter(|&c| self.manager.kind_of(c) == NodeKind::Lambda);
        let offset = usize::from(function.is_some());
        let code = function.map(|f| {
            let r = self.interpret(Some(f), false);
            self.protect(&r);
            r
        });

        let keys = self.interpret(children.get(offset).copied(), false);
        self.protect(&keys);
        let values = self.interpret(children.get(offset + 1).copied(), false);
        self.protect(&values);

        let key_nodes: Vec<NodeId> = match keys.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::List => {
                self.manager.children_of(id)
            }
            Some(id) => vec![id],
            None => Vec::new(),
        };
        let value_nodes: Vec<NodeId> = match values.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::List => {
                self.manager.children_of(id)
            }
            Some(id) => vec![id],
            None => Vec::new(),
        };

        let out = self.manager.alloc(NodeKind::Assoc);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        for (i, &key_node) in key_nodes.iter().enumerate() {
            let Some(key_text) = self.node_to_string(key_node) else {
                continue;
            };
            let key = intern::intern(&key_text);
            let incoming = match value_nodes.get(i) {
                Some(&v) => tree::deep_copy(&self.manager, v),
                None => self.manager.alloc(NodeKind::Null),
            };
            let stored = match (self.manager.mapped_get(out, key), &code) {
                (Some(existing), Some(code)) => {
                    self.push_construction_context(
                        Some(out),
                        true,
                        Immediate::Str(intern::pool().add_ref(key)),
                        Some(incoming),
                    );
                    self.set_construction_previous(Some(existing), false);
                    let merged = self.interpret(code.node_id(), false);
                    self.pop_construction_context();
                    let (node, _) = self.result_to_node_always(merged);
                    node
                }
                _ => incoming,
            };
            self.manager.set_mapped_child(out, key, stored);
        }

        self.unprotect(&keep);
        self.unprotect(&values);
        self.unprotect(&keys);
        self.free_result(values);
        self.free_result(keys);
        if let Some(code) = code {
            self.unprotect(&code);
            self.free_result(code);
        }
        EvalResult::node(out, true)
    }

    /// `(unzip assoc keys)` — values for the listed keys, in order.
    pub(crate) fn op_unzip(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let source = self.interpret(children.first().copied(), false);
        self.protect(&source);
        let keys = self.interpret(children.get(1).copied(), false);
        self.protect(&keys);

        let out = self.manager.alloc(NodeKind::List);
        if let (Some(assoc), Some(key_list)) = (source.node_id(), keys.node_id()) {
            let key_nodes = match self.manager.kind_of(key_list) {
                NodeKind::List => self.manager.children_of(key_list),
                _ => vec![key_list],
            };
            for key_node in key_nodes {
                let value = self
                    .node_to_string(key_node)
                    .and_then(|text| intern::pool().id_if_exists(&text))
                    .and_then(|sid| self.manager.mapped_get(assoc, sid));
                let child = match value {
                    Some(v) => tree::deep_copy(&self.manager, v),
                    None => self.manager.alloc(NodeKind::Null),
                };
                self.manager.push_child(out, child);
            }
        }

        self.unprotect(&keys);
        self.unprotect(&source);
        self.free_result(keys);
        self.free_result(source);
        EvalResult::node(out, true)
    }
}

enum SelectorKey {
    Index(usize),
    Text(String),
}
