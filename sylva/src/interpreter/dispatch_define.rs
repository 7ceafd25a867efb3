//! Definition, retrieval, stack-introspection, and simulation opcodes.

use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Scopes and bindings
    // -----------------------------------------------------------------------

    /// `(let assoc body...)` — pushes the assoc as a new lexical frame.
    pub(crate) fn op_let(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let frame = self.build_args_frame(children.first().copied());
        self.push_frame(frame);
        let (result, _) = self.eval_sequence(&children[1.min(children.len())..], immediate_ok);
        self.pop_frame();
        result
    }

    /// `(declare assoc body...)` — defaults bindings into the current frame
    /// without creating a scope; existing bindings are left alone.
    pub(crate) fn op_declare(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        if let Some(&bindings) = children.first() {
            let evaluated = self.interpret(Some(bindings), false);
            if let Some(assoc) = evaluated.node_id() {
                if self.manager.kind_of(assoc) == NodeKind::Assoc {
                    let frame = self.current_frame();
                    for (key, value) in self.manager.mapped_entries_sorted(assoc) {
                        if self.manager.mapped_get(frame, key).is_none() {
                            let bound = if evaluated.unique {
                                value
                            } else {
                                tree::deep_copy(&self.manager, value)
                            };
                            self.manager
                                .set_mapped_child(frame, intern::pool().add_ref(key), bound);
                        }
                    }
                }
            }
        }
        let (result, _) = self.eval_sequence(&children[1.min(children.len())..], immediate_ok);
        result
    }

    /// `(assign sym value)`, `(assign assoc)`, or `(assign sym path... value)`
    /// — rebinds symbols found by walking the call stack. `accum`
    /// accumulates instead of overwriting: numbers add, strings concatenate,
    /// lists append, maps merge.
    pub(crate) fn op_assign_accum(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);
        let accumulate = kind == NodeKind::Accum;

        // Single-child form: an assoc of symbol -> value.
        if children.len() == 1 {
            let bindings = self.interpret(children.first().copied(), false);
            if let Some(assoc) = bindings.node_id() {
                if self.manager.kind_of(assoc) == NodeKind::Assoc {
                    for (key, value) in self.manager.mapped_entries_sorted(assoc) {
                        let bound = if bindings.unique {
                            value
                        } else {
                            tree::deep_copy(&self.manager, value)
                        };
                        let stored = if accumulate {
                            self.accumulate_binding(key, EvalResult::node(bound, bindings.unique))
                        } else {
                            bound
                        };
                        self.set_call_stack_symbol(key, stored);
                    }
                }
            }
            return EvalResult::NULL;
        }

        let sid = self.interpret_into_string_id_with_reference(children.first().copied());
        if sid.is_none() {
            return EvalResult::NULL;
        }

        if children.len() <= 2 {
            let value = self.interpret(children.get(1).copied(), false);
            let stored = if accumulate {
                self.accumulate_binding(sid, value)
            } else {
                let (node, _) = self.result_to_node_always(value);
                node
            };
            self.set_call_stack_symbol(sid, stored);
            intern::pool().release(sid);
            return EvalResult::NULL;
        }

        // Path form: mutate inside the bound structure. The bound node may
        // be aliased from elsewhere on the stack, so mutate a copy and
        // rebind it.
        let current = match self.get_call_stack_symbol(sid) {
            Some((_, _, value)) => tree::deep_copy(&self.manager, value),
            None => self.manager.alloc(NodeKind::List),
        };
        let keep = EvalResult::node(current, true);
        self.protect(&keep);

        let path_children = &children[1..children.len() - 1];
        let path_node = if path_children.len() == 1 {
            Some(path_children[0])
        } else {
            let list = self.manager.alloc(NodeKind::List);
            self.manager.set_children(list, path_children.to_vec());
            Some(list)
        };
        let value = self.interpret(children.last().copied(), false);
        self.protect(&value);
        let slot = self.traverse_to_destination_from_path_list(current, path_node, true);
        self.unprotect(&value);
        if let Some(slot) = slot {
            let existing = self.read_slot(&slot);
            let stored = if accumulate {
                let base = existing.map(|e| tree::deep_copy(&self.manager, e));
                self.accumulate_nodes(base, value)
            } else {
                let (node, _) = self.result_to_node_always(value);
                node
            };
            self.write_slot(slot, stored);
        } else {
            self.free_result(value);
        }
        self.unprotect(&keep);
        self.set_call_stack_symbol(sid, current);
        intern::pool().release(sid);
        EvalResult::NULL
    }

    fn accumulate_binding(&mut self, sid: SymbolId, value: EvalResult) -> NodeId {
        let base = self
            .get_call_stack_symbol(sid)
            .map(|(_, _, bound)| tree::deep_copy(&self.manager, bound));
        self.accumulate_nodes(base, value)
    }

    /// Applies the accum type table to `base` (an owned copy) and `value`.
    pub(crate) fn accumulate_nodes(
        &mut self,
        base: Option<NodeId>,
        value: EvalResult,
    ) -> NodeId {
        let Some(base) = base else {
            let (node, _) = self.result_to_node_always(value);
            return node;
        };
        match self.manager.kind_of(base) {
            NodeKind::Number => {
                let sum = self.manager.number_of(base) + self.value_to_number(&value);
                self.free_result(value);
                self.manager.set_number(base, sum);
                base
            }
            NodeKind::String => {
                let mut text = intern::text(self.manager.symbol_of(base));
                if let Some(suffix) = self.value_to_string(&value) {
                    text.push_str(&suffix);
                }
                self.free_result(value);
                self.manager.set_symbol_handoff(base, intern::intern(&text));
                base
            }
            NodeKind::List => {
                let (node, unique) = self.result_to_node_always(value);
                if self.manager.kind_of(node) == NodeKind::List {
                    for child in self.manager.children_of(node) {
                        let appended = if unique {
                            child
                        } else {
                            tree::deep_copy(&self.manager, child)
                        };
                        self.manager.push_child(base, appended);
                    }
                } else {
                    self.manager.push_child(base, node);
                }
                base
            }
            NodeKind::Assoc => {
                let (node, unique) = self.result_to_node_always(value);
                if self.manager.kind_of(node) == NodeKind::Assoc {
                    for (key, child) in self.manager.mapped_entries_sorted(node) {
                        let merged = if unique {
                            child
                        } else {
                            tree::deep_copy(&self.manager, child)
                        };
                        self.manager
                            .set_mapped_child(base, intern::pool().add_ref(key), merged);
                    }
                }
                base
            }
            _ => {
                // Accumulating onto null or code falls back to replacement.
                self.manager.free_node_tree(base);
                let (node, _) = self.result_to_node_always(value);
                node
            }
        }
    }

    /// `(retrieve sym)` or `(retrieve (list sym...))` — reads bindings from
    /// the lexical chain, newest frame first.
    pub(crate) fn op_retrieve(&mut self, n: NodeId) -> EvalResult {
        let spec = self.interpret(self.manager.child(n, 0), false);
        let result = match spec.value {
            Immediate::Str(sid) => self.lookup_symbol_value(sid),
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::List => {
                let out = self.manager.alloc(NodeKind::List);
                for child in self.manager.children_of(id) {
                    let sid = self.manager.symbol_of(child);
                    let value = self.lookup_symbol_value(sid);
                    let (node, _) = self.result_to_node_always(value);
                    self.manager.push_child(out, node);
                }
                self.manager.set_need_cycle_check(out, true);
                EvalResult::node(out, false)
            }
            Immediate::Node(id)
                if matches!(
                    self.manager.kind_of(id),
                    NodeKind::String | NodeKind::Symbol
                ) =>
            {
                self.lookup_symbol_value(self.manager.symbol_of(id))
            }
            _ => EvalResult::NULL,
        };
        self.free_result(spec);
        result
    }

    pub(crate) fn lookup_symbol_value(&mut self, sid: SymbolId) -> EvalResult {
        if let Some((_, _, value)) = self.get_call_stack_symbol(sid) {
            // Bindings stay owned by their frame; the caller gets an alias.
            return EvalResult::node(value, false);
        }
        // Fall back to the entity: labeled nodes, then associative roots.
        if let Some(entity) = &self.entity {
            if let Some(value) = entity.symbol_value(sid, true) {
                return EvalResult::node(value, false);
            }
        }
        EvalResult::NULL
    }

    /// `(get target path...)` — traverses a node graph by index or key. A
    /// single path yields the node; several paths yield a list.
    pub(crate) fn op_get(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let target = self.interpret(children.first().copied(), false);
        let Some(base) = target.node_id() else {
            self.free_result(target);
            return EvalResult::NULL;
        };
        self.protect(&target);

        let paths = &children[1..];
        let result = match paths {
            [] => EvalResult::node(base, target.unique),
            [single] => {
                match self.traverse_to_destination_from_path_list(base, Some(*single), false) {
                    Some(slot) => {
                        let found = self.read_slot(&slot);
                        self.drop_slot(slot);
                        match found {
                            Some(id) => EvalResult::node(id, false),
                            None => EvalResult::NULL,
                        }
                    }
                    None => EvalResult::NULL,
                }
            }
            several => {
                let out = self.manager.alloc(NodeKind::List);
                for &path in several {
                    let found = self
                        .traverse_to_destination_from_path_list(base, Some(path), false)
                        .and_then(|slot| {
                            let found = self.read_slot(&slot);
                            self.drop_slot(slot);
                            found
                        });
                    let child = match found {
                        Some(id) => id,
                        None => self.manager.alloc(NodeKind::Null),
                    };
                    self.manager.push_child(out, child);
                }
                self.manager.set_need_cycle_check(out, true);
                EvalResult::node(out, false)
            }
        };
        self.unprotect(&target);
        result
    }

    /// `(set target path value ...)` writes values at paths; `(replace
    /// target path fn ...)` evaluates `fn` with the addressed node as the
    /// current value and stores the result. Both mutate a uniquely owned
    /// copy of the target.
    pub(crate) fn op_set_replace(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);
        let target = self.interpret(children.first().copied(), false);
        let base = match target.value {
            Immediate::Node(id) if target.unique => id,
            Immediate::Node(id) => tree::deep_copy(&self.manager, id),
            _ => {
                self.free_result(target);
                return EvalResult::NULL;
            }
        };
        let keep = EvalResult::node(base, true);
        self.protect(&keep);

        let mut i = 1;
        while i < children.len() {
            let path = children[i];
            let Some(&op_child) = children.get(i + 1) else {
                break;
            };
            if let Some(slot) = self.traverse_to_destination_from_path_list(base, Some(path), true)
            {
                let stored = if kind == NodeKind::Set {
                    let value = self.interpret(Some(op_child), false);
                    let (node, _) = self.result_to_node_always(value);
                    node
                } else {
                    let existing = self.read_slot(&slot);
                    self.push_construction_context(
                        Some(base),
                        true,
                        Immediate::Null,
                        existing,
                    );
                    let replaced = self.interpret(Some(op_child), false);
                    self.pop_construction_context();
                    let (node, _) = self.result_to_node_always(replaced);
                    node
                };
                self.write_slot(slot, stored);
            }
            i += 2;
        }

        self.unprotect(&keep);
        EvalResult::node(base, true)
    }

    // -----------------------------------------------------------------------
    // Stack introspection
    // -----------------------------------------------------------------------

    /// `(target depth?)` — the collection under construction.
    pub(crate) fn op_target(&mut self, n: NodeId) -> EvalResult {
        let depth = self.optional_depth(n);
        match self.construction_target(depth) {
            Some(id) => EvalResult::node(id, false),
            None => EvalResult::NULL,
        }
    }

    /// `(current_index depth?)` — the iteration index or key.
    pub(crate) fn op_current_index(&mut self, n: NodeId) -> EvalResult {
        let depth = self.optional_depth(n);
        match self.construction_index(depth) {
            Some(&Immediate::Number(v)) => EvalResult::number(v),
            Some(&Immediate::Str(sid)) => EvalResult::string(intern::pool().add_ref(sid)),
            _ => EvalResult::NULL,
        }
    }

    /// `(current_value depth?)` — the element being iterated.
    pub(crate) fn op_current_value(&mut self, n: NodeId) -> EvalResult {
        let depth = self.optional_depth(n);
        match self.construction_value(depth) {
            Some(id) => EvalResult::node(id, false),
            None => EvalResult::NULL,
        }
    }

    /// `(previous_result depth?)` — the previous iteration's value.
    pub(crate) fn op_previous_result(&mut self, n: NodeId) -> EvalResult {
        let depth = self.optional_depth(n);
        match self.construction_previous(depth) {
            Some(id) => EvalResult::node(id, false),
            None => EvalResult::NULL,
        }
    }

    /// `(opcode_stack offset?)` — a copy of the nodes under evaluation; with
    /// an offset, the node that many levels up from the top.
    pub(crate) fn op_opcode_stack(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        match children.first() {
            None => {
                let copy = tree::deep_copy(&self.manager, self.opcode_stack);
                EvalResult::node(copy, true)
            }
            Some(&offset_node) => {
                let offset = self.interpret_into_number(Some(offset_node));
                if offset.is_nan() || offset < 0.0 {
                    return EvalResult::NULL;
                }
                let count = self.manager.child_count(self.opcode_stack);
                let index = count.checked_sub(1 + offset as usize);
                match index.and_then(|i| self.manager.child(self.opcode_stack, i)) {
                    Some(id) => {
                        let copy = tree::deep_copy(&self.manager, id);
                        EvalResult::node(copy, true)
                    }
                    None => EvalResult::NULL,
                }
            }
        }
    }

    /// `(stack)` — a copy of the whole call stack.
    pub(crate) fn op_stack(&mut self, _n: NodeId) -> EvalResult {
        let copy = tree::deep_copy(&self.manager, self.call_stack);
        EvalResult::node(copy, true)
    }

    /// `(args depth?)` — the lexical frame `depth` levels below the top.
    pub(crate) fn op_args(&mut self, n: NodeId) -> EvalResult {
        let depth = self.optional_depth(n);
        let count = self.call_stack_depth();
        let index = count.checked_sub(1 + depth);
        match index.and_then(|i| self.manager.child(self.call_stack, i)) {
            Some(frame) => EvalResult::node(frame, false),
            None => EvalResult::NULL,
        }
    }

    fn optional_depth(&mut self, n: NodeId) -> usize {
        match self.manager.child(n, 0) {
            Some(child) => {
                let v = self.interpret_into_number(Some(child));
                if v.is_nan() || v < 0.0 {
                    0
                } else {
                    v as usize
                }
            }
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// `(rand)` in [0,1); `(rand x)` in [0,x); `(rand list)` picks an
    /// element; an extra count yields a list of draws.
    pub(crate) fn op_rand(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(&domain) = children.first() else {
            let draw = self.next_rand_double_owned();
            return self.number_result(draw, immediate_ok);
        };
        let count = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|v| *v >= 1.0)
            .map(|v| v as usize);

        let domain_result = self.interpret(Some(domain), false);
        self.protect(&domain_result);
        let draw = |this: &mut Self, domain_result: &EvalResult| -> EvalResult {
            match domain_result.value {
                Immediate::Number(v) => EvalResult::number(this.next_rand_double_owned() * v),
                Immediate::Node(id) if this.manager.kind_of(id) == NodeKind::List => {
                    let len = this.manager.child_count(id);
                    if len == 0 {
                        return EvalResult::NULL;
                    }
                    let pick = this.next_rand_index(len);
                    match this.manager.child(id, pick) {
                        Some(chosen) => {
                            EvalResult::node(tree::deep_copy(&this.manager, chosen), true)
                        }
                        None => EvalResult::NULL,
                    }
                }
                Immediate::Node(id) if this.manager.kind_of(id) == NodeKind::Number => {
                    let v = this.manager.number_of(id);
                    EvalResult::number(this.next_rand_double_owned() * v)
                }
                _ => EvalResult::number(this.next_rand_double_owned()),
            }
        };

        let result = match count {
            None => {
                let r = draw(self, &domain_result);
                match r.value {
                    Immediate::Number(v) => self.number_result(v, immediate_ok),
                    _ => r,
                }
            }
            Some(count) => {
                let out = self.manager.alloc(NodeKind::List);
                for _ in 0..count {
                    let r = draw(self, &domain_result);
                    let (node, _) = self.result_to_node_always(r);
                    self.manager.push_child(out, node);
                }
                EvalResult::node(out, true)
            }
        };
        self.unprotect(&domain_result);
        let domain_keep = domain_result;
        self.free_result(domain_keep);
        result
    }

    /// `(weighted_rand assoc count?)` — keys drawn with probability
    /// proportional to their numeric values.
    pub(crate) fn op_weighted_rand(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let weights = self.interpret(children.first().copied(), false);
        let Some(assoc) = weights.node_id().filter(|&id| {
            self.manager.kind_of(id) == NodeKind::Assoc
        }) else {
            self.free_result(weights);
            return EvalResult::NULL;
        };
        self.protect(&weights);

        let entries: Vec<(SymbolId, f64)> = self
            .manager
            .mapped_entries_sorted(assoc)
            .into_iter()
            .map(|(k, v)| (k, self.node_to_number(v).max(0.0)))
            .filter(|(_, w)| *w > 0.0 && !w.is_nan())
            .collect();
        let total: f64 = entries.iter().map(|(_, w)| w).sum();

        let count = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|v| *v >= 1.0)
            .map(|v| v as usize);

        let mut draw_key = |this: &mut Self| -> SymbolId {
            if total <= 0.0 || entries.is_empty() {
                return SymbolId::NONE;
            }
            let mut roll = this.next_rand_double_owned() * total;
            for &(key, weight) in &entries {
                roll -= weight;
                if roll <= 0.0 {
                    return key;
                }
            }
            entries[entries.len() - 1].0
        };

        let result = match count {
            None => {
                let key = draw_key(self);
                if key.is_none() {
                    EvalResult::NULL
                } else {
                    EvalResult::string(intern::pool().add_ref(key))
                }
            }
            Some(count) => {
                let out = self.manager.alloc(NodeKind::List);
                for _ in 0..count {
                    let key = draw_key(self);
                    let child = if key.is_none() {
                        self.manager.alloc(NodeKind::Null)
                    } else {
                        self.manager
                            .alloc_with_handoff(NodeKind::String, intern::pool().add_ref(key))
                    };
                    self.manager.push_child(out, child);
                }
                EvalResult::node(out, true)
            }
        };
        self.unprotect(&weights);
        self.free_result(weights);
        result
    }

    pub(crate) fn op_get_rand_seed(&mut self, _n: NodeId) -> EvalResult {
        let seed = match &self.entity {
            Some(entity) => entity.rand_seed(),
            None => self.fallback_rand.seed().to_string(),
        };
        EvalResult::string(intern::intern(&seed))
    }

    pub(crate) fn op_set_rand_seed(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(seed) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        match &self.entity {
            Some(entity) => entity.set_rand_seed(&seed),
            None => self.fallback_rand.set_seed(&seed),
        }
        self.note_side_effect();
        EvalResult::string(intern::intern(&seed))
    }

    pub(crate) fn op_system_time(&mut self, _n: NodeId) -> EvalResult {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        EvalResult::number(now)
    }

    fn next_rand_double_owned(&mut self) -> f64 {
        self.next_rand_double()
    }
}
