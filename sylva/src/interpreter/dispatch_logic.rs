//! Logic, equivalence, constants, leaf literals, and node-type opcodes.

use std::cmp::Ordering;

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Logic
    // -----------------------------------------------------------------------

    /// `(and ...)` — short-circuits on the first falsy child; otherwise the
    /// last value is the result.
    pub(crate) fn op_and(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut last = EvalResult::NULL;
        for (i, &child) in children.iter().enumerate() {
            self.protect(&last);
            let result = self.interpret(Some(child), immediate_ok && i + 1 == children.len());
            self.unprotect(&last);
            if !self.value_truthy(&result, false) {
                self.free_result(result);
                self.free_result(last);
                return self.boolean_result(false, immediate_ok);
            }
            let prev = std::mem::replace(&mut last, result);
            self.free_result(prev);
        }
        if children.is_empty() {
            return self.boolean_result(true, immediate_ok);
        }
        last
    }

    /// `(or ...)` — the first truthy value wins.
    pub(crate) fn op_or(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        for &child in &children {
            let result = self.interpret(Some(child), immediate_ok);
            if self.value_truthy(&result, false) {
                return result;
            }
            self.free_result(result);
        }
        self.boolean_result(false, immediate_ok)
    }

    /// `(xor ...)` — true when an odd number of children are truthy.
    pub(crate) fn op_xor(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut truthy = 0usize;
        for &child in &children {
            let result = self.interpret(Some(child), true);
            if self.value_truthy(&result, false) {
                truthy += 1;
            }
            self.free_result(result);
        }
        self.boolean_result(truthy % 2 == 1, immediate_ok)
    }

    pub(crate) fn op_not(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let value = !self.interpret_into_bool(self.manager.child(n, 0), false);
        self.boolean_result(value, immediate_ok)
    }

    // -----------------------------------------------------------------------
    // Equivalence
    // -----------------------------------------------------------------------

    /// `(= ...)` — true when every child is structurally equal; `(!= ...)`
    /// — true when no two children are equal.
    pub(crate) fn op_equal(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut results: Vec<EvalResult> = Vec::with_capacity(children.len());
        for &child in &children {
            let result = self.interpret(Some(child), true);
            self.protect(&result);
            results.push(result);
        }

        let value = if kind == NodeKind::Equal {
            results
                .windows(2)
                .all(|pair| self.results_equal(&pair[0], &pair[1]))
        } else {
            let mut distinct = true;
            'outer: for i in 0..results.len() {
                for j in i + 1..results.len() {
                    if self.results_equal(&results[i], &results[j]) {
                        distinct = false;
                        break 'outer;
                    }
                }
            }
            distinct
        };

        for result in results.into_iter().rev() {
            self.unprotect(&result);
            self.free_result(result);
        }
        self.boolean_result(value, immediate_ok)
    }

    /// `(< ...)`, `(<= ...)`, `(> ...)`, `(>= ...)` — chained comparison;
    /// incomparable values (NaN, mixed kinds) fail the chain.
    pub(crate) fn op_compare(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut holds = true;
        let mut prev: Option<EvalResult> = None;
        for &child in &children {
            if let Some(earlier) = &prev {
                self.protect(earlier);
            }
            let result = self.interpret(Some(child), true);
            if let Some(earlier) = &prev {
                self.unprotect(earlier);
            }
            if let Some(earlier) = prev.take() {
                let ordering = self.results_order(&earlier, &result);
                holds &= match (ordering, kind) {
                    (Some(Ordering::Less), NodeKind::Less | NodeKind::Lequal) => true,
                    (Some(Ordering::Equal), NodeKind::Lequal | NodeKind::Gequal) => true,
                    (Some(Ordering::Greater), NodeKind::Greater | NodeKind::Gequal) => true,
                    _ => false,
                };
                self.free_result(earlier);
                if !holds {
                    self.free_result(result);
                    return self.boolean_result(false, immediate_ok);
                }
            }
            prev = Some(result);
        }
        if let Some(last) = prev {
            self.free_result(last);
        }
        self.boolean_result(holds, immediate_ok)
    }

    /// `(~ ...)` — all children share one kind; `(!~ ...)` — no two do.
    pub(crate) fn op_type_equals(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut kinds: Vec<NodeKind> = Vec::with_capacity(children.len());
        for &child in &children {
            let result = self.interpret(Some(child), true);
            kinds.push(self.result_kind(&result));
            self.free_result(result);
        }
        let value = if kind == NodeKind::TypeEquals {
            kinds.windows(2).all(|pair| pair[0] == pair[1])
        } else {
            let mut distinct = true;
            'outer: for i in 0..kinds.len() {
                for j in i + 1..kinds.len() {
                    if kinds[i] == kinds[j] {
                        distinct = false;
                        break 'outer;
                    }
                }
            }
            distinct
        };
        self.boolean_result(value, immediate_ok)
    }

    pub(crate) fn result_kind(&self, result: &EvalResult) -> NodeKind {
        match result.value {
            Immediate::Null => NodeKind::Null,
            Immediate::Number(_) => NodeKind::Number,
            Immediate::Str(_) => NodeKind::String,
            Immediate::Node(id) => self.manager.kind_of(id),
        }
    }

    pub(crate) fn results_equal(&self, a: &EvalResult, b: &EvalResult) -> bool {
        match (a.value, b.value) {
            (Immediate::Null, Immediate::Null) => true,
            (Immediate::Node(x), Immediate::Node(y)) => {
                tree::deep_equal(&self.manager, x, &self.manager, y)
            }
            _ => {
                let ka = self.result_kind(a);
                let kb = self.result_kind(b);
                if ka == NodeKind::Number && kb == NodeKind::Number {
                    let (x, y) = (self.value_to_number(a), self.value_to_number(b));
                    return x == y || (x.is_nan() && y.is_nan());
                }
                if ka != kb {
                    return false;
                }
                match ka {
                    NodeKind::Null | NodeKind::True | NodeKind::False => true,
                    NodeKind::String | NodeKind::Symbol => {
                        self.value_to_string(a) == self.value_to_string(b)
                    }
                    _ => false,
                }
            }
        }
    }

    fn results_order(&self, a: &EvalResult, b: &EvalResult) -> Option<Ordering> {
        let ka = self.result_kind(a);
        let kb = self.result_kind(b);
        if ka == NodeKind::Number || kb == NodeKind::Number {
            let (x, y) = (self.value_to_number(a), self.value_to_number(b));
            return x.partial_cmp(&y);
        }
        if matches!(ka, NodeKind::String | NodeKind::Symbol)
            && matches!(kb, NodeKind::String | NodeKind::Symbol)
        {
            return Some(self.value_to_string(a).cmp(&self.value_to_string(b)));
        }
        None
    }

    // -----------------------------------------------------------------------
    // Constants and leaf literals
    // -----------------------------------------------------------------------

    pub(crate) fn op_constant(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        match kind {
            NodeKind::True => self.boolean_result(true, immediate_ok),
            NodeKind::False => self.boolean_result(false, immediate_ok),
            _ => {
                let _ = n;
                EvalResult::NULL
            }
        }
    }

    pub(crate) fn op_number_literal(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        if immediate_ok {
            EvalResult::number(self.manager.number_of(n))
        } else {
            // The literal itself is the value; it stays owned by the program
            // tree, so the reference is shared.
            EvalResult::node(n, false)
        }
    }

    pub(crate) fn op_string_literal(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        if immediate_ok {
            EvalResult::string(intern::pool().add_ref(self.manager.symbol_of(n)))
        } else {
            EvalResult::node(n, false)
        }
    }

    /// A bare symbol reads its binding from the lexical chain.
    pub(crate) fn op_symbol(&mut self, n: NodeId) -> EvalResult {
        let sid = self.manager.symbol_of(n);
        self.lookup_symbol_value(sid)
    }

    /// `(list child...)` — evaluates children into a fresh list. Fans out
    /// when this node requests concurrency.
    pub(crate) fn op_list(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);

        if let Some(results) = self.interpret_nodes_concurrently(n, &children, false) {
            let out = self.manager.alloc(NodeKind::List);
            for result in results {
                let (node, _) = self.result_to_node_always(result);
                self.manager.push_child(out, node);
            }
            self.manager.set_need_cycle_check(out, true);
            return EvalResult::node(out, true);
        }

        let out = self.manager.alloc(NodeKind::List);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        let mut unique = true;
        for (i, &child) in children.iter().enumerate() {
            self.push_construction_context(Some(out), true, Immediate::Number(i as f64), None);
            let result = self.interpret(Some(child), false);
            self.pop_construction_context();
            unique &= result.unique || matches!(result.value, Immediate::Null);
            let (node, _) = self.result_to_node_always(result);
            self.manager.push_child(out, node);
            if self.unwinding.is_some() {
                break;
            }
        }
        if !unique {
            self.manager.set_need_cycle_check(out, true);
        }
        self.unprotect(&keep);
        EvalResult::node(out, unique)
    }

    /// `(assoc k v ...)` — evaluates mapped children into a fresh assoc.
    pub(crate) fn op_assoc(&mut self, n: NodeId) -> EvalResult {
        let out = self.manager.alloc(NodeKind::Assoc);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        let mut unique = true;
        for (key, child) in self.manager.mapped_entries_sorted(n) {
            self.push_construction_context(
                Some(out),
                true,
                Immediate::Str(intern::pool().add_ref(key)),
                None,
            );
            let result = self.interpret(Some(child), false);
            self.pop_construction_context();
            unique &= result.unique || matches!(result.value, Immediate::Null);
            let (node, _) = self.result_to_node_always(result);
            self.manager
                .set_mapped_child(out, intern::pool().add_ref(key), node);
            if self.unwinding.is_some() {
                break;
            }
        }
        if !unique {
            self.manager.set_need_cycle_check(out, true);
        }
        self.unprotect(&keep);
        EvalResult::node(out, unique)
    }

    // -----------------------------------------------------------------------
    // Node types
    // -----------------------------------------------------------------------

    /// `(get_type x)` — a bare node of the value's kind.
    pub(crate) fn op_get_type(&mut self, n: NodeId) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let kind = self.result_kind(&result);
        self.free_result(result);
        EvalResult::node(self.manager.alloc(kind), true)
    }

    /// `(get_type_string x)` — the kind's surface name.
    pub(crate) fn op_get_type_string(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let result = self.interpret(self.manager.child(n, 0), false);
        let kind = self.result_kind(&result);
        self.free_result(result);
        self.string_result(kind.name(), immediate_ok)
    }

    /// `(set_type x kind-name)` — retypes a copy (or the unique original)
    /// of the value.
    pub(crate) fn op_set_type(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let Some(name) = self.interpret_into_string(children.get(1).copied()) else {
            self.free_result(value);
            return EvalResult::NULL;
        };
        let Some(kind) = NodeKind::from_name(&name) else {
            log::warn!("set_type: unknown kind {:?}", name);
            self.free_result(value);
            return EvalResult::NULL;
        };

        let (node, unique) = self.result_to_node_always(value);
        let target = if unique {
            node
        } else {
            tree::deep_copy(&self.manager, node)
        };
        self.manager.set_kind(target, kind);
        EvalResult::node(target, true)
    }

    /// `(format value from to)` — converts between "number", "string",
    /// "code", and "json" renderings of a value.
    pub(crate) fn op_format(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret(children.first().copied(), false);
        let from = self
            .interpret_into_string(children.get(1).copied())
            .unwrap_or_else(|| "string".to_string());
        let to = self
            .interpret_into_string(children.get(2).copied())
            .unwrap_or_else(|| "string".to_string());

        // Normalize the input to a node first.
        let (mut node, _) = self.result_to_node_always(value);
        match from.as_str() {
            "json" => {
                if let Some(text) = self.node_to_string(node) {
                    match crate::asset::json_to_node(&text, &self.manager) {
                        Ok(decoded) => node = decoded,
                        Err(err) => {
                            log::warn!("format: invalid json input: {}", err);
                            return EvalResult::NULL;
                        }
                    }
                }
            }
            "code" => {
                if self.manager.kind_of(node).is_immediate() {
                    if let Some(text) = self.node_to_string(node) {
                        match crate::parser::parse(&text, &self.manager, "format", false) {
                            Ok(parsed) => node = parsed,
                            Err(_) => return EvalResult::NULL,
                        }
                    }
                }
            }
            _ => {}
        }

        match to.as_str() {
            "number" => EvalResult::number(self.node_to_number(node)),
            "string" => match self.node_to_string(node) {
                Some(text) => EvalResult::string(intern::intern(&text)),
                None => EvalResult::NULL,
            },
            "code" => EvalResult::node(node, false),
            "json" => match crate::asset::node_to_json(&self.manager, node) {
                Ok(text) => EvalResult::string(intern::intern(&text)),
                Err(err) => {
                    log::warn!("format: cannot encode as json: {}", err);
                    EvalResult::NULL
                }
            },
            other => {
                log::warn!("format: unknown target format {:?}", other);
                EvalResult::NULL
            }
        }
    }
}
