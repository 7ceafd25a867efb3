//! List manipulation and the iteration opcodes (map, filter, weave, reduce,
//! apply, sort, rewrite).
//!
//! Iteration opcodes drive the construction stack: each pushes a context
//! carrying the target collection, the current index/key, the current value,
//! and the previous result, which the `target` / `current_*` opcodes read
//! from inside the supplied function.

use crate::concurrency::coordinator;
use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Simple list manipulation
    // -----------------------------------------------------------------------

    /// `(first x)` — first element of a list, first entry value of an
    /// assoc, first character of a string; numbers pass through.
    pub(crate) fn op_first(&mut self, n: NodeId) -> EvalResult {
        let arg = self.interpret(self.manager.child(n, 0), false);
        match arg.value {
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::List | NodeKind::Assoc => self.detach_element(arg, id, Position::First),
                NodeKind::String => {
                    let text = intern::text(self.manager.symbol_of(id));
                    self.free_result(arg);
                    match text.chars().next() {
                        Some(c) => EvalResult::string(intern::intern(&c.to_string())),
                        None => EvalResult::NULL,
                    }
                }
                _ => arg,
            },
            Immediate::Str(sid) => {
                let text = intern::text(sid);
                intern::pool().release(sid);
                match text.chars().next() {
                    Some(c) => EvalResult::string(intern::intern(&c.to_string())),
                    None => EvalResult::NULL,
                }
            }
            _ => arg,
        }
    }

    /// `(last x)` — mirror of `first`.
    pub(crate) fn op_last(&mut self, n: NodeId) -> EvalResult {
        let arg = self.interpret(self.manager.child(n, 0), false);
        match arg.value {
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::List | NodeKind::Assoc => self.detach_element(arg, id, Position::Last),
                NodeKind::String => {
                    let text = intern::text(self.manager.symbol_of(id));
                    self.free_result(arg);
                    match text.chars().last() {
                        Some(c) => EvalResult::string(intern::intern(&c.to_string())),
                        None => EvalResult::NULL,
                    }
                }
                _ => arg,
            },
            Immediate::Str(sid) => {
                let text = intern::text(sid);
                intern::pool().release(sid);
                match text.chars().last() {
                    Some(c) => EvalResult::string(intern::intern(&c.to_string())),
                    None => EvalResult::NULL,
                }
            }
            _ => arg,
        }
    }

    /// `(tail x count?)` — everything but the first element; with a count,
    /// the last `count` elements.
    pub(crate) fn op_tail(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let count = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)));
        let arg = self.interpret(children.first().copied(), false);
        self.slice_collection(arg, |len| {
            let keep = match count {
                Some(c) if !c.is_nan() && c >= 0.0 => (c as usize).min(len),
                _ => len.saturating_sub(1),
            };
            (len - keep, len)
        })
    }

    /// `(trunc x count?)` — everything but the last element; with a count,
    /// the first `count` elements.
    pub(crate) fn op_trunc(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let count = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)));
        let arg = self.interpret(children.first().copied(), false);
        self.slice_collection(arg, |len| {
            let keep = match count {
                Some(c) if !c.is_nan() && c >= 0.0 => (c as usize).min(len),
                _ => len.saturating_sub(1),
            };
            (0, keep)
        })
    }

    /// `(append a b ...)` — lists splice, scalars append; if the first
    /// operand is an assoc the rest merge into it.
    pub(crate) fn op_append(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let first = self.interpret(children.first().copied(), false);
        let assoc_mode = matches!(
            first.node_id().map(|id| self.manager.kind_of(id)),
            Some(NodeKind::Assoc)
        );

        if assoc_mode {
            let out = self.manager.alloc(NodeKind::Assoc);
            let keep = EvalResult::node(out, true);
            self.protect(&keep);
            self.merge_into_assoc(out, &first);
            self.free_result(first);
            for &child in &children[1..] {
                let value = self.interpret(Some(child), false);
                self.merge_into_assoc(out, &value);
                self.free_result(value);
            }
            self.unprotect(&keep);
            EvalResult::node(out, true)
        } else {
            let out = self.manager.alloc(NodeKind::List);
            let keep = EvalResult::node(out, true);
            self.protect(&keep);
            self.splice_into_list(out, first);
            for &child in &children[1..] {
                let value = self.interpret(Some(child), false);
                self.splice_into_list(out, value);
            }
            self.unprotect(&keep);
            EvalResult::node(out, true)
        }
    }

    /// `(size x)` — element count of a collection, character count of a
    /// string.
    pub(crate) fn op_size(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let arg = self.interpret(self.manager.child(n, 0), false);
        let size = match arg.value {
            Immediate::Str(sid) => Some(intern::text(sid).chars().count()),
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::Assoc => Some(self.manager.mapped_len(id)),
                NodeKind::String | NodeKind::Symbol => {
                    Some(intern::text(self.manager.symbol_of(id)).chars().count())
                }
                _ => Some(self.manager.child_count(id)),
            },
            _ => None,
        };
        self.free_result(arg);
        match size {
            Some(size) => self.number_result(size as f64, immediate_ok),
            None => EvalResult::NULL,
        }
    }

    /// `(range start end step?)` or `(range fn start end step?)` — numeric
    /// progression, optionally mapped through a function.
    pub(crate) fn op_range(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = children
            .first()
            .copied()
            .filter(|&c| self.manager.kind_of(c) == NodeKind::Lambda);
        let offset = usize::from(function.is_some());

        let start = self.interpret_into_number(children.get(offset).copied());
        let end = self.interpret_into_number(children.get(offset + 1).copied());
        let step = children
            .get(offset + 2)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|s| !s.is_nan() && *s != 0.0)
            .unwrap_or(if end >= start { 1.0 } else { -1.0 });
        if start.is_nan() || end.is_nan() {
            return EvalResult::NULL;
        }
        let ascending = step > 0.0;

        let out = self.manager.alloc(NodeKind::List);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        let body = function.map(|f| self.interpret(Some(f), false));
        if let Some(code) = &body {
            self.protect(code);
        }

        let mut value = start;
        let mut index = 0.0;
        while (ascending && value <= end) || (!ascending && value >= end) {
            if self.resources_exhausted(false) {
                break;
            }
            let element = match &body {
                Some(code) => {
                    let value_node = self.manager.alloc_number(value);
                    self.push_construction_context(
                        Some(out),
                        true,
                        Immediate::Number(index),
                        Some(value_node),
                    );
                    let mapped = self.interpret(code.node_id(), false);
                    self.pop_construction_context();
                    let (node, _) = self.result_to_node_always(mapped);
                    node
                }
                None => self.manager.alloc_number(value),
            };
            self.manager.push_child(out, element);
            value += step;
            index += 1.0;
        }

        if let Some(code) = body {
            self.unprotect(&code);
            self.free_result(code);
        }
        self.unprotect(&keep);
        EvalResult::node(out, true)
    }

    // -----------------------------------------------------------------------
    // Iteration opcodes
    // -----------------------------------------------------------------------

    /// `(rewrite fn tree)` — maps `fn` over every node bottom-up,
    /// preserving structure and self-references.
    pub(crate) fn op_rewrite(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = self.interpret(children.first().copied(), false);
        let Some(code) = function.node_id() else {
            self.free_result(function);
            return EvalResult::NULL;
        };
        self.protect(&function);
        let target = self.interpret(children.get(1).copied(), false);
        let (tree_node, _) = self.result_to_node_always(target);
        let keep = EvalResult::node(tree_node, false);
        self.protect(&keep);

        let result = self.rewrite_by_function(code, tree_node);

        self.unprotect(&keep);
        self.unprotect(&function);
        result
    }

    /// `(map fn coll colls...)` — one output element per input element; the
    /// function sees `current_value` and `current_index`. With several
    /// collections the current value is a list of the aligned elements.
    /// Fans out when this node requests concurrency.
    pub(crate) fn op_map(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = self.interpret(children.first().copied(), false);
        let Some(code) = function.node_id() else {
            self.free_result(function);
            return EvalResult::NULL;
        };
        self.protect(&function);

        let collection = self.interpret(children.get(1).copied(), false);
        self.protect(&collection);

        let result = if children.len() > 2 {
            self.map_multiple(code, &children[1..], collection)
        } else {
            match collection.node_id() {
                Some(coll) if self.manager.kind_of(coll) == NodeKind::Assoc => {
                    self.map_assoc(code, coll)
                }
                Some(coll) => self.map_list(n, code, coll),
                None => EvalResult::NULL,
            }
        };

        // Function results may alias the source elements, so the source
        // collection is left to the collector rather than freed eagerly.
        self.unprotect(&collection);
        self.unprotect(&function);
        result
    }

    fn map_list(&mut self, parent: NodeId, code: NodeId, coll: NodeId) -> EvalResult {
        let elements = self.manager.children_of(coll);

        if let Some(results) = self.apply_concurrently(parent, code, &elements) {
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
        for (i, element) in elements.into_iter().enumerate() {
            self.push_construction_context(
                Some(out),
                true,
                Immediate::Number(i as f64),
                Some(element),
            );
            let mapped = self.interpret(Some(code), false);
            let side_effect = self.pop_construction_context();
            let (node, _) = self.result_to_node_always(mapped);
            self.manager.push_child(out, node);
            if side_effect {
                self.manager.set_need_cycle_check(out, true);
            }
            if self.unwinding.is_some() {
                break;
            }
        }
        self.unprotect(&keep);
        EvalResult::node(out, true)
    }

    fn map_assoc(&mut self, code: NodeId, coll: NodeId) -> EvalResult {
        let out = self.manager.alloc(NodeKind::Assoc);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        for (key, element) in self.manager.mapped_entries_sorted(coll) {
            self.push_construction_context(
                Some(out),
                true,
                Immediate::Str(intern::pool().add_ref(key)),
                Some(element),
            );
            let mapped = self.interpret(Some(code), false);
            let side_effect = self.pop_construction_context();
            let (node, _) = self.result_to_node_always(mapped);
            self.manager
                .set_mapped_child(out, intern::pool().add_ref(key), node);
            if side_effect {
                self.manager.set_need_cycle_check(out, true);
            }
            if self.unwinding.is_some() {
                break;
            }
        }
        self.unprotect(&keep);
        EvalResult::node(out, true)
    }

    fn map_multiple(
        &mut self,
        code: NodeId,
        collection_nodes: &[NodeId],
        first: EvalResult,
    ) -> EvalResult {
        // The first collection is already evaluated; evaluate the rest.
        let mut collections: Vec<EvalResult> = vec![first];
        for &c in &collection_nodes[1..] {
            let value = self.interpret(Some(c), false);
            self.protect(&value);
            collections.push(value);
        }
        let lists: Vec<Vec<NodeId>> = collections
            .iter()
            .map(|r| match r.node_id() {
                Some(id) => self.manager.children_of(id),
                None => Vec::new(),
            })
            .collect();
        let longest = lists.iter().map(Vec::len).max().unwrap_or(0);

        let out = self.manager.alloc(NodeKind::List);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        for i in 0..longest {
            let tuple = self.manager.alloc(NodeKind::List);
            for list in &lists {
                let element = match list.get(i) {
                    Some(&e) => e,
                    None => self.manager.alloc(NodeKind::Null),
                };
                self.manager.push_child(tuple, element);
            }
            self.manager.set_need_cycle_check(tuple, true);
            self.push_construction_context(
                Some(out),
                true,
                Immediate::Number(i as f64),
                Some(tuple),
            );
            let mapped = self.interpret(Some(code), false);
            self.pop_construction_context();
            let (node, _) = self.result_to_node_always(mapped);
            self.manager.push_child(out, node);
            if self.unwinding.is_some() {
                break;
            }
        }
        self.unprotect(&keep);

        // Results may alias elements of the inputs; the collector owns them.
        for value in collections.drain(1..).rev() {
            self.unprotect(&value);
        }
        EvalResult::node(out, true)
    }

    /// `(filter fn? coll)` — keeps elements the function accepts; with no
    /// function, drops nulls.
    pub(crate) fn op_filter(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let (function, coll_node) = if children.len() >= 2 {
            (Some(children[0]), children.get(1).copied())
        } else {
            (None, children.first().copied())
        };

        let code = match function {
            Some(f) => {
                let result = self.interpret(Some(f), false);
                match result.node_id() {
                    Some(id) => {
                        self.protect(&result);
                        Some((result, id))
                    }
                    None => {
                        self.free_result(result);
                        None
                    }
                }
            }
            None => None,
        };

        let collection = self.interpret(coll_node, false);
        self.protect(&collection);

        let result = match collection.node_id() {
            Some(coll) if self.manager.kind_of(coll) == NodeKind::Assoc => {
                let out = self.manager.alloc(NodeKind::Assoc);
                let keep = EvalResult::node(out, true);
                self.protect(&keep);
                for (key, element) in self.manager.mapped_entries_sorted(coll) {
                    let accept = match &code {
                        Some((_, f)) => {
                            self.push_construction_context(
                                Some(out),
                                true,
                                Immediate::Str(intern::pool().add_ref(key)),
                                Some(element),
                            );
                            let verdict = self.interpret(Some(*f), true);
                            self.pop_construction_context();
                            let accept = self.value_truthy(&verdict, false);
                            self.free_result(verdict);
                            accept
                        }
                        None => self.manager.kind_of(element) != NodeKind::Null,
                    };
                    if accept {
                        let copied = if collection.unique {
                            element
                        } else {
                            tree::deep_copy(&self.manager, element)
                        };
                        self.manager
                            .set_mapped_child(out, intern::pool().add_ref(key), copied);
                    }
                }
                self.unprotect(&keep);
                EvalResult::node(out, true)
            }
            Some(coll) => {
                let out = self.manager.alloc(NodeKind::List);
                let keep = EvalResult::node(out, true);
                self.protect(&keep);
                for (i, element) in self.manager.children_of(coll).into_iter().enumerate() {
                    let accept = match &code {
                        Some((_, f)) => {
                            self.push_construction_context(
                                Some(out),
                                true,
                                Immediate::Number(i as f64),
                                Some(element),
                            );
                            let verdict = self.interpret(Some(*f), true);
                            self.pop_construction_context();
                            let accept = self.value_truthy(&verdict, false);
                            self.free_result(verdict);
                            accept
                        }
                        None => self.manager.kind_of(element) != NodeKind::Null,
                    };
                    if accept {
                        let copied = if collection.unique {
                            element
                        } else {
                            tree::deep_copy(&self.manager, element)
                        };
                        self.manager.push_child(out, copied);
                    }
                }
                self.unprotect(&keep);
                EvalResult::node(out, true)
            }
            None => EvalResult::NULL,
        };

        self.unprotect(&collection);
        if let Some((result, _)) = code {
            self.unprotect(&result);
        }
        result
    }

    /// `(weave l1 l2 ...)` or `(weave fn l1 l2 ...)` — interleaves ordered
    /// sequences; a function, when given, receives the aligned elements as
    /// a list and its result is spliced into the output.
    pub(crate) fn op_weave(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = children
            .first()
            .copied()
            .filter(|&c| {
                matches!(self.manager.kind_of(c), NodeKind::Lambda | NodeKind::Null)
            });
        let offset = usize::from(function.is_some());
        let code = match function {
            Some(f) if self.manager.kind_of(f) == NodeKind::Lambda => {
                let result = self.interpret(Some(f), false);
                self.protect(&result);
                Some(result)
            }
            _ => None,
        };

        let mut lists: Vec<EvalResult> = Vec::new();
        for &c in &children[offset..] {
            let value = self.interpret(Some(c), false);
            self.protect(&value);
            lists.push(value);
        }
        let element_lists: Vec<Vec<NodeId>> = lists
            .iter()
            .map(|r| match r.node_id() {
                Some(id) if self.manager.kind_of(id) == NodeKind::List => {
                    self.manager.children_of(id)
                }
                Some(id) => vec![id],
                None => Vec::new(),
            })
            .collect();
        let longest = element_lists.iter().map(Vec::len).max().unwrap_or(0);

        let out = self.manager.alloc(NodeKind::List);
        let keep = EvalResult::node(out, true);
        self.protect(&keep);
        for i in 0..longest {
            match &code {
                None => {
                    for list in &element_lists {
                        if let Some(&element) = list.get(i) {
                            self.manager.push_child(out, element);
                            self.manager.set_need_cycle_check(out, true);
                        }
                    }
                }
                Some(code) => {
                    let tuple = self.manager.alloc(NodeKind::List);
                    for list in &element_lists {
                        let element = match list.get(i) {
                            Some(&e) => e,
                            None => self.manager.alloc(NodeKind::Null),
                        };
                        self.manager.push_child(tuple, element);
                    }
                    self.manager.set_need_cycle_check(tuple, true);
                    self.push_construction_context(
                        Some(out),
                        true,
                        Immediate::Number(i as f64),
                        Some(tuple),
                    );
                    let woven = self.interpret(code.node_id(), false);
                    self.pop_construction_context();
                    match woven.node_id() {
                        Some(id) if self.manager.kind_of(id) == NodeKind::List => {
                            // A list result splices its elements in.
                            for element in self.manager.children_of(id) {
                                self.manager.push_child(out, element);
                            }
                            self.manager.set_need_cycle_check(out, true);
                        }
                        _ => {
                            let (node, _) = self.result_to_node_always(woven);
                            self.manager.push_child(out, node);
                        }
                    }
                }
            }
        }
        self.unprotect(&keep);

        for value in lists.into_iter().rev() {
            self.unprotect(&value);
        }
        if let Some(code) = code {
            self.unprotect(&code);
            self.free_result(code);
        }
        EvalResult::node(out, true)
    }

    /// `(reduce fn coll)` — folds the collection; the function sees the
    /// accumulator as `previous_result` and each element as
    /// `current_value`.
    pub(crate) fn op_reduce(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let function = self.interpret(children.first().copied(), false);
        let Some(code) = function.node_id() else {
            self.free_result(function);
            return EvalResult::NULL;
        };
        self.protect(&function);
        let collection = self.interpret(children.get(1).copied(), false);
        self.protect(&collection);

        let elements: Vec<(Immediate, NodeId)> = match collection.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => self
                .manager
                .mapped_entries_sorted(id)
                .into_iter()
                .map(|(k, v)| (Immediate::Str(intern::pool().add_ref(k)), v))
                .collect(),
            Some(id) => self
                .manager
                .children_of(id)
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Immediate::Number(i as f64), v))
                .collect(),
            None => Vec::new(),
        };

        let mut acc: Option<NodeId> = None;
        for (index, element) in elements {
            match acc {
                None => {
                    if let Immediate::Str(sid) = index {
                        intern::pool().release(sid);
                    }
                    acc = Some(element);
                }
                Some(previous) => {
                    self.push_construction_context(None, true, index, Some(element));
                    self.set_construction_previous(Some(previous), false);
                    let folded = self.interpret(Some(code), false);
                    self.pop_construction_context();
                    let (node, _) = self.result_to_node_always(folded);
                    acc = Some(node);
                }
            }
            if self.unwinding.is_some() {
                break;
            }
        }

        self.unprotect(&collection);
        self.unprotect(&function);
        match acc {
            // The fold's value may alias the source collection.
            Some(id) => EvalResult::node(id, false),
            None => EvalResult::NULL,
        }
    }

    /// `(apply kind coll)` — retypes the collection to the named opcode and
    /// evaluates it; `(apply fn coll)` evaluates the function with the
    /// collection as the current value.
    pub(crate) fn op_apply(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let head = self.interpret(children.first().copied(), false);
        let collection = self.interpret(children.get(1).copied(), false);

        let kind_name = self.value_as_kind_name(&head);
        if let Some(kind) = kind_name.as_deref().and_then(NodeKind::from_name) {
            self.free_result(head);
            let (coll_node, unique) = self.result_to_node_always(collection);
            let target = if unique {
                coll_node
            } else {
                tree::deep_copy(&self.manager, coll_node)
            };
            self.manager.set_kind(target, kind);
            let keep = EvalResult::node(target, true);
            self.protect(&keep);
            let result = self.interpret(Some(target), immediate_ok);
            self.unprotect(&keep);
            return result;
        }

        match head.node_id() {
            Some(code) => {
                self.protect(&head);
                let (coll_node, _) = self.result_to_node_always(collection);
                self.push_construction_context(None, true, Immediate::Null, Some(coll_node));
                let result = self.interpret(Some(code), immediate_ok);
                self.pop_construction_context();
                self.unprotect(&head);
                result
            }
            None => {
                self.free_result(head);
                self.free_result(collection);
                EvalResult::NULL
            }
        }
    }

    fn value_as_kind_name(&self, result: &EvalResult) -> Option<String> {
        match result.value {
            Immediate::Str(sid) => Some(intern::text(sid)),
            Immediate::Node(id)
                if matches!(
                    self.manager.kind_of(id),
                    NodeKind::String | NodeKind::Symbol
                ) =>
            {
                Some(intern::text(self.manager.symbol_of(id)))
            }
            _ => None,
        }
    }

    /// `(reverse x)` — reversed list or string.
    pub(crate) fn op_reverse(&mut self, n: NodeId) -> EvalResult {
        let arg = self.interpret(self.manager.child(n, 0), false);
        match arg.value {
            Immediate::Str(sid) => {
                let text: String = intern::text(sid).chars().rev().collect();
                intern::pool().release(sid);
                EvalResult::string(intern::intern(&text))
            }
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::String => {
                    let text: String =
                        intern::text(self.manager.symbol_of(id)).chars().rev().collect();
                    self.free_result(arg);
                    EvalResult::string(intern::intern(&text))
                }
                _ if self.manager.kind_of(id).uses_ordered_children() => {
                    let (node, unique) = (id, arg.unique);
                    let target = if unique {
                        node
                    } else {
                        tree::deep_copy(&self.manager, node)
                    };
                    let mut children = self.manager.children_of(target);
                    children.reverse();
                    self.manager.set_children(target, children);
                    EvalResult::node(target, true)
                }
                _ => arg,
            },
            _ => arg,
        }
    }

    /// `(sort coll)` with the default ordering (numbers, then strings, then
    /// code by printed form), or `(sort fn coll)` with a comparator that
    /// sees the two candidates as `current_value` and `previous_result`.
    pub(crate) fn op_sort(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let (function, coll_node) = if children.len() >= 2 {
            (Some(children[0]), children.get(1).copied())
        } else {
            (None, children.first().copied())
        };

        let code = function.map(|f| {
            let result = self.interpret(Some(f), false);
            self.protect(&result);
            result
        });

        let collection = self.interpret(coll_node, false);
        let (coll, unique) = match collection.value {
            Immediate::Node(id) if self.manager.kind_of(id).uses_ordered_children() => {
                (id, collection.unique)
            }
            _ => {
                self.free_result(collection);
                if let Some(code) = code {
                    self.unprotect(&code);
                    self.free_result(code);
                }
                return EvalResult::NULL;
            }
        };
        let target = if unique {
            coll
        } else {
            tree::deep_copy(&self.manager, coll)
        };
        let keep = EvalResult::node(target, true);
        self.protect(&keep);

        let mut elements = self.manager.children_of(target);
        // Insertion sort: the comparator re-enters the interpreter, so the
        // sort must tolerate arbitrary side effects mid-comparison.
        for i in 1..elements.len() {
            let mut j = i;
            while j > 0 {
                let earlier = elements[j - 1];
                let later = elements[j];
                let in_order = match &code {
                    Some(code) => self.compare_with_function(code.node_id(), earlier, later),
                    None => default_order(self, earlier, later) != std::cmp::Ordering::Greater,
                };
                if in_order {
                    break;
                }
                elements.swap(j - 1, j);
                j -= 1;
            }
        }
        self.manager.set_children(target, elements);

        self.unprotect(&keep);
        if let Some(code) = code {
            self.unprotect(&code);
            self.free_result(code);
        }
        EvalResult::node(target, true)
    }

    /// Comparator protocol: the function sees `current_value` = earlier and
    /// `previous_result` = later, and returns a number; non-positive means
    /// the pair is already in order.
    fn compare_with_function(
        &mut self,
        code: Option<NodeId>,
        earlier: NodeId,
        later: NodeId,
    ) -> bool {
        self.push_construction_context(None, true, Immediate::Null, Some(earlier));
        self.set_construction_previous(Some(later), false);
        let verdict = self.interpret(code, true);
        self.pop_construction_context();
        let ordering = self.value_to_number(&verdict);
        self.free_result(verdict);
        !(ordering > 0.0)
    }

    // -----------------------------------------------------------------------
    // Concurrent application
    // -----------------------------------------------------------------------

    /// Applies `code` to each element on its own pool thread when `parent`
    /// requests concurrency and a full batch of permits is available.
    fn apply_concurrently(
        &mut self,
        parent: NodeId,
        code: NodeId,
        elements: &[NodeId],
    ) -> Option<Vec<EvalResult>> {
        if !self.manager.concurrency_requested(parent) {
            return None;
        }
        if elements.len() < 2 {
            return None;
        }
        let permit = coordinator().try_reserve(elements.len())?;

        let this: &Interpreter = self;
        let results: Vec<EvalResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = elements
                .iter()
                .enumerate()
                .map(|(i, &element)| {
                    scope.spawn(move || {
                        let mut worker = this.fork_worker();
                        worker.push_construction_context(
                            None,
                            false,
                            Immediate::Number(i as f64),
                            Some(element),
                        );
                        let result = worker.execute(code, false);
                        worker.pop_construction_context();
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => {
                        log::error!("worker thread panicked during map fan-out");
                        EvalResult::NULL
                    }
                })
                .collect()
        });
        drop(permit);
        Some(results)
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn detach_element(&mut self, arg: EvalResult, id: NodeId, pos: Position) -> EvalResult {
        if self.manager.kind_of(id) == NodeKind::Assoc {
            let entries = self.manager.mapped_entries_sorted(id);
            let picked = match pos {
                Position::First => entries.first(),
                Position::Last => entries.last(),
            };
            return match picked {
                Some(&(_, value)) => {
                    if arg.unique {
                        let copy = tree::deep_copy(&self.manager, value);
                        self.free_result(arg);
                        EvalResult::node(copy, true)
                    } else {
                        EvalResult::node(value, false)
                    }
                }
                None => {
                    self.free_result(arg);
                    EvalResult::NULL
                }
            };
        }

        let count = self.manager.child_count(id);
        if count == 0 {
            self.free_result(arg);
            return EvalResult::NULL;
        }
        if arg.unique {
            // Detach the survivor, then release the rest of the tree.
            let index = match pos {
                Position::First => 0,
                Position::Last => count - 1,
            };
            let survivor = self.manager.remove_child(id, index);
            self.manager.free_node_tree(id);
            EvalResult::node(survivor, true)
        } else {
            let index = match pos {
                Position::First => 0,
                Position::Last => count - 1,
            };
            match self.manager.child(id, index) {
                Some(child) => EvalResult::node(child, false),
                None => EvalResult::NULL,
            }
        }
    }

    fn slice_collection(
        &mut self,
        arg: EvalResult,
        bounds: impl Fn(usize) -> (usize, usize),
    ) -> EvalResult {
        match arg.value {
            Immediate::Str(sid) => {
                let text = intern::text(sid);
                intern::pool().release(sid);
                let chars: Vec<char> = text.chars().collect();
                let (lo, hi) = bounds(chars.len());
                let sliced: String = chars[lo.min(chars.len())..hi.min(chars.len())]
                    .iter()
                    .collect();
                EvalResult::string(intern::intern(&sliced))
            }
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::String => {
                    let text = intern::text(self.manager.symbol_of(id));
                    self.free_result(arg);
                    let chars: Vec<char> = text.chars().collect();
                    let (lo, hi) = bounds(chars.len());
                    let sliced: String = chars[lo.min(chars.len())..hi.min(chars.len())]
                        .iter()
                        .collect();
                    EvalResult::string(intern::intern(&sliced))
                }
                kind if kind.uses_ordered_children() => {
                    let target = if arg.unique {
                        id
                    } else {
                        tree::deep_copy(&self.manager, id)
                    };
                    let children = self.manager.children_of(target);
                    let (lo, hi) = bounds(children.len());
                    let kept: Vec<NodeId> =
                        children[lo.min(children.len())..hi.min(children.len())].to_vec();
                    self.manager.set_children(target, kept);
                    EvalResult::node(target, true)
                }
                _ => arg,
            },
            _ => arg,
        }
    }

    fn splice_into_list(&mut self, out: NodeId, value: EvalResult) {
        match value.value {
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::List => {
                for child in self.manager.children_of(id) {
                    let appended = if value.unique {
                        child
                    } else {
                        tree::deep_copy(&self.manager, child)
                    };
                    self.manager.push_child(out, appended);
                }
            }
            Immediate::Null => {}
            _ => {
                let (node, _) = self.result_to_node_always(value);
                self.manager.push_child(out, node);
            }
        }
    }

    fn merge_into_assoc(&mut self, out: NodeId, value: &EvalResult) {
        if let Some(id) = value.node_id() {
            if self.manager.kind_of(id) == NodeKind::Assoc {
                for (key, child) in self.manager.mapped_entries_sorted(id) {
                    let merged = if value.unique {
                        child
                    } else {
                        tree::deep_copy(&self.manager, child)
                    };
                    self.manager
                        .set_mapped_child(out, intern::pool().add_ref(key), merged);
                }
            }
        }
    }
}

enum Position {
    First,
    Last,
}

/// Default sort order: numbers ascending, then strings, then everything
/// else by printed form.
fn default_order(
    interp: &Interpreter,
    a: NodeId,
    b: NodeId,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let rank = |id: NodeId| match interp.manager.kind_of(id) {
        NodeKind::Number => 0u8,
        NodeKind::String | NodeKind::Symbol => 1,
        _ => 2,
    };
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => {}
        other => return other,
    }
    match interp.manager.kind_of(a) {
        NodeKind::Number => interp
            .manager
            .number_of(a)
            .partial_cmp(&interp.manager.number_of(b))
            .unwrap_or(Ordering::Equal),
        NodeKind::String | NodeKind::Symbol => intern::text(interp.manager.symbol_of(a))
            .cmp(&intern::text(interp.manager.symbol_of(b))),
        _ => {
            let ta = crate::parser::unparse(&interp.manager, a, false, false, true);
            let tb = crate::parser::unparse(&interp.manager, b, false, false, true);
            ta.cmp(&tb)
        }
    }
}
