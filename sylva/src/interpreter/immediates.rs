//! Immediate-value plumbing: interpret-into helpers and coercions.
//!
//! Callers that only need a primitive ask for an immediate result, and these
//! helpers coerce whatever comes back. The shared optimization invariant:
//! whenever an intermediate is unique and the desired kind can be produced
//! by retyping it in place, no new node is allocated.

use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::parser;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Result disposal and promotion
    // -----------------------------------------------------------------------

    /// Disposes of a result: unique node trees are freed eagerly, string
    /// immediates release their pool reference, everything else is left to
    /// the collector.
    pub(crate) fn free_result(&mut self, result: EvalResult) {
        match result.value {
            Immediate::Node(_) => self.manager.free_node_tree_if_possible(&result),
            Immediate::Str(sid) => intern::pool().release(sid),
            _ => {}
        }
    }

    /// Promotes a result to a node id, allocating for immediates. Null stays
    /// `None`. The returned flag is the promoted reference's uniqueness.
    pub(crate) fn result_to_node(&mut self, result: EvalResult) -> (Option<NodeId>, bool) {
        match result.value {
            Immediate::Null => (None, true),
            Immediate::Number(v) => (Some(self.manager.alloc_number(v)), true),
            Immediate::Str(sid) => (
                Some(self.manager.alloc_with_handoff(NodeKind::String, sid)),
                true,
            ),
            Immediate::Node(id) => (Some(id), result.unique),
        }
    }

    /// Like [`Self::result_to_node`] but materializes null as a null node,
    /// for storage positions that need a real child.
    pub(crate) fn result_to_node_always(&mut self, result: EvalResult) -> (NodeId, bool) {
        match self.result_to_node(result) {
            (Some(id), unique) => (id, unique),
            (None, _) => (self.manager.alloc(NodeKind::Null), true),
        }
    }

    // -----------------------------------------------------------------------
    // Coercions on already-computed values
    // -----------------------------------------------------------------------

    pub(crate) fn node_to_number(&self, id: NodeId) -> f64 {
        match self.manager.kind_of(id) {
            NodeKind::Number => self.manager.number_of(id),
            NodeKind::True => 1.0,
            NodeKind::False => 0.0,
            NodeKind::String | NodeKind::Symbol => {
                let text = intern::text(self.manager.symbol_of(id));
                parser::parse_number(&text).unwrap_or(f64::NAN)
            }
            _ => f64::NAN,
        }
    }

    pub(crate) fn value_to_number(&self, result: &EvalResult) -> f64 {
        match result.value {
            Immediate::Null => f64::NAN,
            Immediate::Number(v) => v,
            Immediate::Str(sid) => {
                parser::parse_number(&intern::text(sid)).unwrap_or(f64::NAN)
            }
            Immediate::Node(id) => self.node_to_number(id),
        }
    }

    pub(crate) fn node_truthy(&self, id: NodeId) -> bool {
        match self.manager.kind_of(id) {
            NodeKind::Null | NodeKind::False => false,
            NodeKind::True => true,
            NodeKind::Number => {
                let v = self.manager.number_of(id);
                v != 0.0 && !v.is_nan()
            }
            _ => true,
        }
    }

    pub(crate) fn value_truthy(&self, result: &EvalResult, default_if_null: bool) -> bool {
        match result.value {
            Immediate::Null => default_if_null,
            Immediate::Number(v) => v != 0.0 && !v.is_nan(),
            Immediate::Str(_) => true,
            Immediate::Node(id) => self.node_truthy(id),
        }
    }

    /// String rendering of a node: leaves render their payload, code renders
    /// through the unparser.
    pub(crate) fn node_to_string(&self, id: NodeId) -> Option<String> {
        match self.manager.kind_of(id) {
            NodeKind::Null => None,
            NodeKind::Number => Some(parser::format_number(self.manager.number_of(id))),
            NodeKind::String | NodeKind::Symbol => {
                Some(intern::text(self.manager.symbol_of(id)))
            }
            NodeKind::True => Some("true".to_string()),
            NodeKind::False => Some("false".to_string()),
            _ => Some(parser::unparse(&self.manager, id, false, false, false)),
        }
    }

    pub(crate) fn value_to_string(&self, result: &EvalResult) -> Option<String> {
        match result.value {
            Immediate::Null => None,
            Immediate::Number(v) => Some(parser::format_number(v)),
            Immediate::Str(sid) => Some(intern::text(sid)),
            Immediate::Node(id) => self.node_to_string(id),
        }
    }

    // -----------------------------------------------------------------------
    // interpret-into helpers
    // -----------------------------------------------------------------------

    /// Evaluates to a number, freeing the unique intermediate. Null is NaN.
    pub(crate) fn interpret_into_number(&mut self, node: Option<NodeId>) -> f64 {
        let Some(node) = node else {
            return f64::NAN;
        };
        if self.manager.kind_of(node) == NodeKind::Number {
            return self.manager.number_of(node);
        }
        let result = self.interpret(Some(node), true);
        let value = self.value_to_number(&result);
        self.free_result(result);
        value
    }

    /// Evaluates to a boolean; a null result yields `default_if_null`.
    pub(crate) fn interpret_into_bool(
        &mut self,
        node: Option<NodeId>,
        default_if_null: bool,
    ) -> bool {
        let Some(node) = node else {
            return default_if_null;
        };
        let result = self.interpret(Some(node), true);
        let value = self.value_truthy(&result, default_if_null);
        self.free_result(result);
        value
    }

    /// Evaluates to a string; `None` when the value has no string form.
    pub(crate) fn interpret_into_string(&mut self, node: Option<NodeId>) -> Option<String> {
        let Some(node) = node else {
            return None;
        };
        if self.manager.kind_of(node) == NodeKind::String {
            return Some(intern::text(self.manager.symbol_of(node)));
        }
        let result = self.interpret(Some(node), true);
        let value = self.value_to_string(&result);
        self.free_result(result);
        value
    }

    /// Evaluates to an interned id only when the string is already in the
    /// pool: lookups that would never create a binding use this to avoid
    /// polluting the pool. No reference is taken.
    pub(crate) fn interpret_into_string_id_if_exists(
        &mut self,
        node: Option<NodeId>,
    ) -> SymbolId {
        let Some(node) = node else {
            return SymbolId::NONE;
        };
        if self.manager.kind_of(node) == NodeKind::String {
            return self.manager.symbol_of(node);
        }
        let result = self.interpret(Some(node), true);
        let sid = match result.value {
            Immediate::Str(sid) => sid,
            _ => match self.value_to_string(&result) {
                Some(text) => intern::pool().id_if_exists(&text).unwrap_or(SymbolId::NONE),
                None => SymbolId::NONE,
            },
        };
        self.free_result(result);
        sid
    }

    /// Evaluates to an interned id holding a fresh reference, reusing the
    /// unique intermediate's reference when possible.
    pub(crate) fn interpret_into_string_id_with_reference(
        &mut self,
        node: Option<NodeId>,
    ) -> SymbolId {
        let Some(node) = node else {
            return SymbolId::NONE;
        };
        if self.manager.kind_of(node) == NodeKind::String {
            return intern::pool().add_ref(self.manager.symbol_of(node));
        }
        let result = self.interpret(Some(node), true);
        match result.value {
            // A string immediate already owns the reference; hand it over.
            Immediate::Str(sid) => sid,
            Immediate::Node(id)
                if result.unique && self.manager.kind_of(id) == NodeKind::String =>
            {
                // Steal the unique node's reference instead of creating one.
                let sid = self.manager.take_symbol(id);
                self.manager.free_node_tree(id);
                sid
            }
            _ => {
                let sid = match self.value_to_string(&result) {
                    Some(text) => intern::intern(&text),
                    None => SymbolId::NONE,
                };
                self.free_result(result);
                sid
            }
        }
    }

    /// Evaluates to a unique number node, retyping the unique intermediate
    /// in place when possible.
    pub fn interpret_into_unique_number_node(&mut self, node: Option<NodeId>) -> EvalResult {
        let result = self.interpret(node, false);
        match result.value {
            Immediate::Node(id) if result.unique => {
                let value = self.node_to_number(id);
                self.manager.clear_metadata(id);
                if self.manager.kind_of(id) != NodeKind::Number {
                    self.manager.set_kind(id, NodeKind::Number);
                }
                self.manager.set_number(id, value);
                EvalResult::node(id, true)
            }
            _ => {
                let value = self.value_to_number(&result);
                self.free_result(result);
                EvalResult::node(self.manager.alloc_number(value), true)
            }
        }
    }

    /// Evaluates to a unique string node, retyping in place when possible.
    pub fn interpret_into_unique_string_node(&mut self, node: Option<NodeId>) -> EvalResult {
        let result = self.interpret(node, false);
        match result.value {
            Immediate::Node(id) if result.unique => {
                let text = self.node_to_string(id);
                self.manager.clear_metadata(id);
                if self.manager.kind_of(id) != NodeKind::String {
                    self.manager.set_kind(id, NodeKind::String);
                }
                match text {
                    Some(text) => self.manager.set_symbol_handoff(id, intern::intern(&text)),
                    None => self.manager.set_symbol_handoff(id, SymbolId::NONE),
                }
                EvalResult::node(id, true)
            }
            _ => {
                let text = self.value_to_string(&result);
                self.free_result(result);
                match text {
                    Some(text) => {
                        EvalResult::node(self.manager.alloc_string(&text), true)
                    }
                    None => EvalResult::NULL,
                }
            }
        }
    }

    /// Wraps a computed boolean the way the caller asked for it: as an
    /// immediate when permitted, otherwise as a true/false node.
    pub(crate) fn boolean_result(&mut self, value: bool, immediate_ok: bool) -> EvalResult {
        if immediate_ok {
            EvalResult::boolean(value)
        } else {
            EvalResult::node(self.manager.alloc_boolean(value), true)
        }
    }

    /// Wraps a computed number per the caller's immediate hint.
    pub(crate) fn number_result(&mut self, value: f64, immediate_ok: bool) -> EvalResult {
        if immediate_ok {
            EvalResult::number(value)
        } else {
            EvalResult::node(self.manager.alloc_number(value), true)
        }
    }

    /// Wraps an owned string per the caller's immediate hint.
    pub(crate) fn string_result(&mut self, value: &str, immediate_ok: bool) -> EvalResult {
        if immediate_ok {
            EvalResult::string(intern::intern(value))
        } else {
            EvalResult::node(self.manager.alloc_string(value), true)
        }
    }
}
