//! Immediate values and evaluation results.
//!
//! Hot paths avoid allocating a heap node per intermediate: arithmetic and
//! comparison opcodes consume and produce [`Immediate`]s, and only promote
//! to a node when a caller actually needs one.

use crate::intern::{self, SymbolId};
use crate::node::NodeId;

// ---------------------------------------------------------------------------
// Immediate
// ---------------------------------------------------------------------------

/// A value that may live outside the arena.
///
/// Ownership convention: a `Str` immediate owns one intern-pool reference.
/// Whoever consumes the immediate must either hand the reference off (for
/// example to a node payload) or release it; [`EvalResult::release`] does
/// the latter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Immediate {
    Null,
    Number(f64),
    Str(SymbolId),
    Node(NodeId),
}

impl Immediate {
    #[inline(always)]
    pub fn is_null(self) -> bool {
        matches!(self, Immediate::Null)
    }
}

// ---------------------------------------------------------------------------
// EvalResult
// ---------------------------------------------------------------------------

/// Result of evaluating a node: an immediate or node value plus the unique
/// bit.
///
/// `unique == true` asserts no other reference currently reaches the value's
/// subtree, so the bearer may mutate it in place or free it eagerly. The bit
/// is a best-effort hint and must be cleared whenever a reference is
/// duplicated or stored into a cycle-checked container.
#[derive(Copy, Clone, Debug)]
pub struct EvalResult {
    pub value: Immediate,
    pub unique: bool,
}

impl EvalResult {
    pub const NULL: EvalResult = EvalResult {
        value: Immediate::Null,
        unique: true,
    };

    #[inline(always)]
    pub fn number(v: f64) -> EvalResult {
        EvalResult {
            value: Immediate::Number(v),
            unique: true,
        }
    }

    /// Wraps a string id. The result takes ownership of one pool reference.
    #[inline(always)]
    pub fn string(sid: SymbolId) -> EvalResult {
        EvalResult {
            value: Immediate::Str(sid),
            unique: true,
        }
    }

    #[inline(always)]
    pub fn node(id: NodeId, unique: bool) -> EvalResult {
        EvalResult {
            value: Immediate::Node(id),
            unique,
        }
    }

    #[inline(always)]
    pub fn boolean(v: bool) -> EvalResult {
        // Truth values are numbers on the immediate path; opcode handlers
        // allocate true/false nodes only when a node result is required.
        EvalResult::number(if v { 1.0 } else { 0.0 })
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    #[inline(always)]
    pub fn node_id(&self) -> Option<NodeId> {
        match self.value {
            Immediate::Node(id) => Some(id),
            _ => None,
        }
    }

    /// Marks the result as aliased.
    #[inline(always)]
    pub fn shared(mut self) -> EvalResult {
        self.unique = false;
        self
    }

    /// Releases any intern reference the immediate owns. Node values are not
    /// touched; the arena collector owns node liveness.
    pub fn release(self) {
        if let Immediate::Str(sid) = self.value {
            intern::pool().release(sid);
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
    fn null_is_null() {
        assert!(EvalResult::NULL.is_null());
        assert!(!EvalResult::number(0.0).is_null());
    }

    #[test]
    fn fresh_results_are_unique() {
        assert!(EvalResult::number(1.0).unique);
        assert!(!EvalResult::number(1.0).shared().unique);
    }

    #[test]
    fn boolean_maps_to_number() {
        assert_eq!(EvalResult::boolean(true).value, Immediate::Number(1.0));
        assert_eq!(EvalResult::boolean(false).value, Immediate::Number(0.0));
    }
}
