//! Performance constraints: execution budgets with soft-abort semantics.
//!
//! A constraints block bounds execution steps, allocated nodes, opcode
//! depth, and entity growth. Counters are shared atomics: once a budget is
//! exhausted it stays exhausted, so enclosing evaluations unwind too rather
//! than resuming with a drained budget. Budget exhaustion is the engine's
//! cancellation mechanism — exhausted evaluations yield null references,
//! never errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::entity::Entity;

/// Bounds for one sandboxed evaluation. A zero maximum means unconstrained.
pub struct PerformanceConstraints {
    pub max_execution_steps: u64,
    pub cur_execution_step: AtomicU64,
    pub max_allocated_nodes: u64,
    /// Nodes attributed to entity creation, counted against
    /// `max_allocated_nodes` alongside arena usage.
    pub cur_allocated_nodes_to_entities: AtomicU64,
    pub max_opcode_depth: u64,
    pub constrain_contained_entities: bool,
    pub max_contained_entities: u64,
    pub constrain_entity_depth: bool,
    pub max_contained_entity_depth: u64,
    pub max_entity_id_length: u64,
    /// Scope in which contained-entity counts are measured.
    pub entity_to_constrain_from: Weak<Entity>,
}

impl Default for PerformanceConstraints {
    fn default() -> Self {
        PerformanceConstraints {
            max_execution_steps: 0,
            cur_execution_step: AtomicU64::new(0),
            max_allocated_nodes: 0,
            cur_allocated_nodes_to_entities: AtomicU64::new(0),
            max_opcode_depth: 0,
            constrain_contained_entities: false,
            max_contained_entities: 0,
            constrain_entity_depth: false,
            max_contained_entity_depth: 0,
            max_entity_id_length: 0,
            entity_to_constrain_from: Weak::new(),
        }
    }
}

impl PerformanceConstraints {
    pub fn constrained_steps(&self) -> bool {
        self.max_execution_steps > 0
    }

    pub fn constrained_allocated_nodes(&self) -> bool {
        self.max_allocated_nodes > 0
    }

    pub fn constrained_opcode_depth(&self) -> bool {
        self.max_opcode_depth > 0
    }

    /// Steps left before exhaustion; zero means exhausted.
    pub fn remaining_steps(&self) -> u64 {
        let cur = self.cur_execution_step.load(Ordering::Relaxed);
        self.max_execution_steps.saturating_sub(cur)
    }

    /// Node allocations left given the arena's current usage.
    pub fn remaining_allocated_nodes(&self, used_nodes: u64) -> u64 {
        let attributed = self.cur_allocated_nodes_to_entities.load(Ordering::Relaxed);
        self.max_allocated_nodes
            .saturating_sub(used_nodes.saturating_add(attributed))
    }

    pub fn remaining_opcode_depth(&self, cur_depth: u64) -> u64 {
        self.max_opcode_depth.saturating_sub(cur_depth)
    }

    /// Counts one execution step and reports whether any budget is spent.
    /// Soft abort: the caller yields null and lets the null propagate.
    pub fn are_execution_resources_exhausted(
        &self,
        count_step: bool,
        used_nodes: u64,
        opcode_depth: u64,
    ) -> bool {
        if self.constrained_steps() {
            let cur = if count_step {
                self.cur_execution_step.fetch_add(1, Ordering::Relaxed) + 1
            } else {
                self.cur_execution_step.load(Ordering::Relaxed)
            };
            if cur > self.max_execution_steps {
                return true;
            }
        }
        if self.constrained_allocated_nodes() && self.remaining_allocated_nodes(used_nodes) == 0 {
            return true;
        }
        if self.constrained_opcode_depth() && opcode_depth > self.max_opcode_depth {
            return true;
        }
        false
    }

    /// Marks the step budget as spent so enclosing evaluations abort too.
    pub fn exhaust(&self) {
        if self.constrained_steps() {
            self.cur_execution_step
                .store(self.max_execution_steps + 1, Ordering::Relaxed);
        }
    }

    /// Derives a child block from this one: each child budget becomes the
    /// minimum of what the child requested and what the parent has left.
    /// A parent budget that is already exhausted pins the child's maximum to
    /// 1 with the counter at 1, so the child aborts on first use.
    pub fn derive_child(
        &self,
        child: &mut PerformanceConstraints,
        used_nodes: u64,
        cur_depth: u64,
        active_threads: u64,
    ) {
        if self.constrained_steps() {
            let remaining = self.remaining_steps();
            if remaining > 0 {
                child.max_execution_steps = if child.constrained_steps() {
                    child.max_execution_steps.min(remaining)
                } else {
                    remaining
                };
            } else {
                child.max_execution_steps = 1;
                child.cur_execution_step.store(1, Ordering::Relaxed);
            }
        }

        if self.constrained_allocated_nodes() {
            let remaining = self.remaining_allocated_nodes(used_nodes);
            if remaining > 0 {
                child.max_allocated_nodes = if child.constrained_allocated_nodes() {
                    child.max_allocated_nodes.min(remaining)
                } else {
                    remaining
                };
            } else {
                child.max_allocated_nodes = 1;
            }
        }
        if child.constrained_allocated_nodes() {
            // Other threads eat into the same arena, so scale the share and
            // offset by the current watermark.
            child.max_allocated_nodes = child
                .max_allocated_nodes
                .saturating_mul(active_threads)
                .saturating_add(used_nodes);
        }

        if self.constrained_opcode_depth() {
            let remaining = self.remaining_opcode_depth(cur_depth);
            if remaining > 0 {
                child.max_opcode_depth = if child.constrained_opcode_depth() {
                    child.max_opcode_depth.min(remaining)
                } else {
                    remaining
                };
            } else {
                child.max_opcode_depth = 1;
            }
        }

        if self.constrain_contained_entities {
            child.constrain_contained_entities = true;
            child.max_contained_entities = if child.max_contained_entities > 0 {
                child.max_contained_entities.min(self.max_contained_entities)
            } else {
                self.max_contained_entities
            };
        }
        if self.constrain_entity_depth {
            child.constrain_entity_depth = true;
            child.max_contained_entity_depth = if child.max_contained_entity_depth > 0 {
                child
                    .max_contained_entity_depth
                    .min(self.max_contained_entity_depth)
            } else {
                self.max_contained_entity_depth
            };
        }
        if self.max_entity_id_length > 0 {
            child.max_entity_id_length = if child.max_entity_id_length > 0 {
                child.max_entity_id_length.min(self.max_entity_id_length)
            } else {
                self.max_entity_id_length
            };
        }
        if child.entity_to_constrain_from.upgrade().is_none() {
            child.entity_to_constrain_from = self.entity_to_constrain_from.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn with_steps(max: u64) -> PerformanceConstraints {
        PerformanceConstraints {
            max_execution_steps: max,
            ..Default::default()
        }
    }

    #[test]
    fn step_budget_exhausts() {
        let c = with_steps(3);
        assert!(!c.are_execution_resources_exhausted(true, 0, 0));
        assert!(!c.are_execution_resources_exhausted(true, 0, 0));
        assert!(!c.are_execution_resources_exhausted(true, 0, 0));
        assert!(c.are_execution_resources_exhausted(true, 0, 0));
        // Exhaustion is sticky.
        assert!(c.are_execution_resources_exhausted(false, 0, 0));
    }

    #[test]
    fn child_budget_is_min_of_requested_and_remaining() {
        let parent = with_steps(100);
        parent.cur_execution_step.store(40, Ordering::Relaxed);

        let mut child = with_steps(500);
        parent.derive_child(&mut child, 0, 0, 1);
        assert_eq!(child.max_execution_steps, 60);

        let mut modest = with_steps(10);
        parent.derive_child(&mut modest, 0, 0, 1);
        assert_eq!(modest.max_execution_steps, 10);
    }

    #[test]
    fn exhausted_parent_pins_child_to_immediate_abort() {
        let parent = with_steps(10);
        parent.cur_execution_step.store(10, Ordering::Relaxed);

        let mut child = with_steps(1000);
        parent.derive_child(&mut child, 0, 0, 1);
        assert_eq!(child.max_execution_steps, 1);
        assert!(child.are_execution_resources_exhausted(true, 0, 0));
    }

    #[test]
    fn node_budget_scales_with_threads_and_watermark() {
        let parent = PerformanceConstraints {
            max_allocated_nodes: 1000,
            ..Default::default()
        };
        let mut child = PerformanceConstraints {
            max_allocated_nodes: 100,
            ..Default::default()
        };
        parent.derive_child(&mut child, 50, 0, 2);
        // min(100, 1000-50) = 100, times 2 threads, offset by 50 used.
        assert_eq!(child.max_allocated_nodes, 250);
    }

    #[test]
    fn id_length_budget_narrows_in_child() {
        let parent = PerformanceConstraints {
            max_entity_id_length: 16,
            ..Default::default()
        };
        let mut child = PerformanceConstraints {
            max_entity_id_length: 64,
            ..Default::default()
        };
        parent.derive_child(&mut child, 0, 0, 1);
        assert_eq!(child.max_entity_id_length, 16);
    }
}
