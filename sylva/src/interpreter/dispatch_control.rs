//! Control-flow opcodes: if, seq, parallel, lambda, conclude/return, call,
//! call_sandboxed, while, plus the system family (system, get_defaults,
//! parse, unparse).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::parser;
use crate::value::{EvalResult, Immediate};

use super::{Interpreter, UnwindKind};

impl Interpreter {
    /// Evaluates children left to right, freeing intermediates and keeping
    /// the last result. The returned flag reports whether a `conclude`
    /// stopped the sequence (the unwind flag is already cleared); a
    /// `return` is left set for the nearest call boundary.
    pub(crate) fn eval_sequence(
        &mut self,
        children: &[NodeId],
        immediate_ok: bool,
    ) -> (EvalResult, bool) {
        let mut last = EvalResult::NULL;
        for (i, &child) in children.iter().enumerate() {
            let is_last = i + 1 == children.len();
            // Keep the previous value rooted while the next child runs.
            self.protect(&last);
            let result = self.interpret(Some(child), immediate_ok && is_last);
            self.unprotect(&last);
            let prev = std::mem::replace(&mut last, result);
            self.free_result(prev);
            match self.unwinding {
                Some(UnwindKind::Conclude) => {
                    self.unwinding = None;
                    return (last, true);
                }
                Some(UnwindKind::Return) => return (last, true),
                None => {}
            }
        }
        (last, false)
    }

    pub(crate) fn op_seq(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let (result, _) = self.eval_sequence(&children, immediate_ok);
        result
    }

    /// `(if cond then cond then ... else?)` — conditions short-circuit; an
    /// odd trailing child is the else branch.
    pub(crate) fn op_if(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut i = 0;
        while i + 1 < children.len() {
            if self.interpret_into_bool(Some(children[i]), false) {
                return self.interpret(Some(children[i + 1]), immediate_ok);
            }
            if self.unwinding.is_some() {
                return EvalResult::NULL;
            }
            i += 2;
        }
        if i < children.len() {
            return self.interpret(Some(children[i]), immediate_ok);
        }
        EvalResult::NULL
    }

    /// `(parallel body...)` — children evaluated for effect; results are
    /// discarded and the opcode yields null. With concurrency requested the
    /// children fan out to the thread pool.
    pub(crate) fn op_parallel(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        if let Some(results) = self.interpret_nodes_concurrently(n, &children, true) {
            for result in results {
                self.free_result(result);
            }
            return EvalResult::NULL;
        }
        for child in children {
            let result = self.interpret(Some(child), true);
            self.free_result(result);
            if self.unwinding.is_some() {
                break;
            }
        }
        EvalResult::NULL
    }

    /// `(lambda body)` — returns the child literally, unevaluated.
    pub(crate) fn op_lambda(&mut self, n: NodeId) -> EvalResult {
        match self.manager.child(n, 0) {
            Some(body) => EvalResult::node(body, false),
            None => EvalResult::NULL,
        }
    }

    pub(crate) fn op_conclude_return(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let result = match self.manager.child(n, 0) {
            Some(value) => self.interpret(Some(value), false),
            None => EvalResult::NULL,
        };
        self.unwinding = Some(if kind == NodeKind::Conclude {
            UnwindKind::Conclude
        } else {
            UnwindKind::Return
        });
        result
    }

    /// `(call fn args?)` — pushes a new lexical frame with the bound
    /// arguments and evaluates the callee's code.
    pub(crate) fn op_call(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let target = self.interpret(children.first().copied(), false);
        let Some(code) = target.node_id() else {
            self.free_result(target);
            return EvalResult::NULL;
        };
        self.protect(&target);

        let frame = self.build_args_frame(children.get(1).copied());
        self.push_frame(frame);
        let result = self.interpret(Some(code), immediate_ok);
        self.pop_frame();
        if self.unwinding == Some(UnwindKind::Return) {
            self.unwinding = None;
        }

        self.unprotect(&target);
        result
    }

    /// `(call_sandboxed fn args? steps? nodes? depth? entities? entity_depth?
    /// id_len?)` — like call, but the callee runs in a child interpreter
    /// with a fresh call stack (the outer stack is hidden) and a bounded
    /// performance-constraint block.
    pub(crate) fn op_call_sandboxed(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let target = self.interpret(children.first().copied(), false);
        let Some(code) = target.node_id() else {
            self.free_result(target);
            return EvalResult::NULL;
        };
        self.protect(&target);

        let frame = self.build_args_frame(children.get(1).copied());
        let frame_keep = EvalResult::node(frame, true);
        self.protect(&frame_keep);
        let constraints = self
            .populate_constraints_from_params(&children, 2, true)
            .map(|c| {
                let entity = self.entity.clone();
                self.finalize_child_constraints(c, entity.as_ref())
            });

        let mut sandbox = self.fork_sandboxed(frame, constraints);
        self.unprotect(&frame_keep);
        let result = sandbox.execute(code, immediate_ok);
        drop(sandbox);

        self.unprotect(&target);
        result
    }

    /// `(while cond body...)` — loops under the resource budget, returning
    /// the last body value. The construction stack exposes the iteration
    /// index and the previous iteration's result.
    pub(crate) fn op_while(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(&cond) = children.first() else {
            return EvalResult::NULL;
        };
        let body = &children[1..];

        self.push_construction_context(None, true, Immediate::Number(0.0), None);
        let mut last = EvalResult::NULL;
        let mut iteration = 0.0;
        loop {
            if self.resources_exhausted(false) {
                let old = std::mem::replace(&mut last, EvalResult::NULL);
                self.free_result(old);
                break;
            }
            if !self.interpret_into_bool(Some(cond), false) {
                break;
            }
            self.set_construction_index(Immediate::Number(iteration));
            let (result, ended) = self.eval_sequence(body, immediate_ok);
            // Expose this iteration's value to the next one.
            let (prev_node, prev_unique) = match result.value {
                Immediate::Node(id) => (Some(id), result.unique),
                _ => (None, true),
            };
            self.set_construction_previous(prev_node, prev_unique);
            let old = std::mem::replace(&mut last, result);
            self.free_result(old);
            if ended {
                break;
            }
            iteration += 1.0;
        }
        self.pop_construction_context();
        last
    }

    // -----------------------------------------------------------------------
    // System family
    // -----------------------------------------------------------------------

    /// `(system "command" ...)` — engine-level introspection, gated on the
    /// entity's root permission.
    pub(crate) fn op_system(&mut self, n: NodeId) -> EvalResult {
        let permitted = self
            .entity
            .as_ref()
            .map(|e| e.root_permission())
            .unwrap_or(true);
        if !permitted {
            log::warn!("system opcode refused: entity lacks root permission");
            return EvalResult::NULL;
        }
        let children = self.manager.children_of(n);
        let Some(command) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        match command.as_str() {
            "time" => EvalResult::number(epoch_seconds()),
            "version" => {
                let (major, minor, patch) = crate::engine_version();
                let text = format!("{}.{}.{}", major, minor, patch);
                EvalResult::string(intern::intern(&text))
            }
            "rand" => EvalResult::number(self.next_rand_double()),
            "interpreter_count" => {
                EvalResult::number(crate::concurrency::coordinator().active_threads() as f64)
            }
            other => {
                log::warn!("unknown system command {:?}", other);
                EvalResult::NULL
            }
        }
    }

    /// `(get_defaults)` — the engine's default tunables.
    pub(crate) fn op_get_defaults(&mut self, _n: NodeId) -> EvalResult {
        let assoc = self.manager.alloc(NodeKind::Assoc);
        let rate = self.manager.alloc_number(1e-5);
        self.manager
            .set_mapped_child(assoc, intern::intern("mutation_rate"), rate);
        let concurrency = self.manager.alloc_boolean(false);
        self.manager
            .set_mapped_child(assoc, intern::intern("concurrency"), concurrency);
        EvalResult::node(assoc, true)
    }

    /// `(parse str)` — parses code text into a node graph.
    pub(crate) fn op_parse(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(text) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        match parser::parse(&text, &self.manager, "parse", false) {
            Ok(node) => EvalResult::node(node, true),
            Err(err) => {
                log::warn!("parse opcode failed: {}", err);
                EvalResult::NULL
            }
        }
    }

    /// `(unparse code pretty? sort_keys?)` — renders a node graph to text.
    pub(crate) fn op_unparse(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let code = self.interpret(children.first().copied(), false);
        let pretty = self.interpret_into_bool(children.get(1).copied(), false);
        let sort_keys = self.interpret_into_bool(children.get(2).copied(), false);
        let text = match code.node_id() {
            Some(id) => parser::unparse(&self.manager, id, pretty, true, sort_keys),
            None => "(null)".to_string(),
        };
        self.free_result(code);
        EvalResult::string(intern::intern(&text))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Evaluates an args expression into a fresh assoc frame. A non-assoc or
    /// shared result is copied so the frame is always uniquely owned.
    pub(crate) fn build_args_frame(&mut self, args: Option<NodeId>) -> NodeId {
        let result = self.interpret(args, false);
        let frame = match result.value {
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::Assoc => {
                if result.unique {
                    id
                } else {
                    crate::tree::deep_copy(&self.manager, id)
                }
            }
            _ => {
                self.free_result(result);
                self.manager.alloc(NodeKind::Assoc)
            }
        };
        self.manager.set_need_cycle_check(frame, true);
        frame
    }

    pub(crate) fn next_rand_double(&mut self) -> f64 {
        match &self.entity {
            Some(entity) => entity.next_double(),
            None => self.fallback_rand.next_double(),
        }
    }

    pub(crate) fn next_rand_index(&mut self, bound: usize) -> usize {
        match &self.entity {
            Some(entity) => entity.next_index(bound),
            None => self.fallback_rand.next_index(bound),
        }
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
