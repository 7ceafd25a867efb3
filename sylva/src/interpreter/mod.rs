//! The tree-walking interpreter.
//!
//! Evaluation walks opcode trees, allocating intermediate results through
//! the entity's node manager and yielding an [`EvalResult`] the caller
//! either keeps (promoting it to a root) or frees. Three cooperating stacks
//! live as ordinary list nodes in the same arena so the collector reaches
//! them automatically:
//!
//! - the **call stack**: one assoc node per lexical frame, oldest first;
//! - the **opcode stack**: nodes currently under evaluation, which doubles
//!   as the root set keeping in-flight intermediates alive;
//! - the **construction stack**: contexts pushed by the iteration opcodes
//!   (map, filter, reduce, rewrite, associate).
//!
//! Every `interpret` entry is a safe point: garbage may be collected and
//! budgets are polled there, and nowhere else. Errors are data — a handler
//! never panics across an opcode boundary; it returns a null result and, for
//! budget exhaustion, leaves the counters spent so enclosing evaluations
//! abort as well.

mod constraints;
mod dispatch_assoc;
mod dispatch_control;
mod dispatch_define;
mod dispatch_entity;
mod dispatch_list;
mod dispatch_logic;
mod dispatch_math;
mod dispatch_query;
mod dispatch_string;
mod dispatch_tree;
mod immediates;

pub use constraints::PerformanceConstraints;

use std::sync::{Arc, RwLock};

use crate::concurrency::coordinator;
use crate::entity::{Entity, PathSegment};
use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::node_manager::NodeManager;
use crate::rand::RandomStream;
use crate::value::{EvalResult, Immediate};

/// Why the interpreter is unwinding between opcodes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum UnwindKind {
    /// `conclude`: stop the nearest enclosing sequence scope.
    Conclude,
    /// `return`: unwind through the nearest call boundary.
    Return,
}

/// One construction-stack context. The node-valued slots (target, current
/// value, previous result) are children of the construction stack node so
/// the collector reaches them; this record carries the rest.
pub(crate) struct ConstructionMeta {
    /// Current iteration index (number) or key (string, owns a pool ref).
    pub index: Immediate,
    pub target_unique: bool,
    pub previous_result_unique: bool,
    /// Set when an opcode with side effects ran inside this context.
    pub side_effect: bool,
}

/// Addressable slot inside a node graph, produced by path traversal.
pub(crate) enum Slot {
    Index(NodeId, usize),
    Key(NodeId, SymbolId),
}

const CONSTRUCTION_SLOTS: usize = 3;
const SLOT_TARGET: usize = 0;
const SLOT_VALUE: usize = 1;
const SLOT_PREVIOUS: usize = 2;

/// A tree-walking evaluator bound to one entity (or a bare manager).
pub struct Interpreter {
    pub(crate) manager: Arc<NodeManager>,
    pub(crate) entity: Option<Arc<Entity>>,
    pub(crate) constraints: Option<Arc<PerformanceConstraints>>,
    pub(crate) call_stack: NodeId,
    pub(crate) opcode_stack: NodeId,
    pub(crate) construction_stack: NodeId,
    pub(crate) construction_meta: Vec<ConstructionMeta>,
    /// Frames below this depth are shared with other threads and require
    /// the call-stack lock; frames at or above it are thread-private.
    pub(crate) unique_access_start_depth: usize,
    pub(crate) call_stack_lock: Arc<RwLock<()>>,
    pub(crate) unwinding: Option<UnwindKind>,
    /// Stream for entity-less evaluation; entities supply their own.
    fallback_rand: RandomStream,
    owns_call_stack: bool,
    is_worker: bool,
}

impl Interpreter {
    /// Interpreter for an entity, with a fresh call stack holding one empty
    /// frame.
    pub fn new(entity: &Arc<Entity>) -> Interpreter {
        Self::build(
            entity.manager().clone(),
            Some(entity.clone()),
            None,
            None,
            Arc::new(RwLock::new(())),
            false,
        )
    }

    /// Entity-less interpreter over a bare manager (tooling, tests).
    pub fn for_manager(manager: &Arc<NodeManager>) -> Interpreter {
        Self::build(manager.clone(), None, None, None, Arc::new(RwLock::new(())), false)
    }

    /// Interpreter for an entity call: a fresh call stack seeded with `args`
    /// as the only frame, hiding the caller's stack.
    pub fn with_args_frame(
        entity: &Arc<Entity>,
        args_frame: NodeId,
        constraints: Option<Arc<PerformanceConstraints>>,
    ) -> Interpreter {
        Self::build(
            entity.manager().clone(),
            Some(entity.clone()),
            constraints,
            Some(args_frame),
            Arc::new(RwLock::new(())),
            false,
        )
    }

    fn build(
        manager: Arc<NodeManager>,
        entity: Option<Arc<Entity>>,
        constraints: Option<Arc<PerformanceConstraints>>,
        initial_frame: Option<NodeId>,
        call_stack_lock: Arc<RwLock<()>>,
        is_worker: bool,
    ) -> Interpreter {
        let call_stack = manager.alloc(NodeKind::List);
        let frame = initial_frame.unwrap_or_else(|| manager.alloc(NodeKind::Assoc));
        manager.set_need_cycle_check(frame, true);
        manager.push_child(call_stack, frame);
        manager.set_need_cycle_check(call_stack, true);

        let opcode_stack = manager.alloc(NodeKind::List);
        manager.set_need_cycle_check(opcode_stack, true);
        let construction_stack = manager.alloc(NodeKind::List);
        manager.set_need_cycle_check(construction_stack, true);

        manager.keep_node_references(&[call_stack, opcode_stack, construction_stack]);

        let fallback_rand = match &entity {
            Some(e) => e.fork_stream("interpreter"),
            None => RandomStream::seeded("interpreter"),
        };

        Interpreter {
            manager,
            entity,
            constraints,
            call_stack,
            opcode_stack,
            construction_stack,
            construction_meta: Vec::new(),
            unique_access_start_depth: 0,
            call_stack_lock,
            unwinding: None,
            fallback_rand,
            owns_call_stack: true,
            is_worker,
        }
    }

    /// Child interpreter for a sandboxed call: shares the manager and
    /// entity, but sees a fresh call stack whose only frame is `args_frame`
    /// and whatever constraints the sandbox imposes.
    pub(crate) fn fork_sandboxed(
        &self,
        args_frame: NodeId,
        constraints: Option<Arc<PerformanceConstraints>>,
    ) -> Interpreter {
        Self::build(
            self.manager.clone(),
            self.entity.clone(),
            constraints,
            Some(args_frame),
            Arc::new(RwLock::new(())),
            self.is_worker,
        )
    }

    /// Worker for opcode-level parallelism: shares this interpreter's
    /// manager, entity, constraints, call-stack frames and lock; gets its
    /// own opcode and construction stacks. Frames at the current depth and
    /// above are thread-private to the worker.
    fn fork_worker(&self) -> Interpreter {
        let manager = self.manager.clone();
        let call_stack = manager.alloc(NodeKind::List);
        manager.set_need_cycle_check(call_stack, true);
        let frames = manager.children_of(self.call_stack);
        let depth = frames.len();
        manager.set_children(call_stack, frames);

        let opcode_stack = manager.alloc(NodeKind::List);
        manager.set_need_cycle_check(opcode_stack, true);
        let construction_stack = manager.alloc(NodeKind::List);
        manager.set_need_cycle_check(construction_stack, true);
        manager.keep_node_references(&[call_stack, opcode_stack, construction_stack]);

        Interpreter {
            manager,
            entity: self.entity.clone(),
            constraints: self.constraints.clone(),
            call_stack,
            opcode_stack,
            construction_stack,
            construction_meta: Vec::new(),
            unique_access_start_depth: depth,
            call_stack_lock: self.call_stack_lock.clone(),
            unwinding: None,
            fallback_rand: self.fallback_rand.fork("worker"),
            owns_call_stack: true,
            is_worker: true,
        }
    }

    pub fn entity(&self) -> Option<&Arc<Entity>> {
        self.entity.as_ref()
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn set_constraints(&mut self, constraints: Option<Arc<PerformanceConstraints>>) {
        self.constraints = constraints;
    }

    pub fn constraints(&self) -> Option<&Arc<PerformanceConstraints>> {
        self.constraints.as_ref()
    }

    // -----------------------------------------------------------------------
    // Execution entry
    // -----------------------------------------------------------------------

    /// Evaluates `program` to completion. The ephemeral opcode and
    /// construction stacks are cleared afterwards; the call stack keeps any
    /// bindings the program created.
    pub fn execute(&mut self, program: NodeId, immediate_ok: bool) -> EvalResult {
        let result = self.interpret(Some(program), immediate_ok);
        self.unwinding = None;
        result
    }

    /// Per-node dispatch. Every entry is a safe point for collection and
    /// budget enforcement.
    pub fn interpret(&mut self, node: Option<NodeId>, immediate_ok: bool) -> EvalResult {
        let Some(node) = node else {
            return EvalResult::NULL;
        };

        // The opcode stack keeps this node's subtree (and any results we
        // park on the stack) alive across collection.
        self.manager.push_child(self.opcode_stack, node);

        self.maybe_collect();

        if self.resources_exhausted(true) {
            self.manager.pop_child(self.opcode_stack);
            return EvalResult::NULL;
        }

        let kind = self.manager.kind_of(node);
        let result = self.dispatch(kind, node, immediate_ok);

        self.manager.pop_child(self.opcode_stack);
        result
    }

    fn dispatch(&mut self, kind: NodeKind, n: NodeId, immediate_ok: bool) -> EvalResult {
        use NodeKind::*;
        match kind {
            // system
            System => self.op_system(n),
            GetDefaults => self.op_get_defaults(n),
            Parse => self.op_parse(n),
            Unparse => self.op_unparse(n),
            // control
            If => self.op_if(n, immediate_ok),
            Seq => self.op_seq(n, immediate_ok),
            Parallel => self.op_parallel(n),
            Lambda => self.op_lambda(n),
            Conclude | Return => self.op_conclude_return(n, kind),
            Call => self.op_call(n, immediate_ok),
            CallSandboxed => self.op_call_sandboxed(n, immediate_ok),
            While => self.op_while(n, immediate_ok),
            // definitions and retrieval
            Let => self.op_let(n, immediate_ok),
            Declare => self.op_declare(n, immediate_ok),
            Assign | Accum => self.op_assign_accum(n, kind),
            Retrieve => self.op_retrieve(n),
            Get => self.op_get(n),
            Set | Replace => self.op_set_replace(n, kind),
            // stack introspection
            Target => self.op_target(n),
            CurrentIndex => self.op_current_index(n),
            CurrentValue => self.op_current_value(n),
            PreviousResult => self.op_previous_result(n),
            OpcodeStack => self.op_opcode_stack(n),
            Stack => self.op_stack(n),
            Args => self.op_args(n),
            // simulation
            Rand => self.op_rand(n, immediate_ok),
            WeightedRand => self.op_weighted_rand(n),
            GetRandSeed => self.op_get_rand_seed(n),
            SetRandSeed => self.op_set_rand_seed(n),
            SystemTime => self.op_system_time(n),
            // math
            Add | Subtract | Multiply | Divide | Modulus => {
                self.op_arithmetic(n, kind, immediate_ok)
            }
            GetDigits => self.op_get_digits(n),
            SetDigits => self.op_set_digits(n),
            Floor | Ceiling | Round => self.op_rounding(n, kind, immediate_ok),
            Exponent | Log | Sin | Asin | Cos | Acos | Tan | Atan | Sinh | Asinh | Cosh
            | Acosh | Tanh | Atanh | Erf | Tgamma | Lgamma | Sqrt | Abs => {
                self.op_unary_math(n, kind, immediate_ok)
            }
            Pow => self.op_pow(n, immediate_ok),
            Max | Min => self.op_max_min(n, kind, immediate_ok),
            DotProduct => self.op_dot_product(n),
            GeneralizedDistance => self.op_generalized_distance(n),
            Entropy => self.op_entropy(n),
            // list manipulation
            First => self.op_first(n),
            Tail => self.op_tail(n),
            Last => self.op_last(n),
            Trunc => self.op_trunc(n),
            Append => self.op_append(n),
            Size => self.op_size(n, immediate_ok),
            Range => self.op_range(n),
            // transformation
            Rewrite => self.op_rewrite(n),
            Map => self.op_map(n),
            Filter => self.op_filter(n),
            Weave => self.op_weave(n),
            Reduce => self.op_reduce(n),
            Apply => self.op_apply(n, immediate_ok),
            Reverse => self.op_reverse(n),
            Sort => self.op_sort(n),
            // associative manipulation
            Indices => self.op_indices(n),
            Values => self.op_values(n),
            ContainsIndex => self.op_contains_index(n, immediate_ok),
            ContainsValue => self.op_contains_value(n, immediate_ok),
            Remove => self.op_remove(n),
            Keep => self.op_keep(n),
            Associate => self.op_associate(n),
            Zip => self.op_zip(n),
            Unzip => self.op_unzip(n),
            // logic and equivalence
            And => self.op_and(n, immediate_ok),
            Or => self.op_or(n, immediate_ok),
            Xor => self.op_xor(n, immediate_ok),
            Not => self.op_not(n, immediate_ok),
            Equal | Nequal => self.op_equal(n, kind, immediate_ok),
            Less | Lequal | Greater | Gequal => self.op_compare(n, kind, immediate_ok),
            TypeEquals | TypeNequals => self.op_type_equals(n, kind, immediate_ok),
            // constants and data types
            True | False | Null => self.op_constant(n, kind, immediate_ok),
            Number => self.op_number_literal(n, immediate_ok),
            String => self.op_string_literal(n, immediate_ok),
            Symbol => self.op_symbol(n),
            List => self.op_list(n),
            Assoc => self.op_assoc(n),
            // node types
            GetType => self.op_get_type(n),
            GetTypeString => self.op_get_type_string(n, immediate_ok),
            SetType => self.op_set_type(n),
            Format => self.op_format(n),
            // labels, comments, concurrency
            GetLabels => self.op_get_labels(n),
            GetAllLabels => self.op_get_all_labels(n),
            SetLabels => self.op_set_labels(n),
            ZipLabels => self.op_zip_labels(n),
            GetComments => self.op_get_comments(n),
            SetComments => self.op_set_comments(n),
            GetConcurrency => self.op_get_concurrency(n, immediate_ok),
            SetConcurrency => self.op_set_concurrency(n),
            GetValue => self.op_get_value(n),
            SetValue => self.op_set_value(n),
            // string
            Explode => self.op_explode(n),
            Split => self.op_split(n),
            Substr => self.op_substr(n),
            Concat => self.op_concat(n, immediate_ok),
            // encryption
            CryptoSign => self.op_crypto_sign(n),
            CryptoSignVerify => self.op_crypto_sign_verify(n, immediate_ok),
            Encrypt => self.op_encrypt(n),
            Decrypt => self.op_decrypt(n),
            // i/o
            Print => self.op_print(n),
            // tree merging
            TotalSize => self.op_total_size(n, immediate_ok),
            Mutate => self.op_mutate(n),
            Commonality => self.op_commonality(n, immediate_ok),
            EditDistance => self.op_edit_distance(n, immediate_ok),
            Intersect => self.op_intersect(n),
            Union => self.op_union(n),
            Difference => self.op_difference(n),
            Mix => self.op_mix(n),
            MixLabels => self.op_mix_labels(n),
            // entity merging, details, actions, access
            TotalEntitySize => self.op_total_entity_size(n, immediate_ok),
            FlattenEntity => self.op_flatten_entity(n),
            MutateEntity | CommonalityEntities | EditDistanceEntities | IntersectEntities
            | UnionEntities | DifferenceEntities | MixEntities => {
                self.op_entity_merge(n, kind)
            }
            GetEntityComments => self.op_get_entity_comments(n),
            RetrieveEntityRoot => self.op_retrieve_entity_root(n),
            AssignEntityRoots | AccumEntityRoots => self.op_assign_entity_roots(n, kind),
            GetEntityRandSeed => self.op_get_entity_rand_seed(n),
            SetEntityRandSeed => self.op_set_entity_rand_seed(n),
            GetEntityRootPermission => self.op_get_entity_root_permission(n, immediate_ok),
            SetEntityRootPermission => self.op_set_entity_root_permission(n),
            CreateEntities => self.op_create_entities(n),
            CloneEntities => self.op_clone_entities(n),
            MoveEntities => self.op_move_entities(n),
            DestroyEntities => self.op_destroy_entities(n, immediate_ok),
            Load => self.op_load(n),
            LoadEntity | LoadPersist => self.op_load_entity(n, kind),
            Store => self.op_store(n, immediate_ok),
            StoreEntity => self.op_store_entity(n, immediate_ok),
            ContainsEntity => self.op_contains_entity(n, immediate_ok),
            ContainsLabel => self.op_contains_label(n, immediate_ok),
            AssignToEntities | DirectAssignToEntities | AccumToEntities => {
                self.op_assign_to_entities(n, kind, immediate_ok)
            }
            RetrieveFromEntity | DirectRetrieveFromEntity => self.op_retrieve_from_entity(n),
            CallEntity | CallEntityGetChanges => self.op_call_entity(n, kind),
            CallContainer => self.op_call_container(n),
            // entity queries
            ContainedEntities | ComputeOnContainedEntities => self.op_contained_entities(n, kind),
            _ if kind.is_query() => self.op_query_condition(n),
            ComputeEntityConvictions
            | ComputeEntityGroupKlDivergence
            | ComputeEntityDistanceContributions
            | ComputeEntityKlDivergences => self.op_aggregate_analysis(n, kind),
            Deallocated | Uninitialized => {
                log::warn!("evaluated a node that is not in active memory");
                EvalResult::NULL
            }
            _ => EvalResult::NULL,
        }
    }

    // -----------------------------------------------------------------------
    // Safe-point plumbing
    // -----------------------------------------------------------------------

    /// Collection runs only from the coordinating thread, and only between
    /// opcode fan-outs; workers defer to the parent's next safe point.
    fn maybe_collect(&self) {
        if !self.is_worker && coordinator().active_threads() == 1 {
            self.manager.collect_garbage_if_needed();
        }
    }

    pub(crate) fn resources_exhausted(&mut self, count_step: bool) -> bool {
        let Some(constraints) = &self.constraints else {
            return false;
        };
        let used = self.manager.used_nodes() as u64;
        let depth = self.manager.child_count(self.opcode_stack) as u64;
        constraints.are_execution_resources_exhausted(count_step, used, depth)
    }

    /// Parks a node on the opcode stack so collection cannot reclaim an
    /// unattached intermediate. Pair with [`Self::unprotect`].
    pub(crate) fn protect(&self, result: &EvalResult) {
        if let Immediate::Node(id) = result.value {
            self.manager.push_child(self.opcode_stack, id);
        }
    }

    pub(crate) fn unprotect(&self, result: &EvalResult) {
        if let Immediate::Node(_) = result.value {
            self.manager.pop_child(self.opcode_stack);
        }
    }

    // -----------------------------------------------------------------------
    // Call stack
    // -----------------------------------------------------------------------

    pub(crate) fn call_stack_depth(&self) -> usize {
        self.manager.child_count(self.call_stack)
    }

    pub(crate) fn current_frame(&self) -> NodeId {
        let count = self.manager.child_count(self.call_stack);
        self.manager
            .child(self.call_stack, count - 1)
            .expect("call stack always has at least one frame")
    }

    pub(crate) fn push_frame(&mut self, frame: NodeId) {
        self.manager.set_need_cycle_check(frame, true);
        self.manager.push_child(self.call_stack, frame);
    }

    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(self.call_stack_depth() > 1 || self.unique_access_start_depth == 0);
        self.manager.pop_child(self.call_stack);
    }

    /// Walks frames top-down for `sid`, returning the containing frame and
    /// its index. Shared frames (below `unique_access_start_depth`) are read
    /// under the call-stack lock.
    pub(crate) fn get_call_stack_symbol(&self, sid: SymbolId) -> Option<(usize, NodeId, NodeId)> {
        let frames = self.manager.children_of(self.call_stack);
        for (idx, &frame) in frames.iter().enumerate().rev() {
            let hit = if idx < self.unique_access_start_depth {
                let _guard = self.call_stack_lock.read().unwrap();
                self.manager.mapped_get(frame, sid)
            } else {
                self.manager.mapped_get(frame, sid)
            };
            if let Some(value) = hit {
                return Some((idx, frame, value));
            }
        }
        None
    }

    /// Binds `sid` in the frame that already holds it, or creates the
    /// binding in the topmost (never a shared) frame.
    pub(crate) fn set_call_stack_symbol(&mut self, sid: SymbolId, value: NodeId) {
        match self.get_call_stack_symbol(sid) {
            Some((idx, frame, _)) if idx >= self.unique_access_start_depth => {
                self.manager
                    .set_mapped_child(frame, intern::pool().add_ref(sid), value);
            }
            Some((_, frame, _)) => {
                let _guard = self.call_stack_lock.write().unwrap();
                self.manager
                    .set_mapped_child(frame, intern::pool().add_ref(sid), value);
            }
            None => {
                let top = self.current_frame();
                if self.call_stack_depth() <= self.unique_access_start_depth {
                    let _guard = self.call_stack_lock.write().unwrap();
                    self.manager
                        .set_mapped_child(top, intern::pool().add_ref(sid), value);
                } else {
                    self.manager
                        .set_mapped_child(top, intern::pool().add_ref(sid), value);
                }
            }
        }
        self.note_side_effect();
    }

    // -----------------------------------------------------------------------
    // Construction stack
    // -----------------------------------------------------------------------

    pub(crate) fn push_construction_context(
        &mut self,
        target: Option<NodeId>,
        target_unique: bool,
        index: Immediate,
        value: Option<NodeId>,
    ) {
        let null_slot = self.manager.alloc(NodeKind::Null);
        self.manager
            .push_child(self.construction_stack, target.unwrap_or(null_slot));
        self.manager
            .push_child(self.construction_stack, value.unwrap_or(null_slot));
        self.manager.push_child(self.construction_stack, null_slot);
        self.construction_meta.push(ConstructionMeta {
            index,
            target_unique,
            previous_result_unique: true,
            side_effect: false,
        });
    }

    /// Pops the top context, reporting whether a side effect ran inside it.
    pub(crate) fn pop_construction_context(&mut self) -> bool {
        for _ in 0..CONSTRUCTION_SLOTS {
            self.manager.pop_child(self.construction_stack);
        }
        match self.construction_meta.pop() {
            Some(meta) => {
                if let Immediate::Str(sid) = meta.index {
                    intern::pool().release(sid);
                }
                meta.side_effect
            }
            None => false,
        }
    }

    fn construction_slot(&self, depth: usize, slot: usize) -> Option<NodeId> {
        let contexts = self.construction_meta.len();
        if depth >= contexts {
            return None;
        }
        let base = (contexts - 1 - depth) * CONSTRUCTION_SLOTS;
        let id = self.manager.child(self.construction_stack, base + slot)?;
        if self.manager.kind_of(id) == NodeKind::Null && self.manager.labels_of(id).is_empty() {
            // Unfilled placeholder slot.
            return None;
        }
        Some(id)
    }

    pub(crate) fn construction_target(&self, depth: usize) -> Option<NodeId> {
        self.construction_slot(depth, SLOT_TARGET)
    }

    pub(crate) fn construction_value(&self, depth: usize) -> Option<NodeId> {
        self.construction_slot(depth, SLOT_VALUE)
    }

    pub(crate) fn construction_previous(&self, depth: usize) -> Option<NodeId> {
        self.construction_slot(depth, SLOT_PREVIOUS)
    }

    pub(crate) fn construction_index(&self, depth: usize) -> Option<&Immediate> {
        let contexts = self.construction_meta.len();
        if depth >= contexts {
            return None;
        }
        Some(&self.construction_meta[contexts - 1 - depth].index)
    }

    pub(crate) fn set_construction_index(&mut self, index: Immediate) {
        if let Some(meta) = self.construction_meta.last_mut() {
            if let Immediate::Str(old) = meta.index {
                intern::pool().release(old);
            }
            meta.index = index;
        }
    }

    fn set_construction_slot(&mut self, slot: usize, value: Option<NodeId>) {
        let contexts = self.construction_meta.len();
        if contexts == 0 {
            return;
        }
        let base = (contexts - 1) * CONSTRUCTION_SLOTS;
        let id = match value {
            Some(id) => id,
            None => self.manager.alloc(NodeKind::Null),
        };
        self.manager.set_child(self.construction_stack, base + slot, id);
    }

    pub(crate) fn set_construction_value(&mut self, value: Option<NodeId>) {
        self.set_construction_slot(SLOT_VALUE, value);
    }

    pub(crate) fn set_construction_previous(&mut self, value: Option<NodeId>, unique: bool) {
        self.set_construction_slot(SLOT_PREVIOUS, value);
        if let Some(meta) = self.construction_meta.last_mut() {
            meta.previous_result_unique = unique;
        }
    }

    /// Records that a side effect ran, for every open context: an iteration
    /// function that mutated anything forces cycle checks on reassembly.
    pub(crate) fn note_side_effect(&mut self) {
        for meta in &mut self.construction_meta {
            meta.side_effect = true;
        }
    }

    // -----------------------------------------------------------------------
    // Entity paths and node-graph traversal
    // -----------------------------------------------------------------------

    /// Evaluates a node to an entity path: null means the current entity, a
    /// string names a direct child, a list walks child names (a leading null
    /// restarts at the outermost container).
    pub(crate) fn interpret_into_entity_path(
        &mut self,
        node: Option<NodeId>,
    ) -> Vec<PathSegment> {
        let result = self.interpret(node, false);
        let path = self.result_to_path(&result);
        self.free_result(result);
        path
    }

    fn result_to_path(&mut self, result: &EvalResult) -> Vec<PathSegment> {
        match result.value {
            Immediate::Null => Vec::new(),
            Immediate::Str(sid) => vec![PathSegment::Name(intern::text(sid))],
            Immediate::Number(v) => vec![PathSegment::Name(crate::parser::format_number(v))],
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::Null => Vec::new(),
                NodeKind::List => {
                    let mut segments = Vec::new();
                    for (i, child) in self.manager.children_of(id).into_iter().enumerate() {
                        match self.manager.kind_of(child) {
                            NodeKind::Null if i == 0 => segments.push(PathSegment::Root),
                            NodeKind::Null => {}
                            NodeKind::Number => segments.push(PathSegment::Name(
                                crate::parser::format_number(self.manager.number_of(child)),
                            )),
                            _ => segments.push(PathSegment::Name(intern::text(
                                self.manager.symbol_of(child),
                            ))),
                        }
                    }
                    segments
                }
                NodeKind::Number => vec![PathSegment::Name(crate::parser::format_number(
                    self.manager.number_of(id),
                ))],
                _ => vec![PathSegment::Name(intern::text(self.manager.symbol_of(id)))],
            },
        }
    }

    /// Resolves an entity path from the current entity.
    pub(crate) fn resolve_entity(&mut self, path_node: Option<NodeId>) -> Option<Arc<Entity>> {
        let path = self.interpret_into_entity_path(path_node);
        let current = self.entity.clone()?;
        crate::entity::resolve_path(&current, &path)
    }

    /// Navigates a node graph by ordered index or map key, optionally
    /// allocating intermediate list/assoc nodes along the way.
    pub(crate) fn traverse_to_destination_from_path_list(
        &mut self,
        base: NodeId,
        path_node: Option<NodeId>,
        create_if_missing: bool,
    ) -> Option<Slot> {
        let steps: Vec<NodeId> = match path_node {
            None => return None,
            Some(p) if self.manager.kind_of(p) == NodeKind::List => self.manager.children_of(p),
            Some(p) => vec![p],
        };
        if steps.is_empty() {
            return None;
        }

        let mut cur = base;
        for (step_idx, &step) in steps.iter().enumerate() {
            let is_last = step_idx + 1 == steps.len();
            let slot = self.path_step_to_slot(cur, step)?;
            if is_last {
                return Some(slot);
            }
            cur = match &slot {
                Slot::Index(parent, i) => match self.manager.child(*parent, *i) {
                    Some(next) => next,
                    None if create_if_missing => {
                        let next = self.manager.alloc(NodeKind::List);
                        while self.manager.child_count(*parent) <= *i {
                            let filler = self.manager.alloc(NodeKind::Null);
                            self.manager.push_child(*parent, filler);
                        }
                        self.manager.set_child(*parent, *i, next);
                        next
                    }
                    None => return None,
                },
                Slot::Key(parent, key) => match self.manager.mapped_get(*parent, *key) {
                    Some(next) => next,
                    None if create_if_missing => {
                        let next = self.manager.alloc(NodeKind::Assoc);
                        self.manager
                            .set_mapped_child(*parent, intern::pool().add_ref(*key), next);
                        next
                    }
                    None => return None,
                },
            };
        }
        None
    }

    fn path_step_to_slot(&mut self, parent: NodeId, step: NodeId) -> Option<Slot> {
        let step_result = self.interpret(Some(step), true);
        let slot = match step_result.value {
            Immediate::Number(v) if v >= 0.0 => Some(Slot::Index(parent, v as usize)),
            Immediate::Number(_) => None,
            Immediate::Str(sid) => Some(Slot::Key(parent, sid)),
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::Number => {
                    let v = self.manager.number_of(id);
                    if v >= 0.0 {
                        Some(Slot::Index(parent, v as usize))
                    } else {
                        None
                    }
                }
                NodeKind::String | NodeKind::Symbol => Some(Slot::Key(
                    parent,
                    intern::pool().add_ref(self.manager.symbol_of(id)),
                )),
                _ => None,
            },
            Immediate::Null => None,
        };
        // A Str immediate's reference was either moved into the slot above
        // or must be dropped here.
        match (&slot, step_result.value) {
            (Some(Slot::Key(_, key)), Immediate::Str(sid)) if *key == sid => {}
            (_, Immediate::Str(sid)) => intern::pool().release(sid),
            _ => self.free_result(step_result),
        }
        slot
    }

    pub(crate) fn read_slot(&self, slot: &Slot) -> Option<NodeId> {
        match slot {
            Slot::Index(parent, i) => self.manager.child(*parent, *i),
            Slot::Key(parent, key) => self.manager.mapped_get(*parent, *key),
        }
    }

    /// Writes into a slot, consuming the key reference carried by `Slot::Key`.
    pub(crate) fn write_slot(&mut self, slot: Slot, value: NodeId) {
        match slot {
            Slot::Index(parent, i) => {
                while self.manager.child_count(parent) <= i {
                    let filler = self.manager.alloc(NodeKind::Null);
                    self.manager.push_child(parent, filler);
                }
                self.manager.set_child(parent, i, value);
            }
            Slot::Key(parent, key) => {
                self.manager.set_mapped_child(parent, key, value);
            }
        }
        self.note_side_effect();
    }

    pub(crate) fn drop_slot(&self, slot: Slot) {
        if let Slot::Key(_, key) = slot {
            intern::pool().release(key);
        }
    }

    // -----------------------------------------------------------------------
    // Rewrite
    // -----------------------------------------------------------------------

    /// Maps `function` across every node of `tree`, preserving structure and
    /// self-references. Two maps track the correspondence: original to new
    /// node, and new node to its new parent; revisiting an original marks
    /// the already-built new node and its ancestors as cycle-checked.
    pub(crate) fn rewrite_by_function(
        &mut self,
        function: NodeId,
        tree: NodeId,
    ) -> EvalResult {
        let mut original_to_new = std::collections::HashMap::new();
        let mut new_to_parent = std::collections::HashMap::new();
        self.rewrite_rec(function, tree, None, &mut original_to_new, &mut new_to_parent)
    }

    fn rewrite_rec(
        &mut self,
        function: NodeId,
        tree: NodeId,
        new_parent: Option<NodeId>,
        original_to_new: &mut std::collections::HashMap<NodeId, NodeId>,
        new_to_parent: &mut std::collections::HashMap<NodeId, Option<NodeId>>,
    ) -> EvalResult {
        if let Some(&existing) = original_to_new.get(&tree) {
            set_ancestors_cycle_checked(&self.manager, existing, new_to_parent);
            return EvalResult::node(existing, false);
        }

        let new_tree = self.manager.copy_node(tree);
        original_to_new.insert(tree, new_tree);
        new_to_parent.insert(new_tree, new_parent);

        let kind = self.manager.kind_of(tree);
        if kind.uses_mapped_children() {
            self.push_construction_context(None, true, Immediate::Null, None);
            for (key, _) in self.manager.mapped_entries_sorted(new_tree) {
                self.set_construction_index(Immediate::Str(intern::pool().add_ref(key)));
                let Some(child) = self.manager.mapped_get(new_tree, key) else {
                    continue;
                };
                self.set_construction_value(Some(child));
                let new_child =
                    self.rewrite_rec(function, child, Some(new_tree), original_to_new, new_to_parent);
                if !new_child.is_null() {
                    let (id, _) = self.result_to_node_always(new_child);
                    self.manager
                        .set_mapped_child(new_tree, intern::pool().add_ref(key), id);
                }
            }
            if self.pop_construction_context() {
                set_ancestors_cycle_checked(&self.manager, new_tree, new_to_parent);
            }
        } else if !kind.is_immediate() {
            let count = self.manager.child_count(new_tree);
            if count > 0 {
                self.push_construction_context(None, true, Immediate::Number(0.0), None);
                for i in 0..count {
                    self.set_construction_index(Immediate::Number(i as f64));
                    let child = match self.manager.child(new_tree, i) {
                        Some(c) => c,
                        None => break,
                    };
                    self.set_construction_value(Some(child));
                    let new_child = self.rewrite_rec(
                        function,
                        child,
                        Some(new_tree),
                        original_to_new,
                        new_to_parent,
                    );
                    if !new_child.is_null() {
                        let (id, _) = self.result_to_node_always(new_child);
                        self.manager.set_child(new_tree, i, id);
                    }
                }
                if self.pop_construction_context() {
                    set_ancestors_cycle_checked(&self.manager, new_tree, new_to_parent);
                }
            }
        }

        // The function sees the rewritten node as the current value.
        self.push_construction_context(None, true, Immediate::Null, Some(new_tree));
        let result = self.interpret(Some(function), false);
        self.pop_construction_context();
        result
    }

    // -----------------------------------------------------------------------
    // Constraint population
    // -----------------------------------------------------------------------

    /// Parses up to six trailing opcode parameters into a constraints block:
    /// steps, nodes, depth, then (optionally) contained entities, entity
    /// depth, and id length. Values below one (or NaN) leave the budget
    /// unconstrained. Returns `None` when nothing is constrained and no
    /// parent constraints exist.
    pub(crate) fn populate_constraints_from_params(
        &mut self,
        params: &[NodeId],
        offset: usize,
        include_entity_constraints: bool,
    ) -> Option<PerformanceConstraints> {
        let mut constraints = PerformanceConstraints::default();
        let mut any = self.constraints.is_some();

        let mut numeric_param = |this: &mut Self, index: usize, minimum: f64| -> Option<u64> {
            let node = params.get(offset + index).copied();
            node?;
            let value = this.interpret_into_number(node);
            if value >= minimum {
                Some(value as u64)
            } else {
                None
            }
        };

        if let Some(v) = numeric_param(self, 0, 1.0) {
            constraints.max_execution_steps = v;
            any = true;
        }
        if let Some(v) = numeric_param(self, 1, 1.0) {
            constraints.max_allocated_nodes = v;
            any = true;
        }
        if let Some(v) = numeric_param(self, 2, 1.0) {
            constraints.max_opcode_depth = v;
            any = true;
        }
        if include_entity_constraints {
            if let Some(v) = numeric_param(self, 3, 0.0) {
                constraints.constrain_contained_entities = true;
                constraints.max_contained_entities = v;
                any = true;
            }
            if let Some(v) = numeric_param(self, 4, 0.0) {
                constraints.constrain_entity_depth = true;
                constraints.max_contained_entity_depth = v;
                any = true;
            }
            if let Some(v) = numeric_param(self, 5, 1.0) {
                constraints.max_entity_id_length = v;
                any = true;
            }
        }

        if any {
            Some(constraints)
        } else {
            None
        }
    }

    /// Applies the parent-derivation rules and wraps the block for a child
    /// interpreter.
    pub(crate) fn finalize_child_constraints(
        &self,
        mut child: PerformanceConstraints,
        entity_from: Option<&Arc<Entity>>,
    ) -> Arc<PerformanceConstraints> {
        if let Some(entity) = entity_from {
            child.entity_to_constrain_from = Arc::downgrade(entity);
        }
        if let Some(parent) = &self.constraints {
            let used = self.manager.used_nodes() as u64;
            let depth = self.manager.child_count(self.opcode_stack) as u64;
            let threads = coordinator().active_threads() as u64;
            parent.derive_child(&mut child, used, depth, threads);
        } else if child.constrained_allocated_nodes() {
            let used = self.manager.used_nodes() as u64;
            let threads = coordinator().active_threads() as u64;
            child.max_allocated_nodes = child
                .max_allocated_nodes
                .saturating_mul(threads)
                .saturating_add(used);
        }
        Arc::new(child)
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    /// Fans the given nodes out to the thread pool, one task per node, when
    /// the parent node requested concurrency and a whole batch of permits is
    /// available. Returns `None` to signal serial fallback. Results come
    /// back in submission order.
    pub(crate) fn interpret_nodes_concurrently(
        &mut self,
        parent: NodeId,
        nodes: &[NodeId],
        immediate_ok: bool,
    ) -> Option<Vec<EvalResult>> {
        if !self.manager.concurrency_requested(parent) {
            return None;
        }
        if nodes.len() < 2 {
            return None;
        }
        let permit = coordinator().try_reserve(nodes.len())?;

        let this: &Interpreter = self;
        let results: Vec<EvalResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .map(|&node| {
                    scope.spawn(move || {
                        let mut worker = this.fork_worker();
                        worker.execute(node, immediate_ok)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => {
                        log::error!("worker thread panicked during parallel evaluation");
                        EvalResult::NULL
                    }
                })
                .collect()
        });
        drop(permit);

        // Anything a worker computed is only rooted by arena reachability
        // now; results get attached by the caller before the next safe
        // point, which cannot collect until then.
        Some(results)
    }
}

/// Climbs `new_to_parent` from `node`, setting cycle flags until an already
/// flagged ancestor or the rewrite root is reached.
fn set_ancestors_cycle_checked(
    manager: &Arc<NodeManager>,
    node: NodeId,
    new_to_parent: &std::collections::HashMap<NodeId, Option<NodeId>>,
) {
    let mut cur = Some(node);
    while let Some(id) = cur {
        if manager.need_cycle_check(id) {
            break;
        }
        manager.set_need_cycle_check(id, true);
        cur = match new_to_parent.get(&id) {
            Some(&parent) => parent,
            None => None,
        };
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        while !self.construction_meta.is_empty() {
            self.pop_construction_context();
        }
        self.manager.free_node_references(&[
            self.call_stack,
            self.opcode_stack,
            self.construction_stack,
        ]);
        // The ephemeral stacks are freed eagerly; their contents stay owned
        // by the arena and fall to the collector.
        self.manager.free_node(self.opcode_stack);
        self.manager.free_node(self.construction_stack);
        if self.owns_call_stack {
            self.manager.free_node(self.call_stack);
        }
    }
}
