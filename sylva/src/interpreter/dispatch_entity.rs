//! Entity opcodes: merging, details, lifecycle actions, and cross-entity
//! access.
//!
//! Every opcode here resolves an entity path first, then does its semantic
//! work against that entity's own arena; values crossing an entity boundary
//! are deep-copied between arenas, never aliased.

use std::sync::Arc;

use crate::asset;
use crate::entity::Entity;
use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::tree;
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Entity merging
    // -----------------------------------------------------------------------

    /// `(total_entity_size path?)` — node count of the entity and all its
    /// contained entities.
    pub(crate) fn op_total_entity_size(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        self.number_result(target.total_entity_size() as f64, immediate_ok)
    }

    /// `(flatten_entity path?)` — self-contained code describing the
    /// entity: its root, seed, and flattened children.
    pub(crate) fn op_flatten_entity(&mut self, n: NodeId) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        EvalResult::node(self.flatten_into_current(&target), true)
    }

    fn flatten_into_current(&mut self, entity: &Arc<Entity>) -> NodeId {
        let out = self.manager.alloc(NodeKind::Assoc);
        let root = match entity.root() {
            Some(root) => tree::deep_copy_between(entity.manager(), &self.manager, root),
            None => self.manager.alloc(NodeKind::Null),
        };
        self.manager
            .set_mapped_child(out, intern::intern("root"), root);
        let seed = self.manager.alloc_string(&entity.rand_seed());
        self.manager
            .set_mapped_child(out, intern::intern("seed"), seed);

        let children = entity.child_names();
        if !children.is_empty() {
            let contained = self.manager.alloc(NodeKind::Assoc);
            for name in children {
                if let Some(child) = entity.child(&name) {
                    let flattened = self.flatten_into_current(&child);
                    self.manager
                        .set_mapped_child(contained, intern::intern(&name), flattened);
                }
            }
            self.manager
                .set_mapped_child(out, intern::intern("contained"), contained);
        }
        out
    }

    /// The two-entity merge family. Scalar results (`commonality_entities`,
    /// `edit_distance_entities`) come back as numbers; structural results
    /// land in a new entity at the destination path.
    pub(crate) fn op_entity_merge(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);

        if kind == NodeKind::MutateEntity {
            // (mutate_entity src dest rate?)
            let Some(source) = self.resolve_entity(children.first().copied()) else {
                return EvalResult::NULL;
            };
            let rate = children
                .get(2)
                .map(|&c| self.interpret_into_number(Some(c)))
                .filter(|r| !r.is_nan() && *r >= 0.0)
                .unwrap_or(1e-5);
            let Some(root) = source.root() else {
                return EvalResult::NULL;
            };
            let mut stream = self.scratch_stream();
            let mutated = tree::mutate(source.manager(), root, rate, &mut stream);
            return self.install_merge_result(children.get(1).copied(), &source, mutated);
        }

        let Some(a) = self.resolve_entity(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some(b) = self.resolve_entity(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        let (Some(root_a), Some(root_b)) = (a.root(), b.root()) else {
            return EvalResult::NULL;
        };

        match kind {
            NodeKind::CommonalityEntities => {
                let value = tree::commonality(a.manager(), root_a, b.manager(), root_b);
                EvalResult::number(value)
            }
            NodeKind::EditDistanceEntities => {
                let value = tree::edit_distance(a.manager(), root_a, b.manager(), root_b);
                EvalResult::number(value)
            }
            _ => {
                // Merge in a's arena, then install.
                let b_in_a = tree::deep_copy_between(b.manager(), a.manager(), root_b);
                let merged = match kind {
                    NodeKind::IntersectEntities => tree::intersect(a.manager(), root_a, b_in_a),
                    NodeKind::UnionEntities => tree::union_trees(a.manager(), root_a, b_in_a),
                    NodeKind::DifferenceEntities => {
                        tree::difference(a.manager(), root_a, b_in_a)
                    }
                    NodeKind::MixEntities => {
                        let fraction = self
                            .manager
                            .child(n, 3)
                            .map(|c| self.interpret_into_number(Some(c)))
                            .filter(|f| !f.is_nan())
                            .unwrap_or(0.5)
                            .clamp(0.0, 1.0);
                        let mut stream = self.scratch_stream();
                        tree::mix(a.manager(), root_a, b_in_a, fraction, &mut stream)
                    }
                    _ => return EvalResult::NULL,
                };
                self.install_merge_result(children.get(2).copied(), &a, merged)
            }
        }
    }

    /// Installs a merge result (a tree in `source`'s arena) as the root of
    /// a new entity at the destination path, returning the new entity's id.
    fn install_merge_result(
        &mut self,
        dest_path: Option<NodeId>,
        source: &Arc<Entity>,
        merged_root: NodeId,
    ) -> EvalResult {
        // The merged tree is unrooted in the source arena; keep it across
        // the path interpretation below, which can collect that arena when
        // the source is the current entity.
        source.manager().keep_node_reference(merged_root);
        let destination = self.resolve_destination(dest_path);
        let installed = destination.and_then(|(container, name)| {
            if !self.can_create_entity(&container, &name) {
                return None;
            }
            let seed = container.fork_child_seed(&name);
            let entity = Entity::with_seed(&name, &seed);
            let root = tree::deep_copy_between(source.manager(), entity.manager(), merged_root);
            entity.set_root(Some(root));
            container.add_child(&name, entity);
            self.persist_if_needed(&container);
            Some(name)
        });
        source.manager().free_node_reference(merged_root);
        match installed {
            Some(name) => EvalResult::string(intern::intern(&name)),
            None => EvalResult::NULL,
        }
    }

    // -----------------------------------------------------------------------
    // Entity details
    // -----------------------------------------------------------------------

    /// `(get_entity_comments path?)` — the root node's comment.
    pub(crate) fn op_get_entity_comments(&mut self, n: NodeId) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        let comment = match target.root() {
            Some(root) => target.manager().comment_of(root),
            None => SymbolId::NONE,
        };
        if comment.is_none() {
            EvalResult::NULL
        } else {
            EvalResult::string(intern::pool().add_ref(comment))
        }
    }

    /// `(retrieve_entity_root path?)` — a copy of the entity's program.
    pub(crate) fn op_retrieve_entity_root(&mut self, n: NodeId) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        match target.root() {
            Some(root) => {
                let copy = tree::deep_copy_between(target.manager(), &self.manager, root);
                EvalResult::node(copy, true)
            }
            None => EvalResult::NULL,
        }
    }

    /// `(assign_entity_roots path code)` replaces the target's root;
    /// `accum_entity_roots` accumulates list/assoc roots instead. Both
    /// rebuild the target's label index.
    pub(crate) fn op_assign_entity_roots(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, code_node) = match children.len() {
            0 => return EvalResult::NULL,
            1 => (None, children[0]),
            _ => (Some(children[0]), children[1]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return EvalResult::NULL;
        };

        let value = self.interpret(Some(code_node), false);
        let new_root = match value.value {
            Immediate::Node(id) => {
                Some(tree::deep_copy_between(&self.manager, target.manager(), id))
            }
            Immediate::Number(v) => Some(target.manager().alloc_number(v)),
            Immediate::Str(sid) => {
                let node = target.manager().alloc_string(&intern::text(sid));
                Some(node)
            }
            Immediate::Null => None,
        };
        self.free_result(value);

        if kind == NodeKind::AccumEntityRoots {
            match (target.root(), new_root) {
                (Some(existing), Some(addition)) => {
                    let manager = target.manager();
                    match (manager.kind_of(existing), manager.kind_of(addition)) {
                        (NodeKind::List, _) => {
                            manager.push_child(existing, addition);
                            target.set_root(Some(existing));
                        }
                        (NodeKind::Assoc, NodeKind::Assoc) => {
                            for (key, child) in manager.mapped_entries_sorted(addition) {
                                manager.set_mapped_child(
                                    existing,
                                    intern::pool().add_ref(key),
                                    child,
                                );
                            }
                            target.set_root(Some(existing));
                        }
                        _ => target.set_root(Some(addition)),
                    }
                }
                (None, Some(addition)) => target.set_root(Some(addition)),
                _ => {}
            }
        } else {
            target.set_root(new_root);
        }
        self.note_side_effect();
        self.persist_if_needed(&target);
        self.boolean_result(true, false)
    }

    pub(crate) fn op_get_entity_rand_seed(&mut self, n: NodeId) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        EvalResult::string(intern::intern(&target.rand_seed()))
    }

    /// `(set_entity_rand_seed seed)` or `(set_entity_rand_seed path seed)`.
    pub(crate) fn op_set_entity_rand_seed(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, seed_node) = match children.len() {
            0 => return EvalResult::NULL,
            1 => (None, children[0]),
            _ => (Some(children[0]), children[1]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return EvalResult::NULL;
        };
        let Some(seed) = self.interpret_into_string(Some(seed_node)) else {
            return EvalResult::NULL;
        };
        target.set_rand_seed(&seed);
        self.note_side_effect();
        EvalResult::string(intern::intern(&seed))
    }

    pub(crate) fn op_get_entity_root_permission(
        &mut self,
        n: NodeId,
        immediate_ok: bool,
    ) -> EvalResult {
        let Some(target) = self.resolve_entity(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        self.boolean_result(target.root_permission(), immediate_ok)
    }

    /// `(set_entity_root_permission path on)` — granting requires the
    /// calling entity itself be rooted.
    pub(crate) fn op_set_entity_root_permission(&mut self, n: NodeId) -> EvalResult {
        let caller_rooted = self
            .entity
            .as_ref()
            .map(|e| e.root_permission())
            .unwrap_or(true);
        if !caller_rooted {
            log::warn!("set_entity_root_permission refused: caller lacks root permission");
            return EvalResult::NULL;
        }
        let children = self.manager.children_of(n);
        let Some(target) = self.resolve_entity(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let on = self.interpret_into_bool(children.get(1).copied(), false);
        target.set_root_permission(on);
        self.boolean_result(on, false)
    }

    // -----------------------------------------------------------------------
    // Entity actions
    // -----------------------------------------------------------------------

    /// `(create_entities code)` or `(create_entities path code)` — creates
    /// a child entity whose root is the evaluated code, honoring the
    /// entity-growth budgets. Yields a list of the created ids.
    pub(crate) fn op_create_entities(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, code_node) = match children.len() {
            0 => (None, None),
            1 => (None, Some(children[0])),
            _ => (Some(children[0]), Some(children[1])),
        };

        let destination = self.resolve_destination(path_node);
        let Some((container, name)) = destination else {
            return EvalResult::NULL;
        };
        if !self.can_create_entity(&container, &name) {
            return EvalResult::NULL;
        }

        let seed = container.fork_child_seed(&name);
        let entity = Entity::with_seed(&name, &seed);

        let code = self.interpret(code_node, false);
        let root = match code.value {
            Immediate::Node(id) => {
                Some(tree::deep_copy_between(&self.manager, entity.manager(), id))
            }
            Immediate::Number(v) => Some(entity.manager().alloc_number(v)),
            Immediate::Str(sid) => Some(entity.manager().alloc_string(&intern::text(sid))),
            Immediate::Null => None,
        };
        self.free_result(code);
        entity.set_root(root);

        if let Some(constraints) = &self.constraints {
            let nodes = entity.manager().used_nodes() as u64;
            constraints
                .cur_allocated_nodes_to_entities
                .fetch_add(nodes, std::sync::atomic::Ordering::Relaxed);
        }

        container.add_child(&name, entity);
        self.note_side_effect();
        self.persist_if_needed(&container);

        let out = self.manager.alloc(NodeKind::List);
        let id_node = self.manager.alloc_string(&name);
        self.manager.push_child(out, id_node);
        EvalResult::node(out, true)
    }

    /// `(clone_entities src dest?)` — deep clone of an entity subtree.
    pub(crate) fn op_clone_entities(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(source) = self.resolve_entity(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some((container, name)) = self.resolve_destination(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        if !self.can_create_entity(&container, &name) {
            return EvalResult::NULL;
        }

        let clone = clone_entity_tree(&source, &name);
        container.add_child(&name, clone);
        self.note_side_effect();
        self.persist_if_needed(&container);

        let out = self.manager.alloc(NodeKind::List);
        let id_node = self.manager.alloc_string(&name);
        self.manager.push_child(out, id_node);
        EvalResult::node(out, true)
    }

    /// `(move_entities src dest)` — detaches and reattaches, renaming to
    /// the destination id.
    pub(crate) fn op_move_entities(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let source_path = self.interpret_into_entity_path(children.first().copied());
        let Some(current) = self.entity.clone() else {
            return EvalResult::NULL;
        };
        let Some((source_container, source_name)) =
            crate::entity::resolve_path_container(&current, &source_path)
        else {
            return EvalResult::NULL;
        };
        let Some((dest_container, dest_name)) =
            self.resolve_destination(children.get(1).copied())
        else {
            return EvalResult::NULL;
        };
        if dest_container.has_child(&dest_name) {
            return EvalResult::NULL;
        }

        let Some(moved) = source_container.remove_child(&source_name) else {
            return EvalResult::NULL;
        };
        dest_container.add_child(&dest_name, moved);
        self.note_side_effect();
        self.persist_if_needed(&source_container);
        self.persist_if_needed(&dest_container);

        let out = self.manager.alloc(NodeKind::List);
        let id_node = self.manager.alloc_string(&dest_name);
        self.manager.push_child(out, id_node);
        EvalResult::node(out, true)
    }

    /// `(destroy_entities path...)` — destroys each named entity and its
    /// children; arenas are released wholesale when the last reference
    /// drops.
    pub(crate) fn op_destroy_entities(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(current) = self.entity.clone() else {
            return EvalResult::NULL;
        };
        let mut all = true;
        for &path_node in &children {
            let path = self.interpret_into_entity_path(Some(path_node));
            match crate::entity::resolve_path_container(&current, &path) {
                Some((container, name)) => {
                    if container.remove_child(&name).is_none() {
                        all = false;
                    } else {
                        self.persist_if_needed(&container);
                    }
                }
                None => all = false,
            }
        }
        self.note_side_effect();
        self.boolean_result(all, immediate_ok)
    }

    /// `(load file-path)` — loads a resource file as a node graph.
    pub(crate) fn op_load(&mut self, n: NodeId) -> EvalResult {
        let Some(path) = self.interpret_into_string(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        let (node, status) = asset::load_resource(std::path::Path::new(&path), &self.manager);
        if !status.loaded {
            log::warn!("load {:?} failed: {}", path, status.message);
        }
        match node {
            Some(node) => EvalResult::node(node, true),
            None => EvalResult::NULL,
        }
    }

    /// `(load_entity file-path entity-path?)` — loads a stored entity and
    /// attaches it; `load_persist` additionally keeps it bound to its
    /// files.
    pub(crate) fn op_load_entity(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(file_path) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let persistent = kind == NodeKind::LoadPersist;

        let destination = match children.get(1) {
            Some(&dest) => self.resolve_destination(Some(dest)),
            None => {
                let stem = std::path::Path::new(&file_path)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(asset::unescape_filename)
                    .unwrap_or_else(|| "loaded".to_string());
                self.entity.clone().map(|current| (current, stem))
            }
        };
        let Some((container, name)) = destination else {
            return EvalResult::NULL;
        };
        if !self.can_create_entity(&container, &name) {
            return EvalResult::NULL;
        }

        let seed = container.fork_child_seed(&name);
        match asset::load_entity(std::path::Path::new(&file_path), &seed, persistent) {
            Ok(entity) => {
                container.add_child(&name, entity);
                self.note_side_effect();
                EvalResult::string(intern::intern(&name))
            }
            Err(status) => {
                log::warn!("load_entity {:?} failed: {}", file_path, status.message);
                EvalResult::NULL
            }
        }
    }

    /// `(store file-path code)` — stores a node graph as a resource file.
    pub(crate) fn op_store(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(path) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let code = self.interpret(children.get(1).copied(), false);
        let (node, _) = self.result_to_node_always(code);
        let stored = asset::store_resource(
            &self.manager,
            node,
            std::path::Path::new(&path),
            false,
        );
        if let Err(err) = &stored {
            log::warn!("store {:?} failed: {}", path, err);
        }
        self.boolean_result(stored.is_ok(), immediate_ok)
    }

    /// `(store_entity file-path entity-path?)`.
    pub(crate) fn op_store_entity(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(path) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some(target) = self.resolve_entity(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        let stored = asset::store_entity(&target, std::path::Path::new(&path));
        if let Err(err) = &stored {
            log::warn!("store_entity {:?} failed: {}", path, err);
        }
        self.boolean_result(stored.is_ok(), immediate_ok)
    }

    pub(crate) fn op_contains_entity(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let found = self.resolve_entity(self.manager.child(n, 0)).is_some();
        self.boolean_result(found, immediate_ok)
    }

    // -----------------------------------------------------------------------
    // Entity access
    // -----------------------------------------------------------------------

    /// `(contains_label label)` or `(contains_label path label)`.
    pub(crate) fn op_contains_label(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, label_node) = match children.len() {
            0 => return EvalResult::NULL,
            1 => (None, children[0]),
            _ => (Some(children[0]), children[1]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return self.boolean_result(false, immediate_ok);
        };
        let include_private = self.is_current_entity(&target);
        let sid = self.interpret_into_string_id_if_exists(Some(label_node));
        let found = !sid.is_none() && target.label_target(sid, include_private).is_some();
        self.boolean_result(found, immediate_ok)
    }

    /// `(assign_to_entities assoc)` / `(assign_to_entities path assoc)` —
    /// overwrites each labeled node's value in the target entity;
    /// `accum_to_entities` accumulates instead. The direct variants share
    /// this implementation (write listeners are an external concern).
    pub(crate) fn op_assign_to_entities(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, assoc_node) = match children.len() {
            0 => return EvalResult::NULL,
            1 => (None, children[0]),
            _ => (Some(children[0]), children[1]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return self.boolean_result(false, immediate_ok);
        };
        let include_private = self.is_current_entity(&target);
        let accumulate = kind == NodeKind::AccumToEntities;

        let bindings = self.interpret(Some(assoc_node), false);
        let Some(assoc) = bindings.node_id().filter(|&id| {
            self.manager.kind_of(id) == NodeKind::Assoc
        }) else {
            self.free_result(bindings);
            return self.boolean_result(false, immediate_ok);
        };
        self.protect(&bindings);

        let mut all = true;
        for (label, value) in self.manager.mapped_entries_sorted(assoc) {
            match target.symbol_value(label, include_private) {
                Some(dest) => {
                    overwrite_labeled_node(
                        &self.manager,
                        value,
                        target.manager(),
                        dest,
                        accumulate,
                    );
                }
                None => all = false,
            }
        }
        target.rebuild_label_index();
        self.note_side_effect();
        self.persist_if_needed(&target);

        self.unprotect(&bindings);
        self.free_result(bindings);
        self.boolean_result(all, immediate_ok)
    }

    /// `(retrieve_from_entity label)` / `(retrieve_from_entity path label)`
    /// — reads labeled values out of an entity, copying across arenas. A
    /// list of labels yields a list of values.
    pub(crate) fn op_retrieve_from_entity(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let (path_node, label_node) = match children.len() {
            0 => return EvalResult::NULL,
            1 => (None, children[0]),
            _ => (Some(children[0]), children[1]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return EvalResult::NULL;
        };
        let include_private = self.is_current_entity(&target);

        let spec = self.interpret(Some(label_node), false);
        let result = match spec.value {
            Immediate::Str(sid) => self.copy_labeled_value(&target, sid, include_private),
            Immediate::Node(id) if self.manager.kind_of(id) == NodeKind::List => {
                let out = self.manager.alloc(NodeKind::List);
                for child in self.manager.children_of(id) {
                    let sid = self.manager.symbol_of(child);
                    let value = self.copy_labeled_value(&target, sid, include_private);
                    let (node, _) = self.result_to_node_always(value);
                    self.manager.push_child(out, node);
                }
                EvalResult::node(out, true)
            }
            Immediate::Node(id)
                if matches!(
                    self.manager.kind_of(id),
                    NodeKind::String | NodeKind::Symbol
                ) =>
            {
                let sid = self.manager.symbol_of(id);
                self.copy_labeled_value(&target, sid, include_private)
            }
            _ => EvalResult::NULL,
        };
        self.free_result(spec);
        result
    }

    fn copy_labeled_value(
        &mut self,
        target: &Arc<Entity>,
        label: SymbolId,
        include_private: bool,
    ) -> EvalResult {
        match target.symbol_value(label, include_private) {
            Some(node) => {
                let copy = tree::deep_copy_between(target.manager(), &self.manager, node);
                // The copy does not carry the addressing label itself.
                self.manager.clear_metadata(copy);
                EvalResult::node(copy, true)
            }
            None => EvalResult::NULL,
        }
    }

    /// `(call_entity path label args? steps? nodes? depth? ...)` —
    /// evaluates a labeled program inside the target entity with a fresh
    /// call stack and derived budgets, then copies the result back.
    /// `call_entity_get_changes` evaluates identically and pairs the result
    /// with a null change journal.
    pub(crate) fn op_call_entity(&mut self, n: NodeId, kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(target) = self.resolve_entity(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let result = self.call_labeled(&target, children.get(1).copied(), &children, 2, false);
        if kind == NodeKind::CallEntityGetChanges {
            let out = self.manager.alloc(NodeKind::List);
            let (value, _) = self.result_to_node_always(result);
            self.manager.push_child(out, value);
            let journal = self.manager.alloc(NodeKind::Null);
            self.manager.push_child(out, journal);
            return EvalResult::node(out, true);
        }
        result
    }

    /// `(call_container label args? ...)` — like `call_entity` against the
    /// containing entity.
    pub(crate) fn op_call_container(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(container) = self.entity.as_ref().and_then(|e| e.container()) else {
            return EvalResult::NULL;
        };
        self.call_labeled(&container, children.first().copied(), &children, 1, false)
    }

    fn call_labeled(
        &mut self,
        target: &Arc<Entity>,
        label_node: Option<NodeId>,
        children: &[NodeId],
        constraint_offset: usize,
        include_private: bool,
    ) -> EvalResult {
        let sid = self.interpret_into_string_id_if_exists(label_node);
        if sid.is_none() {
            return EvalResult::NULL;
        }
        let include_private = include_private || self.is_current_entity(target);
        let Some(code) = target.label_target(sid, include_private) else {
            return EvalResult::NULL;
        };

        // Arguments are evaluated here, then copied into the target arena.
        let args = self.interpret(children.get(constraint_offset).copied(), false);
        let frame = match args.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => {
                tree::deep_copy_between(&self.manager, target.manager(), id)
            }
            _ => target.manager().alloc(NodeKind::Assoc),
        };
        self.free_result(args);

        let constraints = self
            .populate_constraints_from_params(children, constraint_offset + 1, true)
            .map(|c| self.finalize_child_constraints(c, Some(target)));

        let mut callee = Interpreter::with_args_frame(target, frame, constraints);
        let result = callee.execute(code, false);

        // Copy the result back into the caller's arena.
        let out = match result.value {
            Immediate::Node(id) => {
                let copy = tree::deep_copy_between(target.manager(), &self.manager, id);
                EvalResult::node(copy, true)
            }
            other => EvalResult {
                value: other,
                unique: result.unique,
            },
        };
        drop(callee);
        self.persist_if_needed(target);
        out
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn is_current_entity(&self, target: &Arc<Entity>) -> bool {
        self.entity
            .as_ref()
            .map(|e| Arc::ptr_eq(e, target))
            .unwrap_or(false)
    }

    /// Destination for a new entity: the path's container and final name,
    /// or the current entity with a generated name when the path is null.
    pub(crate) fn resolve_destination(
        &mut self,
        path_node: Option<NodeId>,
    ) -> Option<(Arc<Entity>, String)> {
        match path_node {
            None => {
                let current = self.entity.clone()?;
                let name = current.unused_child_name();
                Some((current, name))
            }
            Some(node) => {
                let path = self.interpret_into_entity_path(Some(node));
                let current = self.entity.clone()?;
                if path.is_empty() {
                    let name = current.unused_child_name();
                    return Some((current, name));
                }
                crate::entity::resolve_path_container(&current, &path)
            }
        }
    }

    /// Enforces the entity-growth budgets before creating a child of
    /// `container`: contained-entity count, containment depth, and id
    /// length.
    pub(crate) fn can_create_entity(&mut self, container: &Arc<Entity>, name: &str) -> bool {
        if container.has_child(name) {
            return false;
        }
        let Some(constraints) = self.constraints.clone() else {
            return true;
        };
        if constraints.max_entity_id_length > 0
            && name.len() as u64 > constraints.max_entity_id_length
        {
            constraints.exhaust();
            return false;
        }
        let Some(scope) = constraints.entity_to_constrain_from.upgrade() else {
            return true;
        };
        if constraints.constrain_contained_entities
            && scope.deep_contained_count() as u64 >= constraints.max_contained_entities
        {
            constraints.exhaust();
            return false;
        }
        if constraints.constrain_entity_depth {
            let depth = container.depth_below(&scope).unwrap_or(0) as u64;
            if depth + 1 > constraints.max_contained_entity_depth {
                constraints.exhaust();
                return false;
            }
        }
        true
    }

    /// Rewrites the nearest persisted ancestor's files after a structural
    /// mutation, keeping disk in sync for `load_persist`ed entities.
    pub(crate) fn persist_if_needed(&mut self, entity: &Arc<Entity>) {
        let mut cur = Some(entity.clone());
        while let Some(e) = cur {
            if let Some(path) = e.persist_path() {
                if let Err(err) = asset::store_entity(&e, &path) {
                    log::warn!("persisting {:?} failed: {}", path, err);
                }
                return;
            }
            cur = e.container();
        }
    }
}

/// Clones an entity and its children: roots, seeds, and permissions.
fn clone_entity_tree(source: &Arc<Entity>, new_id: &str) -> Arc<Entity> {
    let clone = Entity::with_seed(new_id, &source.rand_seed());
    if let Some(root) = source.root() {
        let copied = tree::deep_copy_between(source.manager(), clone.manager(), root);
        clone.set_root(Some(copied));
    }
    clone.set_root_permission(source.root_permission());
    for name in source.child_names() {
        if let Some(child) = source.child(&name) {
            let child_clone = clone_entity_tree(&child, &name);
            clone.add_child(&name, child_clone);
        }
    }
    clone
}

/// Overwrites (or accumulates into) a labeled node in place, preserving the
/// node's identity so labels and parents stay valid.
fn overwrite_labeled_node(
    src_mgr: &Arc<crate::node_manager::NodeManager>,
    src: NodeId,
    dst_mgr: &Arc<crate::node_manager::NodeManager>,
    dst: NodeId,
    accumulate: bool,
) {
    let src_kind = src_mgr.kind_of(src);
    if accumulate {
        match (dst_mgr.kind_of(dst), src_kind) {
            (NodeKind::Number, NodeKind::Number) => {
                dst_mgr.set_number(dst, dst_mgr.number_of(dst) + src_mgr.number_of(src));
                return;
            }
            (NodeKind::String, NodeKind::String) => {
                let mut text = intern::text(dst_mgr.symbol_of(dst));
                text.push_str(&intern::text(src_mgr.symbol_of(src)));
                dst_mgr.set_symbol_handoff(dst, intern::intern(&text));
                return;
            }
            (NodeKind::List, _) => {
                let copy = tree::deep_copy_between(src_mgr, dst_mgr, src);
                dst_mgr.push_child(dst, copy);
                return;
            }
            _ => {}
        }
    }

    // Replace the node's value while keeping its metadata: retype, then
    // graft copied children or payload.
    let labels: Vec<SymbolId> = dst_mgr
        .labels_of(dst)
        .into_iter()
        .map(|l| intern::pool().add_ref(l))
        .collect();
    dst_mgr.set_kind(dst, src_kind);
    match src_kind {
        NodeKind::Number => dst_mgr.set_number(dst, src_mgr.number_of(src)),
        NodeKind::String | NodeKind::Symbol => {
            let text = intern::text(src_mgr.symbol_of(src));
            dst_mgr.set_symbol_handoff(dst, intern::intern(&text));
        }
        _ if src_kind.uses_mapped_children() => {
            for (key, _) in dst_mgr.mapped_entries(dst) {
                dst_mgr.remove_mapped_child(dst, key);
            }
            for (key, value) in src_mgr.mapped_entries(src) {
                let copy = tree::deep_copy_between(src_mgr, dst_mgr, value);
                let key_text = intern::text(key);
                dst_mgr.set_mapped_child(dst, intern::intern(&key_text), copy);
            }
        }
        _ => {
            let copies: Vec<NodeId> = src_mgr
                .children_of(src)
                .into_iter()
                .map(|c| tree::deep_copy_between(src_mgr, dst_mgr, c))
                .collect();
            dst_mgr.set_children(dst, copies);
        }
    }
    dst_mgr.set_labels_handoff(dst, labels);
}
