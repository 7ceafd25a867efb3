//! Entities: named containers forming the persistent universe.
//!
//! Each entity owns its node arena, a root program, a random stream, a label
//! index over the root, and nested child entities. Entities are shared as
//! `Arc<Entity>`; structural state sits behind a read/write lock that is
//! only ever held for short structural operations, never across nested
//! evaluation, so sibling entities can be evaluated concurrently and
//! traversals can lock paths top-down without self-deadlocking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

use crate::intern::{self, SymbolId};
use crate::node::{NodeId, PRIVATE_LABEL_SIGIL};
use crate::node_manager::NodeManager;
use crate::rand::RandomStream;

struct EntityInner {
    id: String,
    root: Option<NodeId>,
    /// label id -> labeled node reachable from the root.
    label_index: HashMap<SymbolId, NodeId>,
    rand: RandomStream,
    children: BTreeMap<String, Arc<Entity>>,
    container: Weak<Entity>,
    root_permission: bool,
    persist_path: Option<PathBuf>,
}

/// A named container with a root program, a random stream, and children.
pub struct Entity {
    manager: Arc<NodeManager>,
    inner: RwLock<EntityInner>,
}

impl Entity {
    /// Creates a bare entity with an entropy-derived (but replayable) seed.
    pub fn new(id: &str) -> Arc<Entity> {
        Entity::with_seed(id, &RandomStream::from_entropy().seed().to_string())
    }

    /// Creates a bare entity with the given random seed.
    pub fn with_seed(id: &str, seed: &str) -> Arc<Entity> {
        Arc::new(Entity {
            manager: Arc::new(NodeManager::new()),
            inner: RwLock::new(EntityInner {
                id: id.to_string(),
                root: None,
                label_index: HashMap::new(),
                rand: RandomStream::seeded(seed),
                children: BTreeMap::new(),
                container: Weak::new(),
                root_permission: false,
                persist_path: None,
            }),
        })
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    // -- Root program --

    /// Installs the root node and rebuilds the label index.
    pub fn set_root(&self, root: Option<NodeId>) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.root = root;
        }
        self.manager.set_root(root);
        self.rebuild_label_index();
    }

    pub fn root(&self) -> Option<NodeId> {
        self.inner.read().unwrap().root
    }

    /// Recomputes label id -> node from the current root. Called after root
    /// installation and after interpreter mutations that touch labels.
    pub fn rebuild_label_index(&self) {
        let root = self.root();
        let mut index = HashMap::new();
        if let Some(root) = root {
            let mut seen: HashSet<NodeId> = HashSet::new();
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                for label in self.manager.labels_of(id) {
                    // First occurrence wins on duplicate labels.
                    index.entry(label).or_insert(id);
                }
                stack.extend(self.manager.children_of(id));
                stack.extend(self.manager.mapped_entries(id).into_iter().map(|(_, v)| v));
            }
        }
        self.inner.write().unwrap().label_index = index;
    }

    /// Looks up the node addressed by a label. Private labels (leading `!`)
    /// resolve only when `include_private` is set.
    pub fn label_target(&self, label: SymbolId, include_private: bool) -> Option<NodeId> {
        if !include_private && intern::text(label).starts_with(PRIVATE_LABEL_SIGIL) {
            return None;
        }
        self.inner.read().unwrap().label_index.get(&label).copied()
    }

    /// Resolves a name against the entity: first the label index, then —
    /// when the root is associative — the root's own keys. An `assoc` root
    /// resolves by mapped key; an unevaluated `associate` root resolves by
    /// scanning its literal key/value pairs.
    pub fn symbol_value(&self, name: SymbolId, include_private: bool) -> Option<NodeId> {
        if let Some(node) = self.label_target(name, include_private) {
            return Some(node);
        }
        let root = self.root()?;
        match self.manager.kind_of(root) {
            crate::node::NodeKind::Assoc => self.manager.mapped_get(root, name),
            crate::node::NodeKind::Associate => {
                let children = self.manager.children_of(root);
                let mut i = 0;
                while i + 1 < children.len() {
                    let key = children[i];
                    if self.manager.kind_of(key).uses_string_payload()
                        && self.manager.symbol_of(key) == name
                    {
                        return Some(children[i + 1]);
                    }
                    i += 2;
                }
                None
            }
            _ => None,
        }
    }

    /// All (label, node) pairs currently indexed.
    pub fn labels(&self, include_private: bool) -> Vec<(SymbolId, NodeId)> {
        let inner = self.inner.read().unwrap();
        inner
            .label_index
            .iter()
            .filter(|(l, _)| include_private || !intern::text(**l).starts_with(PRIVATE_LABEL_SIGIL))
            .map(|(&l, &n)| (l, n))
            .collect()
    }

    // -- Random stream --

    pub fn rand_seed(&self) -> String {
        self.inner.read().unwrap().rand.seed().to_string()
    }

    pub fn set_rand_seed(&self, seed: &str) {
        self.inner.write().unwrap().rand.set_seed(seed);
    }

    pub fn next_double(&self) -> f64 {
        self.inner.write().unwrap().rand.next_double()
    }

    pub fn next_index(&self, bound: usize) -> usize {
        self.inner.write().unwrap().rand.next_index(bound)
    }

    /// Deterministic seed for a child entity, mixing this entity's stream
    /// with the child's name.
    pub fn fork_child_seed(&self, name: &str) -> String {
        self.inner.read().unwrap().rand.fork(name).seed().to_string()
    }

    /// A forked stream for a worker interpreter.
    pub fn fork_stream(&self, name: &str) -> RandomStream {
        self.inner.read().unwrap().rand.fork(name)
    }

    // -- Permissions and persistence --

    pub fn root_permission(&self) -> bool {
        self.inner.read().unwrap().root_permission
    }

    pub fn set_root_permission(&self, on: bool) {
        self.inner.write().unwrap().root_permission = on;
    }

    pub fn persist_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().persist_path.clone()
    }

    pub fn set_persist_path(&self, path: Option<PathBuf>) {
        self.inner.write().unwrap().persist_path = path;
    }

    // -- Containment --

    pub fn container(&self) -> Option<Arc<Entity>> {
        self.inner.read().unwrap().container.upgrade()
    }

    /// Attaches `child` under `name`, replacing any previous child of that
    /// name. The child's random stream is left untouched.
    pub fn add_child(self: &Arc<Self>, name: &str, child: Arc<Entity>) {
        {
            let mut child_inner = child.inner.write().unwrap();
            child_inner.container = Arc::downgrade(self);
            child_inner.id = name.to_string();
        }
        self.inner
            .write()
            .unwrap()
            .children
            .insert(name.to_string(), child);
    }

    pub fn child(&self, name: &str) -> Option<Arc<Entity>> {
        self.inner.read().unwrap().children.get(name).cloned()
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Entity>> {
        let removed = self.inner.write().unwrap().children.remove(name);
        if let Some(child) = &removed {
            child.inner.write().unwrap().container = Weak::new();
        }
        removed
    }

    /// Child names in deterministic (sorted) order.
    pub fn child_names(&self) -> Vec<String> {
        self.inner.read().unwrap().children.keys().cloned().collect()
    }

    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.inner.read().unwrap().children.values().cloned().collect()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.inner.read().unwrap().children.contains_key(name)
    }

    /// A child name not currently in use, drawn from the random stream.
    pub fn unused_child_name(&self) -> String {
        loop {
            let n = {
                let mut inner = self.inner.write().unwrap();
                inner.rand.next_index(u32::MAX as usize)
            };
            let name = format!("_{:x}", n);
            if !self.has_child(&name) {
                return name;
            }
        }
    }

    /// All transitively contained entities grouped by depth (closest first),
    /// safe to iterate during aggregate queries.
    pub fn all_contained_by_depth(self: &Arc<Self>) -> Vec<Vec<Arc<Entity>>> {
        let mut groups = Vec::new();
        let mut frontier = self.children();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for e in &frontier {
                next.extend(e.children());
            }
            groups.push(std::mem::take(&mut frontier));
            frontier = next;
        }
        groups
    }

    /// Count of transitively contained entities.
    pub fn deep_contained_count(self: &Arc<Self>) -> usize {
        self.all_contained_by_depth().iter().map(|g| g.len()).sum()
    }

    /// Depth of `self` below `ancestor`, if contained.
    pub fn depth_below(self: &Arc<Self>, ancestor: &Arc<Entity>) -> Option<usize> {
        let mut depth = 0;
        let mut cur = self.clone();
        loop {
            if Arc::ptr_eq(&cur, ancestor) {
                return Some(depth);
            }
            cur = cur.container()?;
            depth += 1;
        }
    }

    /// Total node count of this entity and all contained entities.
    pub fn total_entity_size(self: &Arc<Self>) -> usize {
        let mut total = self.manager.used_nodes();
        for child in self.children() {
            total += child.total_entity_size();
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// One segment of an entity path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// A child entity name.
    Name(String),
    /// Leading null: restart from the outermost container.
    Root,
}

/// Walks an entity path from `start`. An empty path is `start` itself; a
/// leading [`PathSegment::Root`] jumps to the outermost container first.
/// Locks are taken transiently per step, top-down.
pub fn resolve_path(start: &Arc<Entity>, path: &[PathSegment]) -> Option<Arc<Entity>> {
    let mut cur = start.clone();
    let mut segments = path;
    if let Some(PathSegment::Root) = segments.first() {
        while let Some(container) = cur.container() {
            cur = container;
        }
        segments = &segments[1..];
    }
    for seg in segments {
        match seg {
            PathSegment::Name(name) => cur = cur.child(name)?,
            PathSegment::Root => return None,
        }
    }
    Some(cur)
}

/// Like [`resolve_path`] but stops one short: returns the container of the
/// final segment plus that segment's name, whether or not the target exists.
pub fn resolve_path_container(
    start: &Arc<Entity>,
    path: &[PathSegment],
) -> Option<(Arc<Entity>, String)> {
    let (last, prefix) = path.split_last()?;
    let container = resolve_path(start, prefix)?;
    match last {
        PathSegment::Name(name) => Some((container, name.clone())),
        PathSegment::Root => None,
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({})", self.id())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    #[test]
    fn set_root_builds_label_index() {
        let e = Entity::with_seed("e", "seed");
        let m = e.manager().clone();
        let root = m.alloc(NodeKind::List);
        let labeled = m.alloc_number(42.0);
        m.add_label(labeled, "answer");
        m.push_child(root, labeled);
        e.set_root(Some(root));

        let sid = intern::pool().id_if_exists("answer").unwrap();
        assert_eq!(e.label_target(sid, false), Some(labeled));
    }

    #[test]
    fn private_labels_hidden_without_access() {
        let e = Entity::with_seed("e", "seed");
        let m = e.manager().clone();
        let root = m.alloc(NodeKind::List);
        let secret = m.alloc_number(7.0);
        m.add_label(secret, "!secret");
        m.push_child(root, secret);
        e.set_root(Some(root));

        let sid = intern::pool().id_if_exists("!secret").unwrap();
        assert_eq!(e.label_target(sid, false), None);
        assert_eq!(e.label_target(sid, true), Some(secret));
    }

    #[test]
    fn path_resolution() {
        let parent = Entity::with_seed("parent", "s");
        let child = Entity::with_seed("child", "s2");
        let grandchild = Entity::with_seed("grandchild", "s3");
        child.add_child("gc", grandchild.clone());
        parent.add_child("c", child.clone());

        let path = [
            PathSegment::Name("c".into()),
            PathSegment::Name("gc".into()),
        ];
        let found = resolve_path(&parent, &path).unwrap();
        assert!(Arc::ptr_eq(&found, &grandchild));

        // Leading Root restarts from the outermost container.
        let up = resolve_path(&grandchild, &[PathSegment::Root]).unwrap();
        assert!(Arc::ptr_eq(&up, &parent));

        assert_eq!(resolve_path(&parent, &[PathSegment::Name("nope".into())]), None);
    }

    #[test]
    fn child_seeds_are_deterministic_forks() {
        let a = Entity::with_seed("a", "seed");
        let b = Entity::with_seed("b", "seed");
        assert_eq!(a.fork_child_seed("kid"), b.fork_child_seed("kid"));
        assert_ne!(a.fork_child_seed("kid"), a.fork_child_seed("other"));
    }

    #[test]
    fn contained_by_depth_groups() {
        let root = Entity::with_seed("r", "s");
        let c1 = Entity::with_seed("c1", "s");
        let c2 = Entity::with_seed("c2", "s");
        let g = Entity::with_seed("g", "s");
        c1.add_child("g", g);
        root.add_child("c1", c1);
        root.add_child("c2", c2);

        let groups = root.all_contained_by_depth();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(root.deep_contained_count(), 3);
    }
}
