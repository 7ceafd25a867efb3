//! Sylva — a symbolic code-and-data platform.
//!
//! Programs, data, and persisted entities all live in a single uniform node
//! graph. A program is a tree of typed opcode nodes; running it means walking
//! the tree and producing a new subgraph as the result. Entities (named
//! containers holding a root program, a random stream, and nested child
//! entities) form the persistent universe, and the asset layer moves entities
//! between memory and the filesystem.
//!
//! The crate is organized leaves-first:
//!
//! - [`intern`] — process-wide string intern pool
//! - [`node`] — the node record and the closed set of node kinds
//! - [`node_manager`] — per-entity arena plus mark-and-sweep collection
//! - [`value`] — immediate values and evaluation results
//! - [`rand`] — seedable, forkable random streams
//! - [`entity`] — the entity tree and its locking contract
//! - [`tree`] — whole-tree copying, comparison, and the merge family
//! - [`parser`] / [`asset`] — the native text format and on-disk persistence
//! - [`query`] — query conditions over contained entities
//! - [`concurrency`] — the permit pool behind opcode-level parallelism
//! - [`interpreter`] — the tree-walking evaluator and its opcode table

pub mod asset;
pub mod concurrency;
pub mod entity;
pub mod intern;
pub mod interpreter;
pub mod node;
pub mod node_manager;
pub mod parser;
pub mod query;
pub mod rand;
pub mod tree;
pub mod value;

pub use entity::Entity;
pub use interpreter::Interpreter;
pub use node::{Node, NodeId, NodeKind};
pub use node_manager::NodeManager;
pub use value::{EvalResult, Immediate};

/// Engine version triple parsed from the crate version.
pub fn engine_version() -> (u32, u32, u32) {
    let mut parts = env!("CARGO_PKG_VERSION").split(['.', '-']);
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}

/// Build suffix ("" for release builds, e.g. "alpha" for dev builds).
pub fn engine_version_suffix() -> &'static str {
    match env!("CARGO_PKG_VERSION").split_once('-') {
        Some((_, suffix)) => suffix,
        None => "",
    }
}
