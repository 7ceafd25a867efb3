//! Process-wide string intern pool.
//!
//! Canonicalizes identifiers and strings to dense u32 ids with refcounted
//! slot lifetime, so comparing two strings anywhere in the engine reduces to
//! comparing two ids. The pool is the only process-global mutable state in
//! the engine; slot refcounts are atomic so reference churn stays off the
//! table lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{OnceLock, RwLock};

// ---------------------------------------------------------------------------
// SymbolId
// ---------------------------------------------------------------------------

/// Dense id of an interned string.
///
/// Holding a `SymbolId` does not by itself own a pool reference; the owner
/// of the id (a node payload, a label slot, an immediate string value) is
/// responsible for the reference it was created with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) u32);

impl SymbolId {
    /// Reserved "not a string" id.
    pub const NONE: SymbolId = SymbolId(0);
    /// Reserved id of the empty string.
    pub const EMPTY: SymbolId = SymbolId(1);

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self == SymbolId::NONE
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct Slot {
    text: String,
    refs: AtomicU32,
}

struct PoolInner {
    slots: Vec<Slot>,
    by_text: HashMap<String, u32>,
    free: Vec<u32>,
}

/// Refcounted intern table. Use [`pool`] for the process-wide instance.
pub struct InternPool {
    inner: RwLock<PoolInner>,
}

impl InternPool {
    pub fn new() -> Self {
        let mut by_text = HashMap::new();
        by_text.insert(String::new(), SymbolId::EMPTY.0);
        InternPool {
            inner: RwLock::new(PoolInner {
                slots: vec![
                    // Slot 0 is NONE and never resolves to text.
                    Slot {
                        text: String::new(),
                        refs: AtomicU32::new(1),
                    },
                    // Slot 1 is the empty string, permanently alive.
                    Slot {
                        text: String::new(),
                        refs: AtomicU32::new(1),
                    },
                ],
                by_text,
                free: Vec::new(),
            }),
        }
    }

    /// Interns `s`, returning an id that owns one new reference.
    pub fn intern(&self, s: &str) -> SymbolId {
        if s.is_empty() {
            return SymbolId::EMPTY;
        }

        {
            let inner = self.inner.read().unwrap();
            if let Some(&idx) = inner.by_text.get(s) {
                inner.slots[idx as usize].refs.fetch_add(1, Ordering::Relaxed);
                return SymbolId(idx);
            }
        }

        let mut inner = self.inner.write().unwrap();
        // Re-check: another thread may have interned between the locks.
        if let Some(&idx) = inner.by_text.get(s) {
            inner.slots[idx as usize].refs.fetch_add(1, Ordering::Relaxed);
            return SymbolId(idx);
        }
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.slots[idx as usize] = Slot {
                    text: s.to_string(),
                    refs: AtomicU32::new(1),
                };
                idx
            }
            None => {
                let idx = inner.slots.len();
                if idx > u32::MAX as usize {
                    // Pool exhaustion is unrecoverable: ids are 32-bit.
                    log::error!("string intern pool exhausted");
                    std::process::abort();
                }
                inner.slots.push(Slot {
                    text: s.to_string(),
                    refs: AtomicU32::new(1),
                });
                idx as u32
            }
        };
        inner.by_text.insert(s.to_string(), idx);
        SymbolId(idx)
    }

    /// Returns the id for `s` only if it is already interned. No reference is
    /// created.
    pub fn id_if_exists(&self, s: &str) -> Option<SymbolId> {
        if s.is_empty() {
            return Some(SymbolId::EMPTY);
        }
        let inner = self.inner.read().unwrap();
        inner.by_text.get(s).map(|&idx| SymbolId(idx))
    }

    /// Adds a reference to an existing id and returns it.
    pub fn add_ref(&self, id: SymbolId) -> SymbolId {
        if id == SymbolId::NONE || id == SymbolId::EMPTY {
            return id;
        }
        let inner = self.inner.read().unwrap();
        inner.slots[id.0 as usize].refs.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Releases one reference; the slot becomes reusable at zero.
    pub fn release(&self, id: SymbolId) {
        if id == SymbolId::NONE || id == SymbolId::EMPTY {
            return;
        }
        let prev = {
            let inner = self.inner.read().unwrap();
            inner.slots[id.0 as usize].refs.fetch_sub(1, Ordering::AcqRel)
        };
        debug_assert!(prev > 0, "intern refcount underflow");
        if prev == 1 {
            let mut inner = self.inner.write().unwrap();
            // A racing intern may have resurrected the slot.
            if inner.slots[id.0 as usize].refs.load(Ordering::Acquire) == 0 {
                let text = std::mem::take(&mut inner.slots[id.0 as usize].text);
                inner.by_text.remove(&text);
                inner.free.push(id.0);
            }
        }
    }

    /// Resolves an id to its text. `NONE` resolves to the empty string.
    pub fn get(&self, id: SymbolId) -> String {
        let inner = self.inner.read().unwrap();
        inner.slots[id.0 as usize].text.clone()
    }

    #[cfg(test)]
    fn refcount(&self, id: SymbolId) -> u32 {
        let inner = self.inner.read().unwrap();
        inner.slots[id.0 as usize].refs.load(Ordering::Relaxed)
    }
}

impl Default for InternPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide intern pool.
pub fn pool() -> &'static InternPool {
    static POOL: OnceLock<InternPool> = OnceLock::new();
    POOL.get_or_init(InternPool::new)
}

/// Interns into the process pool. Shorthand for `pool().intern(s)`.
pub fn intern(s: &str) -> SymbolId {
    pool().intern(s)
}

/// Resolves from the process pool. Shorthand for `pool().get(id)`.
pub fn text(id: SymbolId) -> String {
    pool().get(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let p = InternPool::new();
        let a = p.intern("alpha");
        let b = p.intern("alpha");
        assert_eq!(a, b);
        assert_eq!(p.get(a), "alpha");
    }

    #[test]
    fn distinct_strings_distinct_ids() {
        let p = InternPool::new();
        assert_ne!(p.intern("a"), p.intern("b"));
    }

    #[test]
    fn empty_string_is_reserved() {
        let p = InternPool::new();
        assert_eq!(p.intern(""), SymbolId::EMPTY);
        assert_eq!(p.get(SymbolId::EMPTY), "");
    }

    #[test]
    fn release_to_zero_reuses_slot() {
        let p = InternPool::new();
        let a = p.intern("ephemeral");
        assert_eq!(p.refcount(a), 1);
        p.release(a);
        assert_eq!(p.id_if_exists("ephemeral"), None);
        let b = p.intern("replacement");
        // The freed slot is reused for the next intern.
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn add_ref_keeps_slot_alive() {
        let p = InternPool::new();
        let a = p.intern("kept");
        p.add_ref(a);
        p.release(a);
        assert_eq!(p.id_if_exists("kept"), Some(a));
        p.release(a);
        assert_eq!(p.id_if_exists("kept"), None);
    }

    #[test]
    fn id_if_exists_creates_nothing() {
        let p = InternPool::new();
        assert_eq!(p.id_if_exists("never-interned"), None);
    }
}
