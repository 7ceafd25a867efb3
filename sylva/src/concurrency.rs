//! Opcode-level parallelism: a permit pool with a batch-or-nothing
//! handshake.
//!
//! Composite opcodes that request concurrency reserve one permit per child
//! before fanning out onto scoped OS threads. Reservation is atomic across
//! the whole batch: either every child gets a thread or the opcode silently
//! falls back to serial evaluation. There is no preemption inside an opcode;
//! every `interpret_node` entry is a safe point, nothing else is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Process-wide permit pool sized to the machine's parallelism.
pub struct ThreadCoordinator {
    available: AtomicUsize,
    capacity: usize,
}

impl ThreadCoordinator {
    fn new() -> ThreadCoordinator {
        let capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ThreadCoordinator {
            available: AtomicUsize::new(capacity),
            capacity,
        }
    }

    /// Reserves `n` permits atomically; `None` means the batch cannot be
    /// scheduled and the caller should evaluate serially.
    pub fn try_reserve(&self, n: usize) -> Option<BatchPermit<'_>> {
        if n < 2 || n > self.capacity {
            return None;
        }
        let mut cur = self.available.load(Ordering::Acquire);
        loop {
            if cur < n {
                return None;
            }
            match self.available.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(BatchPermit { pool: self, n }),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Threads currently reserved, plus one for the calling thread. Used to
    /// scale per-thread allocation budgets.
    pub fn active_threads(&self) -> usize {
        self.capacity - self.available.load(Ordering::Acquire) + 1
    }
}

/// Releases its permits when dropped.
pub struct BatchPermit<'a> {
    pool: &'a ThreadCoordinator,
    n: usize,
}

impl Drop for BatchPermit<'_> {
    fn drop(&mut self) {
        self.pool.available.fetch_add(self.n, Ordering::AcqRel);
    }
}

/// The process-wide coordinator.
pub fn coordinator() -> &'static ThreadCoordinator {
    static COORDINATOR: OnceLock<ThreadCoordinator> = OnceLock::new();
    COORDINATOR.get_or_init(ThreadCoordinator::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_reservation_is_all_or_nothing() {
        let pool = ThreadCoordinator {
            available: AtomicUsize::new(4),
            capacity: 4,
        };
        let first = pool.try_reserve(3).expect("3 of 4 should fit");
        assert!(pool.try_reserve(2).is_none(), "only 1 permit left");
        drop(first);
        assert!(pool.try_reserve(2).is_some(), "permits released on drop");
    }

    #[test]
    fn single_task_batches_fall_back_to_serial() {
        let pool = ThreadCoordinator {
            available: AtomicUsize::new(4),
            capacity: 4,
        };
        assert!(pool.try_reserve(1).is_none());
        assert!(pool.try_reserve(0).is_none());
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let pool = ThreadCoordinator {
            available: AtomicUsize::new(2),
            capacity: 2,
        };
        assert!(pool.try_reserve(3).is_none());
    }

    #[test]
    fn active_threads_counts_reservations() {
        let pool = ThreadCoordinator {
            available: AtomicUsize::new(4),
            capacity: 4,
        };
        assert_eq!(pool.capacity - pool.available.load(Ordering::Acquire) + 1, 1);
        let _permit = pool.try_reserve(2);
        assert_eq!(pool.capacity - pool.available.load(Ordering::Acquire) + 1, 3);
    }
}
