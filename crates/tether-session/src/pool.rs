//! Bounded pool for short-lived, resettable per-call objects.
//!
//! The pool is a best-effort cache, not a resource limiter: `rent` never
//! blocks and never fails (it constructs a fresh item on a miss), and a
//! rejected return is always correctness-neutral - only an allocation
//! saved or not saved. The connection runtime uses it to amortize the
//! per-request cancellation controllers of inbound dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A pooled object that can be prepared for reuse.
///
/// `recycle` returns false when the object is spent and must not be
/// handed to another borrower.
pub trait Recycle: Send + 'static {
    fn recycle(&mut self) -> bool;
}

/// A bounded pool of reusable objects.
///
/// `rent`/`give_back` are safe from any number of concurrent callers.
/// The idle count is adjusted with increment-then-check ordering on
/// return, so the tracked count can never exceed `capacity` even under
/// races; over-rejection under contention is possible and harmless.
pub struct ResourcePool<T> {
    free: Mutex<Vec<T>>,
    idle: AtomicUsize,
    capacity: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Recycle> ResourcePool<T> {
    pub fn new(capacity: usize, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            idle: AtomicUsize::new(0),
            capacity,
            make: Box::new(make),
        }
    }

    /// Take an idle item, or construct a new one.
    pub fn rent(&self) -> T {
        let popped = {
            let mut free = self.free.lock();
            let item = free.pop();
            if item.is_some() {
                self.idle.fetch_sub(1, Ordering::AcqRel);
            }
            item
        };
        popped.unwrap_or_else(|| (self.make)())
    }

    /// Return an item. It is either queued for a future `rent` or
    /// dropped - never both, and never handed out without a successful
    /// recycle.
    pub fn give_back(&self, mut item: T) {
        if !item.recycle() {
            return;
        }
        let prev = self.idle.fetch_add(1, Ordering::AcqRel);
        if prev >= self.capacity {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.free.lock().push(item);
    }

    /// Number of idle items currently held.
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A pooled per-request cancellation controller.
///
/// Fresh or recycled, the token it carries has never fired. A slot whose
/// token was cancelled is spent: the token cannot un-fire, so `recycle`
/// rejects it and the pool drops it.
pub(crate) struct CancelSlot {
    token: CancellationToken,
}

impl CancelSlot {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Recycle for CancelSlot {
    fn recycle(&mut self) -> bool {
        !self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counter {
        spent: bool,
    }

    impl Recycle for Counter {
        fn recycle(&mut self) -> bool {
            !self.spent
        }
    }

    #[test]
    fn rent_constructs_on_empty_pool() {
        let pool = ResourcePool::new(4, || Counter { spent: false });
        assert_eq!(pool.idle(), 0);
        let item = pool.rent();
        assert_eq!(pool.idle(), 0);
        pool.give_back(item);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn spent_items_are_discarded() {
        let pool = ResourcePool::new(4, || Counter { spent: false });
        pool.give_back(Counter { spent: true });
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn returns_beyond_capacity_are_dropped() {
        let pool = ResourcePool::new(2, || Counter { spent: false });
        for _ in 0..5 {
            pool.give_back(Counter { spent: false });
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn concurrent_churn_never_exceeds_capacity() {
        let pool = Arc::new(ResourcePool::new(8, || Counter { spent: false }));
        let mut joins = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            joins.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let item = pool.rent();
                    assert!(pool.idle() <= pool.capacity());
                    pool.give_back(item);
                    assert!(pool.idle() <= pool.capacity());
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert!(pool.idle() <= pool.capacity());
    }

    #[test]
    fn cancel_slot_reuse_gated_on_unfired_token() {
        let pool = ResourcePool::new(4, CancelSlot::new);

        let slot = pool.rent();
        pool.give_back(slot);
        assert_eq!(pool.idle(), 1);

        let slot = pool.rent();
        slot.token().cancel();
        pool.give_back(slot);
        assert_eq!(pool.idle(), 0);
    }
}
