//! Outbound queue accounting.
//!
//! Every link has a fixed queue capacity. A submission first reserves a
//! slot in the [`BackpressureController`]; the writer task releases slots
//! once the packages are on the wire. A submission that finds the queue
//! full is refused on the spot and its job reads `SendQueueIsFull`:
//! submitting never waits for room.
//!
//! # Configuration
//!
//! - `capacity`: Maximum number of queued packages per link (default: 1024)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{IoServiceError, Result};

/// Default maximum queued packages per link.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Lock-free counter of queued packages for one link.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    /// Current queued package count.
    pending: Arc<AtomicUsize>,
    /// Maximum allowed queued packages.
    capacity: usize,
}

impl BackpressureController {
    /// Create a new controller with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Get current queued count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Get the capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve one slot without waiting.
    ///
    /// Returns `Err(SendQueueFull)` if at capacity. The returned guard gives
    /// the slot back on drop unless it is disarmed.
    pub fn try_reserve(&self) -> Result<BackpressureGuard> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .map_err(|_| IoServiceError::SendQueueFull)?;
        Ok(BackpressureGuard {
            controller: self.clone(),
            released: false,
        })
    }

    /// Release slots after packages were written (or dropped).
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Guard that releases a reserved slot on drop.
pub struct BackpressureGuard {
    controller: BackpressureController,
    released: bool,
}

impl BackpressureGuard {
    /// Keep the slot reserved; the writer task releases it after the write.
    pub fn disarm(mut self) {
        self.released = true;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if !self.released {
            self.controller.release_many(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_creation() {
        let ctrl = BackpressureController::new(100);
        assert_eq!(ctrl.capacity(), 100);
        assert_eq!(ctrl.pending_count(), 0);
        assert_eq!(BackpressureController::default().capacity(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_try_reserve_until_full() {
        let ctrl = BackpressureController::new(2);

        ctrl.try_reserve().unwrap().disarm();
        ctrl.try_reserve().unwrap().disarm();
        assert_eq!(ctrl.pending_count(), ctrl.capacity());
        assert!(matches!(ctrl.try_reserve(), Err(IoServiceError::SendQueueFull)));

        ctrl.release_many(2);
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let ctrl = BackpressureController::new(1);
        {
            let _guard = ctrl.try_reserve().unwrap();
            assert_eq!(ctrl.pending_count(), 1);
        }
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ctrl = BackpressureController::new(0);
        assert_eq!(ctrl.capacity(), 1);
        assert!(ctrl.try_reserve().is_ok());
    }

    #[test]
    fn test_concurrent_reservations_respect_capacity() {
        let ctrl = BackpressureController::new(50);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctrl = ctrl.clone();
                std::thread::spawn(move || {
                    let mut won = 0;
                    for _ in 0..20 {
                        if let Ok(guard) = ctrl.try_reserve() {
                            guard.disarm();
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(ctrl.pending_count(), 50);
    }
}
