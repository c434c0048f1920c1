use crate::device::constants::PUSH_BUFFERS_PER_CONTEXT;
use std::sync::atomic::{AtomicBool, Ordering};

/// Write combining buffers a context can hand to its queue pairs.
pub(crate) struct PushBufferPool {
    availability: Box<[AtomicBool]>,
}

impl PushBufferPool {
    pub(crate) fn new(enabled: bool) -> Self {
        let count = if enabled { PUSH_BUFFERS_PER_CONTEXT } else { 0 };
        Self {
            availability: (0..count).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    /// Check out a free buffer. `None` once the pool is exhausted, in which
    /// case the queue pair falls back to plain doorbells.
    pub(crate) fn checkout(&self) -> Option<usize> {
        self.availability
            .iter()
            .enumerate()
            .find_map(|(idx, free)| free.swap(false, Ordering::AcqRel).then_some(idx))
    }

    pub(crate) fn give_back(&self, idx: usize) {
        if let Some(free) = self.availability.get(idx) {
            free.store(true, Ordering::Release);
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.availability
            .iter()
            .filter(|free| free.load(Ordering::Acquire))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_until_exhausted() {
        let pool = PushBufferPool::new(true);
        let taken: Vec<usize> = (0..PUSH_BUFFERS_PER_CONTEXT)
            .map(|_| pool.checkout().unwrap())
            .collect();
        assert_eq!(taken[0], 0);
        assert_eq!(taken[PUSH_BUFFERS_PER_CONTEXT - 1], PUSH_BUFFERS_PER_CONTEXT - 1);
        assert!(pool.checkout().is_none());

        pool.give_back(7);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.checkout(), Some(7));
    }

    #[test]
    fn test_disabled_pool_is_empty() {
        let pool = PushBufferPool::new(false);
        assert!(pool.checkout().is_none());
        pool.give_back(0);
        assert_eq!(pool.available(), 0);
    }
}
