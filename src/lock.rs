use log::error;
use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

/// Lock guarding one queue. In single-threaded mode the mutex is replaced by a
/// busy flag that only detects concurrent use.
pub(crate) enum QueueLock<T> {
    Shared(Mutex<T>),
    Single(Unsynchronized<T>),
}

pub(crate) struct Unsynchronized<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is only handed out while `busy` is held, and a
// second concurrent taker aborts instead of aliasing.
unsafe impl<T: Send> Sync for Unsynchronized<T> {}

pub(crate) enum QueueGuard<'a, T> {
    Shared(MutexGuard<'a, T>),
    Single(&'a Unsynchronized<T>),
}

impl<T> QueueLock<T> {
    pub(crate) fn new(value: T, single_threaded: bool) -> Self {
        if single_threaded {
            Self::Single(Unsynchronized {
                busy: AtomicBool::new(false),
                value: UnsafeCell::new(value),
            })
        } else {
            Self::Shared(Mutex::new(value))
        }
    }

    pub(crate) fn lock(&self) -> QueueGuard<'_, T> {
        match self {
            Self::Shared(mutex) => {
                QueueGuard::Shared(mutex.lock().unwrap_or_else(PoisonError::into_inner))
            }
            Self::Single(cell) => {
                if cell.busy.swap(true, Ordering::Acquire) {
                    error!("queue used concurrently in single-threaded mode");
                    panic!("single-threaded queue accessed concurrently");
                }
                QueueGuard::Single(cell)
            }
        }
    }
}

impl<T> Deref for QueueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Shared(guard) => guard,
            // SAFETY: the busy flag is held by this guard.
            Self::Single(cell) => unsafe { &*cell.value.get() },
        }
    }
}

impl<T> DerefMut for QueueGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Self::Shared(guard) => guard,
            // SAFETY: the busy flag is held by this guard.
            Self::Single(cell) => unsafe { &mut *cell.value.get() },
        }
    }
}

impl<T> Drop for QueueGuard<'_, T> {
    fn drop(&mut self) {
        if let Self::Single(cell) = self {
            cell.busy.store(false, Ordering::Release);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
