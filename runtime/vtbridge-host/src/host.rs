//!
//! Host Serialization
//!
//! Every adapter call holds the host lock while foreign code runs. The lock
//! is reentrant: a foreign method may execute SQL on the same connection,
//! which calls back into the bridge on the same thread.
//!

use std::cell::Cell;
use std::marker::PhantomData;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, const_reentrant_mutex};

static HOST_LOCK: ReentrantMutex<()> = const_reentrant_mutex(());

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Scope guard for one entry into host code.
///
/// Dropping the guard releases the lock, including on the error path.
pub struct HostGuard {
    _lock: ReentrantMutexGuard<'static, ()>,
    _not_send: PhantomData<*const ()>,
}

impl HostGuard {
    pub fn enter() -> Self {
        let lock = HOST_LOCK.lock();
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _lock: lock,
            _not_send: PhantomData,
        }
    }

    /// Nesting level of adapter calls on this thread.
    pub fn depth() -> usize {
        DEPTH.with(|d| d.get())
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
