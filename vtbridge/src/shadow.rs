//!
//! Shadow-Name Trampoline Pool
//!
//! xShadowName is called with nothing but a table-name suffix, so each module
//! that declares it needs its own entry point. The pool holds a fixed set of
//! distinct trampolines, one per slot; a slot is bound to one live module and
//! its factory, and the trampoline looks the factory up by its slot index.
//!
//! The pool is process-wide. It is created on first registration and slots
//! return to it when the module that holds them is dropped by the engine.
//! Running out of slots fails the registration; it is never retried.
//!

use std::ffi::{c_char, c_int};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use vtbridge_host::{ErrorKind, HostError, HostResult};

use crate::call::{Ident, adapter_call, borrow_str, unraisable};
use crate::module::TableFactory;

/// Number of distinct shadow-name entry points.
pub const SHADOW_POOL_CAPACITY: usize = 32;

pub(crate) type ShadowNameFn = unsafe extern "C" fn(*const c_char) -> c_int;

/// Identity of one module registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ModuleId(u64);

impl ModuleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Slot {
    module: Option<ModuleId>,
    name: Option<Arc<str>>,
    factory: Option<Arc<dyn TableFactory>>,
}

/// The fixed arena of shadow-name slots.
pub struct ShadowNamePool {
    slots: Vec<Slot>,
}

static POOL: LazyLock<Mutex<ShadowNamePool>> =
    LazyLock::new(|| Mutex::new(ShadowNamePool::new()));

fn pool() -> std::sync::MutexGuard<'static, ShadowNamePool> {
    POOL.lock().unwrap_or_else(|e| e.into_inner())
}

impl ShadowNamePool {
    fn new() -> Self {
        Self {
            slots: (0..SHADOW_POOL_CAPACITY).map(|_| Slot::default()).collect(),
        }
    }

    fn bind(
        &mut self,
        module: ModuleId,
        name: Arc<str>,
        factory: Arc<dyn TableFactory>,
    ) -> HostResult<usize> {
        if self.slots.iter().any(|s| s.module == Some(module)) {
            return Err(HostError::misuse(format!(
                "module {} already holds a shadow-name slot",
                name
            )));
        }
        let Some(index) = self.slots.iter().position(|s| s.module.is_none()) else {
            return Err(HostError::exhausted(
                ErrorKind::Error,
                format!(
                    "no shadow-name slots available ({} in use) for module {}",
                    SHADOW_POOL_CAPACITY, name
                ),
            ));
        };
        self.slots[index] = Slot {
            module: Some(module),
            name: Some(name),
            factory: Some(factory),
        };
        Ok(index)
    }

    fn unbind(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::default();
        }
    }

    fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.module.is_none()).count()
    }

    pub fn capacity() -> usize {
        SHADOW_POOL_CAPACITY
    }

    /// Slots not bound to any module, across all connections.
    pub fn free_slots() -> usize {
        pool().free_count()
    }

    /// Module names holding slots, by slot index.
    pub fn live_slots() -> Vec<(usize, String)> {
        pool()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.name.as_ref().map(|n| (i, n.to_string())))
            .collect()
    }

    /// Bind a slot to `module`; the slot is released when the guard drops.
    pub(crate) fn allocate(
        module: ModuleId,
        name: Arc<str>,
        factory: Arc<dyn TableFactory>,
    ) -> HostResult<ShadowSlot> {
        let index = pool().bind(module, name.clone(), factory)?;
        tracing::debug!(module = %name, slot = index, "shadow-name slot allocated");
        Ok(ShadowSlot { index })
    }
}

/// A bound pool slot.
#[derive(Debug)]
pub(crate) struct ShadowSlot {
    index: usize,
}

impl ShadowSlot {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn trampoline(&self) -> ShadowNameFn {
        TRAMPOLINES[self.index]
    }
}

impl Drop for ShadowSlot {
    fn drop(&mut self) {
        pool().unbind(self.index);
        tracing::debug!(slot = self.index, "shadow-name slot released");
    }
}

unsafe extern "C" fn shadow_trampoline<const N: usize>(suffix: *const c_char) -> c_int {
    unsafe { dispatch(N, suffix) }
}

macro_rules! trampolines {
    ($($n:literal)*) => {
        [$(shadow_trampoline::<$n> as ShadowNameFn),*]
    };
}

static TRAMPOLINES: [ShadowNameFn; SHADOW_POOL_CAPACITY] = trampolines!(
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
    16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
);

unsafe fn dispatch(index: usize, suffix: *const c_char) -> c_int {
    // Clone out and release the pool before calling host code.
    let (name, factory) = {
        let pool = pool();
        match pool.slots.get(index) {
            Some(Slot {
                name: Some(name),
                factory: Some(factory),
                ..
            }) => (name.clone(), factory.clone()),
            _ => return 0,
        }
    };
    let ident = Ident::new(name, String::new());
    let result = adapter_call("ShadowName", &ident, || {
        let suffix = unsafe { borrow_str(suffix) }?.unwrap_or_default();
        factory.shadow_name(suffix)
    });
    match result {
        Ok(is_shadow) => is_shadow as c_int,
        Err(err) => {
            unraisable(err);
            0
        }
    }
}
