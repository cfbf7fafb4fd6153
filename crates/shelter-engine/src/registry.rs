//! Thread registry: thread id to context mapping under a reentrant guard
//!
//! Same-thread re-entry on the guard just bumps a counter (signal delivery
//! can land while the owning thread already holds it); a different thread
//! blocks. The lock is held only for O(1) map operations, never across an
//! unwind. Frame stacks are never touched cross-thread — the map hands out
//! `Arc<Context>` and only the owning thread runs blocks on it.
//!
//! With the `threads` feature disabled there is no map and no lock: a single
//! implicit context serves the whole (single-threaded) host.

use crate::context::Context;
use std::sync::Arc;
use std::thread::ThreadId;

#[cfg(feature = "threads")]
mod imp {
    use super::*;
    use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
    use rustc_hash::FxHashMap;
    use std::cell::RefCell;

    /// Thread-id → context map, guarded by a reentrant lock.
    pub(crate) struct ContextRegistry {
        inner: ReentrantMutex<RefCell<FxHashMap<ThreadId, Arc<Context>>>>,
    }

    impl ContextRegistry {
        pub(crate) fn new() -> Self {
            ContextRegistry {
                inner: ReentrantMutex::new(RefCell::new(FxHashMap::default())),
            }
        }

        /// Hold the registry lock across a compound transition (frame push +
        /// bridge install, or pop + restore + removal).
        pub(crate) fn guard(&self) -> ReentrantMutexGuard<'_, RefCell<FxHashMap<ThreadId, Arc<Context>>>> {
            self.inner.lock()
        }

        /// The context for `tid`, created and registered on first use.
        pub(crate) fn get_or_create(&self, tid: ThreadId) -> Arc<Context> {
            let guard = self.inner.lock();
            let mut map = guard.borrow_mut();
            map.entry(tid)
                .or_insert_with(|| Arc::new(Context::new()))
                .clone()
        }

        /// The context for `tid` if one exists; never creates.
        pub(crate) fn existing(&self, tid: ThreadId) -> Option<Arc<Context>> {
            self.inner.lock().borrow().get(&tid).cloned()
        }

        /// Drop the context for `tid`, returning it for handler restoration.
        pub(crate) fn remove(&self, tid: ThreadId) -> Option<Arc<Context>> {
            self.inner.lock().borrow_mut().remove(&tid)
        }

        /// Number of live contexts
        pub(crate) fn len(&self) -> usize {
            self.inner.lock().borrow().len()
        }
    }
}

#[cfg(not(feature = "threads"))]
mod imp {
    use super::*;
    use parking_lot::Mutex;

    /// Single implicit context for non-threaded hosts.
    pub(crate) struct ContextRegistry {
        slot: Mutex<Option<Arc<Context>>>,
    }

    impl ContextRegistry {
        pub(crate) fn new() -> Self {
            ContextRegistry {
                slot: Mutex::new(None),
            }
        }

        pub(crate) fn guard(&self) {}

        pub(crate) fn get_or_create(&self, _tid: ThreadId) -> Arc<Context> {
            self.slot
                .lock()
                .get_or_insert_with(|| Arc::new(Context::new()))
                .clone()
        }

        pub(crate) fn existing(&self, _tid: ThreadId) -> Option<Arc<Context>> {
            self.slot.lock().clone()
        }

        pub(crate) fn remove(&self, _tid: ThreadId) -> Option<Arc<Context>> {
            self.slot.lock().take()
        }

        pub(crate) fn len(&self) -> usize {
            if self.slot.lock().is_some() {
                1
            } else {
                0
            }
        }
    }
}

pub(crate) use imp::ContextRegistry;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_or_create_is_stable() {
        let reg = ContextRegistry::new();
        let tid = thread::current().id();
        assert!(reg.existing(tid).is_none());

        let a = reg.get_or_create(tid);
        let b = reg.get_or_create(tid);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let reg = ContextRegistry::new();
        let tid = thread::current().id();
        reg.get_or_create(tid);

        assert!(reg.remove(tid).is_some());
        assert!(reg.remove(tid).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_contexts_are_per_thread() {
        let reg = Arc::new(ContextRegistry::new());
        let main_ctx = reg.get_or_create(thread::current().id());
        main_ctx.set_description("main".to_string());

        let reg2 = reg.clone();
        thread::spawn(move || {
            let ctx = reg2.get_or_create(thread::current().id());
            assert_eq!(ctx.description(), "");
            assert_eq!(reg2.len(), 2);
        })
        .join()
        .unwrap();
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_guard_is_reentrant() {
        let reg = ContextRegistry::new();
        let tid = thread::current().id();
        let _guard = reg.guard();
        // Re-entry from the same thread must not deadlock
        reg.get_or_create(tid);
        assert_eq!(reg.len(), 1);
    }
}
