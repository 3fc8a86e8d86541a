//! Session Lock Registry (C3): a keyed, reference-counted mutex ensuring
//! at most one in-flight model call per session, with entries freed once
//! idle.
//!
//! A naive `HashMap<Uuid, Mutex<()>>` leaks one entry per session forever.
//! Entries here are removed under the map's own lock the moment the last
//! holder releases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    refcount: AtomicUsize,
}

#[derive(Default)]
pub struct SessionLockRegistry {
    entries: StdMutex<HashMap<Uuid, Arc<LockEntry>>>,
}

impl SessionLockRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for `session_id`, creating its entry if needed.
    /// Blocks until the mutex is free. Release is idempotent: call
    /// [`SessionLockGuard::release`] explicitly, or simply drop the guard.
    pub async fn lock(self: &Arc<Self>, session_id: Uuid) -> SessionLockGuard {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = entries
                .entry(session_id)
                .or_insert_with(|| Arc::new(LockEntry { mutex: Arc::new(AsyncMutex::new(())), refcount: AtomicUsize::new(0) }));
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            Arc::clone(&entry.mutex)
        };
        let inner = mutex.lock_owned().await;
        SessionLockGuard { inner: Some(inner), registry: Arc::clone(self), session_id }
    }

    fn release(&self, session_id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let remove = entries.get(&session_id).is_some_and(|entry| entry.refcount.fetch_sub(1, Ordering::SeqCst) == 1);
        if remove {
            entries.remove(&session_id);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

/// Holds the per-session mutex. Dropping or calling [`Self::release`]
/// frees it; both are safe to do (release-then-drop is a no-op second
/// time).
pub struct SessionLockGuard {
    inner: Option<OwnedMutexGuard<()>>,
    registry: Arc<SessionLockRegistry>,
    session_id: Uuid,
}

impl SessionLockGuard {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.inner.take().is_some() {
            self.registry.release(self.session_id);
        }
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}
