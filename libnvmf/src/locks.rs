//! Acquire-or-fail lock table keyed by volume name or id.

use std::sync::Arc;

use dashmap::DashSet;

/// Set of keys currently being operated on.  A second operation on a held
/// key fails immediately instead of queueing.
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    held: Arc<DashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if another operation holds it.
    pub fn try_acquire(&self, key: &str) -> Option<VolumeLockGuard> {
        if self.held.insert(key.to_owned()) {
            Some(VolumeLockGuard {
                held: Arc::clone(&self.held),
                key: key.to_owned(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct VolumeLockGuard {
    held: Arc<DashSet<String>>,
    key: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
