//! Process-wide named lock table
//!
//! Multiple-reader/single-writer locks keyed by object `uname`. Lock
//! upgrades are disallowed; callers release and reacquire. The
//! `is_locked` inspection exists for assertions only.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const NUM_SHARDS: usize = 16;

#[derive(Default)]
struct LockState {
    readers: usize,
    wlocked: bool,
}

struct Shard {
    names: Mutex<HashMap<String, LockState>>,
    cond: Condvar,
}

/// Named rwlock table
pub struct NameLocker {
    shards: Vec<Shard>,
}

impl Default for NameLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl NameLocker {
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard { names: Mutex::new(HashMap::new()), cond: Condvar::new() })
            .collect();
        Self { shards }
    }

    fn shard(&self, uname: &str) -> &Shard {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        uname.hash(&mut h);
        &self.shards[(h.finish() as usize) % NUM_SHARDS]
    }

    /// Acquire the shared (read) lock for `uname`, blocking as needed
    pub fn rlock(&self, uname: &str) {
        let shard = self.shard(uname);
        let mut names = shard.names.lock();
        loop {
            let state = names.entry(uname.to_string()).or_default();
            if !state.wlocked {
                state.readers += 1;
                return;
            }
            shard.cond.wait(&mut names);
        }
    }

    /// Release the shared lock
    pub fn runlock(&self, uname: &str) {
        let shard = self.shard(uname);
        let mut names = shard.names.lock();
        let state = names.get_mut(uname).expect("runlock without rlock");
        assert!(state.readers > 0, "runlock without rlock: {uname}");
        state.readers -= 1;
        if state.readers == 0 && !state.wlocked {
            names.remove(uname);
        }
        drop(names);
        shard.cond.notify_all();
    }

    /// Acquire the exclusive (write) lock for `uname`, blocking as needed
    pub fn wlock(&self, uname: &str) {
        let shard = self.shard(uname);
        let mut names = shard.names.lock();
        loop {
            let state = names.entry(uname.to_string()).or_default();
            if !state.wlocked && state.readers == 0 {
                state.wlocked = true;
                return;
            }
            shard.cond.wait(&mut names);
        }
    }

    /// Release the exclusive lock
    pub fn wunlock(&self, uname: &str) {
        let shard = self.shard(uname);
        let mut names = shard.names.lock();
        let state = names.get_mut(uname).expect("wunlock without wlock");
        assert!(state.wlocked, "wunlock without wlock: {uname}");
        state.wlocked = false;
        if state.readers == 0 {
            names.remove(uname);
        }
        drop(names);
        shard.cond.notify_all();
    }

    /// Inspect the lock state: `(reader_count, exclusive)`.
    /// For assertions only; the state may change the moment it is read.
    #[must_use]
    pub fn is_locked(&self, uname: &str) -> (usize, bool) {
        let shard = self.shard(uname);
        let names = shard.names.lock();
        match names.get(uname) {
            Some(state) => (state.readers, state.wlocked),
            None => (0, false),
        }
    }

    /// RAII shared lock
    pub fn lock_shared(self: &Arc<Self>, uname: &str) -> NameLockGuard {
        self.rlock(uname);
        NameLockGuard { locker: Arc::clone(self), uname: uname.to_string(), excl: false }
    }

    /// RAII exclusive lock
    pub fn lock_excl(self: &Arc<Self>, uname: &str) -> NameLockGuard {
        self.wlock(uname);
        NameLockGuard { locker: Arc::clone(self), uname: uname.to_string(), excl: true }
    }
}

/// Releases the held name lock on drop
pub struct NameLockGuard {
    locker: Arc<NameLocker>,
    uname: String,
    excl: bool,
}

impl Drop for NameLockGuard {
    fn drop(&mut self) {
        if self.excl {
            self.locker.wunlock(&self.uname);
        } else {
            self.locker.runlock(&self.uname);
        }
    }
}
