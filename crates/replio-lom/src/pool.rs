//! Free-list pools for I/O scratch buffers and LOM descriptors
//!
//! Both pools allow concurrent get/put; put beyond the cap simply drops
//! the returned item.

use crate::lom::{Lom, Node};
use parking_lot::Mutex;
use replio_common::{Bck, Result};
use std::sync::Arc;

/// Default scratch buffer size (page-multiple)
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;

const MAX_POOLED: usize = 64;

/// Pool of fixed-size I/O scratch buffers
pub struct BufPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUF_SIZE)
    }
}

impl BufPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self { size, free: Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn buf_size(&self) -> usize {
        self.size
    }

    /// Get a zero-initialized buffer of the pool's size
    #[must_use]
    pub fn alloc(&self) -> Vec<u8> {
        match self.free.lock().pop() {
            Some(buf) => buf,
            None => vec![0u8; self.size],
        }
    }

    /// Return a buffer to the pool
    pub fn free(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

/// Pool of LOM descriptors: recycles heap allocations (notably the
/// copies map) between requests.
#[derive(Default)]
pub struct LomPool {
    free: Mutex<Vec<Box<Lom>>>,
}

impl LomPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a LOM bound to `(bck, objname)`
    pub fn alloc(&self, node: &Arc<Node>, bck: &Bck, objname: &str) -> Result<Box<Lom>> {
        match self.free.lock().pop() {
            Some(mut lom) => {
                lom.reinit(node, bck, objname)?;
                Ok(lom)
            }
            None => Lom::init(Arc::clone(node), bck.clone(), objname),
        }
    }

    /// Allocate a LOM bound to an existing on-disk FQN
    pub fn alloc_by_fqn(&self, node: &Arc<Node>, fqn: &str) -> Result<Box<Lom>> {
        match self.free.lock().pop() {
            Some(mut lom) => {
                lom.reinit_by_fqn(node, fqn)?;
                Ok(lom)
            }
            None => Lom::init_from_fqn(Arc::clone(node), fqn),
        }
    }

    /// Return a descriptor to the pool
    pub fn free(&self, mut lom: Box<Lom>) {
        lom.md.copies.clear();
        lom.md.dirty = false;
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(lom);
        }
    }
}
