//! Replio LOM - Local Object Manager
//!
//! Per-object metadata descriptors (LOMs), the process-wide name lock
//! table, replica/mirror management across mountpaths, load-balanced
//! read selection, and restoration after mountpath loss.

mod copy;
pub mod lock;
pub mod lom;
pub mod pool;

pub use lock::{NameLockGuard, NameLocker};
pub use lom::{Lom, LomMd, Node, INITIAL_VERSION};
pub use pool::{BufPool, LomPool};
