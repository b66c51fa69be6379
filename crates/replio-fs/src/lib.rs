//! Replio FS - Local storage roots
//!
//! This crate manages the node's mountpaths (typed filesystem roots),
//! composes fully-qualified filenames, publishes per-mountpath I/O
//! utilization snapshots, and provides the HRW mountpath oracle.

pub mod hrw;
pub mod mountpath;

pub use hrw::hrw_mpath;
pub use mountpath::{
    Mountpath, MountpathRegistry, MpathUtils, CT_META, CT_OBJ, CT_WORK, FLAG_WAITING_DD,
};

use replio_common::Error;

/// Filesystem health checker contract: consumers of I/O-error
/// notifications raised by replica maintenance.
pub trait HealthNotifier: Send + Sync {
    /// Report a storage error observed while accessing `fqn`.
    fn notify(&self, fqn: &str, err: &Error);
}
