//! Rendezvous (highest-random-weight) mountpath selection
//!
//! Picks the canonical owner mountpath for an object's `uname`. Draining
//! mountpaths never win; the choice is stable for a fixed mountpath set.

use crate::mountpath::{Mountpath, MountpathRegistry, FLAG_WAITING_DD};
use replio_common::{Error, Result};
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// Select the HRW mountpath for `uname`.
pub fn hrw_mpath(reg: &MountpathRegistry, uname: &str) -> Result<Arc<Mountpath>> {
    let avail = reg.get_avail();
    let seed = xxh64(uname.as_bytes(), 0);
    let mut best: Option<Arc<Mountpath>> = None;
    let mut best_score = 0u64;
    for mi in avail.values() {
        if mi.is_set(FLAG_WAITING_DD) {
            continue;
        }
        let score = xxh64(mi.path.as_bytes(), seed);
        if best.is_none() || score > best_score {
            best_score = score;
            best = Some(Arc::clone(mi));
        }
    }
    best.ok_or(Error::NoMountpaths)
}
