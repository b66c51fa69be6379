//! Mountpath registry and FQN composition
//!
//! A mountpath is a storage root, typically one disk. On-disk layout:
//! `{mountpath}/{content_type}/{bucket}/{objname}` where content types
//! separate objects, workfiles, and persisted object metadata.

use parking_lot::RwLock;
use replio_common::{Bck, Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Content type for objects
pub const CT_OBJ: &str = "obj";
/// Content type for workfiles (partial writes, later renamed into place)
pub const CT_WORK: &str = "work";
/// Content type for persisted object metadata sidecars
pub const CT_META: &str = "meta";

/// Mountpath is being drained/disabled; do not place new data on it
pub const FLAG_WAITING_DD: u32 = 1 << 0;

/// Utilization reported for mountpaths we have no sample for.
/// High enough that an unknown path never wins a load-balanced read.
const UNKNOWN_UTIL: i64 = 100;

/// tie-breaker for workfile names, unique within the process
static WORK_TIE: AtomicU64 = AtomicU64::new(0);

/// A single local storage root with flags and a point-in-time
/// utilization snapshot (0-100, refreshed by an external sampler).
pub struct Mountpath {
    pub path: String,
    pub fsid: u64,
    flags: AtomicU32,
    util: AtomicI64,
}

impl Mountpath {
    fn new(path: &str) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;
        let meta = std::fs::metadata(path)?;
        #[cfg(unix)]
        let fsid = {
            use std::os::unix::fs::MetadataExt;
            meta.dev()
        };
        #[cfg(not(unix))]
        let fsid = {
            let _ = &meta;
            0
        };
        Ok(Arc::new(Self {
            path: path.trim_end_matches('/').to_string(),
            fsid,
            flags: AtomicU32::new(0),
            util: AtomicI64::new(0),
        }))
    }

    #[must_use]
    pub fn is_set(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    /// Most recent utilization sample
    #[must_use]
    pub fn utilization(&self) -> i64 {
        self.util.load(Ordering::Relaxed)
    }

    pub(crate) fn set_util(&self, util: i64) {
        self.util.store(util.clamp(0, 100), Ordering::Relaxed);
    }

    /// Content directory for a (content type, bucket) pair
    #[must_use]
    pub fn make_path_cdir(&self, ct: &str, bck: &Bck) -> String {
        format!("{}/{}/{}", self.path, ct, bck.name)
    }

    /// Fully-qualified filename for an object of the given content type
    #[must_use]
    pub fn make_path_fqn(&self, bck: &Bck, ct: &str, objname: &str) -> String {
        format!("{}/{}/{}/{}", self.path, ct, bck.name, objname)
    }

    /// Workfile FQN: deterministic name plus a process-unique tie-breaker
    #[must_use]
    pub fn make_path_work(&self, bck: &Bck, prefix: &str, objname: &str) -> String {
        let tie = WORK_TIE.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}/{}/{}/{}.{}.{}.{}",
            self.path,
            CT_WORK,
            bck.name,
            prefix,
            objname.replace('/', "%"),
            std::process::id(),
            tie
        )
    }

    /// Map an object FQN owned by this mountpath to its metadata sidecar FQN
    #[must_use]
    pub fn meta_path_of(&self, obj_fqn: &str) -> Option<String> {
        let obj_prefix = format!("{}/{}/", self.path, CT_OBJ);
        let rest = obj_fqn.strip_prefix(&obj_prefix)?;
        Some(format!("{}/{}/{}", self.path, CT_META, rest))
    }
}

impl fmt::Display for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp[{}]", self.path)
    }
}

impl fmt::Debug for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp[{}, fsid={}, util={}]", self.path, self.fsid, self.utilization())
    }
}

/// Point-in-time utilization snapshot across mountpaths
pub struct MpathUtils(HashMap<String, i64>);

impl MpathUtils {
    #[must_use]
    pub fn get(&self, mpath: &str) -> i64 {
        self.0.get(mpath).copied().unwrap_or(UNKNOWN_UTIL)
    }
}

/// Registry of this node's available mountpaths
#[derive(Default)]
pub struct MountpathRegistry {
    avail: RwLock<HashMap<String, Arc<Mountpath>>>,
}

impl MountpathRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mountpath rooted at `path`, creating the root if needed
    pub fn add(&self, path: &str) -> Result<Arc<Mountpath>> {
        let mi = Mountpath::new(path)?;
        let mut avail = self.avail.write();
        if avail.contains_key(&mi.path) {
            warn!(mpath = %mi.path, "re-adding mountpath");
        }
        avail.insert(mi.path.clone(), Arc::clone(&mi));
        Ok(mi)
    }

    /// Detach a mountpath (e.g. after it was lost)
    pub fn remove(&self, path: &str) -> Option<Arc<Mountpath>> {
        self.avail.write().remove(path.trim_end_matches('/'))
    }

    /// Snapshot of available mountpaths (draining ones included, flagged)
    #[must_use]
    pub fn get_avail(&self) -> HashMap<String, Arc<Mountpath>> {
        self.avail.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.avail.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.avail.read().is_empty()
    }

    /// Snapshot of per-mountpath utilization
    #[must_use]
    pub fn utils(&self) -> MpathUtils {
        let avail = self.avail.read();
        MpathUtils(
            avail
                .iter()
                .map(|(path, mi)| (path.clone(), mi.utilization()))
                .collect(),
        )
    }

    /// Publish a fresh utilization sample for `path`
    pub fn set_utilization(&self, path: &str, util: i64) -> bool {
        match self.avail.read().get(path.trim_end_matches('/')) {
            Some(mi) => {
                mi.set_util(util);
                true
            }
            None => false,
        }
    }

    /// Find the mountpath owning `fqn`
    #[must_use]
    pub fn resolve(&self, fqn: &str) -> Option<Arc<Mountpath>> {
        let avail = self.avail.read();
        for (path, mi) in avail.iter() {
            if fqn.strip_prefix(path.as_str()).is_some_and(|rest| rest.starts_with('/')) {
                return Some(Arc::clone(mi));
            }
        }
        None
    }

    /// Decompose an FQN into (mountpath, content type, bucket name, object name)
    pub fn parse_fqn(&self, fqn: &str) -> Result<(Arc<Mountpath>, String, String, String)> {
        let mi = self
            .resolve(fqn)
            .ok_or_else(|| Error::MpathNotFound(fqn.to_string()))?;
        let rest = &fqn[mi.path.len() + 1..];
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ct), Some(bucket), Some(objname))
                if !ct.is_empty() && !bucket.is_empty() && !objname.is_empty() =>
            {
                Ok((mi, ct.to_string(), bucket.to_string(), objname.to_string()))
            }
            _ => Err(Error::invalid_request(format!("malformed fqn: {fqn}"))),
        }
    }
}
