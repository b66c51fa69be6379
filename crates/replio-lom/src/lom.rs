//! The LOM descriptor and its persistence
//!
//! A LOM (Local Object Metadata) is the in-memory descriptor for one
//! object replica on this node: its FQN, the HRW location the object is
//! supposed to occupy, and the persisted metadata (version, size,
//! checksum, copies). Metadata is persisted as a sidecar under the
//! `meta` content tree of the replica's own mountpath, so it lives and
//! dies with the replica.

use crate::lock::{NameLockGuard, NameLocker};
use crate::pool::BufPool;
use replio_common::{Bck, Bprops, BucketRegistry, Cksum, CksumHash, CksumType, Error, Result};
use replio_fs::{hrw_mpath, HealthNotifier, Mountpath, MountpathRegistry, CT_META, CT_OBJ};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Version assigned to newly created objects (and to cross-bucket copies)
pub const INITIAL_VERSION: &str = "1";

/// Everything LOM operations need from the node: the mountpath registry,
/// the name lock table, the bucket catalog contract, the filesystem
/// health checker, and the shared scratch-buffer pool.
pub struct Node {
    pub fs: Arc<MountpathRegistry>,
    pub buckets: Arc<BucketRegistry>,
    pub locker: Arc<NameLocker>,
    pub fshc: Option<Arc<dyn HealthNotifier>>,
    pub bufs: BufPool,
}

impl Node {
    #[must_use]
    pub fn new(fs: Arc<MountpathRegistry>, buckets: Arc<BucketRegistry>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            buckets,
            locker: Arc::new(NameLocker::new()),
            fshc: None,
            bufs: BufPool::default(),
        })
    }

    #[must_use]
    pub fn with_fshc(
        fs: Arc<MountpathRegistry>,
        buckets: Arc<BucketRegistry>,
        fshc: Arc<dyn HealthNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            buckets,
            locker: Arc::new(NameLocker::new()),
            fshc: Some(fshc),
            bufs: BufPool::default(),
        })
    }
}

/// Mutable object metadata, persisted alongside each replica
#[derive(Clone, Debug, Default)]
pub struct LomMd {
    pub version: String,
    pub size: u64,
    pub cksum: Cksum,
    /// FQN of every replica (self included whenever non-empty) mapped to
    /// the mountpath that owns it
    pub copies: HashMap<String, Arc<Mountpath>>,
    /// Metadata mutated under a non-immediate write policy; flush pending
    pub dirty: bool,
}

/// On-disk form of [`LomMd`]; copies persist as plain FQNs and are
/// re-resolved against the mountpath registry on load.
#[derive(Serialize, Deserialize)]
struct PersistedMd {
    version: String,
    size: u64,
    cksum: Cksum,
    copies: Vec<String>,
}

/// Local Object Metadata descriptor
pub struct Lom {
    pub(crate) node: Arc<Node>,
    pub(crate) bck: Bck,
    pub(crate) obj_name: String,
    pub(crate) uname: String,
    /// FQN of this descriptor - not necessarily the HRW location
    pub(crate) fqn: String,
    /// where HRW says the object belongs on this node
    pub(crate) hrw_fqn: String,
    pub(crate) mpath: Arc<Mountpath>,
    pub(crate) bprops: Arc<Bprops>,
    pub(crate) md: LomMd,
}

impl Lom {
    /// Create a descriptor for `(bck, objname)` at its HRW location
    pub fn init(node: Arc<Node>, bck: Bck, objname: &str) -> Result<Box<Lom>> {
        let (bck, bprops, uname, mpath, fqn) = Self::bind(&node, &bck, objname)?;
        Ok(Box::new(Lom {
            node,
            bck,
            obj_name: objname.to_string(),
            uname,
            hrw_fqn: fqn.clone(),
            fqn,
            mpath,
            bprops,
            md: LomMd { version: INITIAL_VERSION.to_string(), ..LomMd::default() },
        }))
    }

    /// Create a descriptor bound to an existing FQN (replica or
    /// misplaced object included)
    pub fn init_from_fqn(node: Arc<Node>, fqn: &str) -> Result<Box<Lom>> {
        let (mpath, ct, bucket, objname) = node.fs.parse_fqn(fqn)?;
        debug_assert_eq!(ct, CT_OBJ);
        let (bck, bprops) = node
            .buckets
            .get(&bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.clone()))?;
        let uname = bck.make_uname(&objname);
        let hrw = hrw_mpath(&node.fs, &uname)?;
        let hrw_fqn = hrw.make_path_fqn(&bck, CT_OBJ, &objname);
        Ok(Box::new(Lom {
            node,
            bck,
            obj_name: objname,
            uname,
            fqn: fqn.to_string(),
            hrw_fqn,
            mpath,
            bprops,
            md: LomMd { version: INITIAL_VERSION.to_string(), ..LomMd::default() },
        }))
    }

    fn bind(
        node: &Arc<Node>,
        bck: &Bck,
        objname: &str,
    ) -> Result<(Bck, Arc<Bprops>, String, Arc<Mountpath>, String)> {
        let (bck, bprops) = node
            .buckets
            .get(&bck.name)
            .filter(|(known, _)| known.equal(bck, true, true))
            .ok_or_else(|| Error::BucketNotFound(bck.to_string()))?;
        let uname = bck.make_uname(objname);
        let mpath = hrw_mpath(&node.fs, &uname)?;
        let fqn = mpath.make_path_fqn(&bck, CT_OBJ, objname);
        Ok((bck, bprops, uname, mpath, fqn))
    }

    /// Re-bind a pooled descriptor to `(bck, objname)`
    pub(crate) fn reinit(&mut self, node: &Arc<Node>, bck: &Bck, objname: &str) -> Result<()> {
        let (bck, bprops, uname, mpath, fqn) = Self::bind(node, bck, objname)?;
        self.node = Arc::clone(node);
        self.bck = bck;
        self.obj_name = objname.to_string();
        self.uname = uname;
        self.hrw_fqn = fqn.clone();
        self.fqn = fqn;
        self.mpath = mpath;
        self.bprops = bprops;
        self.reset_md();
        Ok(())
    }

    /// Re-bind a pooled descriptor to an existing FQN
    pub(crate) fn reinit_by_fqn(&mut self, node: &Arc<Node>, fqn: &str) -> Result<()> {
        self.node = Arc::clone(node);
        self.fqn = fqn.to_string();
        self.reset_md();
        self.rebind_from_fqn()
    }

    fn reset_md(&mut self) {
        self.md.version = INITIAL_VERSION.to_string();
        self.md.size = 0;
        self.md.cksum = Cksum::none();
        self.md.copies.clear();
        self.md.dirty = false;
    }

    /// Clone this descriptor, re-pointed at `fqn` (metadata carried over)
    pub(crate) fn clone_as(&self, fqn: &str) -> Box<Lom> {
        Box::new(Lom {
            node: Arc::clone(&self.node),
            bck: self.bck.clone(),
            obj_name: self.obj_name.clone(),
            uname: self.uname.clone(),
            fqn: fqn.to_string(),
            hrw_fqn: self.hrw_fqn.clone(),
            mpath: Arc::clone(&self.mpath),
            bprops: Arc::clone(&self.bprops),
            md: self.md.clone(),
        })
    }

    /// Recompute identity (bucket, object name, mountpath, HRW location)
    /// from this descriptor's current `fqn`.
    pub(crate) fn rebind_from_fqn(&mut self) -> Result<()> {
        let (mpath, ct, bucket, objname) = self.node.fs.parse_fqn(&self.fqn)?;
        debug_assert_eq!(ct, CT_OBJ);
        let (bck, bprops) = self
            .node
            .buckets
            .get(&bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.clone()))?;
        self.uname = bck.make_uname(&objname);
        let hrw = hrw_mpath(&self.node.fs, &self.uname)?;
        self.hrw_fqn = hrw.make_path_fqn(&bck, CT_OBJ, &objname);
        self.bck = bck;
        self.obj_name = objname;
        self.mpath = mpath;
        self.bprops = bprops;
        Ok(())
    }

    //
    // accessors
    //

    #[must_use]
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    #[must_use]
    pub fn hrw_fqn(&self) -> &str {
        &self.hrw_fqn
    }

    #[must_use]
    pub fn bck(&self) -> &Bck {
        &self.bck
    }

    #[must_use]
    pub fn obj_name(&self) -> &str {
        &self.obj_name
    }

    #[must_use]
    pub fn uname(&self) -> &str {
        &self.uname
    }

    #[must_use]
    pub fn mpath(&self) -> &Arc<Mountpath> {
        &self.mpath
    }

    #[must_use]
    pub fn bprops(&self) -> &Bprops {
        &self.bprops
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.md.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.md.size = size;
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.md.version
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.md.version = version.into();
    }

    #[must_use]
    pub fn cksum(&self) -> &Cksum {
        &self.md.cksum
    }

    pub fn set_cksum(&mut self, cksum: Cksum) {
        self.md.cksum = cksum;
    }

    /// Whether this descriptor sits at the object's HRW location
    #[must_use]
    pub fn is_hrw(&self) -> bool {
        self.fqn == self.hrw_fqn
    }

    /// Two LOMs describe the same object state
    #[must_use]
    pub fn equal(&self, other: &Lom) -> bool {
        !self.md.cksum.is_empty()
            && self.md.cksum == other.md.cksum
            && self.md.size == other.md.size
            && self.md.version == other.md.version
    }

    //
    // locking
    //

    pub fn lock_shared(&self) -> NameLockGuard {
        self.node.locker.lock_shared(&self.uname)
    }

    pub fn lock_excl(&self) -> NameLockGuard {
        self.node.locker.lock_excl(&self.uname)
    }

    /// `(reader_count, exclusive)` - assertions only
    #[must_use]
    pub fn is_locked(&self) -> (usize, bool) {
        self.node.locker.is_locked(&self.uname)
    }

    //
    // persistence
    //

    fn meta_fqn_at(&self, mi: &Mountpath) -> String {
        mi.make_path_fqn(&self.bck, CT_META, &self.obj_name)
    }

    /// Read persisted metadata into `md`. The object file itself must
    /// exist; a missing sidecar surfaces as [`Error::MetaNotFound`]
    /// ("load failed, try restore").
    pub fn load(&mut self) -> Result<()> {
        let finfo = std::fs::metadata(&self.fqn)?;
        let meta_fqn = self.meta_fqn_at(&self.mpath);
        let data = match std::fs::read(&meta_fqn) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MetaNotFound { fqn: self.fqn.clone() });
            }
            Err(e) => return Err(e.into()),
        };
        let pmd: PersistedMd = serde_json::from_slice(&data)
            .map_err(|e| Error::internal(format!("corrupted metadata at {meta_fqn}: {e}")))?;
        if finfo.len() != pmd.size {
            warn!(lom = %self, on_disk = finfo.len(), meta = pmd.size, "size mismatch");
        }
        self.md.version = pmd.version;
        self.md.size = pmd.size;
        self.md.cksum = pmd.cksum;
        self.md.copies.clear();
        for fqn in pmd.copies {
            match self.node.fs.resolve(&fqn) {
                Some(mi) => {
                    self.md.copies.insert(fqn, mi);
                }
                None => warn!(lom = %self, copy = %fqn, "dropping copy on a lost mountpath"),
            }
        }
        if self.md.copies.len() <= 1 {
            self.md.copies.clear();
        }
        self.md.dirty = false;
        Ok(())
    }

    /// Persist metadata for this replica (atomic: workfile + rename)
    pub fn persist(&mut self) -> Result<()> {
        let mi = Arc::clone(&self.mpath);
        self.persist_md_at(&mi)?;
        self.md.dirty = false;
        Ok(())
    }

    /// Persist current metadata to every copy except self; on failure
    /// returns the offending copy FQN with the error.
    pub(crate) fn persist_md_on_copies(&self) -> Option<(String, Error)> {
        for (fqn, mi) in &self.md.copies {
            if fqn == &self.fqn {
                continue;
            }
            if let Err(e) = self.persist_md_at(mi) {
                return Some((fqn.clone(), e));
            }
        }
        None
    }

    fn persist_md_at(&self, mi: &Arc<Mountpath>) -> Result<()> {
        let pmd = PersistedMd {
            version: self.md.version.clone(),
            size: self.md.size,
            cksum: self.md.cksum.clone(),
            copies: self.md.copies.keys().cloned().collect(),
        };
        let data = serde_json::to_vec(&pmd)
            .map_err(|e| Error::internal(format!("metadata encode: {e}")))?;

        let meta_fqn = self.meta_fqn_at(mi);
        let work_fqn = mi.make_path_work(&self.bck, "md", &self.obj_name);
        write_file(&work_fqn, &data)?;
        if let Some(parent) = Path::new(&meta_fqn).parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = std::fs::rename(&work_fqn, &meta_fqn) {
            let _ = std::fs::remove_file(&work_fqn);
            return Err(e.into());
        }
        Ok(())
    }
}

impl fmt::Display for Lom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o[{}/{}]", self.bck.name, self.obj_name)
    }
}

impl fmt::Debug for Lom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o[{}/{} fqn={} hrw={}]", self.bck.name, self.obj_name, self.fqn, self.is_hrw())
    }
}

//
// file helpers
//

fn write_file(path: &str, data: &[u8]) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

pub(crate) fn remove_file_ignore_missing(path: &str) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Unlink a replica file together with its metadata sidecar
pub(crate) fn unlink_replica(fqn: &str, mi: &Mountpath) -> std::io::Result<()> {
    remove_file_ignore_missing(fqn)?;
    if let Some(meta) = mi.meta_path_of(fqn) {
        remove_file_ignore_missing(&meta)?;
    }
    Ok(())
}

/// Stream-copy `src` to `dst` through `buf`, checksumming along the way
/// (`CksumType::None` disables verification).
pub(crate) fn copy_file_cksum(
    src: &str,
    dst: &str,
    buf: &mut [u8],
    ty: CksumType,
) -> Result<(u64, Cksum)> {
    let mut from = std::fs::File::open(src)?;
    if let Some(parent) = Path::new(dst).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut to = std::fs::File::create(dst)?;
    let mut hash = CksumHash::new(ty);
    let mut written = 0u64;
    loop {
        let n = from.read(buf)?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n])?;
        hash.update(&buf[..n]);
        written += n as u64;
    }
    to.sync_all()?;
    Ok((written, hash.finalize()))
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use replio_common::Bprops;

    #[test]
    fn test_init_is_hrw() {
        let h = harness(4, Bprops::default());
        let lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        assert!(lom.is_hrw());
        assert_eq!(lom.uname(), h.bck.make_uname("obj1"));
        assert!(lom.fqn().contains("/obj/data/obj1"));
    }

    #[test]
    fn test_init_unknown_bucket() {
        let h = harness(1, Bprops::default());
        let err = Lom::init(Arc::clone(&h.node), Bck::new("nope"), "o").unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
    }

    #[test]
    fn test_persist_load_round_trip() {
        let h = harness(2, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        put_object(&mut lom, b"payload");
        lom.set_version("3");
        lom.persist().unwrap();

        let mut reloaded = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.version(), "3");
        assert_eq!(reloaded.size(), 7);
        assert_eq!(reloaded.cksum(), lom.cksum());
        assert!(reloaded.equal(&lom));
    }

    #[test]
    fn test_load_missing_meta() {
        let h = harness(1, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        // object file exists, sidecar does not
        std::fs::create_dir_all(Path::new(lom.fqn()).parent().unwrap()).unwrap();
        std::fs::write(lom.fqn(), b"x").unwrap();
        assert!(lom.load().unwrap_err().is_meta_not_found());
    }

    #[test]
    fn test_load_missing_object() {
        let h = harness(1, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        assert!(matches!(lom.load().unwrap_err(), Error::Io(_)));
    }

    #[test]
    fn test_init_from_fqn() {
        let h = harness(3, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "a/b/c").unwrap();
        put_object(&mut lom, b"data");

        let other = Lom::init_from_fqn(Arc::clone(&h.node), lom.fqn()).unwrap();
        assert_eq!(other.obj_name(), "a/b/c");
        assert_eq!(other.bck().name, "data");
        assert_eq!(other.fqn(), lom.fqn());
        assert!(other.is_hrw());
    }

    #[test]
    fn test_load_drops_copies_on_lost_mountpath() {
        let h = harness(3, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        put_object(&mut lom, b"data");

        // fabricate two copies, then lose one of their mountpaths
        let avail = h.node.fs.get_avail();
        let mut others = avail.values().filter(|mi| mi.path != lom.mpath().path);
        let m1 = others.next().unwrap().clone();
        let m2 = others.next().unwrap().clone();
        lom.md.copies.insert(lom.fqn().to_string(), Arc::clone(lom.mpath()));
        lom.md.copies.insert(m1.make_path_fqn(&h.bck, CT_OBJ, "obj1"), Arc::clone(&m1));
        lom.md.copies.insert(m2.make_path_fqn(&h.bck, CT_OBJ, "obj1"), Arc::clone(&m2));
        lom.persist().unwrap();

        h.node.fs.remove(&m1.path);
        let mut reloaded = Lom::init(Arc::clone(&h.node), h.bck.clone(), "obj1").unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.md.copies.len(), 2);
        assert!(!reloaded.md.copies.keys().any(|f| f.starts_with(&m1.path)));
    }

    #[test]
    fn test_equal_requires_cksum() {
        let h = harness(1, Bprops::default());
        let a = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        let b = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        // both empty checksums: not comparable
        assert!(!a.equal(&b));
    }

    #[test]
    fn test_lom_pool_recycles() {
        let h = harness(2, Bprops::default());
        let pool = crate::pool::LomPool::new();

        let lom = pool.alloc(&h.node, &h.bck, "o1").unwrap();
        let fqn1 = lom.fqn().to_string();
        pool.free(lom);

        // the recycled descriptor is fully re-bound
        let lom = pool.alloc(&h.node, &h.bck, "o2").unwrap();
        assert_eq!(lom.obj_name(), "o2");
        assert!(lom.is_hrw());
        assert!(lom.md.copies.is_empty());
        pool.free(lom);

        let by_fqn = pool.alloc_by_fqn(&h.node, &fqn1).unwrap();
        assert_eq!(by_fqn.obj_name(), "o1");
        assert_eq!(by_fqn.fqn(), fqn1);
    }

    #[test]
    fn test_copy_file_cksum() {
        let h = harness(1, Bprops::default());
        let mi = h.node.fs.get_avail().into_values().next().unwrap();
        let src = mi.make_path_fqn(&h.bck, CT_OBJ, "src");
        let dst = mi.make_path_fqn(&h.bck, CT_OBJ, "dst");
        std::fs::create_dir_all(Path::new(&src).parent().unwrap()).unwrap();
        std::fs::write(&src, b"some bytes").unwrap();

        let mut buf = vec![0u8; 4];
        let (n, cksum) = copy_file_cksum(&src, &dst, &mut buf, CksumType::XxHash64).unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&dst).unwrap(), b"some bytes");
        assert_eq!(cksum, Cksum::compute(CksumType::XxHash64, b"some bytes"));
    }
}
