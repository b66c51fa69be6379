//! LOM copy management
//!
//! Replica (mirror) bookkeeping across local mountpaths: adding and
//! deleting copies, reconciling persisted metadata, load-balanced read
//! selection, the placement oracle, and restoration from any surviving
//! replica. All mutations require the LOM write lock (see `lock.rs`).

use crate::lom::{copy_file_cksum, remove_file_ignore_missing, unlink_replica, Lom, INITIAL_VERSION};
use replio_common::{CksumType, Error, Result};
use replio_fs::{hrw_mpath, Mountpath, CT_OBJ, FLAG_WAITING_DD};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

impl Lom {
    #[must_use]
    pub fn has_copies(&self) -> bool {
        self.num_copies() > 1
    }

    #[must_use]
    pub fn num_copies(&self) -> usize {
        self.md.copies.len().max(1)
    }

    /// All copies, self included. Caller must hold the lock.
    #[must_use]
    pub fn get_copies(&self) -> &HashMap<String, Arc<Mountpath>> {
        debug_assert!(
            {
                let (readers, exclusive) = self.is_locked();
                exclusive || readers > 0
            },
            "{self}: lock required"
        );
        &self.md.copies
    }

    /// Given an existing on-disk object, determines whether it is a
    /// _copy_ (compare with `is_mirror` below)
    #[must_use]
    pub fn is_copy(&self) -> bool {
        if self.is_hrw() {
            return false;
        }
        // misplaced or a copy
        self.md.copies.contains_key(&self.fqn)
    }

    /// Determines whether the two LOM _descriptors_ represent objects
    /// that must be copies of each other (compare with `is_copy` above)
    pub(crate) fn is_mirror(&self, other: &Lom) -> bool {
        self.bprops.mirror.enabled
            && self.obj_name == other.obj_name
            && self.bck.equal(&other.bck, true /* must have same bid */, true /* same backend */)
    }

    fn warn_is_copy(&self) -> bool {
        if !self.is_copy() {
            return false;
        }
        error!(lom = %self, fqn = %self.fqn, hrw = %self.hrw_fqn, "unexpected operation on a replica");
        debug_assert!(false, "operation on a replica: {self}");
        true
    }

    pub(crate) fn del_copy_md(&mut self, copy_fqn: &str) {
        self.md.copies.remove(copy_fqn);
        if self.md.copies.len() <= 1 {
            self.md.copies.clear();
        }
    }

    /// Record a new copy and make sure self is recorded as well, then
    /// reconcile metadata across all copies.
    pub fn add_copy(&mut self, copy_fqn: &str, mi: &Arc<Mountpath>) -> Result<()> {
        self.md.copies.insert(copy_fqn.to_string(), Arc::clone(mi));
        self.md.copies.insert(self.fqn.clone(), Arc::clone(&self.mpath));
        self.sync_meta_with_copies()
    }

    /// Delete the given copies. The whole batch is validated up front:
    /// an unknown FQN fails the call before any metadata changes.
    pub fn del_copies(&mut self, copies_fqn: &[String]) -> Result<()> {
        let num = self.num_copies();
        for copy_fqn in copies_fqn {
            if !self.md.copies.contains_key(copy_fqn) {
                return Err(Error::CopyDoesNotExist {
                    lom: self.to_string(),
                    num,
                    copy: copy_fqn.clone(),
                });
            }
        }

        // 1. delete from the metadata
        let mut removed = Vec::with_capacity(copies_fqn.len());
        for copy_fqn in copies_fqn {
            if let Some(mi) = self.md.copies.get(copy_fqn) {
                removed.push((copy_fqn.clone(), Arc::clone(mi)));
            }
            self.del_copy_md(copy_fqn);
        }

        // 2. update metadata on the remaining copies, if any
        self.sync_meta_with_copies()?;

        // 3. remove the copies
        for (copy_fqn, mi) in removed {
            if let Err(e) = unlink_replica(&copy_fqn, &mi) {
                // TODO: LRU should take care of it later
                warn!(copy = %copy_fqn, %e, "failed to remove copy");
            }
        }
        Ok(())
    }

    pub fn del_all_copies(&mut self) -> Result<()> {
        let copies_fqn: Vec<String> = self
            .md
            .copies
            .keys()
            .filter(|fqn| *fqn != &self.fqn)
            .cloned()
            .collect();
        self.del_copies(&copies_fqn)
    }

    /// Delete object replicas that are not part of the copies metadata
    /// (cleanup). Returns whether the optional `fqn` was one of them.
    pub fn del_extra_copies(&mut self, fqn: Option<&str>) -> Result<bool> {
        if self.warn_is_copy() {
            return Ok(false);
        }
        let avail = self.node.fs.get_avail();
        let mut removed = false;
        let mut last_err: Option<std::io::Error> = None;
        for mi in avail.values() {
            let copy_fqn = mi.make_path_fqn(&self.bck, CT_OBJ, &self.obj_name);
            if self.md.copies.contains_key(&copy_fqn) {
                continue;
            }
            if let Err(e) = unlink_replica(&copy_fqn, mi) {
                last_err = Some(e);
                continue;
            }
            if fqn == Some(copy_fqn.as_str()) {
                removed = true;
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Try to make sure all copies carry identical metadata.
    ///
    /// Under a non-immediate write policy the metadata is only marked
    /// dirty. Otherwise copies that fail to persist are dropped (with an
    /// FSHC notification when the file is still there) and the loop
    /// retries until success or no copies remain. The caller is
    /// responsible for calling `persist` upon return.
    pub(crate) fn sync_meta_with_copies(&mut self) -> Result<()> {
        if !self.has_copies() {
            return Ok(());
        }
        debug_assert!(self.is_locked().1, "{self}: write lock required");
        if !self.bprops.md_write.is_immediate() {
            self.md.dirty = true;
            return Ok(());
        }
        while let Some((copy_fqn, err)) = self.persist_md_on_copies() {
            warn!(lom = %self, copy = %copy_fqn, %err, "dropping copy that failed to persist");
            self.del_copy_md(&copy_fqn);
            if Path::new(&copy_fqn).exists() {
                if let Some(fshc) = &self.node.fshc {
                    fshc.notify(&copy_fqn, &err);
                }
            }
        }
        Ok(())
    }

    /// Try to restore the object at its default location from any other
    /// mountpath. Returns true iff the object exists upon return.
    pub fn restore_object_from_any(&mut self) -> bool {
        let guard = self.node.locker.lock_excl(&self.uname);
        if self.load().is_ok() {
            drop(guard);
            return true; // nothing to do
        }
        let avail = self.node.fs.get_avail();
        let node = Arc::clone(&self.node);
        let mut buf = node.bufs.alloc();
        let mut exists = false;
        for (path, mi) in &avail {
            if *path == self.mpath.path {
                continue;
            }
            let fqn = mi.make_path_fqn(&self.bck, CT_OBJ, &self.obj_name);
            if std::fs::metadata(&fqn).is_err() {
                continue;
            }
            match self.restore_from(&fqn, &mut buf) {
                Ok(dst) => {
                    self.md = dst.md.clone();
                    exists = true;
                    break;
                }
                Err(e) => debug!(lom = %self, from = %fqn, %e, "restore attempt failed"),
            }
        }
        drop(guard);
        node.bufs.free(buf);
        exists
    }

    fn restore_from(&mut self, fqn: &str, buf: &mut [u8]) -> Result<Box<Lom>> {
        let mut src = Lom::init_from_fqn(Arc::clone(&self.node), fqn)?;
        src.load()?;
        // restore at the default location
        src.copy_to_fqn(&self.fqn, buf)
    }

    /// Increment the object's number of copies by (well) copying it onto
    /// `mi` (compare with `copy_to_fqn` below). Caller must hold the
    /// write lock.
    pub fn copy(&mut self, mi: &Arc<Mountpath>, buf: &mut [u8]) -> Result<()> {
        let copy_fqn = mi.make_path_fqn(&self.bck, CT_OBJ, &self.obj_name);
        let work_fqn = mi.make_path_work(&self.bck, "copy", &self.obj_name);

        // skip the byte copy if the destination exists and is identical
        let mut have_identical = false;
        if Path::new(&copy_fqn).exists() {
            if let Ok(mut cplom) = Lom::init_from_fqn(Arc::clone(&self.node), &copy_fqn) {
                if cplom.load().is_ok() && cplom.equal(self) {
                    have_identical = true;
                }
            }
        }

        if !have_identical {
            copy_file_cksum(&self.fqn, &work_fqn, buf, CksumType::None)?; // TODO: checksumming
            if let Some(parent) = Path::new(&copy_fqn).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let Err(e) = std::fs::rename(&work_fqn, &copy_fqn) {
                if let Err(nested) = remove_file_ignore_missing(&work_fqn) {
                    warn!(%nested, "failed to remove workfile");
                }
                return Err(e.into());
            }
        }

        // add md and persist
        self.add_copy(&copy_fqn, mi)?;
        if let Err(e) = self.persist() {
            self.del_copy_md(&copy_fqn);
            error!(lom = %self, %e, "failed to persist after copy");
            return Err(e);
        }
        self.sync_meta_with_copies()
    }

    /// Copy the object to an arbitrary local destination, recommended
    /// for copying between different buckets (compare with `copy`
    /// above). The source must be write-locked.
    pub fn copy_to_fqn(&mut self, dst_fqn: &str, buf: &mut [u8]) -> Result<Box<Lom>> {
        let cksum_ty = if self.md.cksum.is_empty() {
            CksumType::None
        } else {
            self.md.cksum.ty()
        };

        let mut dst = self.clone_as(dst_fqn);
        dst.rebind_from_fqn()?;
        dst.md.copies.clear();
        if dst.is_mirror(self) {
            debug_assert!(self.is_locked().1, "{self}: write lock required");
            if !self.md.copies.is_empty() {
                dst.md.copies = self.md.copies.clone();
            }
        }

        if !dst.bck.equal(&self.bck, false, true) {
            // the copy landing in another bucket is a separate object
            dst.set_version(INITIAL_VERSION);
        }

        let work_fqn = dst.mpath.make_path_work(&dst.bck, "copy", &dst.obj_name);
        let (_, dst_cksum) = copy_file_cksum(&self.fqn, &work_fqn, buf, cksum_ty)?;

        if let Some(parent) = Path::new(dst_fqn).parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = std::fs::rename(&work_fqn, dst_fqn) {
            if let Err(nested) = remove_file_ignore_missing(&work_fqn) {
                warn!(%nested, "failed to remove workfile");
            }
            return Err(e.into());
        }

        if cksum_ty != CksumType::None {
            if dst_cksum != self.md.cksum {
                return Err(Error::BadDataChecksum {
                    expected: self.md.cksum.to_string(),
                    got: dst_cksum.to_string(),
                });
            }
            dst.set_cksum(dst_cksum);
        }

        // persist
        if self.is_mirror(&dst) {
            let dst_mi = Arc::clone(&dst.mpath);
            let self_mi = Arc::clone(&self.mpath);
            self.md.copies.insert(dst_fqn.to_string(), Arc::clone(&dst_mi));
            dst.md.copies.insert(dst_fqn.to_string(), dst_mi);
            self.md.copies.insert(self.fqn.clone(), Arc::clone(&self_mi));
            dst.md.copies.insert(self.fqn.clone(), self_mi);
            if let Err(e) = self.sync_meta_with_copies() {
                if !self.md.copies.contains_key(dst_fqn) {
                    if let Err(nested) = remove_file_ignore_missing(dst_fqn) {
                        warn!(%nested, "failed to remove destination");
                    }
                }
                // sync may have made changes notwithstanding
                if let Err(nested) = self.persist() {
                    error!(%nested, "failed to persist after sync failure");
                }
                return Err(e);
            }
            self.persist()?;
        } else if let Err(e) = dst.persist() {
            if let Err(nested) = remove_file_ignore_missing(dst_fqn) {
                warn!(%nested, "failed to remove destination");
            }
            return Err(e);
        }
        Ok(dst)
    }

    /// Load-balanced GET: the FQN of the least-utilized replica
    #[must_use]
    pub fn lb_get(&self) -> String {
        if !self.has_copies() {
            return self.fqn.clone();
        }
        self.least_util_copy()
    }

    fn least_util_copy(&self) -> String {
        let utils = self.node.fs.utils();
        let mut fqn = &self.fqn;
        let mut min_util = utils.get(&self.mpath.path);
        for (copy_fqn, mpi) in &self.md.copies {
            if copy_fqn != &self.fqn {
                let util = utils.get(&mpi.path);
                if util < min_util {
                    fqn = copy_fqn;
                    min_util = util;
                }
            }
        }
        fqn.clone()
    }

    /// The least utilized mountpath that does _not_ have a copy of this
    /// object yet (compare with `least_util_copy` above)
    #[must_use]
    pub fn least_util_no_copy(&self) -> Option<Arc<Mountpath>> {
        let avail = self.node.fs.get_avail();
        let utils = self.node.fs.utils();
        let mut min_util = 101i64; // to motivate the first assignment
        let mut best = None;
        for (mpath, mi) in &avail {
            if self.have_mpath(mpath) || mi.is_set(FLAG_WAITING_DD) {
                continue;
            }
            let util = utils.get(mpath);
            if util < min_util {
                min_util = util;
                best = Some(Arc::clone(mi));
            }
        }
        best
    }

    fn have_mpath(&self, mpath: &str) -> bool {
        if self.md.copies.is_empty() {
            return self.mpath.path == mpath;
        }
        self.md.copies.values().any(|mi| mi.path == mpath)
    }

    /// Where this object should live. Must be called under the write
    /// lock. Returns the mountpath to copy/move it to, or `None` when no
    /// copying is required; `is_hrw` set means the object must be moved
    /// to its HRW location.
    ///
    /// Checks the HRW location first, then the copies (if any) against
    /// the mirror configuration and available mountpaths; does not
    /// `stat` in either case.
    pub fn to_mpath(&mut self) -> (Option<Arc<Mountpath>>, bool) {
        let avail = self.node.fs.get_avail();
        let hrw = match hrw_mpath(&self.node.fs, &self.uname) {
            Ok(mi) => mi,
            Err(e) => {
                error!(lom = %self, %e, "hrw resolution failed");
                return (None, false);
            }
        };
        debug_assert!(!hrw.is_set(FLAG_WAITING_DD));
        if self.mpath.path != hrw.path {
            return (Some(hrw), true);
        }
        let mirror = self.bprops.mirror;
        if !mirror.enabled || mirror.copies < 2 {
            return (None, false);
        }
        // count copies vs. configuration, pruning those on missing or
        // draining mountpaths
        let expected = mirror.copies as usize;
        let mut got = 0;
        let mut stale = Vec::new();
        for (fqn, mi) in &self.md.copies {
            match avail.get(&mi.path) {
                Some(live) if !live.is_set(FLAG_WAITING_DD) => got += 1,
                _ => stale.push(fqn.clone()),
            }
        }
        for fqn in stale {
            self.del_copy_md(&fqn);
        }
        if expected <= got {
            return (None, false);
        }
        let mi = self.least_util_no_copy();
        if mi.is_none() {
            warn!(
                lom = %self,
                mpaths = avail.len(),
                got,
                expected,
                "not enough mountpaths to place copies"
            );
        }
        (mi, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lom::testutil::*;
    use replio_common::Bprops;

    fn other_mpath(lom: &Lom) -> Arc<Mountpath> {
        lom.node
            .fs
            .get_avail()
            .into_values()
            .find(|mi| mi.path != lom.mpath().path)
            .unwrap()
    }

    #[test]
    fn test_num_copies_normalization() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        assert_eq!(lom.num_copies(), 1);
        assert!(!lom.has_copies());

        // deleting down to a single entry normalizes to empty
        lom.md.copies.insert(lom.fqn().to_string(), Arc::clone(lom.mpath()));
        lom.md.copies.insert("other".to_string(), other_mpath(&lom));
        lom.del_copy_md("other");
        assert!(lom.md.copies.is_empty());
    }

    #[test]
    fn test_add_copy_invariants() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"bytes");

        let mi = other_mpath(&lom);
        let copy_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        {
            let _g = lom.lock_excl();
            lom.add_copy(&copy_fqn, &mi).unwrap();
        }
        // self is always a member of a non-empty copies map
        assert!(lom.md.copies.contains_key(lom.fqn()));
        assert_eq!(lom.md.copies.get(&copy_fqn).unwrap().path, mi.path);
        assert_eq!(lom.num_copies(), 2);
        assert!(lom.has_copies());
    }

    #[test]
    fn test_del_copies_unknown_is_atomic() {
        let h = harness(3, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"bytes");

        let mi = other_mpath(&lom);
        let copy_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        let _g = lom.lock_excl();
        lom.add_copy(&copy_fqn, &mi).unwrap();

        let before = lom.md.copies.clone();
        let err = lom
            .del_copies(&[copy_fqn.clone(), "/no/such/copy".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::CopyDoesNotExist { .. }));
        // no partial deletions
        assert_eq!(lom.md.copies.len(), before.len());
        assert!(lom.md.copies.contains_key(&copy_fqn));
    }

    #[test]
    fn test_copy_lb_get_and_bytes() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"the payload");

        let mi = other_mpath(&lom);
        let mut buf = vec![0u8; 4096];
        {
            let _g = lom.lock_excl();
            lom.copy(&mi, &mut buf).unwrap();
        }

        let copy_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        assert_eq!(std::fs::read(&copy_fqn).unwrap(), b"the payload");
        assert_eq!(lom.num_copies(), 2);

        // lb_get picks the least-utilized replica; ties favor self
        h.node.fs.set_utilization(&lom.mpath().path, 10);
        h.node.fs.set_utilization(&mi.path, 90);
        assert_eq!(lom.lb_get(), lom.fqn());

        h.node.fs.set_utilization(&lom.mpath().path, 95);
        assert_eq!(lom.lb_get(), copy_fqn);
        assert_eq!(std::fs::read(lom.lb_get()).unwrap(), b"the payload");

        h.node.fs.set_utilization(&mi.path, 95); // tie
        assert_eq!(lom.lb_get(), lom.fqn());
    }

    #[test]
    fn test_copy_skips_identical_destination() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"stable");

        let mi = other_mpath(&lom);
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        lom.copy(&mi, &mut buf).unwrap();

        let copy_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        let mtime = std::fs::metadata(&copy_fqn).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        lom.copy(&mi, &mut buf).unwrap();
        assert_eq!(std::fs::metadata(&copy_fqn).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_del_all_copies() {
        let h = harness(3, mirrored(3));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        let others: Vec<_> = h
            .node
            .fs
            .get_avail()
            .into_values()
            .filter(|mi| mi.path != lom.mpath().path)
            .collect();
        for mi in &others {
            lom.copy(mi, &mut buf).unwrap();
        }
        assert_eq!(lom.num_copies(), 3);

        lom.del_all_copies().unwrap();
        assert!(lom.md.copies.is_empty());
        assert_eq!(lom.num_copies(), 1);
        for mi in &others {
            assert!(!Path::new(&mi.make_path_fqn(&h.bck, CT_OBJ, "o")).exists());
        }
        // the object itself survives
        assert!(Path::new(lom.fqn()).exists());
    }

    #[test]
    fn test_del_extra_copies() {
        let h = harness(3, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        let mi = other_mpath(&lom);
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        lom.copy(&mi, &mut buf).unwrap();

        // drop a straggler replica on the third mountpath, bypassing md
        let third = h
            .node
            .fs
            .get_avail()
            .into_values()
            .find(|m| m.path != lom.mpath().path && m.path != mi.path)
            .unwrap();
        let stray = third.make_path_fqn(&h.bck, CT_OBJ, "o");
        std::fs::create_dir_all(Path::new(&stray).parent().unwrap()).unwrap();
        std::fs::write(&stray, b"x").unwrap();

        let removed = lom.del_extra_copies(Some(&stray)).unwrap();
        assert!(removed);
        assert!(!Path::new(&stray).exists());
        // tracked copies survive
        assert!(Path::new(lom.fqn()).exists());
        assert!(Path::new(&mi.make_path_fqn(&h.bck, CT_OBJ, "o")).exists());
    }

    #[test]
    fn test_sync_meta_delayed_marks_dirty() {
        use replio_common::{MdWritePolicy, MirrorConf};
        let props = Bprops {
            mirror: MirrorConf { enabled: true, copies: 2 },
            md_write: MdWritePolicy::Delayed,
            ..Bprops::default()
        };
        let h = harness(2, props);
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        let mi = other_mpath(&lom);
        let copy_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        let _g = lom.lock_excl();
        lom.add_copy(&copy_fqn, &mi).unwrap();
        assert!(lom.md.dirty);
        // nothing was flushed to the copy's mountpath
        assert!(!Path::new(&mi.make_path_fqn(&h.bck, replio_fs::CT_META, "o")).exists());
    }

    #[test]
    fn test_to_mpath_misplaced_returns_hrw() {
        let h = harness(3, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        // a descriptor pointed at a non-HRW location
        let mi = other_mpath(&lom);
        let misplaced_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        let mut misplaced = Lom::init_from_fqn(Arc::clone(&h.node), &misplaced_fqn).unwrap();
        assert!(!misplaced.is_hrw());

        let _g = misplaced.lock_excl();
        let (target, is_hrw) = misplaced.to_mpath();
        assert!(is_hrw);
        assert_eq!(target.unwrap().path, lom.mpath().path);
    }

    #[test]
    fn test_to_mpath_mirror_placement() {
        // mirror.enabled, copies=2, two mountpaths with utils [10, 90]
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        let other = other_mpath(&lom);
        h.node.fs.set_utilization(&lom.mpath().path, 10);
        h.node.fs.set_utilization(&other.path, 90);

        let _g = lom.lock_excl();
        let (target, is_hrw) = lom.to_mpath();
        assert!(!is_hrw);
        assert_eq!(target.unwrap().path, other.path);

        // after placing the copy, placement is satisfied
        let mut buf = vec![0u8; 4096];
        lom.copy(&other, &mut buf).unwrap();
        let (target, is_hrw) = lom.to_mpath();
        assert!(!is_hrw);
        assert!(target.is_none());
        // and reads go to the less-utilized original
        assert_eq!(lom.lb_get(), lom.fqn());
    }

    #[test]
    fn test_to_mpath_mirror_disabled() {
        let h = harness(2, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");
        let _g = lom.lock_excl();
        let (target, is_hrw) = lom.to_mpath();
        assert!(!is_hrw);
        assert!(target.is_none());
    }

    #[test]
    fn test_to_mpath_prunes_draining_copies() {
        let h = harness(3, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");

        let mi = other_mpath(&lom);
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        lom.copy(&mi, &mut buf).unwrap();

        // the copy's mountpath starts draining: it no longer counts and a
        // replacement location is proposed
        mi.set_flag(FLAG_WAITING_DD);
        let (target, is_hrw) = lom.to_mpath();
        assert!(!is_hrw);
        let target = target.unwrap();
        assert_ne!(target.path, mi.path);
        assert_ne!(target.path, lom.mpath().path);
        assert!(!lom.md.copies.keys().any(|f| f.starts_with(&mi.path)));
    }

    #[test]
    fn test_sync_meta_drops_failing_copy_and_notifies() {
        use replio_common::{Bprops, BucketRegistry};
        use replio_fs::{HealthNotifier, MountpathRegistry};

        #[derive(Default)]
        struct RecordingFshc {
            calls: parking_lot::Mutex<Vec<String>>,
        }
        impl HealthNotifier for RecordingFshc {
            fn notify(&self, fqn: &str, _err: &Error) {
                self.calls.lock().push(fqn.to_string());
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let fs = Arc::new(MountpathRegistry::new());
        fs.add(&format!("{root}/mp0")).unwrap();
        fs.add(&format!("{root}/mp1")).unwrap();
        let buckets = Arc::new(BucketRegistry::new());
        let bck = buckets.add("data", mirrored(2));
        let fshc = Arc::new(RecordingFshc::default());
        let fshc_dyn: Arc<dyn HealthNotifier> = Arc::clone(&fshc) as Arc<dyn HealthNotifier>;
        let node = crate::lom::Node::with_fshc(fs, buckets, fshc_dyn);

        let mut lom = Lom::init(Arc::clone(&node), bck.clone(), "o").unwrap();
        put_object(&mut lom, b"payload");
        let mi = other_mpath(&lom);
        let copy_fqn = mi.make_path_fqn(&bck, CT_OBJ, "o");
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        lom.copy(&mi, &mut buf).unwrap();
        assert!(fshc.calls.lock().is_empty());

        // break the copy's workfile tree so its metadata can no longer
        // be persisted; the object file itself stays put
        std::fs::remove_dir_all(format!("{}/work", mi.path)).unwrap();
        std::fs::write(format!("{}/work", mi.path), b"not a dir").unwrap();

        lom.add_copy(&copy_fqn, &mi).unwrap();
        assert!(lom.md.copies.is_empty());
        assert_eq!(fshc.calls.lock().as_slice(), &[copy_fqn]);
    }

    #[test]
    fn test_restore_object_from_any() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"restore me");

        let mi = other_mpath(&lom);
        let mut buf = vec![0u8; 4096];
        {
            let _g = lom.lock_excl();
            lom.copy(&mi, &mut buf).unwrap();
        }

        // lose the object at its default location (file + metadata)
        std::fs::remove_file(lom.fqn()).unwrap();
        std::fs::remove_file(lom.mpath().meta_path_of(lom.fqn()).unwrap()).unwrap();

        let mut fresh = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        assert!(fresh.load().is_err());
        assert!(fresh.restore_object_from_any());
        assert_eq!(std::fs::read(fresh.fqn()).unwrap(), b"restore me");

        let mut reloaded = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.size(), 10);
        assert!(reloaded.equal(&lom));
    }

    #[test]
    fn test_restore_nothing_to_do() {
        let h = harness(2, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"x");
        assert!(lom.restore_object_from_any());
    }

    #[test]
    fn test_restore_no_replica_anywhere() {
        let h = harness(2, Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "gone").unwrap();
        assert!(!lom.restore_object_from_any());
    }

    #[test]
    fn test_copy_to_fqn_cross_bucket_gets_initial_version() {
        let h = harness(2, Bprops::default());
        let dst_bck = h.node.buckets.add("archive", Bprops::default());
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"versioned");
        lom.set_version("7");
        lom.persist().unwrap();
        lom.load().unwrap();

        let dst_fqn = {
            let probe = Lom::init(Arc::clone(&h.node), dst_bck.clone(), "o").unwrap();
            probe.fqn().to_string()
        };
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        let dst = lom.copy_to_fqn(&dst_fqn, &mut buf).unwrap();
        assert_eq!(dst.version(), INITIAL_VERSION);
        assert_eq!(std::fs::read(&dst_fqn).unwrap(), b"versioned");
        // a different bucket is never a mirror
        assert!(lom.md.copies.is_empty());
        assert!(dst.md.copies.is_empty());
    }

    #[test]
    fn test_copy_to_fqn_mirror_splices_both() {
        let h = harness(2, mirrored(2));
        let mut lom = Lom::init(Arc::clone(&h.node), h.bck.clone(), "o").unwrap();
        put_object(&mut lom, b"mirrored");

        let mi = other_mpath(&lom);
        let dst_fqn = mi.make_path_fqn(&h.bck, CT_OBJ, "o");
        let mut buf = vec![0u8; 4096];
        let _g = lom.lock_excl();
        let dst = lom.copy_to_fqn(&dst_fqn, &mut buf).unwrap();

        for copies in [&lom.md.copies, &dst.md.copies] {
            assert_eq!(copies.len(), 2);
            assert!(copies.contains_key(lom.fqn()));
            assert!(copies.contains_key(&dst_fqn));
        }
        // the destination replica can be loaded on its own
        let mut cp = Lom::init_from_fqn(Arc::clone(&h.node), &dst_fqn).unwrap();
        cp.load().unwrap();
        assert!(cp.is_copy());
        assert!(cp.equal(&lom));
    }
}
