//! Object ingest: the transport-to-LOM glue
//!
//! The callback registered on the transport endpoint. Streams each
//! object payload into a workfile on its HRW mountpath, then finalizes
//! under the LOM write lock: rename into place, persist metadata, and
//! place mirror replicas while the placement oracle asks for more.

use async_trait::async_trait;
use replio_common::{Cksum, CksumHash};
use replio_lom::{Lom, LomPool, Node, INITIAL_VERSION};
use replio_transport::{ObjHdr, ObjReader, Receive};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct ObjectIngest {
    node: Arc<Node>,
    pool: Arc<LomPool>,
}

impl ObjectIngest {
    pub fn new(node: Arc<Node>, pool: Arc<LomPool>) -> Self {
        Self { node, pool }
    }
}

#[async_trait]
impl Receive for ObjectIngest {
    async fn recv(&self, hdr: ObjHdr, obj: &mut ObjReader<'_>) -> io::Result<()> {
        if hdr.objname.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty object name"));
        }
        let Some((bck, props)) = self.node.buckets.get(&hdr.bucket) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bucket not found: {}", hdr.bucket),
            ));
        };
        let lom = self
            .pool
            .alloc(&self.node, &bck, &hdr.objname)
            .map_err(io::Error::other)?;

        // stream the payload to a workfile on the HRW mountpath
        let work_fqn = lom.mpath().make_path_work(&bck, "put", &hdr.objname);
        if let Some(parent) = Path::new(&work_fqn).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&work_fqn).await?;
        let mut hash = CksumHash::new(props.cksum_ty);
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = obj.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            hash.update(&buf[..n]);
            written += n as u64;
        }
        file.sync_all().await?;
        drop(file);
        if written != hdr.dsize {
            let _ = tokio::fs::remove_file(&work_fqn).await;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short object payload: {written} != {}", hdr.dsize),
            ));
        }
        let cksum = hash.finalize();

        debug!(bucket = %hdr.bucket, objname = %hdr.objname, size = written, "ingest");
        let node = Arc::clone(&self.node);
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || finalize(&node, &pool, lom, &work_fqn, written, cksum))
            .await
            .map_err(io::Error::other)?
            .map_err(io::Error::other)
    }
}

/// Commit the workfile at the LOM's home location and satisfy the
/// bucket's mirror placement. Holds the write lock throughout.
fn finalize(
    node: &Arc<Node>,
    pool: &Arc<LomPool>,
    mut lom: Box<Lom>,
    work_fqn: &str,
    size: u64,
    cksum: Cksum,
) -> replio_common::Result<()> {
    let guard = lom.lock_excl();

    // overwrite: bump the version and drop now-stale replicas
    let prev_version = lom.load().ok().and_then(|()| lom.version().parse::<u64>().ok());
    if lom.has_copies() {
        if let Err(e) = lom.del_all_copies() {
            warn!(lom = %lom, %e, "failed to drop stale copies");
        }
    }

    if let Some(parent) = Path::new(lom.fqn()).parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Err(e) = std::fs::rename(work_fqn, lom.fqn()) {
        let _ = std::fs::remove_file(work_fqn);
        return Err(e.into());
    }

    lom.set_size(size);
    lom.set_cksum(cksum);
    match prev_version {
        Some(v) => lom.set_version((v + 1).to_string()),
        None => lom.set_version(INITIAL_VERSION),
    }
    lom.persist()?;

    // mirror placement: keep copying while the oracle asks for more
    let mirror = lom.bprops().mirror;
    if mirror.enabled {
        let mut buf = node.bufs.alloc();
        for _ in 0..mirror.copies {
            let (mi, is_hrw) = lom.to_mpath();
            let Some(mi) = mi else { break };
            if is_hrw {
                // freshly written at the HRW location already
                break;
            }
            if let Err(e) = lom.copy(&mi, &mut buf) {
                warn!(lom = %lom, mpath = %mi, %e, "replica placement failed");
                break;
            }
        }
        node.bufs.free(buf);
    }

    drop(guard);
    pool.free(lom);
    Ok(())
}
