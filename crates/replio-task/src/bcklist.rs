//! The list-objects task
//!
//! Runs in the background and answers `(action, msg)` requests over an
//! unbuffered rendezvous: the caller sends a request with a one-shot
//! reply slot and waits for exactly one response, or for the task to
//! disappear. A task idle past [`IDLE_TIMEOUT`] retires; subsequent
//! requests fail with `TaskGone` and the caller renews.

use crate::TaskCtx;
use replio_common::{
    Bck, BucketEntry, BucketList, Error, Result, SelectMsg, TASK_RESULT, TASK_START, TASK_STATUS,
};
use replio_fs::{MountpathRegistry, CT_OBJ};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A task with no pending requests for this long retires
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One response of the rendezvous protocol
#[derive(Clone, Debug)]
pub struct ListResp {
    pub list: Option<BucketList>,
    pub status: u16,
}

struct ListReq {
    action: String,
    msg: SelectMsg,
    reply: oneshot::Sender<Result<ListResp>>,
}

/// Background list-objects task
pub struct BckListTask {
    uuid: String,
    bck: Bck,
    tx: mpsc::Sender<ListReq>,
    pending: AtomicU32,
    finished: AtomicBool,
    gone: AtomicBool,
}

impl BckListTask {
    pub(crate) fn spawn(ctx: TaskCtx, bck: Bck, uuid: String) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let task = Arc::new(Self {
            uuid,
            bck,
            tx,
            pending: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        });
        tokio::spawn(run(ctx, Arc::clone(&task), rx));
        task
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn bck(&self) -> &Bck {
        &self.bck
    }

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Whether the task retired (evicted after idling)
    #[must_use]
    pub fn gone(&self) -> bool {
        self.gone.load(Ordering::Relaxed)
    }

    /// Send one request and wait for its single response. Surfaces
    /// [`Error::TaskGone`] when the task disappeared in between.
    pub async fn list(&self, action: &str, msg: SelectMsg) -> Result<ListResp> {
        let (reply, wait) = oneshot::channel();
        let req = ListReq { action: action.to_string(), msg, reply };
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::TaskGone(self.uuid.clone()))?;
        wait.await.map_err(|_| Error::TaskGone(self.uuid.clone()))?
    }

    fn handle(&self, ctx: &TaskCtx, action: &str, msg: &SelectMsg) -> Result<ListResp> {
        match action {
            TASK_START => Ok(ListResp { list: None, status: 202 }),
            TASK_STATUS => Ok(ListResp {
                list: None,
                status: if self.finished() { 200 } else { 202 },
            }),
            TASK_RESULT => {
                if ctx.buckets.get(&self.bck.name).is_none() {
                    return Err(Error::BucketNought(self.bck.to_string()));
                }
                let entries = walk_bucket(&ctx.fs, &self.bck, msg)?;
                self.finished.store(true, Ordering::Relaxed);
                Ok(ListResp {
                    list: Some(BucketList { uuid: self.uuid.clone(), entries }),
                    status: 200,
                })
            }
            _ => Err(Error::invalid_request(format!("invalid task action: {action}"))),
        }
    }
}

async fn run(ctx: TaskCtx, task: Arc<BckListTask>, mut rx: mpsc::Receiver<ListReq>) {
    loop {
        let req = match tokio::time::timeout(IDLE_TIMEOUT, rx.recv()).await {
            Err(_) if task.pending() == 0 => break, // idle, retire
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(req)) => req,
        };
        let resp = task.handle(&ctx, &req.action, &req.msg);
        task.dec_pending();
        // the peer may have stopped waiting; that is its problem
        let _ = req.reply.send(resp);
    }
    task.gone.store(true, Ordering::Relaxed);
    debug!(uuid = %task.uuid, bck = %task.bck, "list task retired");
}

/// Union of the bucket's objects across available mountpaths, sorted by
/// name, filtered by prefix, truncated to the page size.
pub(crate) fn walk_bucket(
    fs: &MountpathRegistry,
    bck: &Bck,
    msg: &SelectMsg,
) -> Result<Vec<BucketEntry>> {
    let mut names: BTreeMap<String, u64> = BTreeMap::new();
    for mi in fs.get_avail().values() {
        let cdir = mi.make_path_cdir(CT_OBJ, bck);
        collect(Path::new(&cdir), Path::new(&cdir), &mut names)?;
    }
    Ok(names
        .into_iter()
        .filter(|(name, _)| name.starts_with(&msg.prefix))
        .take(msg.limit())
        .map(|(name, size)| BucketEntry { name, size })
        .collect())
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<String, u64>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let name = rel.to_string_lossy().into_owned();
            out.entry(name).or_insert(meta.len());
        }
    }
    Ok(())
}
