//! Replio Task - background bucket tasks (xactions)
//!
//! Tasks are addressed by client-chosen UUID and owned by the
//! `XactRegistry`. A list-objects task serves pages over a rendezvous
//! request/reply channel and retires after an idle period; a retired
//! task surfaces `TaskGone`, which the dispatcher resolves by renewing
//! exactly once. Summary tasks run to completion and hold their result.

pub mod bcklist;
pub mod summary;

pub use bcklist::{BckListTask, ListResp};
pub use summary::{BckSummaryTask, SummaryProgress};

use parking_lot::RwLock;
use replio_common::{Bck, BucketRegistry, Error, Result, SelectMsg};
use replio_fs::MountpathRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// What tasks need from the node
#[derive(Clone)]
pub struct TaskCtx {
    pub fs: Arc<MountpathRegistry>,
    pub buckets: Arc<BucketRegistry>,
}

/// A registered background task
#[derive(Clone)]
pub enum Xact {
    List(Arc<BckListTask>),
    Summary(Arc<BckSummaryTask>),
}

impl Xact {
    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::List(t) => t.uuid(),
            Self::Summary(t) => t.uuid(),
        }
    }
}

/// Registry of background tasks, keyed by UUID
#[derive(Default)]
pub struct XactRegistry {
    entries: RwLock<HashMap<String, Xact>>,
}

impl XactRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Xact> {
        self.entries.read().get(uuid).cloned()
    }

    /// Return the live list task with this UUID, or create one.
    /// A retired (gone) task is replaced.
    pub fn renew_bck_list(
        &self,
        ctx: &TaskCtx,
        bck: &Bck,
        msg: &SelectMsg,
    ) -> Result<Arc<BckListTask>> {
        if msg.uuid.is_empty() {
            return Err(Error::invalid_request("list-objects requires a uuid"));
        }
        let mut entries = self.entries.write();
        if let Some(Xact::List(task)) = entries.get(&msg.uuid) {
            if !task.gone() {
                return Ok(Arc::clone(task));
            }
        }
        let task = BckListTask::spawn(ctx.clone(), bck.clone(), msg.uuid.clone());
        entries.insert(msg.uuid.clone(), Xact::List(Arc::clone(&task)));
        Ok(task)
    }

    /// Return the summary task with this UUID, or create one
    pub fn renew_bck_summary(
        &self,
        ctx: &TaskCtx,
        bck: &Bck,
        msg: &SelectMsg,
    ) -> Result<Arc<BckSummaryTask>> {
        if msg.uuid.is_empty() {
            return Err(Error::invalid_request("bucket summary requires a uuid"));
        }
        let mut entries = self.entries.write();
        if let Some(Xact::Summary(task)) = entries.get(&msg.uuid) {
            return Ok(Arc::clone(task));
        }
        let task = BckSummaryTask::spawn(ctx.clone(), bck.clone(), msg.uuid.clone());
        entries.insert(msg.uuid.clone(), Xact::Summary(Arc::clone(&task)));
        Ok(task)
    }
}
