//! The bucket summary task
//!
//! Spawned once per UUID, runs to completion in the background, and
//! keeps its result for polling: 202 while running, the summary JSON
//! once done, 410 when the bucket disappeared underneath it.

use crate::bcklist::walk_bucket;
use crate::TaskCtx;
use parking_lot::Mutex;
use replio_common::{Bck, BucketSummary, Error, SelectMsg};
use std::sync::Arc;
use tracing::debug;

/// Observable state of a summary task
#[derive(Clone, Debug)]
pub enum SummaryProgress {
    Running,
    Done(BucketSummary),
    Failed { bucket_gone: bool, msg: String },
}

/// Background bucket summary task
pub struct BckSummaryTask {
    uuid: String,
    bck: Bck,
    state: Mutex<SummaryProgress>,
}

impl BckSummaryTask {
    pub(crate) fn spawn(ctx: TaskCtx, bck: Bck, uuid: String) -> Arc<Self> {
        let task = Arc::new(Self { uuid, bck, state: Mutex::new(SummaryProgress::Running) });
        let worker = Arc::clone(&task);
        tokio::spawn(async move {
            let result = worker.compute(&ctx);
            *worker.state.lock() = result;
            debug!(uuid = %worker.uuid, bck = %worker.bck, "summary task finished");
        });
        task
    }

    fn compute(&self, ctx: &TaskCtx) -> SummaryProgress {
        if ctx.buckets.get(&self.bck.name).is_none() {
            let err = Error::BucketNought(self.bck.to_string());
            return SummaryProgress::Failed { bucket_gone: true, msg: err.to_string() };
        }
        let everything = SelectMsg { page_size: usize::MAX, ..SelectMsg::default() };
        match walk_bucket(&ctx.fs, &self.bck, &everything) {
            Ok(entries) => SummaryProgress::Done(BucketSummary {
                name: self.bck.name.clone(),
                provider: self.bck.provider.clone(),
                objects: entries.len() as u64,
                size: entries.iter().map(|e| e.size).sum(),
            }),
            Err(e) => SummaryProgress::Failed { bucket_gone: false, msg: e.to_string() },
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn bck(&self) -> &Bck {
        &self.bck
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        !matches!(*self.state.lock(), SummaryProgress::Running)
    }

    #[must_use]
    pub fn progress(&self) -> SummaryProgress {
        self.state.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::XactRegistry;
    use replio_common::{Bprops, BucketRegistry};
    use replio_fs::{MountpathRegistry, CT_OBJ};
    use std::path::Path;
    use tempfile::TempDir;

    async fn wait_finished(task: &BckSummaryTask) {
        for _ in 0..1000 {
            if task.finished() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("summary task did not finish");
    }

    fn ctx_with_objects(objects: &[(&str, usize)]) -> (TempDir, TaskCtx, Bck) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let fs = Arc::new(MountpathRegistry::new());
        let mi = fs.add(&format!("{root}/mp0")).unwrap();
        let buckets = Arc::new(BucketRegistry::new());
        let bck = buckets.add("data", Bprops::default());
        for (name, size) in objects {
            let fqn = mi.make_path_fqn(&bck, CT_OBJ, name);
            std::fs::create_dir_all(Path::new(&fqn).parent().unwrap()).unwrap();
            std::fs::write(&fqn, vec![0u8; *size]).unwrap();
        }
        (dir, TaskCtx { fs, buckets }, bck)
    }

    #[tokio::test]
    async fn test_summary_counts_and_sizes() {
        let (_dir, ctx, bck) = ctx_with_objects(&[("a", 10), ("b", 20), ("c/d", 5)]);
        let reg = XactRegistry::new();
        let msg = SelectMsg { uuid: "s1".into(), ..SelectMsg::default() };
        let task = reg.renew_bck_summary(&ctx, &bck, &msg).unwrap();

        wait_finished(&task).await;
        match task.progress() {
            SummaryProgress::Done(summary) => {
                assert_eq!(summary.name, "data");
                assert_eq!(summary.objects, 3);
                assert_eq!(summary.size, 35);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_summary_bucket_gone() {
        let (_dir, ctx, bck) = ctx_with_objects(&[("a", 1)]);
        ctx.buckets.remove("data");
        let reg = XactRegistry::new();
        let msg = SelectMsg { uuid: "s1".into(), ..SelectMsg::default() };
        let task = reg.renew_bck_summary(&ctx, &bck, &msg).unwrap();

        wait_finished(&task).await;
        match task.progress() {
            SummaryProgress::Failed { bucket_gone, .. } => assert!(bucket_gone),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renew_returns_existing_summary() {
        let (_dir, ctx, bck) = ctx_with_objects(&[]);
        let reg = XactRegistry::new();
        let msg = SelectMsg { uuid: "s1".into(), ..SelectMsg::default() };
        let t1 = reg.renew_bck_summary(&ctx, &bck, &msg).unwrap();
        let t2 = reg.renew_bck_summary(&ctx, &bck, &msg).unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
    }
}
