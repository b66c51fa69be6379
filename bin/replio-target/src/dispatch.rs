//! Async bucket-task dispatcher
//!
//! `POST /v1/buckets/{bucket}` drives background list/summary tasks
//! through the query-parameterized start/poll/result protocol. A list
//! task that retired between renewal and the wait is renewed exactly
//! once. Also exposes transport statistics and a liveness probe.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use replio_common::{
    ActionMsg, Bck, Result, SelectMsg, ACT_LIST_OBJECTS, ACT_SUMMARY_BUCKET, TASK_RESULT,
    TASK_START,
};
use replio_lom::{LomPool, Node};
use replio_task::{SummaryProgress, TaskCtx, Xact, XactRegistry};
use replio_transport::Registry;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state for the target's HTTP handlers
#[derive(Clone)]
pub struct TargetState {
    pub node: Arc<Node>,
    pub pool: Arc<LomPool>,
    pub xreg: Arc<XactRegistry>,
    pub tasks: TaskCtx,
    pub transport: Arc<Registry>,
}

/// Build the dispatcher router
pub fn router(state: TargetState) -> Router {
    Router::new()
        .route("/v1/buckets/{bucket}", post(bucket_handler))
        .route("/v1/transport-stats/{network}", get(transport_stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TaskQuery {
    #[serde(default, rename = "taskAction")]
    task_action: String,
    #[serde(default)]
    silent: Option<String>,
    #[serde(default, rename = "callerID")]
    caller_id: String,
}

impl TaskQuery {
    fn is_silent(&self) -> bool {
        matches!(self.silent.as_deref(), Some("true") | Some("1"))
    }
}

fn err_response(status: u16, msg: String, silent: bool) -> Response {
    if !silent {
        warn!(status, %msg, "request failed");
    }
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, msg).into_response()
}

async fn bucket_handler(
    State(state): State<TargetState>,
    Path(bucket): Path<String>,
    Query(query): Query<TaskQuery>,
    Json(amsg): Json<ActionMsg>,
) -> Response {
    let silent = query.is_silent();
    let smsg: SelectMsg = match serde_json::from_value(amsg.value.clone()) {
        Ok(msg) => msg,
        Err(e) => {
            return err_response(400, format!("unable to unmarshal 'value' in request: {e}"), silent)
        }
    };
    let Some((bck, _)) = state.tasks.buckets.get(&bucket) else {
        return err_response(404, format!("bucket not found: {bucket}"), silent);
    };
    if !query.caller_id.is_empty() {
        debug!(caller = %query.caller_id, %bck, action = %amsg.action, "async bucket request");
    }

    if query.task_action == TASK_START {
        return match amsg.action.as_str() {
            ACT_LIST_OBJECTS => start_list(&state, &bck, &smsg, silent).await,
            ACT_SUMMARY_BUCKET => match state.xreg.renew_bck_summary(&state.tasks, &bck, &smsg) {
                Ok(_) => StatusCode::ACCEPTED.into_response(),
                Err(e) => err_response(e.http_status_code(), e.to_string(), silent),
            },
            other => err_response(400, format!("invalid action: {other}"), false),
        };
    }

    // poll / collect
    let Some(xact) = state.xreg.get(&smsg.uuid) else {
        return err_response(404, format!("task {} not found", smsg.uuid), silent);
    };
    match (amsg.action.as_str(), xact) {
        (ACT_LIST_OBJECTS, Xact::List(task)) => {
            task.inc_pending();
            match task.list(&query.task_action, smsg).await {
                Err(e) => err_response(e.http_status_code(), e.to_string(), silent),
                Ok(resp) if query.task_action == TASK_RESULT => {
                    let list = resp.list.unwrap_or_default();
                    debug_assert!(!list.uuid.is_empty());
                    Json(list).into_response()
                }
                Ok(resp) => StatusCode::from_u16(resp.status)
                    .unwrap_or(StatusCode::OK)
                    .into_response(),
            }
        }
        (ACT_LIST_OBJECTS, _) => {
            // never silent
            err_response(400, format!("{} is not a bucket list task", smsg.uuid), false)
        }
        (_, Xact::Summary(task)) => match task.progress() {
            SummaryProgress::Running => StatusCode::ACCEPTED.into_response(),
            SummaryProgress::Failed { bucket_gone: true, msg } => err_response(410, msg, silent),
            SummaryProgress::Failed { bucket_gone: false, msg } => err_response(500, msg, silent),
            SummaryProgress::Done(summary) if query.task_action == TASK_RESULT => {
                Json(summary).into_response()
            }
            SummaryProgress::Done(_) => StatusCode::OK.into_response(),
        },
        (other, _) => err_response(400, format!("invalid action: {other}"), false),
    }
}

async fn start_list(state: &TargetState, bck: &Bck, smsg: &SelectMsg, silent: bool) -> Response {
    match start_list_once(state, bck, smsg).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) if e.is_gone() => {
            // the task retired between renew and wait; retry exactly once
            match start_list_once(state, bck, smsg).await {
                Ok(()) => StatusCode::ACCEPTED.into_response(),
                Err(e) => err_response(e.http_status_code(), e.to_string(), silent),
            }
        }
        Err(e) => err_response(e.http_status_code(), e.to_string(), silent),
    }
}

async fn start_list_once(state: &TargetState, bck: &Bck, smsg: &SelectMsg) -> Result<()> {
    let task = state.xreg.renew_bck_list(&state.tasks, bck, smsg)?;
    task.inc_pending();
    task.list(TASK_START, smsg.clone()).await.map(|_| ())
}

async fn transport_stats_handler(
    State(state): State<TargetState>,
    Path(network): Path<String>,
) -> Response {
    match state.transport.network_stats(&network) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn health_handler(State(state): State<TargetState>) -> Response {
    if state.node.fs.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no mountpaths").into_response()
    } else {
        (StatusCode::OK, "OK").into_response()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::ingest::ObjectIngest;
    use replio_common::{Bprops, BucketRegistry, MirrorConf};
    use replio_fs::MountpathRegistry;
    use replio_transport::NETWORK_PUBLIC;
    use tempfile::TempDir;

    pub struct TestState {
        pub node: Arc<Node>,
        pub pool: Arc<LomPool>,
        pub xreg: Arc<XactRegistry>,
        pub tasks: TaskCtx,
        pub transport: Arc<Registry>,
        pub bck: Bck,
    }

    impl TestState {
        pub fn target(&self) -> TargetState {
            TargetState {
                node: Arc::clone(&self.node),
                pool: Arc::clone(&self.pool),
                xreg: Arc::clone(&self.xreg),
                tasks: self.tasks.clone(),
                transport: Arc::clone(&self.transport),
            }
        }
    }

    /// A target with `n` mountpaths and one bucket ("data"), transport
    /// endpoint registered and all.
    pub fn test_state(n: usize, mirrored: bool) -> (TempDir, TestState) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let fs = Arc::new(MountpathRegistry::new());
        for i in 0..n {
            fs.add(&format!("{root}/mp{i}")).unwrap();
        }
        let buckets = Arc::new(BucketRegistry::new());
        let props = Bprops {
            mirror: MirrorConf { enabled: mirrored, copies: 2 },
            ..Bprops::default()
        };
        let bck = buckets.add("data", props);

        let node = Node::new(Arc::clone(&fs), Arc::clone(&buckets));
        let pool = Arc::new(LomPool::new());
        let transport = Arc::new(Registry::new());
        transport.set_mux(NETWORK_PUBLIC);
        transport
            .register(
                NETWORK_PUBLIC,
                "obj",
                Arc::new(ObjectIngest::new(Arc::clone(&node), Arc::clone(&pool))),
            )
            .unwrap();
        let xreg = Arc::new(XactRegistry::new());
        let tasks = TaskCtx { fs, buckets };
        (dir, TestState { node, pool, xreg, tasks, transport, bck })
    }
}
