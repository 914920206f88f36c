//! The asynchronous work engine: two typed FIFO queues, a pool of conflict
//! workers plus one verification worker, and the shared master-commit
//! cache. The engine is an explicit value so tests can spin up isolated
//! instances; nothing here is process-global.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use db::DBService;
use sqlx::SqlitePool;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info};

use super::{
    config::Settings,
    git_cli::GitCli,
    notify::Notifier,
    webhook::WebhookClient,
    workspace::WorkingCopy,
};

/// One unit of work for the queues.
#[derive(Debug, Clone)]
pub struct Task {
    pub action: TaskAction,
    /// External base URL used in notification links.
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Confirm the request's branch exists upstream and record its tip.
    VerifyBranch { request_id: i64 },
    /// Trial-merge one request against mainline and its release peers.
    TestOne { request_id: i64, requeue: bool },
    /// Re-test every member of a release.
    TestAll { push_id: i64 },
    /// Re-test the members currently marked `conflict-pickme`.
    TestConflicting { push_id: i64 },
}

impl Task {
    pub fn verify(request_id: i64, base_url: impl Into<String>) -> Self {
        Self {
            action: TaskAction::VerifyBranch { request_id },
            base_url: base_url.into(),
        }
    }

    pub fn test_one(request_id: i64, base_url: impl Into<String>, requeue: bool) -> Self {
        Self {
            action: TaskAction::TestOne {
                request_id,
                requeue,
            },
            base_url: base_url.into(),
        }
    }

    pub fn test_all(push_id: i64, base_url: impl Into<String>) -> Self {
        Self {
            action: TaskAction::TestAll { push_id },
            base_url: base_url.into(),
        }
    }

    pub fn test_conflicting(push_id: i64, base_url: impl Into<String>) -> Self {
        Self {
            action: TaskAction::TestConflicting { push_id },
            base_url: base_url.into(),
        }
    }
}

const MASTER_SHA_CACHE_LIMIT: usize = 1000;

/// Memo of commits known to be reachable from mainline. Only positive
/// answers are cached (a commit absent from mainline may get merged
/// later); the whole map is dropped once it outgrows the limit.
#[derive(Clone, Default)]
pub struct MasterShaCache {
    inner: Arc<StdMutex<HashMap<String, ()>>>,
}

impl MasterShaCache {
    pub fn contains(&self, sha: &str) -> bool {
        let mut shas = self.inner.lock().unwrap();
        if shas.len() > MASTER_SHA_CACHE_LIMIT {
            shas.clear();
        }
        shas.contains_key(sha)
    }

    pub fn insert(&self, sha: &str) {
        self.inner.lock().unwrap().insert(sha.to_string(), ());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: Arc<Settings>,
    db: DBService,
    notifier: Arc<dyn Notifier>,
    webhooks: WebhookClient,
    git: GitCli,
    master_shas: MasterShaCache,
    sha_tx: mpsc::UnboundedSender<Task>,
    conflict_tx: mpsc::UnboundedSender<Task>,
    sha_rx: StdMutex<Option<mpsc::UnboundedReceiver<Task>>>,
    conflict_rx: StdMutex<Option<mpsc::UnboundedReceiver<Task>>>,
}

impl Engine {
    pub fn new(settings: Arc<Settings>, db: DBService, notifier: Arc<dyn Notifier>) -> Self {
        let (sha_tx, sha_rx) = mpsc::unbounded_channel();
        let (conflict_tx, conflict_rx) = mpsc::unbounded_channel();
        let webhooks = WebhookClient::new(settings.web_hooks.post_url.clone());
        let git = GitCli::new(settings.main_app.debug);
        Self {
            inner: Arc::new(EngineInner {
                settings,
                db,
                notifier,
                webhooks,
                git,
                master_shas: MasterShaCache::default(),
                sha_tx,
                conflict_tx,
                sha_rx: StdMutex::new(Some(sha_rx)),
                conflict_rx: StdMutex::new(Some(conflict_rx)),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.db.pool
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.inner.notifier.as_ref()
    }

    pub fn webhooks(&self) -> &WebhookClient {
        &self.inner.webhooks
    }

    pub fn git(&self) -> GitCli {
        self.inner.git.clone()
    }

    pub fn master_shas(&self) -> &MasterShaCache {
        &self.inner.master_shas
    }

    /// The working copy owned by the given conflict worker.
    pub fn working_copy(&self, worker_id: usize) -> WorkingCopy {
        WorkingCopy::new(self.git(), self.settings().git.clone(), worker_id)
    }

    /// Dispatch a task to its queue: branch verification has its own
    /// serial queue, everything else goes to the conflict pool. A task
    /// sent to a closed queue is logged and dropped.
    pub fn enqueue(&self, task: Task) {
        let result = match task.action {
            TaskAction::VerifyBranch { .. } => self.inner.sha_tx.send(task),
            _ => self.inner.conflict_tx.send(task),
        };
        if let Err(err) = result {
            error!(task = ?err.0, "attempted to put to a closed git queue, dropping task");
        }
    }

    /// Take the verification queue receiver; `start` consumes it, tests
    /// may take it instead to inspect dispatched tasks.
    pub fn take_sha_queue(&self) -> Option<mpsc::UnboundedReceiver<Task>> {
        self.inner.sha_rx.lock().unwrap().take()
    }

    pub fn take_conflict_queue(&self) -> Option<mpsc::UnboundedReceiver<Task>> {
        self.inner.conflict_rx.lock().unwrap().take()
    }

    /// Spawn the verification worker and the conflict worker pool.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(rx) = self.take_sha_queue() {
            let engine = self.clone();
            handles.push(tokio::spawn(sha_worker(engine, rx)));
        }
        if let Some(rx) = self.take_conflict_queue() {
            let rx = Arc::new(Mutex::new(rx));
            for worker_id in 0..self.settings().git.conflict_threads {
                let engine = self.clone();
                let rx = Arc::clone(&rx);
                handles.push(tokio::spawn(conflict_worker(engine, worker_id, rx)));
            }
        }
        handles
    }
}

const WORKER_THROTTLE: Duration = Duration::from_secs(1);

async fn sha_worker(engine: Engine, mut rx: mpsc::UnboundedReceiver<Task>) {
    info!("starting branch verification worker");
    loop {
        tokio::time::sleep(WORKER_THROTTLE).await;
        let Some(task) = rx.recv().await else {
            info!("verification queue closed, stopping worker");
            break;
        };
        let result = match task.action {
            TaskAction::VerifyBranch { request_id } => engine
                .verify_branch(request_id, &task.base_url)
                .await
                .map_err(anyhow::Error::from),
            ref other => {
                error!(task = ?other, "verification queue received an unexpected task type");
                Ok(())
            }
        };
        if let Err(err) = result {
            error!("verification worker error: {err:#}");
        }
    }
}

async fn conflict_worker(
    engine: Engine,
    worker_id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
) {
    info!(worker_id, "starting conflict worker");
    loop {
        tokio::time::sleep(WORKER_THROTTLE).await;
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            info!(worker_id, "conflict queue closed, stopping worker");
            break;
        };
        if let Err(err) = handle_conflict_task(&engine, worker_id, task).await {
            error!(worker_id, "conflict worker error: {err:#}");
        }
    }
}

async fn handle_conflict_task(
    engine: &Engine,
    worker_id: usize,
    task: Task,
) -> anyhow::Result<()> {
    match task.action {
        TaskAction::TestOne {
            request_id,
            requeue,
        } => {
            engine
                .test_conflicts(worker_id, request_id, &task.base_url, requeue)
                .await?
        }
        TaskAction::TestAll { push_id } => {
            engine
                .requeue_pickmes_for_push(push_id, &task.base_url, false)
                .await?
        }
        TaskAction::TestConflicting { push_id } => {
            engine
                .requeue_pickmes_for_push(push_id, &task.base_url, true)
                .await?
        }
        ref other => {
            error!(task = ?other, "conflict queue received an unexpected task type");
        }
    }
    Ok(())
}
