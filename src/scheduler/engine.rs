//! `Engine` — the run queue worker.
//!
//! Accepts queued runs, caps cross-run parallelism with a semaphore, binds a
//! per-run [`CancellationToken`], and invokes the executor.  The engine's
//! queue handle is what the approval broker and the dependency tracker use
//! to re-enqueue suspended runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::approvals::ApprovalBroker;
use crate::checkpoint::CheckpointStore;
use crate::database::DbPool;
use crate::escalation::{DelegateRunTool, DependencyTracker};
use crate::event_bus::{EventBus, SqliteEventBus};
use crate::memory::MemoryService;
use crate::runs::{QueueError, QueuedRun, RunQueue, RunRepository};
use crate::skills::{SkillCatalog, SkillsGetTool, SkillsListTool};
use crate::tools::ToolRouter;
use crate::{agents::GroupRegistry, ai::ProviderFactory};

use super::executor::{ExecutorDeps, RunExecutor, SchedulerError};
use super::SchedulerConfig;

// ─── QueueHandle ──────────────────────────────────────────────────────────────

/// The engine's [`RunQueue`] implementation: record first, then hand to the
/// worker.
struct QueueHandle {
    tx: mpsc::UnboundedSender<QueuedRun>,
    repo: Arc<RunRepository>,
}

impl RunQueue for QueueHandle {
    fn enqueue(&self, run: QueuedRun) -> Result<(), QueueError> {
        self.repo.create_pending(&run)?;
        self.tx.send(run).map_err(|_| QueueError::Closed)
    }

    fn re_enqueue(&self, run_id: &str) -> Result<(), QueueError> {
        let run = self.repo.load_queued(run_id)?;
        self.tx.send(run).map_err(|_| QueueError::Closed)
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    executor: RunExecutor,
    queue: Arc<dyn RunQueue>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedRun>>>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    semaphore: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Wire up the engine over a shared pool and router.
    ///
    /// Registers the engine-owned builtins on the router: `delegate_run`
    /// (needs the repository and tracker) and the skill discovery tools.
    pub fn new(
        pool: DbPool,
        router: Arc<ToolRouter>,
        memory: Arc<dyn MemoryService>,
        providers: Arc<dyn ProviderFactory>,
        groups: Arc<GroupRegistry>,
        skills: Arc<SkillCatalog>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let repo = Arc::new(RunRepository::new(pool.clone()));
        let queue: Arc<dyn RunQueue> = Arc::new(QueueHandle {
            tx,
            repo: repo.clone(),
        });
        let bus: Arc<dyn EventBus> = Arc::new(SqliteEventBus::new(pool.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(pool.clone()));
        let approvals = Arc::new(ApprovalBroker::new(pool.clone(), queue.clone()));
        let tracker = Arc::new(DependencyTracker::new(pool, queue.clone()));

        router.register(DelegateRunTool::spec(repo.clone(), tracker.clone()));
        router.register(SkillsListTool::spec(skills.clone()));
        router.register(SkillsGetTool::spec(skills.clone()));

        let max_concurrent = config.max_concurrent_runs.max(1);
        let deps = Arc::new(ExecutorDeps {
            repo,
            queue: queue.clone(),
            bus,
            checkpoints,
            router,
            memory,
            providers,
            approvals,
            tracker,
            groups,
            skills,
            config,
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            executor: RunExecutor::new(deps),
            queue,
            rx: Mutex::new(Some(rx)),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            stop_tx,
            stop_rx,
        })
    }

    pub fn queue(&self) -> Arc<dyn RunQueue> {
        self.queue.clone()
    }

    pub fn executor(&self) -> &RunExecutor {
        &self.executor
    }

    pub fn repo(&self) -> &Arc<RunRepository> {
        &self.executor.deps().repo
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.executor.deps().bus
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.executor.deps().approvals
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.executor.deps().tracker
    }

    /// Queue a new run.
    pub fn submit(&self, run: QueuedRun) -> Result<(), QueueError> {
        self.queue.enqueue(run)
    }

    /// Start the worker loop.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.rx.lock().ok().and_then(|mut guard| guard.take()) else {
            log::warn!("engine worker already started");
            return;
        };
        let executor = self.executor.clone();
        let semaphore = self.semaphore.clone();
        let cancellations = self.cancellations.clone();
        let mut stop_rx = self.stop_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_run = rx.recv() => {
                        let Some(run) = maybe_run else { break };
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let token = CancellationToken::new();
                        if let Ok(mut map) = cancellations.lock() {
                            map.insert(run.run_id.clone(), token.clone());
                        }
                        let executor = executor.clone();
                        let cancellations = cancellations.clone();
                        tokio::spawn(async move {
                            let run_id = run.run_id.clone();
                            match executor.execute(run, token).await {
                                Ok(status) => {
                                    log::info!("run {run_id} settled as {status}");
                                }
                                Err(e) => {
                                    log::error!("run {run_id} executor error: {e}");
                                }
                            }
                            if let Ok(mut map) = cancellations.lock() {
                                map.remove(&run_id);
                            }
                            drop(permit);
                        });
                    }
                    result = stop_rx.changed() => {
                        if result.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("engine worker stopped");
        });
    }

    /// Stop accepting work (in-flight runs finish on their own).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Cancel a run.  Idempotent: cancelling a terminal run is a no-op
    /// returning `false`.
    pub fn cancel_run(&self, run_id: &str) -> Result<bool, SchedulerError> {
        let repo = &self.executor.deps().repo;
        if let Some(record) = repo.get(run_id)?
            && record.status.is_terminal()
        {
            return Ok(false);
        }
        let token = self
            .cancellations
            .lock()
            .ok()
            .and_then(|map| map.get(run_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            // Not in flight: flip the record directly (pending or parked).
            None => Ok(repo.cancel(run_id)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ai::{LlmConfig, LlmProvider, ProviderError};
    use crate::memory::InMemoryStore;
    use crate::runs::{RunStatus, Scope};
    use crate::security::ToolPolicy;
    use crate::tools::ToolRegistry;

    use super::*;

    struct NoProviderFactory;

    impl ProviderFactory for NoProviderFactory {
        fn create(&self, config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
            Err(ProviderError::UnsupportedProvider(config.provider.clone()))
        }
    }

    fn engine() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::database::init_at(&dir.path().join("engine.db")).unwrap();
        let router = Arc::new(ToolRouter::new(
            ToolRegistry::new(),
            Arc::new(ToolPolicy::default()),
        ));
        let engine = Engine::new(
            pool,
            router,
            Arc::new(InMemoryStore::new()),
            Arc::new(NoProviderFactory),
            Arc::new(GroupRegistry::new()),
            Arc::new(SkillCatalog::new()),
            SchedulerConfig::default(),
        );
        (engine, dir)
    }

    #[tokio::test]
    async fn submit_records_pending_run() {
        let (engine, _dir) = engine();
        let run = QueuedRun::new(Scope::new("org-1", "user-1"), "sess-1", "task");
        let run_id = run.run_id.clone();
        engine.submit(run).unwrap();

        let record = engine.repo().get(&run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_pending_run_without_worker() {
        let (engine, _dir) = engine();
        let run = QueuedRun::new(Scope::new("org-1", "user-1"), "sess-1", "task");
        let run_id = run.run_id.clone();
        engine.submit(run).unwrap();

        assert!(engine.cancel_run(&run_id).unwrap());
        let record = engine.repo().get(&run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);

        // Idempotent on a terminal run.
        assert!(!engine.cancel_run(&run_id).unwrap());
    }

    #[tokio::test]
    async fn provider_failure_settles_run_as_failed() {
        let (engine, _dir) = engine();
        engine.start();
        let run = QueuedRun::new(Scope::new("org-1", "user-1"), "sess-1", "task");
        let run_id = run.run_id.clone();
        engine.submit(run).unwrap();

        // Poll until the worker settles the run.
        for _ in 0..100 {
            if let Some(record) = engine.repo().get(&run_id).unwrap()
                && record.status.is_terminal()
            {
                assert_eq!(record.status, RunStatus::Failed);
                assert_eq!(record.error.unwrap().code, "EXECUTOR_ERROR");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run never settled");
    }

    #[tokio::test]
    async fn delegate_tool_is_registered() {
        let (engine, _dir) = engine();
        let catalog = engine.executor().deps().router.catalog();
        assert!(catalog.iter().any(|t| t.name == "delegate_run"));
    }
}
