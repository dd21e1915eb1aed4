//! `RunExecutor` — drives one queued run end to end.
//!
//! The executor owns every run state transition: it marks the run running,
//! consumes the runner's event channel (persisting and broadcasting, with
//! token batching), turns terminal events into repository updates, turns
//! suspension outcomes into `suspended`/`waiting`, and replays held tool
//! outcomes on resume.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentRunner, EventSink, ResumeOutcome, ResumeState, RunOutcome, Suspension,
};
use crate::agents::{GROUP_AGENT, GroupResume, SerialOrchestrator, parse_progress_tag};
use crate::approvals::{ApprovalBroker, ApprovalError, DecidedApproval};
use crate::checkpoint::CheckpointStore;
use crate::escalation::{DependencyTracker, EscalationError, SettledDependency};
use crate::event_bus::{ErrorInfo, EventBus, EventBusError, EventPayload, RunEvent};
use crate::memory::MemoryService;
use crate::runs::{
    QueueError, QueuedRun, RunQueue, RunRepository, RunStatus, RunStoreError, SuspendReason,
};
use crate::security::AgentContext;
use crate::skills::SkillCatalog;
use crate::tools::{ToolCallContext, ToolRouter};
use crate::{agents::GroupRegistry, ai::ProviderFactory};

use super::SchedulerConfig;

/// Tokens buffered before a durable `append_batch` flush.
pub const TOKEN_EVENT_BATCH_SIZE: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] RunStoreError),

    #[error(transparent)]
    Bus(#[from] EventBusError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("executor error: {0}")]
    Internal(String),
}

/// Everything the executor needs, shared across runs.
pub struct ExecutorDeps {
    pub repo: Arc<RunRepository>,
    pub queue: Arc<dyn RunQueue>,
    pub bus: Arc<dyn EventBus>,
    pub checkpoints: Arc<CheckpointStore>,
    pub router: Arc<ToolRouter>,
    pub memory: Arc<dyn MemoryService>,
    pub providers: Arc<dyn ProviderFactory>,
    pub approvals: Arc<ApprovalBroker>,
    pub tracker: Arc<DependencyTracker>,
    pub groups: Arc<GroupRegistry>,
    pub skills: Arc<SkillCatalog>,
    pub config: SchedulerConfig,
}

#[derive(Clone)]
pub struct RunExecutor {
    deps: Arc<ExecutorDeps>,
}

struct ConsumeState {
    token_buf: Vec<RunEvent>,
    terminal: Option<RunStatus>,
}

impl RunExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &ExecutorDeps {
        &self.deps
    }

    /// Execute (or resume) one queued run to its next stable state.
    #[tracing::instrument(
        name = "scheduler.execute",
        skip_all,
        fields(run_id = %queued.run_id, group = queued.group_id.as_deref().unwrap_or("-"))
    )]
    pub async fn execute(
        &self,
        queued: QueuedRun,
        cancel: CancellationToken,
    ) -> Result<RunStatus, SchedulerError> {
        let deps = &self.deps;
        let run_id = queued.run_id.clone();

        if cancel.is_cancelled() {
            deps.repo.cancel(&run_id)?;
            return Ok(RunStatus::Cancelled);
        }

        // Effective model configuration; request overrides default.
        let llm = deps
            .config
            .default_llm
            .resolved_with(queued.llm_config.as_ref());

        // Router shared across runs; per-run scope rides in the agent context.
        deps.router.refresh_skills(&deps.skills);
        if let Err(e) = deps.router.refresh_external().await {
            log::warn!("external tool refresh failed for run {run_id}: {e}");
        }

        let record = deps
            .repo
            .get(&run_id)?
            .ok_or(RunStoreError::NotFound(run_id.clone()))?;
        let resuming = matches!(record.status, RunStatus::Suspended | RunStatus::Waiting);
        let suspend_reason = record.suspend_reason;
        deps.repo.mark_running(&run_id)?;

        let provider = match deps.providers.create(&llm) {
            Ok(provider) => provider,
            Err(e) => {
                let error = ErrorInfo::new("EXECUTOR_ERROR", format!("provider setup failed: {e}"));
                self.record_failure(&queued, &error)?;
                return Ok(RunStatus::Failed);
            }
        };

        // Replay a held outcome when re-entering after a suspension.
        let replayed = if resuming {
            match self.build_replay(&queued).await {
                Ok(Some(outcome)) => Some(outcome),
                Ok(None) => {
                    // Spurious re-enqueue: nothing to replay, park it again.
                    log::warn!("run {run_id} re-enqueued without a decided outcome");
                    match suspend_reason {
                        Some(SuspendReason::AwaitingChild) => {
                            deps.repo.mark_waiting(&run_id)?;
                            return Ok(RunStatus::Waiting);
                        }
                        _ => {
                            deps.repo.suspend(&run_id)?;
                            return Ok(RunStatus::Suspended);
                        }
                    }
                }
                Err(e) => {
                    let error =
                        ErrorInfo::new("EXECUTOR_ERROR", format!("resume failed: {e}"));
                    self.record_failure(&queued, &error)?;
                    return Ok(RunStatus::Failed);
                }
            }
        } else {
            None
        };

        // Spawn the runner; events flow through the channel until it closes.
        let (event_tx, mut event_rx) = mpsc::channel::<RunEvent>(256);
        let runner_cancel = cancel.child_token();
        let handle = self.spawn_runner(&queued, provider, llm, replayed, event_tx, runner_cancel.clone());

        let mut state = ConsumeState {
            token_buf: Vec::new(),
            terminal: None,
        };
        let deadline = deps
            .config
            .run_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let mut cancelled_mid_flight = false;
        let mut timed_out = false;
        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => match maybe_event {
                    None => break,
                    Some(event) => self.handle_event(&queued, event, &mut state)?,
                },
                _ = cancel.cancelled() => {
                    cancelled_mid_flight = true;
                    break;
                }
                _ = wall_clock(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }
        self.flush_tokens(&mut state)?;

        if timed_out {
            drop(event_rx);
            runner_cancel.cancel();
            let _ = tokio::time::timeout(deps.config.cancel_grace, handle).await;
            if let Some(terminal) = state.terminal {
                return Ok(terminal);
            }
            let error = ErrorInfo::new("EXECUTOR_ERROR", "run exceeded the wall-clock limit");
            self.fail_running(&queued, &error)?;
            return Ok(RunStatus::Failed);
        }

        if cancelled_mid_flight {
            // The run may have crossed the finish line just before the
            // cancel landed; cancel is then a no-op on the terminal record.
            if let Some(terminal) = state.terminal {
                return Ok(terminal);
            }
            // Stop forwarding events; give the runner a bounded grace period
            // to observe the token, then record the terminal state anyway.
            drop(event_rx);
            runner_cancel.cancel();
            if tokio::time::timeout(deps.config.cancel_grace, handle)
                .await
                .is_err()
            {
                log::warn!("run {run_id} ignored cancellation past the grace period");
            }
            deps.repo.cancel(&run_id)?;
            return Ok(RunStatus::Cancelled);
        }

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error =
                    ErrorInfo::new("EXECUTOR_ERROR", format!("runner task failed: {e}"));
                if state.terminal.is_none() {
                    self.fail_running(&queued, &error)?;
                }
                return Ok(RunStatus::Failed);
            }
        };

        let final_status = match outcome {
            RunOutcome::Completed { ref output, .. } => {
                // Group runs deposit an episodic summary of the synthesis.
                if queued.group_id.is_some()
                    && let Err(e) = deps
                        .memory
                        .deposit_episode(&queued.scope, &run_id, output)
                        .await
                {
                    log::warn!("episodic deposit failed for run {run_id}: {e}");
                }
                RunStatus::Completed
            }
            RunOutcome::Failed { ref code, ref message } => {
                // The runner normally emits run.failed itself; cover the
                // paths that could not (e.g. a checkpoint write failure).
                if state.terminal.is_none() {
                    let error = ErrorInfo::new(code.clone(), message.clone());
                    self.fail_running(&queued, &error)?;
                }
                RunStatus::Failed
            }
            RunOutcome::Cancelled => {
                deps.repo.cancel(&run_id)?;
                RunStatus::Cancelled
            }
            RunOutcome::Suspended(Suspension::AwaitingApproval { .. }) => {
                // The approval row was created when the event came through.
                deps.repo.suspend(&run_id)?;
                RunStatus::Suspended
            }
            RunOutcome::Suspended(Suspension::AwaitingChild {
                ref child_run_id, ..
            }) => {
                // Park the parent first, then release the pending child to
                // the worker — its terminal state must find the parent in
                // `waiting`.
                deps.repo.mark_waiting(&run_id)?;
                deps.queue.re_enqueue(child_run_id)?;
                RunStatus::Waiting
            }
        };

        // A terminal child wakes its waiting parent.
        if final_status.is_terminal() && queued.parent_run_id.is_some() {
            let (output, error) = match &outcome {
                RunOutcome::Completed { output, .. } => (Some(output.clone()), None),
                RunOutcome::Failed { message, .. } => (None, Some(message.clone())),
                _ => (None, None),
            };
            deps.tracker.on_child_terminal(
                &run_id,
                final_status,
                output.as_deref(),
                error.as_deref(),
            )?;
        }

        Ok(final_status)
    }

    // ── Runner spawning ──────────────────────────────────────────────────

    fn spawn_runner(
        &self,
        queued: &QueuedRun,
        provider: Arc<dyn crate::ai::LlmProvider>,
        llm: crate::ai::LlmConfig,
        replayed: Option<Replay>,
        event_tx: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<RunOutcome> {
        let deps = self.deps.clone();
        let queued = queued.clone();

        if queued.group_id.is_some() {
            let group_resume = replayed.and_then(Replay::into_group);
            tokio::spawn(async move {
                let orchestrator = SerialOrchestrator::new(
                    provider,
                    deps.router.clone(),
                    deps.memory.clone(),
                    deps.checkpoints.clone(),
                    deps.groups.clone(),
                    deps.config.runner.clone(),
                    llm,
                );
                let sink = EventSink::new(event_tx, &queued.run_id, queued.agent_id.clone());
                orchestrator.run(&queued, &sink, group_resume, &cancel).await
            })
        } else {
            let single_resume = replayed.and_then(Replay::into_single);
            tokio::spawn(async move {
                let runner = AgentRunner::new(
                    provider,
                    deps.router.clone(),
                    deps.memory.clone(),
                    deps.checkpoints.clone(),
                    deps.config.runner.clone(),
                    llm,
                    deps.config.default_system_prompt.clone(),
                );
                let ctx = AgentContext::new(
                    &queued.run_id,
                    &queued.session_key,
                    queued.scope.clone(),
                    &queued.agent_id,
                )
                .with_delegated(queued.delegated_permissions.clone());
                let sink = EventSink::new(event_tx, &queued.run_id, &queued.agent_id);
                let input = match single_resume {
                    Some(_) => None,
                    None => Some(queued.input.as_str()),
                };
                runner
                    .run(&ctx, input, Vec::new(), single_resume, &sink, &cancel)
                    .await
            })
        }
    }

    // ── Event consumption ────────────────────────────────────────────────

    fn handle_event(
        &self,
        queued: &QueuedRun,
        event: RunEvent,
        state: &mut ConsumeState,
    ) -> Result<(), SchedulerError> {
        let deps = &self.deps;
        let run_id = &queued.run_id;

        // Tokens: broadcast live immediately, persist in batches.
        if event.is_token() {
            deps.bus.broadcast_to_run(run_id, &event);
            state.token_buf.push(event);
            if state.token_buf.len() >= deps.config.token_batch_size {
                self.flush_tokens(state)?;
            }
            return Ok(());
        }

        // Any non-token event flushes buffered tokens first, keeping token
        // durability ahead of the step.completed that covers them.
        self.flush_tokens(state)?;

        match &event.payload {
            EventPayload::RunCompleted { output, .. } => {
                deps.repo.complete(run_id, output, &event)?;
                state.terminal = Some(RunStatus::Completed);
            }
            EventPayload::RunFailed { error } => {
                if error.code == "RUN_CANCELLED" {
                    deps.repo.cancel(run_id)?;
                    state.terminal = Some(RunStatus::Cancelled);
                } else {
                    deps.repo.fail(run_id, error, &event)?;
                    state.terminal = Some(RunStatus::Failed);
                }
            }
            EventPayload::ToolRequiresApproval {
                tool_name,
                tool_call_id,
                args,
                reason,
                risk_level,
            } => {
                deps.bus.append(&event)?;
                deps.approvals.create(
                    run_id,
                    tool_call_id,
                    tool_name,
                    args,
                    *risk_level,
                    reason,
                )?;
            }
            _ => deps.bus.append(&event)?,
        }

        deps.bus.broadcast_to_run(run_id, &event);
        Ok(())
    }

    fn flush_tokens(&self, state: &mut ConsumeState) -> Result<(), SchedulerError> {
        if state.token_buf.is_empty() {
            return Ok(());
        }
        self.deps.bus.append_batch(&state.token_buf)?;
        state.token_buf.clear();
        Ok(())
    }

    // ── Resume assembly ──────────────────────────────────────────────────

    /// Build the replayed outcome for a suspended/waiting run: execute the
    /// approved call, or carry the rejection, or carry the child result.
    async fn build_replay(&self, queued: &QueuedRun) -> Result<Option<Replay>, SchedulerError> {
        let deps = &self.deps;
        let run_id = &queued.run_id;

        let outcome = if let Some(decision) = deps.approvals.take_decided(run_id)? {
            Some(self.replay_approval(queued, decision).await)
        } else if let Some(settled) = deps.tracker.take_completed(run_id)? {
            Some(replay_child(settled))
        } else {
            None
        };
        let Some(outcome) = outcome else {
            return Ok(None);
        };

        if queued.group_id.is_some() {
            let Some((_, group_snapshot)) = deps.checkpoints.latest(run_id, GROUP_AGENT).map_err(to_internal)? else {
                return Err(SchedulerError::Internal(format!(
                    "no group checkpoint for suspended run {run_id}"
                )));
            };
            let tag = group_snapshot
                .working_state
                .plan_tag
                .as_deref()
                .and_then(parse_progress_tag)
                .ok_or_else(|| {
                    SchedulerError::Internal(format!(
                        "unreadable group progress for run {run_id}"
                    ))
                })?;
            let (round, member_index) = tag;
            let group = queued
                .group_id
                .as_deref()
                .and_then(|id| deps.groups.group(id))
                .ok_or_else(|| {
                    SchedulerError::Internal(format!("unknown group for run {run_id}"))
                })?;
            let member = group.members.get(member_index).ok_or_else(|| {
                SchedulerError::Internal(format!("stale member index for run {run_id}"))
            })?;
            let Some((step, member_snapshot)) = deps
                .checkpoints
                .latest(run_id, &member.instance_id)
                .map_err(to_internal)?
            else {
                return Err(SchedulerError::Internal(format!(
                    "no member checkpoint for suspended run {run_id}"
                )));
            };
            Ok(Some(Replay::Group(GroupResume {
                round,
                member_index,
                transcript: group_snapshot.messages,
                member_resume: ResumeState {
                    messages: member_snapshot.messages,
                    working: member_snapshot.working_state,
                    suspended_step: step as u32,
                    outcome,
                },
            })))
        } else {
            let Some((step, snapshot)) = deps
                .checkpoints
                .latest(run_id, &queued.agent_id)
                .map_err(to_internal)?
            else {
                return Err(SchedulerError::Internal(format!(
                    "no checkpoint for suspended run {run_id}"
                )));
            };
            Ok(Some(Replay::Single(ResumeState {
                messages: snapshot.messages,
                working: snapshot.working_state,
                suspended_step: step as u32,
                outcome,
            })))
        }
    }

    async fn replay_approval(
        &self,
        queued: &QueuedRun,
        decision: DecidedApproval,
    ) -> ResumeOutcome {
        if decision.approved {
            // Execute the held call for real, as if it had proceeded.
            let call_ctx = ToolCallContext {
                run_id: queued.run_id.clone(),
                session_key: queued.session_key.clone(),
                scope: queued.scope.clone(),
                agent_id: queued.agent_id.clone(),
                tool_call_id: decision.tool_call_id.clone(),
            };
            let output = self
                .deps
                .router
                .execute_approved(&decision.tool_name, decision.args.clone(), &call_ctx)
                .await;
            ResumeOutcome::Approved {
                tool_call_id: decision.tool_call_id,
                tool_name: decision.tool_name,
                output,
            }
        } else {
            ResumeOutcome::Rejected {
                tool_call_id: decision.tool_call_id,
                tool_name: decision.tool_name,
                reason: decision
                    .decision_reason
                    .unwrap_or_else(|| "rejected by operator".to_string()),
            }
        }
    }

    // ── Failure recording ────────────────────────────────────────────────

    /// Persist a run.failed event and mark the (running) run failed.
    fn fail_running(&self, queued: &QueuedRun, error: &ErrorInfo) -> Result<(), SchedulerError> {
        let event = RunEvent::new(
            &queued.run_id,
            &queued.agent_id,
            0,
            EventPayload::RunFailed {
                error: error.clone(),
            },
        );
        self.deps.repo.fail(&queued.run_id, error, &event)?;
        self.deps.bus.broadcast_to_run(&queued.run_id, &event);
        Ok(())
    }

    fn record_failure(&self, queued: &QueuedRun, error: &ErrorInfo) -> Result<(), SchedulerError> {
        log::error!("run {} failed before execution: {}", queued.run_id, error.message);
        self.fail_running(queued, error)
    }
}

fn to_internal(e: crate::checkpoint::CheckpointError) -> SchedulerError {
    SchedulerError::Internal(e.to_string())
}

/// Sleep until the optional deadline; pend forever when there is none.
async fn wall_clock(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resume payload, shaped for the run's path.
enum Replay {
    Single(ResumeState),
    Group(GroupResume),
}

impl Replay {
    fn into_single(self) -> Option<ResumeState> {
        match self {
            Replay::Single(state) => Some(state),
            Replay::Group(_) => None,
        }
    }

    fn into_group(self) -> Option<GroupResume> {
        match self {
            Replay::Group(resume) => Some(resume),
            Replay::Single(_) => None,
        }
    }
}

fn replay_child(settled: SettledDependency) -> ResumeOutcome {
    ResumeOutcome::ChildCompleted {
        tool_call_id: settled.tool_call_id,
        tool_name: "delegate_run".to_string(),
        status: settled.status,
        output: settled.result,
        error: settled.error,
    }
}

// End-to-end behaviour (the six engine scenarios) is covered in
// tests/engine_scenarios.rs; the pieces consumed here are unit-tested in
// their own modules.
