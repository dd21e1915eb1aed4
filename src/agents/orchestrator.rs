//! `SerialOrchestrator` — drives a group run through ordered member turns.
//!
//! Members take turns over a shared transcript for up to `max_rounds`
//! rounds.  Every member event is forwarded upstream tagged with the member
//! instance id; member lifecycle events (`run.started`, terminal events) are
//! captured instead, and the group emits a single `run.started` /
//! `run.completed` pair of its own.  A lead member whose output begins with
//! [`FINAL_MARKER`] short-circuits the remaining rounds.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentMessage, AgentRunner, EventSink, ResumeState, RunOutcome, RunnerConfig,
};
use crate::ai::{LlmConfig, LlmProvider};
use crate::checkpoint::{CheckpointSnapshot, CheckpointStore, WorkingState};
use crate::event_bus::{ErrorInfo, EventPayload};
use crate::memory::MemoryService;
use crate::runs::QueuedRun;
use crate::security::AgentContext;
use crate::tools::ToolRouter;

use super::roles::GroupRegistry;

/// A lead member's output starting with this marker ends the discussion.
pub const FINAL_MARKER: &str = "FINAL:";

/// Checkpoint agent id reserved for orchestrator progress.
pub const GROUP_AGENT: &str = "group";

/// Resume target for a group run suspended inside a member turn.
pub struct GroupResume {
    pub round: u32,
    pub member_index: usize,
    pub transcript: Vec<AgentMessage>,
    pub member_resume: ResumeState,
}

/// Encode/decode orchestrator progress into the checkpoint `plan_tag`.
pub fn progress_tag(round: u32, member_index: usize) -> String {
    format!("round:{round};member:{member_index}")
}

pub fn parse_progress_tag(tag: &str) -> Option<(u32, usize)> {
    let (round_part, member_part) = tag.split_once(';')?;
    let round = round_part.strip_prefix("round:")?.parse().ok()?;
    let member = member_part.strip_prefix("member:")?.parse().ok()?;
    Some((round, member))
}

// ─── SerialOrchestrator ───────────────────────────────────────────────────────

pub struct SerialOrchestrator {
    provider: Arc<dyn LlmProvider>,
    router: Arc<ToolRouter>,
    memory: Arc<dyn MemoryService>,
    checkpoints: Arc<CheckpointStore>,
    registry: Arc<GroupRegistry>,
    runner_config: RunnerConfig,
    llm: LlmConfig,
}

impl SerialOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        router: Arc<ToolRouter>,
        memory: Arc<dyn MemoryService>,
        checkpoints: Arc<CheckpointStore>,
        registry: Arc<GroupRegistry>,
        runner_config: RunnerConfig,
        llm: LlmConfig,
    ) -> Self {
        Self {
            provider,
            router,
            memory,
            checkpoints,
            registry,
            runner_config,
            llm,
        }
    }

    #[tracing::instrument(
        name = "orchestrator.run",
        skip_all,
        fields(run_id = %run.run_id, group_id = run.group_id.as_deref().unwrap_or("-"))
    )]
    pub async fn run(
        &self,
        run: &QueuedRun,
        events: &EventSink,
        resume: Option<GroupResume>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run_started = Instant::now();
        let Some(group_id) = run.group_id.clone() else {
            return self
                .fail_group(events, "group", "run has no group_id")
                .await;
        };
        let group_sink = events.for_agent(&group_id);
        let Some(group) = self.registry.group(&group_id) else {
            return self
                .fail_group(&group_sink, &group_id, &format!("unknown group '{group_id}'"))
                .await;
        };

        let mut transcript: Vec<AgentMessage> = Vec::new();
        let mut start_round: u32 = 1;
        let mut start_member: usize = 0;
        let mut member_resume: Option<ResumeState> = None;

        match resume {
            None => {
                transcript.push(AgentMessage::user(&run.input));
                group_sink
                    .emit(
                        0,
                        EventPayload::RunStarted {
                            input: run.input.clone(),
                        },
                    )
                    .await;
            }
            Some(resume) => {
                transcript = resume.transcript;
                start_round = resume.round;
                start_member = resume.member_index;
                member_resume = Some(resume.member_resume);
            }
        }

        let mut lead_output: Option<String> = None;
        let mut last_output: Option<String> = None;
        let mut final_output: Option<String> = None;
        let mut turns: u32 = 0;

        'rounds: for round in start_round..=group.max_rounds {
            for (idx, member) in group.members.iter().enumerate() {
                if round == start_round && idx < start_member {
                    continue;
                }
                if cancel.is_cancelled() {
                    return RunOutcome::Cancelled;
                }
                let Some(role) = self.registry.role(&member.role_id) else {
                    return self
                        .fail_group(
                            &group_sink,
                            &group_id,
                            &format!("unknown role '{}'", member.role_id),
                        )
                        .await;
                };

                let ctx = AgentContext::new(
                    &run.run_id,
                    &run.session_key,
                    run.scope.clone(),
                    &member.instance_id,
                )
                .with_role(&role.id)
                .with_allowed(role.allowed_tools.clone())
                .with_denied(role.denied_tools.clone())
                .with_delegated(run.delegated_permissions.clone());

                let runner = AgentRunner::new(
                    self.provider.clone(),
                    self.router.clone(),
                    self.memory.clone(),
                    self.checkpoints.clone(),
                    self.runner_config.clone(),
                    self.llm.clone(),
                    role.system_prompt.clone(),
                )
                .as_group_member();

                let this_resume = if round == start_round && idx == start_member {
                    member_resume.take()
                } else {
                    None
                };

                // Member events flow through a private channel so lifecycle
                // events can be captured rather than forwarded.
                let (member_tx, mut member_rx) = mpsc::channel(256);
                let member_sink = EventSink::new(member_tx, &run.run_id, &member.instance_id);
                let prior = transcript.clone();
                let (outcome, ()) = tokio::join!(
                    async {
                        let outcome = runner
                            .run(&ctx, None, prior, this_resume, &member_sink, cancel)
                            .await;
                        drop(member_sink);
                        outcome
                    },
                    async {
                        while let Some(event) = member_rx.recv().await {
                            let lifecycle = event.payload.is_terminal()
                                || matches!(event.payload, EventPayload::RunStarted { .. });
                            if !lifecycle {
                                events.forward(event).await;
                            }
                        }
                    }
                );
                turns += 1;

                match outcome {
                    RunOutcome::Completed { output, .. } => {
                        last_output = Some(output.clone());
                        if role.lead {
                            lead_output = Some(output.clone());
                        }
                        transcript
                            .push(AgentMessage::user(format!("[{}] {output}", role.id)));
                        if role.lead
                            && let Some(rest) = output.trim_start().strip_prefix(FINAL_MARKER)
                        {
                            final_output = Some(rest.trim().to_string());
                            break 'rounds;
                        }
                    }
                    RunOutcome::Failed { code, message } => {
                        log::warn!(
                            "group {group_id} member {} failed ({code}): {message}",
                            member.instance_id
                        );
                        transcript.push(AgentMessage::user(format!(
                            "[{}] (failed: {message})",
                            role.id
                        )));
                    }
                    RunOutcome::Cancelled => return RunOutcome::Cancelled,
                    RunOutcome::Suspended(suspension) => {
                        let snapshot = CheckpointSnapshot::new(
                            WorkingState {
                                memory_hits: Vec::new(),
                                last_tool_result: None,
                                plan_tag: Some(progress_tag(round, idx)),
                            },
                            transcript.clone(),
                        );
                        let step = (round * 100) as i32 + idx as i32;
                        if let Err(e) =
                            self.checkpoints
                                .save(&run.run_id, GROUP_AGENT, step, &snapshot)
                        {
                            return self
                                .fail_group(
                                    &group_sink,
                                    &group_id,
                                    &format!("group checkpoint failed: {e}"),
                                )
                                .await;
                        }
                        return RunOutcome::Suspended(suspension);
                    }
                }
            }
            if final_output.is_some() {
                break;
            }
        }

        match final_output.or(lead_output).or(last_output) {
            Some(output) => {
                group_sink
                    .emit(
                        0,
                        EventPayload::RunCompleted {
                            output: output.clone(),
                            duration_ms: run_started.elapsed().as_millis() as i64,
                        },
                    )
                    .await;
                RunOutcome::Completed {
                    output,
                    steps: turns,
                }
            }
            None => {
                self.fail_group(&group_sink, &group_id, "no member produced an output")
                    .await
            }
        }
    }

    async fn fail_group(&self, sink: &EventSink, group_id: &str, message: &str) -> RunOutcome {
        log::error!("group {group_id} failed: {message}");
        let error = ErrorInfo::new("EXECUTOR_ERROR", message);
        sink.emit(0, EventPayload::RunFailed {
            error: error.clone(),
        })
        .await;
        RunOutcome::Failed {
            code: error.code,
            message: error.message,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
