//! `AgentRunner` — the stepwise reason-act loop for a single agent.
//!
//! # Algorithm
//!
//! ```text
//! emit run.started
//!       │
//!       ▼ per step (bounded by max_steps)
//! emit step.started
//! retrieve memory ─► compose prompt (system + memory + history tail)
//! stream model call (emit llm.token per token) ─► emit llm.called
//!       │
//!       ├─ tool calls? for each, in declaration order:
//!       │    emit tool.called ─► router dispatch
//!       │      Completed      → emit tool.result, append tool message
//!       │      Blocked        → emit tool.blocked, append blocked message
//!       │      NeedsApproval  → emit tool.requires_approval, SUSPEND
//!       │      NeedsChildRun  → SUSPEND (parent waits on the child)
//!       │    checkpoint ─► emit step.completed(tool_call) ─► next step
//!       │
//!       └─ final text → checkpoint ─► emit step.completed(final_answer)
//!                       ─► emit run.completed ─► done
//!
//! max_steps exhausted → emit run.failed(MAX_STEPS)
//! ```
//!
//! Events flow into an mpsc channel consumed by the scheduler; the runner
//! returning closes the channel.  Cancellation is cooperative: the token is
//! observed before every await, and a fired cancellation ends the loop with
//! no further events.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::{
    LlmConfig, LlmProvider,
    types::{ChatMessage, CompletionRequest, ToolCallRequest},
};
use crate::checkpoint::{CheckpointSnapshot, CheckpointStore, WorkingState};
use crate::event_bus::{ErrorInfo, EventPayload, RunEvent, StepResultType};
use crate::memory::MemoryService;
use crate::security::{AgentContext, RiskLevel};
use crate::tools::{ToolCallOutput, ToolDispatch, ToolRouter};

use super::messages::AgentMessage;

// ─── RunnerConfig ─────────────────────────────────────────────────────────────

/// Runtime configuration for an [`AgentRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum reason-act iterations before the run fails with `MAX_STEPS`.
    pub max_steps: u32,
    /// How many trailing history messages go into the prompt.
    pub history_tail: usize,
    /// How many memory hits to retrieve per step.
    pub memory_hits: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            history_tail: 24,
            memory_hits: 5,
        }
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

/// Why a run left the loop without finishing.
#[derive(Debug, Clone)]
pub enum Suspension {
    AwaitingApproval {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        reason: String,
        risk_level: RiskLevel,
        step: u32,
    },
    AwaitingChild {
        tool_call_id: String,
        tool_name: String,
        child_run_id: String,
        goal: String,
        step: u32,
    },
}

/// Terminal (or suspending) result of one runner invocation.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { output: String, steps: u32 },
    Failed { code: String, message: String },
    Suspended(Suspension),
    Cancelled,
}

/// The replayed outcome injected when a suspended run resumes.
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    /// The held call was approved and executed; this is its real result.
    Approved {
        tool_call_id: String,
        tool_name: String,
        output: ToolCallOutput,
    },
    /// The held call was rejected; the model sees the reason.
    Rejected {
        tool_call_id: String,
        tool_name: String,
        reason: String,
    },
    /// The awaited child run reached a terminal state.
    ChildCompleted {
        tool_call_id: String,
        tool_name: String,
        status: String,
        output: Option<String>,
        error: Option<String>,
    },
}

/// Checkpointed state plus the injected outcome, for re-entry.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub messages: Vec<AgentMessage>,
    pub working: WorkingState,
    /// The step at which the run suspended.
    pub suspended_step: u32,
    pub outcome: ResumeOutcome,
}

// ─── EventSink ────────────────────────────────────────────────────────────────

/// Emits events for one (run, agent) into the scheduler's channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RunEvent>,
    run_id: String,
    agent_id: String,
}

impl EventSink {
    pub fn new(
        tx: mpsc::Sender<RunEvent>,
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            run_id: run_id.into(),
            agent_id: agent_id.into(),
        }
    }

    /// A sink for the same run under a different agent id (group members).
    pub fn for_agent(&self, agent_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            run_id: self.run_id.clone(),
            agent_id: agent_id.into(),
        }
    }

    pub async fn emit(&self, step: u32, payload: EventPayload) {
        self.send(RunEvent::new(&self.run_id, &self.agent_id, step as i32, payload))
            .await;
    }

    pub async fn emit_in_span(&self, step: u32, span: &str, payload: EventPayload) {
        self.send(
            RunEvent::new(&self.run_id, &self.agent_id, step as i32, payload).with_span(span),
        )
        .await;
    }

    pub async fn emit_child(&self, step: u32, parent_span: &str, payload: EventPayload) {
        self.send(
            RunEvent::new(&self.run_id, &self.agent_id, step as i32, payload)
                .with_parent_span(parent_span),
        )
        .await;
    }

    pub async fn forward(&self, event: RunEvent) {
        self.send(event).await;
    }

    async fn send(&self, event: RunEvent) {
        // A closed channel means the scheduler stopped consuming; nothing
        // useful can be done with the event.
        let _ = self.tx.send(event).await;
    }
}

// ─── AgentRunner ──────────────────────────────────────────────────────────────

/// Drives one agent through the bounded reason-act loop.
///
/// The runner is stateless across invocations; conversation state lives in
/// the caller-provided history and in checkpoints.
pub struct AgentRunner {
    provider: Arc<dyn LlmProvider>,
    router: Arc<ToolRouter>,
    memory: Arc<dyn MemoryService>,
    checkpoints: Arc<CheckpointStore>,
    config: RunnerConfig,
    llm: LlmConfig,
    system_prompt: String,
    /// Group members use tiered memory retrieval.
    group_member: bool,
}

impl AgentRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        router: Arc<ToolRouter>,
        memory: Arc<dyn MemoryService>,
        checkpoints: Arc<CheckpointStore>,
        config: RunnerConfig,
        llm: LlmConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            router,
            memory,
            checkpoints,
            config,
            llm,
            system_prompt: system_prompt.into(),
            group_member: false,
        }
    }

    pub fn as_group_member(mut self) -> Self {
        self.group_member = true;
        self
    }

    /// Run the loop.
    ///
    /// `input` is pushed as the user message on a fresh run (`None` when the
    /// transcript in `prior` already carries it).  `resume` re-enters after a
    /// suspension, injecting the replayed tool outcome.
    #[tracing::instrument(
        name = "agent.run",
        skip_all,
        fields(run_id = %ctx.run_id, agent_id = %ctx.agent_id, model = %self.llm.model)
    )]
    pub async fn run(
        &self,
        ctx: &AgentContext,
        input: Option<&str>,
        prior: Vec<AgentMessage>,
        resume: Option<ResumeState>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run_started = Instant::now();
        let mut working = WorkingState::default();
        let mut messages: Vec<AgentMessage> =
            vec![AgentMessage::system(self.system_prompt.clone())];
        messages.extend(prior);
        let mut start_step: u32 = 1;

        match resume {
            None => {
                if let Some(input) = input {
                    messages.push(AgentMessage::user(input));
                }
                events
                    .emit(
                        0,
                        EventPayload::RunStarted {
                            input: input.unwrap_or_default().to_string(),
                        },
                    )
                    .await;
            }
            Some(state) => {
                messages = state.messages;
                working = state.working;
                let step = state.suspended_step;
                start_step = step + 1;
                if let Err(outcome) = self
                    .inject_resume_outcome(ctx, step, state.outcome, &mut messages, &mut working, events)
                    .await
                {
                    return outcome;
                }
                if let Err(outcome) = self.save_checkpoint(ctx, step, &working, &messages) {
                    return outcome;
                }
                events
                    .emit(
                        step,
                        EventPayload::StepCompleted {
                            step_number: step,
                            result_type: StepResultType::ToolCall,
                            duration_ms: 0,
                        },
                    )
                    .await;
            }
        }

        for step in start_step..=self.config.max_steps {
            if cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }
            let step_started = Instant::now();
            let step_span = uuid::Uuid::new_v4().to_string();
            events
                .emit_in_span(step, &step_span, EventPayload::StepStarted { step_number: step })
                .await;

            // ── Memory retrieval ───────────────────────────────────────────
            let query = compose_memory_query(&messages);
            let retrieval = if self.group_member {
                self.memory
                    .retrieve_tiered(&ctx.scope, &ctx.agent_id, &query, self.config.memory_hits)
            } else {
                self.memory
                    .retrieve(&ctx.scope, &query, self.config.memory_hits)
            };
            let hits = tokio::select! {
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                result = retrieval => result,
            };
            working.memory_hits = match hits {
                Ok(hits) => hits,
                Err(e) => {
                    log::warn!("memory retrieval failed for run {}: {e}", ctx.run_id);
                    Vec::new()
                }
            };

            // ── Model call (streamed) ──────────────────────────────────────
            let request = self.compose_request(&messages, &working);
            let llm_started = Instant::now();
            let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
            let provider = self.provider.clone();
            let mut model_fut = Box::pin(provider.stream(request, token_tx));
            let mut token_index: u32 = 0;
            let mut tokens_open = true;
            let response = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return RunOutcome::Cancelled,
                    maybe_token = token_rx.recv(), if tokens_open => {
                        match maybe_token {
                            Some(token) => {
                                events
                                    .emit_child(step, &step_span, EventPayload::LlmToken {
                                        token,
                                        token_index,
                                    })
                                    .await;
                                token_index += 1;
                            }
                            None => tokens_open = false,
                        }
                    }
                    result = &mut model_fut => {
                        // Drain tokens the provider pushed right before returning.
                        while let Ok(token) = token_rx.try_recv() {
                            events
                                .emit_child(step, &step_span, EventPayload::LlmToken {
                                    token,
                                    token_index,
                                })
                                .await;
                            token_index += 1;
                        }
                        break result;
                    }
                }
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let error = ErrorInfo::new("EXECUTOR_ERROR", format!("model call failed: {e}"));
                    events
                        .emit(step, EventPayload::RunFailed { error: error.clone() })
                        .await;
                    return RunOutcome::Failed {
                        code: error.code,
                        message: error.message,
                    };
                }
            };

            let usage = response.usage.clone().unwrap_or_default();
            events
                .emit_in_span(step, &step_span, EventPayload::LlmCalled {
                    model: self.llm.model.clone(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    duration_ms: llm_started.elapsed().as_millis() as i64,
                })
                .await;

            // ── Final answer ───────────────────────────────────────────────
            if response.tool_calls.is_empty() {
                let output = response.content;
                messages.push(AgentMessage::assistant(output.clone(), Vec::new()));
                if let Err(outcome) = self.save_checkpoint(ctx, step, &working, &messages) {
                    return outcome;
                }
                events
                    .emit_in_span(step, &step_span, EventPayload::StepCompleted {
                        step_number: step,
                        result_type: StepResultType::FinalAnswer,
                        duration_ms: step_started.elapsed().as_millis() as i64,
                    })
                    .await;
                events
                    .emit(step, EventPayload::RunCompleted {
                        output: output.clone(),
                        duration_ms: run_started.elapsed().as_millis() as i64,
                    })
                    .await;
                return RunOutcome::Completed {
                    output,
                    steps: step,
                };
            }

            // ── Tool calls ─────────────────────────────────────────────────
            messages.push(AgentMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let calls = response.tool_calls;
            let parallel = calls.len() > 1
                && calls.iter().all(|c| self.router.supports_parallel(&c.name));

            if parallel {
                // All calls announced in declaration order, dispatched
                // concurrently, results applied back in declaration order.
                for call in &calls {
                    events
                        .emit_child(step, &step_span, EventPayload::ToolCalled {
                            tool_name: call.name.clone(),
                            args: call.arguments.clone(),
                        })
                        .await;
                }
                let dispatch_futures = calls.iter().map(|call| {
                    self.router
                        .call_tool(&call.name, call.arguments.clone(), Some(ctx), &call.id)
                });
                let results = futures::future::join_all(dispatch_futures).await;
                for (call, dispatch) in calls.iter().zip(results) {
                    if let Some(suspension) = self
                        .apply_dispatch(ctx, step, &step_span, call, dispatch, &mut messages, &mut working, events)
                        .await
                    {
                        if let Err(outcome) = self.save_checkpoint(ctx, step, &working, &messages) {
                            return outcome;
                        }
                        return RunOutcome::Suspended(suspension);
                    }
                }
            } else {
                // Declaration order, one at a time; a suspension ends the
                // step and later calls never execute.
                for call in &calls {
                    if cancel.is_cancelled() {
                        return RunOutcome::Cancelled;
                    }
                    events
                        .emit_child(step, &step_span, EventPayload::ToolCalled {
                            tool_name: call.name.clone(),
                            args: call.arguments.clone(),
                        })
                        .await;
                    let dispatch = tokio::select! {
                        _ = cancel.cancelled() => return RunOutcome::Cancelled,
                        dispatch = self.router.call_tool(
                            &call.name,
                            call.arguments.clone(),
                            Some(ctx),
                            &call.id,
                        ) => dispatch,
                    };
                    if let Some(suspension) = self
                        .apply_dispatch(ctx, step, &step_span, call, dispatch, &mut messages, &mut working, events)
                        .await
                    {
                        if let Err(outcome) = self.save_checkpoint(ctx, step, &working, &messages) {
                            return outcome;
                        }
                        return RunOutcome::Suspended(suspension);
                    }
                }
            }

            if let Err(outcome) = self.save_checkpoint(ctx, step, &working, &messages) {
                return outcome;
            }
            events
                .emit_in_span(step, &step_span, EventPayload::StepCompleted {
                    step_number: step,
                    result_type: StepResultType::ToolCall,
                    duration_ms: step_started.elapsed().as_millis() as i64,
                })
                .await;
        }

        let error = ErrorInfo::new(
            "MAX_STEPS",
            format!(
                "run did not converge within {} steps",
                self.config.max_steps
            ),
        );
        events
            .emit(self.config.max_steps, EventPayload::RunFailed { error: error.clone() })
            .await;
        RunOutcome::Failed {
            code: error.code,
            message: error.message,
        }
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn compose_request(
        &self,
        messages: &[AgentMessage],
        working: &WorkingState,
    ) -> CompletionRequest {
        let mut chat: Vec<ChatMessage> = Vec::new();
        let mut history = messages;
        if let Some(AgentMessage::System { content }) = messages.first() {
            chat.push(ChatMessage::system(content.clone()));
            history = &messages[1..];
        }
        if !working.memory_hits.is_empty() {
            let context = working
                .memory_hits
                .iter()
                .map(|h| format!("- {}: {}", h.key, h.content))
                .collect::<Vec<_>>()
                .join("\n");
            chat.push(ChatMessage::system(format!(
                "Relevant context from memory:\n{context}"
            )));
        }
        let tail_start = history.len().saturating_sub(self.config.history_tail);
        for message in &history[tail_start..] {
            chat.push(message.to_chat_message());
        }

        let mut request =
            CompletionRequest::new(self.llm.model.clone(), chat).with_tools(self.router.catalog());
        if let Some(t) = self.llm.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.llm.max_tokens {
            request = request.with_max_tokens(m);
        }
        request
    }

    /// Handle one dispatched call: emit events, append the tool message.
    /// Returns a suspension when the dispatch requires one.
    #[allow(clippy::too_many_arguments)]
    async fn apply_dispatch(
        &self,
        ctx: &AgentContext,
        step: u32,
        step_span: &str,
        call: &ToolCallRequest,
        dispatch: ToolDispatch,
        messages: &mut Vec<AgentMessage>,
        working: &mut WorkingState,
        events: &EventSink,
    ) -> Option<Suspension> {
        match dispatch {
            ToolDispatch::Completed(output) => {
                events
                    .emit_child(step, step_span, EventPayload::ToolResult {
                        tool_name: call.name.clone(),
                        result: output.result.clone(),
                        is_error: !output.success,
                        error: output.error.clone(),
                    })
                    .await;
                let content = tool_message_content(&output);
                messages.push(AgentMessage::tool_result(
                    &call.id,
                    &call.name,
                    content,
                    !output.success,
                ));
                working.last_tool_result = Some(output.result);
                None
            }
            ToolDispatch::Blocked { reason } => {
                events
                    .emit_child(step, step_span, EventPayload::ToolBlocked {
                        tool_name: call.name.clone(),
                        args: call.arguments.clone(),
                        reason: reason.clone(),
                        role_id: ctx.role_id.clone(),
                    })
                    .await;
                messages.push(AgentMessage::tool_result(
                    &call.id,
                    &call.name,
                    format!("Blocked: {reason}"),
                    true,
                ));
                None
            }
            ToolDispatch::NeedsApproval { risk_level, reason } => {
                events
                    .emit_child(step, step_span, EventPayload::ToolRequiresApproval {
                        tool_name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                        args: call.arguments.clone(),
                        reason: reason.clone(),
                        risk_level,
                    })
                    .await;
                Some(Suspension::AwaitingApproval {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.arguments.clone(),
                    reason,
                    risk_level,
                    step,
                })
            }
            ToolDispatch::NeedsChildRun { child_run_id, goal } => Some(Suspension::AwaitingChild {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                child_run_id,
                goal,
                step,
            }),
        }
    }

    /// Emit the injected outcome of a resumed suspension as events + message.
    async fn inject_resume_outcome(
        &self,
        ctx: &AgentContext,
        step: u32,
        outcome: ResumeOutcome,
        messages: &mut Vec<AgentMessage>,
        working: &mut WorkingState,
        events: &EventSink,
    ) -> Result<(), RunOutcome> {
        match outcome {
            ResumeOutcome::Approved {
                tool_call_id,
                tool_name,
                output,
            } => {
                events
                    .emit(step, EventPayload::ToolResult {
                        tool_name: tool_name.clone(),
                        result: output.result.clone(),
                        is_error: !output.success,
                        error: output.error.clone(),
                    })
                    .await;
                let content = tool_message_content(&output);
                messages.push(AgentMessage::tool_result(
                    tool_call_id,
                    tool_name,
                    content,
                    !output.success,
                ));
                working.last_tool_result = Some(output.result);
            }
            ResumeOutcome::Rejected {
                tool_call_id,
                tool_name,
                reason,
            } => {
                events
                    .emit(step, EventPayload::ToolBlocked {
                        tool_name: tool_name.clone(),
                        args: Value::Null,
                        reason: reason.clone(),
                        role_id: ctx.role_id.clone(),
                    })
                    .await;
                messages.push(AgentMessage::tool_result(
                    tool_call_id,
                    tool_name,
                    format!("Rejected by operator: {reason}"),
                    true,
                ));
            }
            ResumeOutcome::ChildCompleted {
                tool_call_id,
                tool_name,
                status,
                output,
                error,
            } => {
                let is_error = status != "completed";
                let error_info = error
                    .clone()
                    .map(|m| ErrorInfo::new("CHILD_RUN_FAILED", m));
                let result = json!({
                    "status": status,
                    "output": output,
                    "error": error,
                });
                events
                    .emit(step, EventPayload::ToolResult {
                        tool_name: tool_name.clone(),
                        result: result.clone(),
                        is_error,
                        error: error_info,
                    })
                    .await;
                let content = result.to_string();
                messages.push(AgentMessage::tool_result(
                    tool_call_id,
                    tool_name,
                    content,
                    is_error,
                ));
                working.last_tool_result = Some(result);
            }
        }
        Ok(())
    }

    fn save_checkpoint(
        &self,
        ctx: &AgentContext,
        step: u32,
        working: &WorkingState,
        messages: &[AgentMessage],
    ) -> Result<(), RunOutcome> {
        let snapshot = CheckpointSnapshot::new(working.clone(), messages.to_vec());
        self.checkpoints
            .save(&ctx.run_id, &ctx.agent_id, step as i32, &snapshot)
            .map_err(|e| {
                log::error!("checkpoint save failed for run {}: {e}", ctx.run_id);
                RunOutcome::Failed {
                    code: "EXECUTOR_ERROR".to_string(),
                    message: format!("checkpoint save failed: {e}"),
                }
            })
    }
}

/// Query text for memory retrieval: the last few non-system messages.
fn compose_memory_query(messages: &[AgentMessage]) -> String {
    let mut parts: Vec<&str> = messages
        .iter()
        .rev()
        .filter(|m| !matches!(m, AgentMessage::System { .. }))
        .take(3)
        .map(AgentMessage::text)
        .collect();
    parts.reverse();
    parts.join(" ")
}

fn tool_message_content(output: &ToolCallOutput) -> String {
    if output.success {
        output.result.to_string()
    } else {
        match &output.error {
            Some(err) => format!("Error ({}): {}", err.code, err.message),
            None => "Error: tool failed".to_string(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::ai::types::{CompletionResponse, TokenUsage};
    use crate::ai::{CompletionRequest, ProviderError};
    use crate::memory::InMemoryStore;
    use crate::runs::Scope;
    use crate::security::ToolPolicy;
    use crate::tools::{
        ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolRegistry, ToolSpec,
    };

    use super::*;

    // ── Scripted mock provider ────────────────────────────────────────────

    enum Scripted {
        Text(&'static str),
        Call(&'static str, Value),
    }

    struct MockProvider {
        script: Vec<Scripted>,
        index: AtomicUsize,
    }

    impl MockProvider {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script,
                index: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            let (content, tool_calls) = match self.script.get(i) {
                Some(Scripted::Text(text)) => (text.to_string(), vec![]),
                Some(Scripted::Call(name, args)) => (
                    String::new(),
                    vec![ToolCallRequest::new(*name, args.clone())],
                ),
                None => ("No more responses".to_string(), vec![]),
            };
            Ok(CompletionResponse {
                content,
                tool_calls,
                model: "mock".to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                finish_reason: Some("stop".to_string()),
            })
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }

    // ── Mock tool ─────────────────────────────────────────────────────────

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, args: Value, _ctx: &ToolCallContext) -> Result<Value, String> {
            Ok(json!({"echo": args.get("message").cloned().unwrap_or(Value::Null)}))
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    struct Harness {
        runner: AgentRunner,
        _dir: tempfile::TempDir,
    }

    fn harness(provider: Arc<dyn LlmProvider>) -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::database::init_at(&dir.path().join("runner.db")).unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(ToolSpec::builtin(
            "echo",
            "echoes input",
            ParamSpec::object().required_field("message", ParamKind::String, "text"),
            ToolMeta::low(),
            Arc::new(EchoHandler),
        ));
        registry.register(ToolSpec::builtin(
            "exec_command",
            "runs a command",
            ParamSpec::object(),
            ToolMeta::high().mutating(),
            Arc::new(EchoHandler),
        ));
        let router = Arc::new(crate::tools::ToolRouter::new(
            registry,
            Arc::new(ToolPolicy::default()),
        ));
        let runner = AgentRunner::new(
            provider,
            router,
            Arc::new(InMemoryStore::new()),
            Arc::new(CheckpointStore::new(pool)),
            RunnerConfig {
                max_steps: 4,
                ..Default::default()
            },
            LlmConfig::new("mock", "mock-model"),
            "You are a helper.",
        );
        Harness { runner, _dir: dir }
    }

    fn ctx() -> AgentContext {
        AgentContext::new("run-1", "sess-1", Scope::new("org-1", "user-1"), "main")
    }

    async fn drive(
        harness: &Harness,
        ctx: &AgentContext,
        input: &str,
    ) -> (RunOutcome, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let sink = EventSink::new(tx, &ctx.run_id, &ctx.agent_id);
        let cancel = CancellationToken::new();
        let outcome = harness
            .runner
            .run(ctx, Some(input), Vec::new(), None, &sink, &cancel)
            .await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    fn event_types(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(RunEvent::event_type).collect()
    }

    // ── Tests ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn final_answer_immediately() {
        let h = harness(MockProvider::new(vec![Scripted::Text("hello")]));
        let (outcome, events) = drive(&h, &ctx(), "echo hello").await;

        match outcome {
            RunOutcome::Completed { output, steps } => {
                assert_eq!(output, "hello");
                assert_eq!(steps, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            event_types(&events),
            vec![
                "run.started",
                "step.started",
                "llm.called",
                "step.completed",
                "run.completed",
            ]
        );
    }

    #[tokio::test]
    async fn tool_round_trip_then_final() {
        let h = harness(MockProvider::new(vec![
            Scripted::Call("echo", json!({"message": "ping"})),
            Scripted::Text("The echo said: ping."),
        ]));
        let (outcome, events) = drive(&h, &ctx(), "use the echo tool").await;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(
            event_types(&events),
            vec![
                "run.started",
                "step.started",
                "llm.called",
                "tool.called",
                "tool.result",
                "step.completed",
                "step.started",
                "llm.called",
                "step.completed",
                "run.completed",
            ]
        );
        // The tool result carries the echoed payload.
        let tool_result = events
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::ToolResult { result, is_error, .. } => Some((result.clone(), *is_error)),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_result.0["echo"], "ping");
        assert!(!tool_result.1);
    }

    #[tokio::test]
    async fn denied_tool_blocks_and_continues() {
        let h = harness(MockProvider::new(vec![
            Scripted::Call("echo", json!({"message": "x"})),
            Scripted::Text("I could not use that tool."),
        ]));
        let ctx = ctx().with_denied(vec!["echo".to_string()]);
        let (outcome, events) = drive(&h, &ctx, "try it").await;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let types = event_types(&events);
        assert!(types.contains(&"tool.blocked"));
        assert!(!types.contains(&"tool.result"));
        let reason = events
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::ToolBlocked { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert!(reason.contains("explicitly denied"));
    }

    #[tokio::test]
    async fn high_risk_tool_suspends() {
        let h = harness(MockProvider::new(vec![Scripted::Call(
            "exec_command",
            json!({"cmd": "ls"}),
        )]));
        let (outcome, events) = drive(&h, &ctx(), "list files").await;

        match outcome {
            RunOutcome::Suspended(Suspension::AwaitingApproval {
                tool_name, step, ..
            }) => {
                assert_eq!(tool_name, "exec_command");
                assert_eq!(step, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let types = event_types(&events);
        assert!(types.contains(&"tool.requires_approval"));
        // No terminal event on suspension.
        assert!(!types.contains(&"run.completed"));
        assert!(!types.contains(&"run.failed"));
    }

    #[tokio::test]
    async fn max_steps_fails_run() {
        let script: Vec<Scripted> = (0..10)
            .map(|_| Scripted::Call("echo", json!({"message": "again"})))
            .collect();
        let h = harness(MockProvider::new(script));
        let (outcome, events) = drive(&h, &ctx(), "loop forever").await;

        match outcome {
            RunOutcome::Failed { code, .. } => assert_eq!(code, "MAX_STEPS"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(events.last().unwrap().event_type(), "run.failed");
    }

    #[tokio::test]
    async fn cancellation_stops_before_first_step() {
        let h = harness(MockProvider::new(vec![Scripted::Text("never seen")]));
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(64);
        let sink = EventSink::new(tx, &ctx.run_id, &ctx.agent_id);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = h
            .runner
            .run(&ctx, Some("input"), Vec::new(), None, &sink, &cancel)
            .await;
        drop(sink);

        assert!(matches!(outcome, RunOutcome::Cancelled));
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        // run.started was already emitted; nothing after cancellation.
        assert_eq!(event_types(&events), vec!["run.started"]);
    }

    #[tokio::test]
    async fn step_events_share_the_step_span() {
        let h = harness(MockProvider::new(vec![Scripted::Text("done")]));
        let (_, events) = drive(&h, &ctx(), "hi").await;
        let step_started = events
            .iter()
            .find(|e| e.event_type() == "step.started")
            .unwrap();
        let llm_called = events
            .iter()
            .find(|e| e.event_type() == "llm.called")
            .unwrap();
        assert_eq!(step_started.span_id, llm_called.span_id);
    }

    #[tokio::test]
    async fn resume_after_approval_injects_result_and_continues() {
        let h = harness(MockProvider::new(vec![Scripted::Text("all done")]));
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(1024);
        let sink = EventSink::new(tx, &ctx.run_id, &ctx.agent_id);
        let cancel = CancellationToken::new();

        let resume = ResumeState {
            messages: vec![
                AgentMessage::system("You are a helper."),
                AgentMessage::user("list files"),
                AgentMessage::assistant(
                    "",
                    vec![ToolCallRequest {
                        id: "call-9".to_string(),
                        name: "exec_command".to_string(),
                        arguments: json!({"cmd": "ls"}),
                    }],
                ),
            ],
            working: WorkingState::default(),
            suspended_step: 1,
            outcome: ResumeOutcome::Approved {
                tool_call_id: "call-9".to_string(),
                tool_name: "exec_command".to_string(),
                output: ToolCallOutput::ok(json!({"stdout": "file.txt"})),
            },
        };

        let outcome = h
            .runner
            .run(&ctx, None, Vec::new(), Some(resume), &sink, &cancel)
            .await;
        drop(sink);

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        let types = event_types(&events);
        // Injected tool.result for the suspended step, then the loop resumes.
        assert_eq!(
            types,
            vec![
                "tool.result",
                "step.completed",
                "step.started",
                "llm.called",
                "step.completed",
                "run.completed",
            ]
        );
        assert_eq!(events[0].step_id, 1);
        assert_eq!(events[2].step_id, 2);
    }

    #[tokio::test]
    async fn resume_after_rejection_emits_blocked() {
        let h = harness(MockProvider::new(vec![Scripted::Text("ok, skipping")]));
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(1024);
        let sink = EventSink::new(tx, &ctx.run_id, &ctx.agent_id);
        let cancel = CancellationToken::new();

        let resume = ResumeState {
            messages: vec![
                AgentMessage::system("You are a helper."),
                AgentMessage::user("delete everything"),
            ],
            working: WorkingState::default(),
            suspended_step: 1,
            outcome: ResumeOutcome::Rejected {
                tool_call_id: "call-3".to_string(),
                tool_name: "exec_command".to_string(),
                reason: "too dangerous".to_string(),
            },
        };

        let outcome = h
            .runner
            .run(&ctx, None, Vec::new(), Some(resume), &sink, &cancel)
            .await;
        drop(sink);

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(events[0].event_type(), "tool.blocked");
        match &events[0].payload {
            EventPayload::ToolBlocked { reason, .. } => assert!(reason.contains("too dangerous")),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_query_uses_recent_messages() {
        let messages = vec![
            AgentMessage::system("prompt"),
            AgentMessage::user("first"),
            AgentMessage::user("second"),
            AgentMessage::user("third"),
            AgentMessage::user("fourth"),
        ];
        let query = compose_memory_query(&messages);
        assert_eq!(query, "second third fourth");
    }
}
