//! `ToolRouter` — dispatches a tool call by name.
//!
//! # Dispatch
//!
//! ```text
//! call_tool(name, args, agent_ctx, call_id)
//!       │
//!       ▼
//! lookup ──► unknown? ──► Completed(failure TOOL_NOT_FOUND)
//!       │
//!       ▼ (policy skipped when agent_ctx is absent)
//! ToolPolicy.evaluate()
//!     Deny  → Blocked { reason }
//!     Ask   → NeedsApproval { risk_level, reason }
//!     Allow → execute handler, raced against the timeout
//!       │
//!       ▼
//! normalize: timeout → TOOL_TIMEOUT · handler Err → TOOL_HANDLER_ERROR ·
//! external is_error payload → failure · requires_suspension payload →
//! NeedsApproval / NeedsChildRun
//! ```
//!
//! The router never returns an `Err` to its caller, and it is immutable
//! after construction: per-run state rides in the [`AgentContext`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::event_bus::ErrorInfo;
use crate::security::{AgentContext, Decision, RiskLevel, ToolPolicy};
use crate::skills::SkillCatalog;

use super::external::{ExternalToolHandler, ExternalToolSource};
use super::registry::ToolRegistry;
use super::traits::{ParamSpec, ToolCallContext, ToolMeta, ToolSource, ToolSpec};

/// Default execution timeout raced against every handler.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Outcome types ────────────────────────────────────────────────────────────

/// Normalized result of an executed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallOutput {
    pub success: bool,
    pub result: Value,
    pub error: Option<ErrorInfo>,
}

impl ToolCallOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn fail(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    fn fail_with_result(code: &str, message: impl Into<String>, result: Value) -> Self {
        Self {
            success: false,
            result,
            error: Some(ErrorInfo::new(code, message)),
        }
    }
}

/// The four-outcome dispatch result.  Only the scheduler turns the two
/// suspension variants into run state changes.
#[derive(Debug, Clone)]
pub enum ToolDispatch {
    /// The call ran (successfully or not); the step continues.
    Completed(ToolCallOutput),
    /// Policy denied the call; the model sees a blocked result.
    Blocked { reason: String },
    /// Policy (or the handler itself) requires a human decision.
    NeedsApproval { risk_level: RiskLevel, reason: String },
    /// The call escalated to a child run; the parent must wait.
    NeedsChildRun { child_run_id: String, goal: String },
}

// ─── ToolRouter ───────────────────────────────────────────────────────────────

/// Shared dispatcher: registry + policy + optional external source.
pub struct ToolRouter {
    registry: RwLock<ToolRegistry>,
    policy: Arc<ToolPolicy>,
    external: Option<Arc<dyn ExternalToolSource>>,
    default_timeout: Duration,
}

impl ToolRouter {
    pub fn new(registry: ToolRegistry, policy: Arc<ToolPolicy>) -> Self {
        Self {
            registry: RwLock::new(registry),
            policy,
            external: None,
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_external(mut self, source: Arc<dyn ExternalToolSource>) -> Self {
        self.external = Some(source);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    /// Register a builtin after construction (engine wiring).
    pub fn register(&self, spec: ToolSpec) {
        let mut reg = match self.registry.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.register(spec);
    }

    /// The catalog advertised to the model.
    pub fn catalog(&self) -> Vec<crate::ai::types::ToolCatalogEntry> {
        match self.registry.read() {
            Ok(reg) => reg.catalog(),
            Err(poisoned) => poisoned.into_inner().catalog(),
        }
    }

    pub fn supports_parallel(&self, name: &str) -> bool {
        self.registry
            .read()
            .ok()
            .and_then(|reg| reg.get(name).map(|s| s.meta.supports_parallel))
            .unwrap_or(false)
    }

    /// Re-stamp tool → skill ownership from the catalog.
    pub fn refresh_skills(&self, skills: &SkillCatalog) {
        if let Ok(mut reg) = self.registry.write() {
            reg.apply_skills(skills);
        }
    }

    /// Re-discover external tools, replacing the previous external set.
    pub async fn refresh_external(&self) -> Result<usize, String> {
        let Some(source) = &self.external else {
            return Ok(0);
        };
        let discovered = source.discover().await.map_err(|e| e.to_string())?;
        let count = discovered.len();
        let specs: Vec<ToolSpec> = discovered
            .into_iter()
            .map(|tool| {
                let mut meta = match tool.risk_level {
                    Some(RiskLevel::Low) => ToolMeta::low(),
                    Some(RiskLevel::High) => ToolMeta::high(),
                    _ => ToolMeta::medium(),
                };
                if tool.supports_parallel {
                    meta = meta.parallel_safe();
                }
                ToolSpec::external(
                    tool.name.clone(),
                    tool.description,
                    ParamSpec::Opaque(tool.parameters),
                    meta,
                    Arc::new(ExternalToolHandler::new(source.clone(), tool.name)),
                )
            })
            .collect();

        let mut reg = self
            .registry
            .write()
            .map_err(|_| "registry lock poisoned".to_string())?;
        reg.clear_external();
        for spec in specs {
            reg.register_external(spec);
        }
        log::info!("external tool discovery registered {count} tool(s)");
        Ok(count)
    }

    /// Dispatch one tool call.  Policy is skipped when `agent_ctx` is absent
    /// (system-internal calls).
    #[tracing::instrument(name = "router.call", skip_all, fields(tool = %name))]
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        agent_ctx: Option<&AgentContext>,
        tool_call_id: &str,
    ) -> ToolDispatch {
        let Some(spec) = self.lookup(name) else {
            return ToolDispatch::Completed(ToolCallOutput::fail(
                "TOOL_NOT_FOUND",
                format!("tool '{name}' is not registered"),
            ));
        };

        if let Some(ctx) = agent_ctx {
            let decision =
                self.policy
                    .evaluate(ctx, &spec.name, spec.meta.risk_level, &spec.meta.skill_ids);
            let decision_str = match decision.decision {
                Decision::Allow => "allow",
                Decision::Deny => "deny",
                Decision::Ask => "ask",
            };
            self.policy.log_action(
                &ctx.run_id,
                &spec.name,
                args.clone(),
                spec.meta.risk_level,
                decision_str,
                Some(&decision.reason),
            );
            match decision.decision {
                Decision::Deny => {
                    return ToolDispatch::Blocked {
                        reason: decision.reason,
                    };
                }
                Decision::Ask => {
                    return ToolDispatch::NeedsApproval {
                        risk_level: spec.meta.risk_level,
                        reason: decision.reason,
                    };
                }
                Decision::Allow => {}
            }
        }

        let call_ctx = match agent_ctx {
            Some(ctx) => ToolCallContext::from_agent(ctx, tool_call_id),
            None => ToolCallContext::system(tool_call_id),
        };
        self.run_handler(&spec, args, &call_ctx).await
    }

    /// Execute a previously-approved call, skipping the policy gate.
    pub async fn execute_approved(
        &self,
        name: &str,
        args: Value,
        call_ctx: &ToolCallContext,
    ) -> ToolCallOutput {
        let Some(spec) = self.lookup(name) else {
            return ToolCallOutput::fail(
                "TOOL_NOT_FOUND",
                format!("tool '{name}' is not registered"),
            );
        };
        match self.run_handler(&spec, args, call_ctx).await {
            ToolDispatch::Completed(output) => output,
            // An approved replay must produce a plain result; a handler that
            // signals suspension again is reported as its own failure.
            ToolDispatch::NeedsApproval { reason, .. } | ToolDispatch::Blocked { reason } => {
                ToolCallOutput::fail("TOOL_HANDLER_ERROR", reason)
            }
            ToolDispatch::NeedsChildRun { child_run_id, .. } => ToolCallOutput::fail(
                "TOOL_HANDLER_ERROR",
                format!("tool escalated to child run '{child_run_id}' during approved replay"),
            ),
        }
    }

    fn lookup(&self, name: &str) -> Option<ToolSpec> {
        match self.registry.read() {
            Ok(reg) => reg.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Execute the handler with timeout and normalize the result.
    async fn run_handler(
        &self,
        spec: &ToolSpec,
        args: Value,
        call_ctx: &ToolCallContext,
    ) -> ToolDispatch {
        let timeout = spec.meta.timeout.unwrap_or(self.default_timeout);
        let raw = match tokio::time::timeout(timeout, spec.handler.execute(args, call_ctx)).await
        {
            Err(_) => {
                return ToolDispatch::Completed(ToolCallOutput::fail(
                    "TOOL_TIMEOUT",
                    format!("tool '{}' timed out after {timeout:?}", spec.name),
                ));
            }
            Ok(Err(message)) => {
                return ToolDispatch::Completed(ToolCallOutput::fail(
                    "TOOL_HANDLER_ERROR",
                    message,
                ));
            }
            Ok(Ok(value)) => value,
        };

        // Handler-signalled suspension.
        if raw
            .get("requires_suspension")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            if let Some(child_run_id) = raw.get("child_run_id").and_then(Value::as_str) {
                let goal = raw
                    .get("goal")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                return ToolDispatch::NeedsChildRun {
                    child_run_id: child_run_id.to_string(),
                    goal,
                };
            }
            let approval = raw.get("approval");
            let reason = approval
                .and_then(|a| a.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("tool requested approval")
                .to_string();
            let risk_level = approval
                .and_then(|a| a.get("risk_level"))
                .and_then(Value::as_str)
                .and_then(RiskLevel::parse)
                .unwrap_or(spec.meta.risk_level);
            return ToolDispatch::NeedsApproval { risk_level, reason };
        }

        // External payloads may self-mark failure.
        if spec.source == ToolSource::External
            && raw.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        {
            let message = extract_error_message(&raw);
            return ToolDispatch::Completed(ToolCallOutput::fail_with_result(
                "TOOL_HANDLER_ERROR",
                message,
                raw,
            ));
        }

        ToolDispatch::Completed(ToolCallOutput::ok(raw))
    }
}

fn extract_error_message(raw: &Value) -> String {
    raw.get("error")
        .and_then(|e| {
            e.as_str()
                .map(str::to_string)
                .or_else(|| e.get("message").and_then(Value::as_str).map(str::to_string))
        })
        .or_else(|| raw.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "external tool reported an error".to_string())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
