//! The `delegate_run` builtin: escalate a sub-task to a child run.
//!
//! The handler records the child as a pending run plus a dependency row and
//! signals suspension.  The scheduler hands the child to the worker only
//! after the parent is parked in `waiting`, so the child cannot finish
//! before its parent is ready to be woken.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::runs::{QueuedRun, RunRepository};
use crate::security::DelegatedPermissions;
use crate::tools::{ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolSpec};

use super::tracker::DependencyTracker;

pub struct DelegateRunTool {
    repo: Arc<RunRepository>,
    tracker: Arc<DependencyTracker>,
}

impl DelegateRunTool {
    pub fn spec(repo: Arc<RunRepository>, tracker: Arc<DependencyTracker>) -> ToolSpec {
        ToolSpec::builtin(
            "delegate_run",
            "Delegate a sub-task to another agent or group as a child run. \
             The current run waits until the child finishes and then receives its result.",
            ParamSpec::object()
                .required_field("goal", ParamKind::String, "The task for the child run.")
                .field(
                    "agent_id",
                    ParamKind::String,
                    "Agent to run the child under (default 'main').",
                )
                .field("group_id", ParamKind::String, "Group to run the child as.")
                .field(
                    "allowed_tools",
                    ParamKind::Array,
                    "Restrict the child to these tools (never broader than this run's own grant).",
                )
                .field(
                    "denied_tools",
                    ParamKind::Array,
                    "Additionally deny these tools for the child.",
                ),
            ToolMeta::medium(),
            Arc::new(Self { repo, tracker }),
        )
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

#[async_trait]
impl ToolHandler for DelegateRunTool {
    async fn execute(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, String> {
        if ctx.run_id.is_empty() {
            return Err("delegation requires a run context".to_string());
        }
        let goal = args
            .get("goal")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'goal'")?
            .to_string();

        let parent = self
            .repo
            .get(&ctx.run_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("parent run '{}' not found", ctx.run_id))?;

        let requested = {
            let allowed_tools = string_list(args.get("allowed_tools"));
            let denied_tools = string_list(args.get("denied_tools"));
            if allowed_tools.is_none() && denied_tools.is_none() {
                None
            } else {
                Some(DelegatedPermissions {
                    allowed_tools,
                    denied_tools,
                })
            }
        };
        // Never broaden: the child's grant is the parent's, narrowed.
        let delegated = match &parent.delegated_permissions {
            Some(parent_grant) => Some(parent_grant.narrow(requested.as_ref())),
            None => requested,
        };

        let child_run_id = uuid::Uuid::new_v4().to_string();
        let short = &child_run_id[..8];
        let mut child = QueuedRun {
            run_id: child_run_id.clone(),
            scope: ctx.scope.clone(),
            session_key: format!("{}:sub:{short}", ctx.session_key),
            input: goal.clone(),
            agent_id: args
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or("main")
                .to_string(),
            group_id: args
                .get("group_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            parent_run_id: Some(ctx.run_id.clone()),
            delegated_permissions: delegated,
            llm_config: parent.llm_config.clone(),
        };
        if child.group_id.is_some() {
            child.agent_id = "main".to_string();
        }

        self.tracker
            .create(&ctx.run_id, &child_run_id, &ctx.tool_call_id, &goal)
            .map_err(|e| e.to_string())?;
        // Recorded pending only; the scheduler releases it to the worker
        // once the parent is parked in `waiting`.
        self.repo.create_pending(&child).map_err(|e| e.to_string())?;

        log::info!(
            "run {} delegated to child {child_run_id} (goal: {goal})",
            ctx.run_id
        );

        Ok(json!({
            "requires_suspension": true,
            "kind": "child_run",
            "child_run_id": child_run_id,
            "goal": goal,
        }))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::runs::{QueueError, RunQueue, RunStatus, Scope};

    use super::*;

    struct NoopQueue;

    impl RunQueue for NoopQueue {
        fn enqueue(&self, _run: QueuedRun) -> Result<(), QueueError> {
            Ok(())
        }

        fn re_enqueue(&self, _run_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    struct Setup {
        tool: DelegateRunTool,
        tracker: Arc<DependencyTracker>,
        repo: Arc<RunRepository>,
        _dir: TempDir,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let pool = crate::database::init_at(&dir.path().join("delegate.db")).unwrap();
        let repo = Arc::new(RunRepository::new(pool.clone()));
        let tracker = Arc::new(DependencyTracker::new(pool, Arc::new(NoopQueue)));
        let tool = DelegateRunTool {
            repo: repo.clone(),
            tracker: tracker.clone(),
        };
        Setup {
            tool,
            tracker,
            repo,
            _dir: dir,
        }
    }

    fn parent_ctx(setup: &Setup) -> ToolCallContext {
        let mut parent = QueuedRun::new(Scope::new("org-1", "user-1"), "sess-1", "big task");
        parent.run_id = "p-1".to_string();
        parent.delegated_permissions = Some(DelegatedPermissions {
            allowed_tools: Some(vec!["memory_search".to_string(), "web_fetch".to_string()]),
            denied_tools: None,
        });
        setup.repo.create_pending(&parent).unwrap();
        ToolCallContext {
            run_id: "p-1".to_string(),
            session_key: "sess-1".to_string(),
            scope: Scope::new("org-1", "user-1"),
            agent_id: "main".to_string(),
            tool_call_id: "call-7".to_string(),
        }
    }

    #[tokio::test]
    async fn delegation_records_pending_child_and_signals_suspension() {
        let s = setup();
        let ctx = parent_ctx(&s);
        let out = s
            .tool
            .execute(json!({"goal": "summarize the report"}), &ctx)
            .await
            .unwrap();

        assert_eq!(out["requires_suspension"], true);
        let child_id = out["child_run_id"].as_str().unwrap();

        let child = s.repo.get(child_id).unwrap().unwrap();
        assert_eq!(child.status, RunStatus::Pending);
        assert_eq!(child.parent_run_id.as_deref(), Some("p-1"));
        assert_eq!(child.input, "summarize the report");
        assert!(child.session_key.starts_with("sess-1:sub:"));
    }

    #[tokio::test]
    async fn child_permissions_are_never_broadened() {
        let s = setup();
        let ctx = parent_ctx(&s);
        let out = s
            .tool
            .execute(
                json!({
                    "goal": "fetch things",
                    "allowed_tools": ["web_fetch", "exec_command"],
                }),
                &ctx,
            )
            .await
            .unwrap();

        let child_id = out["child_run_id"].as_str().unwrap();
        let child = s.repo.get(child_id).unwrap().unwrap();
        let delegated = child.delegated_permissions.unwrap();
        // exec_command is outside the parent grant and must be dropped.
        assert_eq!(
            delegated.allowed_tools,
            Some(vec!["web_fetch".to_string()])
        );
    }

    #[tokio::test]
    async fn dependency_row_is_recorded_with_the_call_id() {
        let s = setup();
        let ctx = parent_ctx(&s);
        let out = s.tool.execute(json!({"goal": "g"}), &ctx).await.unwrap();
        let child_id = out["child_run_id"].as_str().unwrap();

        // Settling the child immediately finds the row.
        let parents = s
            .tracker
            .on_child_terminal(child_id, RunStatus::Completed, Some("done"), None)
            .unwrap();
        assert_eq!(parents, vec!["p-1"]);
        let settled = s.tracker.take_completed("p-1").unwrap().unwrap();
        assert_eq!(settled.tool_call_id, "call-7");
    }

    #[tokio::test]
    async fn missing_goal_is_an_error() {
        let s = setup();
        let ctx = parent_ctx(&s);
        let err = s.tool.execute(json!({}), &ctx).await.unwrap_err();
        assert!(err.contains("goal"));
    }

    #[tokio::test]
    async fn system_context_cannot_delegate() {
        let s = setup();
        let ctx = ToolCallContext::system("c-1");
        let err = s.tool.execute(json!({"goal": "g"}), &ctx).await.unwrap_err();
        assert!(err.contains("run context"));
    }
}
