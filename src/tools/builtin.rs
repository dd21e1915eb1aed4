//! Builtin tools that ship with the engine.
//!
//! Memory tools live in `crate::memory::tools`, skill discovery tools in
//! `crate::skills::tools`, and run delegation in `crate::escalation::tool`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::traits::{
    ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolSpec,
};

// ─── exec_command ─────────────────────────────────────────────────────────────

/// Runs a shell command via `/bin/sh -c` and captures its output.
///
/// Registered high-risk and mutating, so under the default policy it always
/// goes through the approval gate.
pub struct ExecCommandTool;

impl ExecCommandTool {
    pub fn spec() -> ToolSpec {
        ToolSpec::builtin(
            "exec_command",
            "Execute a shell command and return its stdout/stderr output.",
            ParamSpec::object()
                .required_field("cmd", ParamKind::String, "The shell command to execute.")
                .field(
                    "working_dir",
                    ParamKind::String,
                    "Optional working directory for the command.",
                ),
            ToolMeta::high().mutating(),
            Arc::new(ExecCommandTool),
        )
    }
}

#[async_trait]
impl ToolHandler for ExecCommandTool {
    async fn execute(&self, args: Value, _ctx: &ToolCallContext) -> Result<Value, String> {
        let command = args
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'cmd'")?
            .to_string();
        let working_dir = args
            .get("working_dir")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Run in a blocking thread to avoid stalling the async runtime.
        let output = tokio::task::spawn_blocking(move || {
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(&command);
            if let Some(dir) = &working_dir {
                cmd.current_dir(dir);
            }
            cmd.output()
                .map_err(|e| format!("failed to spawn process: {e}"))
        })
        .await
        .map_err(|e| format!("blocking task panicked: {e}"))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code(),
            "success": output.status.success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_captures_stdout() {
        let ctx = ToolCallContext::system("call-1");
        let out = ExecCommandTool
            .execute(json!({"cmd": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(out["success"], true);
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit() {
        let ctx = ToolCallContext::system("call-1");
        let out = ExecCommandTool
            .execute(json!({"cmd": "exit 3"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 3);
        assert_eq!(out["success"], false);
    }

    #[tokio::test]
    async fn exec_requires_cmd() {
        let ctx = ToolCallContext::system("call-1");
        let err = ExecCommandTool.execute(json!({}), &ctx).await.unwrap_err();
        assert!(err.contains("cmd"));
    }

    #[test]
    fn spec_is_high_risk() {
        let spec = ExecCommandTool::spec();
        assert_eq!(spec.meta.risk_level, crate::security::RiskLevel::High);
        assert!(spec.meta.mutating);
    }
}
