//! Agent-callable tools backed by the memory subsystem.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolSpec};

use super::traits::MemoryService;

// ─── memory_search ────────────────────────────────────────────────────────────

/// Search the caller's scoped memory.
pub struct MemorySearchTool {
    memory: Arc<dyn MemoryService>,
}

impl MemorySearchTool {
    pub fn spec(memory: Arc<dyn MemoryService>) -> ToolSpec {
        ToolSpec::builtin(
            "memory_search",
            "Search the agent's memory for relevant facts and prior episodes.",
            ParamSpec::object()
                .required_field("query", ParamKind::String, "Search query.")
                .field("limit", ParamKind::Integer, "Maximum hits to return (default 5)."),
            ToolMeta::low().parallel_safe(),
            Arc::new(Self { memory }),
        )
    }
}

#[async_trait]
impl ToolHandler for MemorySearchTool {
    async fn execute(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'query'")?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;

        let hits = self.memory.retrieve(&ctx.scope, query, limit).await?;
        Ok(json!({ "hits": hits }))
    }
}

// ─── memory_write ─────────────────────────────────────────────────────────────

/// Store a fact in the caller's scoped memory.
pub struct MemoryWriteTool {
    memory: Arc<dyn MemoryService>,
}

impl MemoryWriteTool {
    pub fn spec(memory: Arc<dyn MemoryService>) -> ToolSpec {
        ToolSpec::builtin(
            "memory_write",
            "Store a fact in the agent's persistent memory under a namespaced key.",
            ParamSpec::object()
                .required_field(
                    "key",
                    ParamKind::String,
                    "Namespaced lookup key (e.g. 'user:name', 'project:goal').",
                )
                .required_field("content", ParamKind::String, "Text content to store."),
            ToolMeta::medium().mutating(),
            Arc::new(Self { memory }),
        )
    }
}

#[async_trait]
impl ToolHandler for MemoryWriteTool {
    async fn execute(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, String> {
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'key'")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'content'")?;

        self.memory.store(&ctx.scope, key, content).await?;
        Ok(json!({ "stored": key }))
    }
}
