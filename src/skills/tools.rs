//! Discovery tools over the skill catalog.
//!
//! Both are on the policy's always-allowed list: an agent may always find
//! out what it could ask for, even when it may not call it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolSpec};

use super::catalog::SkillCatalog;

/// List every skill with its bundled tools.
pub struct SkillsListTool {
    catalog: Arc<SkillCatalog>,
}

impl SkillsListTool {
    pub fn spec(catalog: Arc<SkillCatalog>) -> ToolSpec {
        ToolSpec::builtin(
            "skills_list",
            "List the available skills and the tools each one bundles.",
            ParamSpec::object(),
            ToolMeta::low().parallel_safe(),
            Arc::new(Self { catalog }),
        )
    }
}

#[async_trait]
impl ToolHandler for SkillsListTool {
    async fn execute(&self, _args: Value, _ctx: &ToolCallContext) -> Result<Value, String> {
        Ok(json!({ "skills": self.catalog.list() }))
    }
}

/// Fetch one skill definition by id.
pub struct SkillsGetTool {
    catalog: Arc<SkillCatalog>,
}

impl SkillsGetTool {
    pub fn spec(catalog: Arc<SkillCatalog>) -> ToolSpec {
        ToolSpec::builtin(
            "skills_get",
            "Fetch a single skill definition by id.",
            ParamSpec::object().required_field("id", ParamKind::String, "Skill id."),
            ToolMeta::low().parallel_safe(),
            Arc::new(Self { catalog }),
        )
    }
}

#[async_trait]
impl ToolHandler for SkillsGetTool {
    async fn execute(&self, args: Value, _ctx: &ToolCallContext) -> Result<Value, String> {
        let id = args
            .get("id")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'id'")?;
        match self.catalog.get(id) {
            Some(skill) => Ok(json!({ "skill": skill })),
            None => Err(format!("unknown skill '{id}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::skills::SkillSpec;

    use super::*;

    #[tokio::test]
    async fn list_and_get() {
        let catalog = Arc::new(SkillCatalog::new());
        catalog.register(
            SkillSpec::new("web", "Web").with_tools(vec!["web_fetch".to_string()]),
        );
        let ctx = ToolCallContext::system("c1");

        let list = SkillsListTool {
            catalog: catalog.clone(),
        };
        let out = list.execute(Value::Null, &ctx).await.unwrap();
        assert_eq!(out["skills"].as_array().unwrap().len(), 1);

        let get = SkillsGetTool { catalog };
        let out = get.execute(json!({"id": "web"}), &ctx).await.unwrap();
        assert_eq!(out["skill"]["id"], "web");
    }

    #[tokio::test]
    async fn get_unknown_skill_errors() {
        let get = SkillsGetTool {
            catalog: Arc::new(SkillCatalog::new()),
        };
        let err = get
            .execute(json!({"id": "nope"}), &ToolCallContext::system("c1"))
            .await
            .unwrap_err();
        assert!(err.contains("unknown skill"));
    }
}
