use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ai::types::ToolCatalogEntry;
use crate::runs::Scope;
use crate::security::{AgentContext, RiskLevel};

// ─── ToolSource ───────────────────────────────────────────────────────────────

/// Where a tool spec came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Builtin,
    External,
}

// ─── Parameter descriptors ────────────────────────────────────────────────────

/// Primitive kinds for typed parameter fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamField {
    pub kind: ParamKind,
    pub description: String,
}

/// Parameter descriptor for a tool: typed for builtins, opaque JSON schema
/// for discovered externals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamSpec {
    Object {
        properties: BTreeMap<String, ParamField>,
        required: Vec<String>,
    },
    Opaque(Value),
}

impl ParamSpec {
    /// Start an empty typed object descriptor.
    pub fn object() -> Self {
        ParamSpec::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    /// Add an optional field (builder style; no-op on `Opaque`).
    pub fn field(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
    ) -> Self {
        if let ParamSpec::Object { properties, .. } = &mut self {
            properties.insert(
                name.into(),
                ParamField {
                    kind,
                    description: description.into(),
                },
            );
        }
        self
    }

    /// Add a required field.
    pub fn required_field(
        self,
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let mut spec = self.field(name.clone(), kind, description);
        if let ParamSpec::Object { required, .. } = &mut spec {
            required.push(name);
        }
        spec
    }

    /// Render as a JSON Schema object for LLM tool catalogs.
    pub fn to_json_schema(&self) -> Value {
        match self {
            ParamSpec::Object {
                properties,
                required,
            } => {
                let props: serde_json::Map<String, Value> = properties
                    .iter()
                    .map(|(name, field)| {
                        (
                            name.clone(),
                            json!({
                                "type": field.kind.json_type(),
                                "description": field.description,
                            }),
                        )
                    })
                    .collect();
                let mut schema = json!({
                    "type": "object",
                    "properties": props,
                });
                if !required.is_empty() {
                    schema["required"] = json!(required);
                }
                schema
            }
            ParamSpec::Opaque(value) => value.clone(),
        }
    }
}

// ─── ToolMeta ─────────────────────────────────────────────────────────────────

/// Execution metadata attached to a tool spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub risk_level: RiskLevel,
    pub mutating: bool,
    pub supports_parallel: bool,
    /// Per-tool override of the router's execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Skills this tool is bundled by (stamped by the registry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skill_ids: Vec<String>,
}

impl Default for ToolMeta {
    fn default() -> Self {
        Self::low()
    }
}

impl ToolMeta {
    pub fn low() -> Self {
        Self {
            risk_level: RiskLevel::Low,
            mutating: false,
            supports_parallel: false,
            timeout: None,
            skill_ids: Vec::new(),
        }
    }

    pub fn medium() -> Self {
        Self {
            risk_level: RiskLevel::Medium,
            ..Self::low()
        }
    }

    pub fn high() -> Self {
        Self {
            risk_level: RiskLevel::High,
            ..Self::low()
        }
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn parallel_safe(mut self) -> Self {
        self.supports_parallel = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ─── ToolCallContext ──────────────────────────────────────────────────────────

/// Identity of one tool invocation, handed to the handler.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub run_id: String,
    pub session_key: String,
    pub scope: Scope,
    pub agent_id: String,
    pub tool_call_id: String,
}

impl ToolCallContext {
    pub fn from_agent(ctx: &AgentContext, tool_call_id: impl Into<String>) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            session_key: ctx.session_key.clone(),
            scope: ctx.scope.clone(),
            agent_id: ctx.agent_id.clone(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Context for system-internal calls that carry no agent context.
    pub fn system(tool_call_id: impl Into<String>) -> Self {
        Self {
            run_id: String::new(),
            session_key: String::new(),
            scope: Scope::new("system", "system"),
            agent_id: "system".to_string(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

// ─── ToolHandler / ToolSpec ───────────────────────────────────────────────────

/// A capability the router can dispatch to.
///
/// Handlers return any JSON-serializable value.  Two shapes are special:
/// `{"requires_suspension": true, ...}` signals suspension upward, and (for
/// external tools) `{"is_error": true, ...}` marks a normalized failure.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, String>;
}

/// Declarative description of a registered tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: ParamSpec,
    pub source: ToolSource,
    pub meta: ToolMeta,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn builtin(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSpec,
        meta: ToolMeta,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            source: ToolSource::Builtin,
            meta,
            handler,
        }
    }

    pub fn external(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSpec,
        meta: ToolMeta,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            source: ToolSource::External,
            meta,
            handler,
        }
    }

    /// Entry for the LLM tool catalog.
    pub fn catalog_entry(&self) -> ToolCatalogEntry {
        ToolCatalogEntry {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.params.to_json_schema(),
        }
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("risk_level", &self.meta.risk_level)
            .finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_spec_builds_json_schema() {
        let spec = ParamSpec::object()
            .required_field("query", ParamKind::String, "Search query.")
            .field("limit", ParamKind::Integer, "Max results.");
        let schema = spec.to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[test]
    fn opaque_spec_passes_through() {
        let raw = json!({"type": "object", "additionalProperties": true});
        let spec = ParamSpec::Opaque(raw.clone());
        assert_eq!(spec.to_json_schema(), raw);
    }

    #[test]
    fn meta_builders() {
        let meta = ToolMeta::high().mutating().with_timeout(Duration::from_secs(5));
        assert_eq!(meta.risk_level, RiskLevel::High);
        assert!(meta.mutating);
        assert!(!meta.supports_parallel);
        assert_eq!(meta.timeout, Some(Duration::from_secs(5)));
    }
}
