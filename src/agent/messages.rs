//! Conversation history for an agent run.

use serde::{Deserialize, Serialize};

use crate::ai::types::{ChatMessage, ToolCallRequest};

/// A message in the agent's conversation history.
///
/// This is what checkpoints persist; [`AgentMessage::to_chat_message`]
/// produces the model-facing form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    /// An assistant turn, which may include pending tool calls.
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    /// Result of a tool execution, threaded to its originating call.
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        AgentMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        AgentMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        AgentMessage::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        AgentMessage::Tool {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Convert to the model-facing message type.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self {
            AgentMessage::System { content } => ChatMessage::system(content.clone()),
            AgentMessage::User { content } => ChatMessage::user(content.clone()),
            AgentMessage::Assistant {
                content,
                tool_calls,
            } => ChatMessage::assistant_with_calls(content.clone(), tool_calls.clone()),
            AgentMessage::Tool {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => {
                let prefix = if *is_error { "error" } else { "ok" };
                ChatMessage::tool(
                    tool_call_id.clone(),
                    format!("[{tool_name}:{prefix}] {content}"),
                )
            }
        }
    }

    /// Plain text view, used when composing memory queries.
    pub fn text(&self) -> &str {
        match self {
            AgentMessage::System { content }
            | AgentMessage::User { content }
            | AgentMessage::Assistant { content, .. }
            | AgentMessage::Tool { content, .. } => content,
        }
    }
}
