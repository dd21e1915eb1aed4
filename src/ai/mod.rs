//! The model seam: typed requests/responses and the provider trait.

pub mod provider;
pub mod types;

pub use provider::{LlmProvider, ProviderError, ProviderFactory};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmConfig, MessageRole, TokenUsage,
    ToolCallRequest, ToolCatalogEntry,
};
