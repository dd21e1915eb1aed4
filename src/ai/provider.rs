use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{CompletionRequest, CompletionResponse, LlmConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("model call timed out")]
    Timeout,

    #[error("unsupported provider '{0}'")]
    UnsupportedProvider(String),
}

/// Seam to the model back end.  Wire protocols live behind this trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt and return the full response.
    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    /// Stream a completion, pushing each content token into `tokens` as it
    /// arrives, and return the assembled final response.
    ///
    /// The default implementation has no token granularity: it completes
    /// without pushing anything into `tokens`.
    async fn stream(
        &self,
        request: CompletionRequest,
        tokens: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        drop(tokens);
        self.complete(request).await
    }

    fn provider_name(&self) -> &str;
}

/// Creates providers from resolved run configuration.
///
/// The scheduler calls this once per run with the effective [`LlmConfig`];
/// implementations decide caching/pooling.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ProviderError>;
}
