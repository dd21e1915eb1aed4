//! The `MemoryService` contract: the engine's view of the retrieval back end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runs::Scope;

/// A single retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    /// Namespaced lookup key (e.g. `"user:name"`, `"project:goal"`).
    pub key: String,
    pub content: String,
    /// Relevance score in [0, 1] — higher is more relevant.
    pub score: f32,
}

/// Abstraction over the knowledge/memory retrieval back end.
///
/// Implementations may sit on an in-process map, an SQLite table, or a remote
/// vector index.  Retrieval results are sorted by descending `score`, and
/// every operation is isolated to the caller's [`Scope`].
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Search for entries matching `query`, at most `limit` hits.
    async fn retrieve(
        &self,
        scope: &Scope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, String>;

    /// Tiered retrieval for group members: agent-local knowledge first, then
    /// shared tiers.  Defaults to plain [`retrieve`](Self::retrieve).
    async fn retrieve_tiered(
        &self,
        scope: &Scope,
        _agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, String> {
        self.retrieve(scope, query, limit).await
    }

    /// Store or overwrite an entry identified by `key`.
    async fn store(&self, scope: &Scope, key: &str, content: &str) -> Result<(), String>;

    /// Deposit an episodic summary of a finished run (group post-processing).
    async fn deposit_episode(
        &self,
        scope: &Scope,
        run_id: &str,
        summary: &str,
    ) -> Result<(), String>;
}
