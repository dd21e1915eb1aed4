//! In-process [`MemoryService`] with naive token-overlap scoring.
//!
//! Good enough for tests and small single-node deployments; production
//! retrieval plugs a vector index in behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::runs::Scope;

use super::traits::{MemoryHit, MemoryService};

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    content: String,
}

/// Scope-partitioned in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    partitions: RwLock<HashMap<String, Vec<Entry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fraction of query words found in `content`, in [0, 1].
fn overlap_score(query: &str, content: &str) -> f32 {
    let query_words: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if query_words.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let matched = query_words
        .iter()
        .filter(|w| content_lower.contains(w.as_str()))
        .count();
    matched as f32 / query_words.len() as f32
}

#[async_trait]
impl MemoryService for InMemoryStore {
    async fn retrieve(
        &self,
        scope: &Scope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, String> {
        let partitions = self.partitions.read().await;
        let Some(entries) = partitions.get(&scope.partition_key()) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<MemoryHit> = entries
            .iter()
            .map(|e| MemoryHit {
                key: e.key.clone(),
                content: e.content.clone(),
                score: overlap_score(query, &e.content),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn store(&self, scope: &Scope, key: &str, content: &str) -> Result<(), String> {
        let mut partitions = self.partitions.write().await;
        let entries = partitions.entry(scope.partition_key()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.key == key) {
            existing.content = content.to_string();
        } else {
            entries.push(Entry {
                key: key.to_string(),
                content: content.to_string(),
            });
        }
        Ok(())
    }

    async fn deposit_episode(
        &self,
        scope: &Scope,
        run_id: &str,
        summary: &str,
    ) -> Result<(), String> {
        self.store(scope, &format!("episode:{run_id}"), summary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new("org-1", "user-1")
    }

    #[tokio::test]
    async fn store_and_retrieve_sorted_by_score() {
        let store = InMemoryStore::new();
        let s = scope();
        store.store(&s, "a", "rust is a systems language").await.unwrap();
        store.store(&s, "b", "rust systems engineering notes").await.unwrap();
        store.store(&s, "c", "cooking pasta").await.unwrap();

        let hits = store.retrieve(&s, "rust systems", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| h.key != "c"));
    }

    #[tokio::test]
    async fn retrieval_is_scope_isolated() {
        let store = InMemoryStore::new();
        let s1 = scope();
        let s2 = Scope::new("org-2", "user-2");
        store.store(&s1, "a", "secret fact").await.unwrap();

        let hits = store.retrieve(&s2, "secret fact", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn store_overwrites_same_key() {
        let store = InMemoryStore::new();
        let s = scope();
        store.store(&s, "a", "old fact").await.unwrap();
        store.store(&s, "a", "new fact").await.unwrap();
        let hits = store.retrieve(&s, "fact", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "new fact");
    }

    #[tokio::test]
    async fn deposit_episode_is_retrievable() {
        let store = InMemoryStore::new();
        let s = scope();
        store
            .deposit_episode(&s, "run-1", "the group agreed on a plan")
            .await
            .unwrap();
        let hits = store.retrieve(&s, "group plan", 5).await.unwrap();
        assert_eq!(hits[0].key, "episode:run-1");
    }

    #[tokio::test]
    async fn limit_is_respected() {
        let store = InMemoryStore::new();
        let s = scope();
        for i in 0..10 {
            store.store(&s, &format!("k{i}"), "common word").await.unwrap();
        }
        let hits = store.retrieve(&s, "common", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}
