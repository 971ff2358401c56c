use crate::error::AgentError;
use crate::ports::{EmbeddingPort, MemoryRepository};
use cadence_types::MemorySearchResult;
use std::sync::Arc;

/// Semantic memory search: embeds a query, then searches the repository.
///
/// Without an embedder retrieval is disabled and every search is empty.
#[derive(Clone)]
pub struct MemoryRetriever {
    embedder: Option<Arc<dyn EmbeddingPort>>,
    repository: Arc<dyn MemoryRepository>,
}

impl MemoryRetriever {
    pub fn new(
        embedder: Option<Arc<dyn EmbeddingPort>>,
        repository: Arc<dyn MemoryRepository>,
    ) -> Self {
        Self {
            embedder,
            repository,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<MemorySearchResult>, AgentError> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = embedder.embed(query).await?;
        let mut results = self
            .repository
            .search_memories(&embedding, limit, min_score)
            .await?;
        results.retain(|r| r.score >= min_score);
        results.truncate(limit);
        Ok(results)
    }

    /// Embeds and stores `content`. Returns `None` when retrieval is disabled.
    pub async fn remember(&self, content: &str) -> Result<Option<String>, AgentError> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let embedding = embedder.embed(content).await?;
        let id = self.repository.store_memory(content, &embedding).await?;
        Ok(Some(id))
    }
}
