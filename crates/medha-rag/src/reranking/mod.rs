//! Second-pass ordering of retrieved candidates.

pub mod llm_reranker;

use anyhow::Result;
use async_trait::async_trait;

use crate::index::ScoredPassage;

pub use llm_reranker::LlmReranker;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Return `candidates` reordered by relevance to `query`, most relevant first.
    /// Implementations may drop candidates but never invent new ones.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredPassage>,
    ) -> Result<Vec<ScoredPassage>>;

    fn name(&self) -> &str;
}
