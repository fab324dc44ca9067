//! Similarity index seam.
//!
//! The pipeline only asks for the best `k` passages for a query. How they are
//! ranked (embeddings, keywords, a remote vector store) is up to the
//! implementation.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::Passage;

pub use memory::InMemoryIndex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Top-`k` passages with scores, best first.
    async fn search_scored(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>>;

    /// Top-`k` passages, best first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>> {
        Ok(self
            .search_scored(query, k)
            .await?
            .into_iter()
            .map(|hit| hit.passage)
            .collect())
    }

    /// Insert or replace passages. Returns how many were written.
    async fn upsert(&self, passages: Vec<Passage>) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
