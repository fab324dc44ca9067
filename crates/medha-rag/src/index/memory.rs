//! Brute-force cosine index held in memory.
//!
//! Suitable for the corpora a single department or course produces (a few
//! thousand passages). Ranking is deterministic: score descending, then
//! insertion order. Passages whose score is NaN are never returned.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ScoredPassage, SimilarityIndex};
use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::state::Passage;

struct IndexEntry {
    passage: Passage,
    vector: Vec<f32>,
}

#[derive(Default)]
struct IndexState {
    entries: Vec<IndexEntry>,
    /// Passage key to position in `entries`.
    positions: HashMap<String, usize>,
}

pub struct InMemoryIndex {
    embeddings: Arc<dyn EmbeddingModel>,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new(embeddings: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embeddings,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Build an index and embed `passages` up front.
    pub async fn from_passages(
        embeddings: Arc<dyn EmbeddingModel>,
        passages: Vec<Passage>,
    ) -> Result<Self> {
        let index = Self::new(embeddings);
        index.upsert(passages).await?;
        Ok(index)
    }

    pub fn embedding_model(&self) -> &str {
        self.embeddings.model_name()
    }
}

/// Passages sharing a key replace each other: `metadata["id"]` when it is a
/// string, the content otherwise.
fn passage_key(passage: &Passage) -> String {
    match passage.metadata.get("id") {
        Some(Value::String(id)) => id.clone(),
        _ => passage.content.clone(),
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn search_scored(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embeddings.embed_query(query).await?;

        let state = self.state.read();
        let entries = &state.entries;
        let mut scored: Vec<(usize, f32)> = entries
            .par_iter()
            .enumerate()
            .map(|(position, entry)| {
                let score = cosine_similarity(&query_vector, &entry.vector);
                (position, score)
            })
            .filter(|(_, score)| !score.is_nan())
            .collect();
        if scored.len() < entries.len() {
            tracing::warn!(
                skipped = entries.len() - scored.len(),
                "Skipping passages with NaN similarity"
            );
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let hits: Vec<ScoredPassage> = scored
            .into_iter()
            .take(k)
            .map(|(position, score)| ScoredPassage {
                passage: entries[position].passage.clone(),
                score,
            })
            .collect();

        tracing::debug!(
            k,
            hits = hits.len(),
            indexed = entries.len(),
            "Index search complete"
        );
        Ok(hits)
    }

    async fn upsert(&self, passages: Vec<Passage>) -> Result<usize> {
        if passages.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;
        if vectors.len() != passages.len() {
            return Err(anyhow!(
                "Embedding model returned {} vectors for {} passages",
                vectors.len(),
                passages.len()
            ));
        }

        let written = passages.len();
        let mut state = self.state.write();
        let IndexState { entries, positions } = &mut *state;
        let mut replaced = 0usize;
        for (passage, vector) in passages.into_iter().zip(vectors) {
            let key = passage_key(&passage);
            let entry = IndexEntry { passage, vector };
            match positions.get(&key) {
                Some(&position) => {
                    entries[position] = entry;
                    replaced += 1;
                }
                None => {
                    positions.insert(key, entries.len());
                    entries.push(entry);
                }
            }
        }

        tracing::info!(
            written,
            replaced,
            total = entries.len(),
            model = self.embeddings.model_name(),
            "Index updated"
        );
        Ok(written)
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{department_corpus, FakeEmbeddings};

    async fn department_index() -> InMemoryIndex {
        InMemoryIndex::from_passages(Arc::new(FakeEmbeddings::new()), department_corpus())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_ranks_best_match_first() {
        let index = department_index().await;
        let hits = index.search("head of the department", 2).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("head of the department"));
    }

    #[tokio::test]
    async fn test_k_larger_than_corpus_returns_everything() {
        let index = department_index().await;
        let hits = index.search("department", 50).await.unwrap();
        assert_eq!(hits.len(), index.len());
    }

    #[tokio::test]
    async fn test_search_is_repeatable() {
        let index = department_index().await;
        let first = index.search_scored("Mehta email", 3).await.unwrap();
        let second = index.search_scored("Mehta email", 3).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let index = InMemoryIndex::from_passages(
            Arc::new(FakeEmbeddings::new()),
            vec![Passage::new("library hours"), Passage::new("hours library")],
        )
        .await
        .unwrap();

        let hits = index.search("library hours", 2).await.unwrap();
        assert_eq!(hits[0].content, "library hours");
        assert_eq!(hits[1].content, "hours library");
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let index = department_index().await;
        let before = index.len();

        index
            .upsert(vec![Passage::new("Office hours moved to Tuesdays.")
                .with_metadata("id", "office-hours")])
            .await
            .unwrap();

        assert_eq!(index.len(), before);
        let hits = index.search("office hours", 1).await.unwrap();
        assert_eq!(hits[0].content, "Office hours moved to Tuesdays.");
    }

    #[tokio::test]
    async fn test_upsert_adds_new_passages() {
        let index = InMemoryIndex::new(Arc::new(FakeEmbeddings::new()));
        assert!(index.is_empty());

        let written = index
            .upsert(vec![Passage::new("a"), Passage::new("b"), Passage::new("a")])
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_hits() {
        let index = InMemoryIndex::new(Arc::new(FakeEmbeddings::new()));
        assert!(index.search("anything", 5).await.unwrap().is_empty());
    }

    /// Gives every passage mentioning "corrupt" a NaN vector.
    struct CorruptEmbeddings;

    #[async_trait]
    impl EmbeddingModel for CorruptEmbeddings {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("corrupt") {
                        vec![f32::NAN, 0.0]
                    } else if t.contains("close") {
                        vec![1.0, 0.1]
                    } else {
                        vec![0.1, 1.0]
                    }
                })
                .collect())
        }

        fn model_name(&self) -> &str {
            "corrupt-test"
        }
    }

    #[tokio::test]
    async fn test_nan_scores_are_skipped() {
        let passages = vec![
            Passage::new("far one"),
            Passage::new("corrupt one"),
            Passage::new("close one"),
            Passage::new("corrupt two"),
            Passage::new("far two"),
        ];
        let index = InMemoryIndex::from_passages(Arc::new(CorruptEmbeddings), passages)
            .await
            .unwrap();

        let hits = index.search("anything", 5).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["close one", "far one", "far two"]);
    }

    #[tokio::test]
    async fn test_bulk_upsert_with_duplicate_keys() {
        let index = department_index().await;
        let mut batch: Vec<Passage> = (0..200)
            .map(|i| Passage::new(format!("Seminar {} is held in hall {}.", i, i % 7)))
            .collect();
        batch.push(Passage::new("Head changed.").with_metadata("id", "head"));
        batch.push(Passage::new("Seminar 5 is held in hall 5."));

        let written = index.upsert(batch).await.unwrap();

        assert_eq!(written, 202);
        assert_eq!(index.len(), 4 + 200);
        let hits = index.search("head changed", 1).await.unwrap();
        assert_eq!(hits[0].content, "Head changed.");
        assert_eq!(hits[0].metadata["id"], "head");
    }
}
