use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use super::{elapsed_ms, PipelineNode};
use crate::error::{PipelineError, StateError};
use crate::index::{ScoredPassage, SimilarityIndex};
use crate::reranking::Reranker;
use crate::state::{ConversationState, Metadata};

const NODE: &str = "retriever";

/// Attaches the top-`k` passages for the current question.
pub struct Retriever {
    index: Arc<dyn SimilarityIndex>,
    k: usize,
    reranker: Option<(Arc<dyn Reranker>, usize)>,
}

/// One ranked hit, shortened for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassagePreview {
    pub rank: usize,
    pub score: f32,
    pub snippet: String,
    pub metadata: Metadata,
}

impl Retriever {
    pub fn new(index: Arc<dyn SimilarityIndex>, k: usize) -> Self {
        Self {
            index,
            k,
            reranker: None,
        }
    }

    /// Fetch `candidates` passages, let `reranker` reorder them, then keep `k`.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>, candidates: usize) -> Self {
        self.reranker = Some((reranker, candidates.max(self.k)));
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Ranked snippets for `question`, each cut to `max_chars` characters.
    pub async fn preview(
        &self,
        question: &str,
        max_chars: usize,
    ) -> anyhow::Result<Vec<PassagePreview>> {
        let hits = self.ranked(question).await?;
        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| {
                let content = &hit.passage.content;
                let snippet = if content.chars().count() > max_chars {
                    format!("{}...", content.chars().take(max_chars).collect::<String>())
                } else {
                    content.clone()
                };
                PassagePreview {
                    rank: i + 1,
                    score: hit.score,
                    snippet,
                    metadata: hit.passage.metadata,
                }
            })
            .collect())
    }

    async fn ranked(&self, question: &str) -> anyhow::Result<Vec<ScoredPassage>> {
        let Some((reranker, candidates)) = &self.reranker else {
            return self.index.search_scored(question, self.k).await;
        };
        let hits = self.index.search_scored(question, *candidates).await?;
        let fetched = hits.len();
        let mut ranked = reranker.rerank(question, hits).await?;
        ranked.truncate(self.k);
        tracing::debug!(
            reranker = reranker.name(),
            candidates = fetched,
            kept = ranked.len(),
            "Candidates reranked"
        );
        Ok(ranked)
    }
}

#[async_trait]
impl PipelineNode for Retriever {
    fn name(&self) -> &'static str {
        NODE
    }

    async fn process(&self, state: ConversationState) -> Result<ConversationState, PipelineError> {
        if state.question().trim().is_empty() {
            return Err(PipelineError::precondition(
                NODE,
                StateError::Missing { field: "question" },
            ));
        }
        let start = Instant::now();

        let passages: Vec<_> = self
            .ranked(state.question())
            .await
            .map_err(|e| PipelineError::upstream(NODE, e))?
            .into_iter()
            .map(|hit| hit.passage)
            .collect();

        if passages.is_empty() {
            tracing::warn!(question = %state.question(), "Retrieval returned no passages");
        } else {
            tracing::debug!(hits = passages.len(), k = self.k, "Passages retrieved");
        }

        let hits = passages.len();
        let state = state
            .with_retrieved_context(passages)
            .map_err(|e| PipelineError::precondition(NODE, e))?;
        Ok(state
            .with_metadata("retrieved", hits)
            .with_metadata("retriever_ms", elapsed_ms(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationConfig;
    use crate::reranking::LlmReranker;
    use crate::state::Message;
    use crate::testing::{department_corpus, FakeIndex, ScriptedModel};

    fn retriever(k: usize) -> Retriever {
        Retriever::new(Arc::new(FakeIndex::new(department_corpus())), k)
    }

    #[tokio::test]
    async fn test_context_is_joined_in_rank_order() {
        let state = retriever(2)
            .process(ConversationState::new("What is Dr. Asha Mehta's email?"))
            .await
            .unwrap();

        let docs = state.source_docs();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata["id"], "contact");
        assert_eq!(
            state.context().unwrap(),
            format!("{}\n\n{}", docs[0].content, docs[1].content)
        );
        assert_eq!(state.metadata()["retrieved"], 2);
    }

    #[tokio::test]
    async fn test_retrieval_is_idempotent() {
        let node = retriever(3);
        let state = ConversationState::new("department courses");

        let first = node.process(state.clone()).await.unwrap();
        let second = node.process(state).await.unwrap();

        assert_eq!(first.context(), second.context());
        assert_eq!(first.source_docs(), second.source_docs());
    }

    #[tokio::test]
    async fn test_history_and_answer_untouched() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let state = ConversationState::new("office hours").with_history(history.clone());

        let out = retriever(5).process(state).await.unwrap();

        assert_eq!(out.messages(), history.as_slice());
        assert!(out.answer().is_none());
    }

    #[tokio::test]
    async fn test_blank_question_is_precondition() {
        let index = Arc::new(FakeIndex::new(department_corpus()));
        let err = Retriever::new(index.clone(), 5)
            .process(ConversationState::new(""))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Precondition { node: "retriever", field: "question" }
        ));
        assert!(index.queries().is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_is_upstream() {
        let err = Retriever::new(Arc::new(FakeIndex::failing()), 5)
            .process(ConversationState::new("office hours"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upstream { stage: "retriever", .. }));
    }

    #[tokio::test]
    async fn test_preview_truncates_snippets() {
        let previews = retriever(2).preview("office hours room", 10).await.unwrap();

        assert_eq!(previews[0].rank, 1);
        assert_eq!(previews[0].snippet, "Office hou...");
        assert_eq!(previews[0].metadata["source"], "faculty.md");
    }

    /// Reverses whatever the index returned.
    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _query: &str,
            mut candidates: Vec<ScoredPassage>,
        ) -> anyhow::Result<Vec<ScoredPassage>> {
            candidates.reverse();
            Ok(candidates)
        }

        fn name(&self) -> &str {
            "reversing"
        }
    }

    #[tokio::test]
    async fn test_reranker_reorders_then_truncates_to_k() {
        let index = Arc::new(FakeIndex::new(department_corpus()));
        let plain = Retriever::new(index.clone(), 4)
            .preview("Dr. Asha Mehta department", 200)
            .await
            .unwrap();
        assert_eq!(plain.len(), 3);

        let node = Retriever::new(index.clone(), 2)
            .with_reranker(Arc::new(ReversingReranker), 4);
        let state = node
            .process(ConversationState::new("Dr. Asha Mehta department"))
            .await
            .unwrap();

        let ids: Vec<_> = state
            .source_docs()
            .iter()
            .map(|p| &p.metadata["id"])
            .collect();
        assert_eq!(ids, vec![&plain[2].metadata["id"], &plain[1].metadata["id"]]);
    }

    #[tokio::test]
    async fn test_reranker_with_llm_order() {
        let llm = Arc::new(ScriptedModel::new(["[2, 1]"]));
        let reranker = Arc::new(LlmReranker::new(llm, GenerationConfig::default()));
        let index = Arc::new(FakeIndex::new(department_corpus()));

        let state = Retriever::new(index.clone(), 1)
            .with_reranker(reranker, 2)
            .process(ConversationState::new("Asha Mehta email"))
            .await
            .unwrap();

        assert_eq!(state.source_docs().len(), 1);
        assert_eq!(state.source_docs()[0].metadata["id"], "head");
        assert_eq!(index.queries(), vec!["Asha Mehta email"]);
    }
}
