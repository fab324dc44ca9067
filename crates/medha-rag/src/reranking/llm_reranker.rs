//! Listwise reranking with a single chat call.
//!
//! Cosine scores from the embedding index reward topical overlap. The model
//! sees the question and numbered snippets and returns the order it would read
//! them in. Any failure keeps the index order.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::Reranker;
use crate::index::ScoredPassage;
use crate::llm::{GenerationConfig, LanguageModel};
use crate::sanitize::strip_reasoning_trace;

const MAX_RERANK_CANDIDATES: usize = 15;
const RERANK_SNIPPET_CHARS: usize = 300;
const RERANK_TIMEOUT: Duration = Duration::from_secs(20);

pub struct LlmReranker {
    llm: Arc<dyn LanguageModel>,
    generation: GenerationConfig,
    timeout: Duration,
}

impl LlmReranker {
    pub fn new(llm: Arc<dyn LanguageModel>, generation: GenerationConfig) -> Self {
        Self {
            llm,
            generation,
            timeout: RERANK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn prompt(query: &str, candidates: &[ScoredPassage]) -> String {
        let snippets = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let content = &c.passage.content;
                let snippet: String = content.chars().take(RERANK_SNIPPET_CHARS).collect();
                format!("[{}] {}", i + 1, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a search relevance judge. Given a user question and numbered passages, \
             rank the passages by how well they help answer the question.\n\n\
             Question: \"{}\"\n\n\
             Passages:\n{}\n\n\
             Return ONLY a JSON array of passage numbers ordered from most relevant to least \
             relevant. Include ALL {} passage numbers. Example: [3, 1, 2]",
            query,
            snippets,
            candidates.len()
        )
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredPassage>,
    ) -> Result<Vec<ScoredPassage>> {
        if candidates.len() <= 1 {
            return Ok(candidates);
        }
        let judged = candidates.len().min(MAX_RERANK_CANDIDATES);
        let prompt = Self::prompt(query, &candidates[..judged]);

        let call = self.llm.generate(&prompt, &self.generation);
        let raw = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Reranking call failed, keeping index order");
                return Ok(candidates);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Reranking timed out, keeping index order"
                );
                return Ok(candidates);
            }
        };

        let output = strip_reasoning_trace(&raw);
        match parse_ranking(&output, judged) {
            Some(order) => {
                tracing::debug!(order = ?order, "Candidates reranked");
                Ok(apply_ranking(candidates, &order))
            }
            None => {
                tracing::warn!(
                    output = %output.chars().take(200).collect::<String>(),
                    "Unparseable reranking output, keeping index order"
                );
                Ok(candidates)
            }
        }
    }

    fn name(&self) -> &str {
        "llm-listwise"
    }
}

/// Zero-based order from the model's reply: a JSON array, the first `[...]`
/// inside the reply, or failing both the bare numbers if at least half of
/// them are present.
fn parse_ranking(output: &str, expected: usize) -> Option<Vec<usize>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let in_range = |n: &usize| (1..=expected).contains(n);

    if let Ok(order) = serde_json::from_str::<Vec<usize>>(trimmed) {
        if !order.is_empty() && order.iter().all(in_range) {
            return Some(dedup_zero_based(order));
        }
    }

    if let Some(start) = trimmed.find('[') {
        if let Some(end) = trimmed[start..].find(']') {
            let slice = &trimmed[start..=start + end];
            if let Ok(order) = serde_json::from_str::<Vec<usize>>(slice) {
                if !order.is_empty() && order.iter().all(in_range) {
                    return Some(dedup_zero_based(order));
                }
            }
        }
    }

    let numbers: Vec<usize> = trimmed
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(in_range)
        .collect();
    let order = dedup_zero_based(numbers);
    (!order.is_empty() && order.len() >= expected.div_ceil(2)).then_some(order)
}

fn dedup_zero_based(order: Vec<usize>) -> Vec<usize> {
    let mut seen = HashSet::new();
    order
        .into_iter()
        .filter(|n| seen.insert(*n))
        .map(|n| n - 1)
        .collect()
}

/// Candidates named in `order` first, then the rest in their original order.
fn apply_ranking(candidates: Vec<ScoredPassage>, order: &[usize]) -> Vec<ScoredPassage> {
    let mut slots: Vec<Option<ScoredPassage>> = candidates.into_iter().map(Some).collect();
    let mut ranked = Vec::with_capacity(slots.len());
    for &idx in order {
        if let Some(candidate) = slots.get_mut(idx).and_then(Option::take) {
            ranked.push(candidate);
        }
    }
    ranked.extend(slots.into_iter().flatten());
    ranked
}
