//! Retrieval evaluation against hand-labelled queries.
//!
//! Labels are text snippets rather than passage ids: a retrieved passage is
//! relevant when it contains one of the query's expected snippets
//! (case-insensitive). This survives re-chunking the corpus.
//!
//! - Precision@K: fraction of the top K passages that are relevant
//! - Recall@K: fraction of expected snippets found somewhere in the top K
//! - MRR: average 1/rank of the first relevant passage
//! - Hit Rate@K: fraction of queries with at least one relevant passage in the top K

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::index::SimilarityIndex;
use crate::state::Passage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalQuery {
    pub query: String,
    /// Snippets a relevant passage must contain.
    pub expected: Vec<String>,
}

impl EvalQuery {
    pub fn new<I, S>(query: impl Into<String>, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: query.into(),
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query: String,
    pub reciprocal_rank: f64,
    pub precision_at_k: BTreeMap<usize, f64>,
    pub recall_at_k: BTreeMap<usize, f64>,
    pub num_expected: usize,
    pub num_retrieved: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub num_queries: usize,
    pub mrr: f64,
    pub precision_at: BTreeMap<usize, f64>,
    pub recall_at: BTreeMap<usize, f64>,
    pub hit_rate_at: BTreeMap<usize, f64>,
    pub per_query: Vec<QueryMetrics>,
}

/// Run every query against `index` once, at the largest K, and score the
/// ranking at each K.
pub async fn evaluate_retrieval(
    index: &dyn SimilarityIndex,
    eval_set: &[EvalQuery],
    k_values: &[usize],
) -> Result<EvalMetrics> {
    let max_k = k_values.iter().copied().max().unwrap_or(0);
    let mut per_query = Vec::with_capacity(eval_set.len());
    for eval_query in eval_set {
        let results = index.search(&eval_query.query, max_k).await?;
        per_query.push(evaluate_single(eval_query, &results, k_values));
    }

    let metrics = aggregate(per_query, k_values);
    tracing::info!(
        queries = metrics.num_queries,
        mrr = metrics.mrr,
        "Retrieval evaluation complete"
    );
    Ok(metrics)
}

fn matches(passage: &Passage, expected_lower: &[String]) -> bool {
    let content = passage.content.to_lowercase();
    expected_lower.iter().any(|e| content.contains(e.as_str()))
}

fn evaluate_single(
    eval_query: &EvalQuery,
    results: &[Passage],
    k_values: &[usize],
) -> QueryMetrics {
    let expected: Vec<String> = eval_query
        .expected
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    let relevant: Vec<bool> = results.iter().map(|p| matches(p, &expected)).collect();
    let reciprocal_rank = relevant
        .iter()
        .position(|&r| r)
        .map(|idx| 1.0 / (idx + 1) as f64)
        .unwrap_or(0.0);

    let mut precision_at_k = BTreeMap::new();
    let mut recall_at_k = BTreeMap::new();
    for &k in k_values {
        let top_k = &results[..results.len().min(k)];

        let relevant_in_k = relevant[..top_k.len()].iter().filter(|&&r| r).count();
        let precision = if top_k.is_empty() {
            0.0
        } else {
            relevant_in_k as f64 / top_k.len() as f64
        };
        precision_at_k.insert(k, precision);

        let found = expected
            .iter()
            .filter(|e| {
                top_k
                    .iter()
                    .any(|p| p.content.to_lowercase().contains(e.as_str()))
            })
            .count();
        let recall = if expected.is_empty() {
            0.0
        } else {
            found as f64 / expected.len() as f64
        };
        recall_at_k.insert(k, recall);
    }

    QueryMetrics {
        query: eval_query.query.clone(),
        reciprocal_rank,
        precision_at_k,
        recall_at_k,
        num_expected: expected.len(),
        num_retrieved: results.len(),
    }
}

fn mean(per_query: &[QueryMetrics], f: impl Fn(&QueryMetrics) -> f64) -> f64 {
    per_query.iter().map(f).sum::<f64>() / per_query.len().max(1) as f64
}

fn aggregate(per_query: Vec<QueryMetrics>, k_values: &[usize]) -> EvalMetrics {
    let mut precision_at = BTreeMap::new();
    let mut recall_at = BTreeMap::new();
    let mut hit_rate_at = BTreeMap::new();
    for &k in k_values {
        let at_k = |m: &BTreeMap<usize, f64>| m.get(&k).copied().unwrap_or(0.0);
        precision_at.insert(k, mean(&per_query, |q| at_k(&q.precision_at_k)));
        recall_at.insert(k, mean(&per_query, |q| at_k(&q.recall_at_k)));
        hit_rate_at.insert(
            k,
            mean(&per_query, |q| {
                if at_k(&q.precision_at_k) > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }),
        );
    }
    let mrr = mean(&per_query, |q| q.reciprocal_rank);

    EvalMetrics {
        num_queries: per_query.len(),
        mrr,
        precision_at,
        recall_at,
        hit_rate_at,
        per_query,
    }
}

/// Format evaluation metrics as a human-readable report.
pub fn format_report(metrics: &EvalMetrics) -> String {
    let mut report = String::new();

    report.push_str(&format!(
        "=== Retrieval Evaluation Report ({} queries) ===\n\n",
        metrics.num_queries
    ));
    report.push_str(&format!("MRR: {:.4}\n\n", metrics.mrr));

    report.push_str("| K  | Precision | Recall | Hit Rate |\n");
    report.push_str("|----|-----------|--------|----------|\n");
    for (&k, &precision) in &metrics.precision_at {
        let recall = metrics.recall_at.get(&k).copied().unwrap_or(0.0);
        let hit_rate = metrics.hit_rate_at.get(&k).copied().unwrap_or(0.0);
        report.push_str(&format!(
            "| {:2} | {:.4}    | {:.4} | {:.4}   |\n",
            k, precision, recall, hit_rate
        ));
    }

    let missed: Vec<&QueryMetrics> = metrics
        .per_query
        .iter()
        .filter(|q| q.reciprocal_rank == 0.0)
        .collect();
    if !missed.is_empty() {
        report.push_str(&format!(
            "\n--- Queries with no relevant passage ({}/{}) ---\n",
            missed.len(),
            metrics.num_queries
        ));
        for q in &missed {
            report.push_str(&format!(
                "  - \"{}\" ({} expected snippets, {} retrieved)\n",
                q.query, q.num_expected, q.num_retrieved
            ));
        }
    }

    report
}
