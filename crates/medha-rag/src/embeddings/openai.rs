//! Hosted embeddings over the OpenAI-compatible `/v1/embeddings` API.
//!
//! Query embeddings are cached; the same question is embedded on every retry
//! of a turn.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroUsize;

use super::EmbeddingModel;
use crate::config::EmbeddingConfig;
use crate::llm::external::parse_json_body;

pub struct OpenAIEmbeddings {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    cache: Mutex<lru::LruCache<String, Vec<f32>>>,
}

impl OpenAIEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_size = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| anyhow!("embedding.cache_size must be > 0"))?;
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            cache: Mutex::new(lru::LruCache::new(cache_size)),
        })
    }

    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": inputs });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("Embedding request to {} failed: {}", self.endpoint, e))?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(
                endpoint = %self.endpoint,
                status = %status,
                "Embedding API returned error"
            );
            return Err(anyhow!("Embedding API error ({}): {}", status, text));
        }

        let parsed: EmbeddingResponse = parse_json_body(status, &text, &self.endpoint)?;
        order_embeddings(parsed, inputs.len())
    }
}

/// The API may return items out of order; `index` is authoritative.
fn order_embeddings(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if response.data.len() != expected {
        return Err(anyhow!(
            "Embedding API returned {} vectors for {} inputs",
            response.data.len(),
            expected
        ));
    }
    let mut data = response.data;
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingModel for OpenAIEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let mut vectors = self.request_embeddings(&[text.to_string()]).await?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| anyhow!("Embedding API returned no vector"))?;
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(count = texts.len(), model = %self.model, "Embedding passages");
        self.request_embeddings(texts).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embeddings_reordered_by_index() {
        let body = r#"{"data":[
            {"index":1,"embedding":[0.0,1.0]},
            {"index":0,"embedding":[1.0,0.0]}
        ]}"#;
        let parsed: EmbeddingResponse =
            parse_json_body(reqwest::StatusCode::OK, body, "http://test").unwrap();
        let vectors = order_embeddings(parsed, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let body = r#"{"data":[{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse =
            parse_json_body(reqwest::StatusCode::OK, body, "http://test").unwrap();
        assert!(order_embeddings(parsed, 2).is_err());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let mut config = crate::config::PipelineConfig::default().embedding;
        config.cache_size = 0;
        assert!(OpenAIEmbeddings::new(&config).is_err());
    }
}
