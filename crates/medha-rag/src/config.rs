use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::llm::ApiProvider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub llm: GatewayConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub features: FeatureFlags,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub checkpoint: CheckpointBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub provider: ApiProvider,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    pub max_tokens: usize,
    /// Sampling temperature for question rewriting. Kept at 0 so rewrites are repeatable.
    pub reformulation_temperature: f32,
    pub generation_temperature: f32,
    pub top_p: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Number of query embeddings kept in the LRU cache.
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Passages attached per turn. Fixed when the pipeline is built.
    pub k: usize,
    /// Candidates fetched for the reranker before cutting back to `k`.
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
}

fn default_rerank_candidates() -> usize {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_reformulation: bool,
    /// Reorder retrieved candidates with a second, query-aware pass.
    #[serde(default)]
    pub enable_reranking: bool,
    /// Append the previous turn's answer to the context sent to the model.
    pub include_previous_answer: bool,
    pub prompt_style: PromptStyle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    /// Grounding instructions followed by the retrieved context.
    Minimal,
    /// Templated system prompt embedding the context and a rendered transcript.
    #[default]
    Templated,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptConfig {
    /// Markdown file overriding the generator's system prompt.
    pub system_prompt_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    /// One JSON file per thread under `data_dir/threads`.
    File,
}

impl PipelineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.llm.model.trim().is_empty() {
            return Err("llm.model must not be empty".into());
        }
        if self.llm.max_tokens == 0 {
            return Err("llm.max_tokens must be > 0".into());
        }
        for (name, t) in [
            ("llm.reformulation_temperature", self.llm.reformulation_temperature),
            ("llm.generation_temperature", self.llm.generation_temperature),
        ] {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("{} must be in [0.0, 2.0]", name));
            }
        }
        if !(0.0..=1.0).contains(&self.llm.top_p) || self.llm.top_p == 0.0 {
            return Err("llm.top_p must be in (0.0, 1.0]".into());
        }
        if self.embedding.model.trim().is_empty() {
            return Err("embedding.model must not be empty".into());
        }
        if self.embedding.cache_size == 0 {
            return Err("embedding.cache_size must be > 0".into());
        }
        if self.retrieval.k == 0 {
            return Err("retrieval.k must be > 0".into());
        }
        let retrieval = &self.retrieval;
        if self.features.enable_reranking && retrieval.rerank_candidates < retrieval.k {
            return Err("retrieval.rerank_candidates must be >= retrieval.k".into());
        }
        Ok(())
    }

    /// Load config from a JSON file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn threads_dir(&self) -> PathBuf {
        self.data_dir.join("threads")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = if let Ok(env_path) = std::env::var("MEDHA_DATA_DIR") {
            PathBuf::from(env_path)
        } else {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("medha")
        };

        Self {
            data_dir,
            llm: GatewayConfig {
                provider: ApiProvider::Groq,
                model: "qwen/qwen3-32b".to_string(),
                api_key: std::env::var("GROQ_API_KEY").unwrap_or_default(),
                max_tokens: 2048,
                reformulation_temperature: 0.0,
                generation_temperature: 0.0,
                top_p: 1.0,
                timeout_secs: 120,
            },
            embedding: EmbeddingConfig {
                endpoint: "https://api.openai.com/v1/embeddings".to_string(),
                model: "text-embedding-3-large".to_string(),
                api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                cache_size: 1000,
            },
            retrieval: RetrievalConfig {
                k: 5,
                rerank_candidates: default_rerank_candidates(),
            },
            features: FeatureFlags {
                enable_reformulation: true,
                enable_reranking: false,
                include_previous_answer: true,
                prompt_style: PromptStyle::Templated,
            },
            prompts: PromptConfig::default(),
            checkpoint: CheckpointBackend::Memory,
        }
    }
}
