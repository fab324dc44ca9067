//! Language model gateway.
//!
//! The pipeline only needs two call shapes from a hosted model: an ordered,
//! role-tagged message list and a single plain prompt. Both return text.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::state::Message;

pub mod external;

pub use external::ExternalProvider;

/// Hosted providers speaking the OpenAI chat-completions protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiProvider {
    Groq,
    OpenAI,
    OpenRouter,
    Together,
    Ollama,
    Custom { endpoint: String },
}

impl ApiProvider {
    pub fn chat_endpoint(&self) -> String {
        match self {
            Self::Groq => "https://api.groq.com/openai/v1/chat/completions".to_string(),
            Self::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            Self::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            Self::Together => "https://api.together.xyz/v1/chat/completions".to_string(),
            Self::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            Self::Custom { endpoint } => endpoint.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Groq => "Groq",
            Self::OpenAI => "OpenAI",
            Self::OpenRouter => "OpenRouter",
            Self::Together => "Together",
            Self::Ollama => "Ollama",
            Self::Custom { .. } => "Custom",
        }
    }

    /// Local servers accept requests without a key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama | Self::Custom { .. })
    }
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
}

impl GenerationConfig {
    /// Settings for question rewriting.
    pub fn reformulation(config: &GatewayConfig) -> Self {
        Self {
            max_tokens: config.max_tokens.min(256),
            temperature: config.reformulation_temperature,
            top_p: config.top_p,
            stop_sequences: vec![],
            seed: None,
        }
    }

    /// Settings for listwise reranking. Shares the rewrite temperature.
    pub fn reranking(config: &GatewayConfig) -> Self {
        Self {
            max_tokens: config.max_tokens.min(256),
            temperature: config.reformulation_temperature,
            top_p: config.top_p,
            stop_sequences: vec![],
            seed: None,
        }
    }

    /// Settings for answer generation.
    pub fn generation(config: &GatewayConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.generation_temperature,
            top_p: config.top_p,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
            top_p: 1.0,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

/// Provider information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Chat completion over an ordered message list.
    async fn chat(&self, messages: &[Message], config: &GenerationConfig) -> Result<String>;

    /// Single-prompt completion. Sent as one user message by default.
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        self.chat(&[Message::user(prompt)], config).await
    }

    fn info(&self) -> ProviderInfo;
}
