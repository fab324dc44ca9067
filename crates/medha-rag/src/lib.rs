pub mod checkpoint;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod eval;
pub mod index;
pub mod llm;
pub mod nodes;
pub mod pipeline;
pub mod prompts;
pub mod reranking;
pub mod sanitize;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{PipelineConfig, PromptStyle};
pub use embeddings::{EmbeddingModel, OpenAIEmbeddings};
pub use error::{InvocationError, PipelineError, StateError};
pub use index::{InMemoryIndex, ScoredPassage, SimilarityIndex};
pub use llm::{ApiProvider, ExternalProvider, GenerationConfig, LanguageModel, ProviderInfo};
pub use nodes::{AnswerGenerator, PipelineNode, QueryReformulator, Retriever};
pub use pipeline::{ChatRequest, ChatResponse, PipelineBuilder, PipelineGraph};
pub use reranking::{LlmReranker, Reranker};
pub use state::{ConversationState, Message, Passage, Role};

pub use anyhow::{Error, Result};
