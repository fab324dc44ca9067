//! The conversational pipeline: reformulate, retrieve, generate, checkpoint.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::{CheckpointBackend, PipelineConfig};
use crate::embeddings::OpenAIEmbeddings;
use crate::error::{InvocationError, PipelineError};
use crate::index::{InMemoryIndex, SimilarityIndex};
use crate::llm::{ExternalProvider, GenerationConfig, LanguageModel};
use crate::nodes::{AnswerGenerator, PipelineNode, QueryReformulator, Retriever};
use crate::prompts::load_prompt;
use crate::reranking::{LlmReranker, Reranker};
use crate::state::{ConversationState, Message, Metadata, Passage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Prior messages seeding a thread seen for the first time. Ignored for
    /// threads that already have a checkpoint.
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            thread_id: None,
            messages: None,
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub thread_id: String,
    /// The question as asked.
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reformulated_question: Option<String>,
    pub answer: String,
    pub context: String,
    pub source_docs: Vec<Passage>,
    pub messages: Vec<Message>,
    pub summary: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChatResponse {
    fn from_state(thread_id: String, state: &ConversationState) -> Self {
        Self {
            thread_id,
            question: state.user_question().to_string(),
            reformulated_question: state.reformulated_question().map(str::to_string),
            answer: state.answer().unwrap_or_default().to_string(),
            context: state.context().unwrap_or_default().to_string(),
            source_docs: state.source_docs().to_vec(),
            messages: state.messages().to_vec(),
            summary: state.summary(),
            metadata: state.metadata().clone(),
        }
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    index: Option<Arc<dyn SimilarityIndex>>,
    reranker: Option<Arc<dyn Reranker>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            llm: None,
            index: None,
            reranker: None,
            store: None,
        }
    }

    /// Defaults to a hosted provider built from `config.llm`.
    pub fn llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Defaults to an empty in-memory index over the hosted embeddings in
    /// `config.embedding`. Fill it through [`PipelineGraph::index`].
    pub fn index(mut self, index: Arc<dyn SimilarityIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Always used when set. Otherwise `features.enable_reranking` selects a
    /// listwise reranker over the pipeline's language model.
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Defaults to the backend named in `config.checkpoint`.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<PipelineGraph> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid pipeline config: {}", e))?;

        let llm: Arc<dyn LanguageModel> = match self.llm {
            Some(llm) => llm,
            None => Arc::new(ExternalProvider::new(&config.llm)?),
        };
        let index: Arc<dyn SimilarityIndex> = match self.index {
            Some(index) => index,
            None => {
                let embeddings = Arc::new(OpenAIEmbeddings::new(&config.embedding)?);
                tracing::info!(
                    model = %config.embedding.model,
                    "No index supplied, starting with an empty in-memory index"
                );
                Arc::new(InMemoryIndex::new(embeddings))
            }
        };
        let reranker: Option<Arc<dyn Reranker>> = match self.reranker {
            Some(reranker) => Some(reranker),
            None if config.features.enable_reranking => Some(Arc::new(LlmReranker::new(
                llm.clone(),
                GenerationConfig::reranking(&config.llm),
            ))),
            None => None,
        };
        let store: Arc<dyn CheckpointStore> = match self.store {
            Some(store) => store,
            None => match config.checkpoint {
                CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
                CheckpointBackend::File => Arc::new(FileCheckpointStore::new(config.threads_dir())),
            },
        };

        let mut nodes: Vec<Box<dyn PipelineNode>> = Vec::with_capacity(3);
        if config.features.enable_reformulation {
            nodes.push(Box::new(QueryReformulator::new(
                llm.clone(),
                GenerationConfig::reformulation(&config.llm),
            )));
        }
        let mut retriever = Retriever::new(index.clone(), config.retrieval.k);
        if let Some(reranker) = &reranker {
            let candidates = config.retrieval.rerank_candidates;
            retriever = retriever.with_reranker(reranker.clone(), candidates);
        }
        nodes.push(Box::new(retriever));

        let mut generator = AnswerGenerator::new(
            llm.clone(),
            GenerationConfig::generation(&config.llm),
            config.features.prompt_style,
        )
        .with_previous_answer(config.features.include_previous_answer);
        if let Some(path) = &config.prompts.system_prompt_path {
            generator = generator.with_system_prompt(load_prompt(path)?);
        }
        nodes.push(Box::new(generator));

        let info = llm.info();
        tracing::info!(
            provider = %info.name,
            model = %info.model,
            k = config.retrieval.k,
            reformulation = config.features.enable_reformulation,
            reranker = ?reranker.as_ref().map(|r| r.name()),
            checkpoint = ?config.checkpoint,
            "Pipeline built"
        );

        Ok(PipelineGraph {
            nodes,
            index,
            store,
        })
    }
}

/// A fixed sequence of nodes plus the thread store.
pub struct PipelineGraph {
    nodes: Vec<Box<dyn PipelineNode>>,
    index: Arc<dyn SimilarityIndex>,
    store: Arc<dyn CheckpointStore>,
}

impl PipelineGraph {
    pub fn node_names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    /// The index the retriever searches. Passages upserted here are visible
    /// to the next turn.
    pub fn index(&self) -> &Arc<dyn SimilarityIndex> {
        &self.index
    }

    /// Run every node in order without touching the checkpoint store.
    ///
    /// Reformulation and retrieval can be re-run on the same input and give
    /// the same result. Generation cannot: each successful pass appends
    /// another user/assistant pair, so a caller retrying on a state that
    /// already went through the generator must start again from the state it
    /// had before the first attempt.
    pub async fn run(
        &self,
        mut state: ConversationState,
    ) -> Result<ConversationState, PipelineError> {
        for node in &self.nodes {
            let start = Instant::now();
            state = match node.process(state).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(node = node.name(), error = %e, "Node failed");
                    return Err(e);
                }
            };
            tracing::debug!(
                node = node.name(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Node finished"
            );
        }
        Ok(state)
    }

    /// Answer one question in a thread. The thread's state is only written
    /// back once every node has succeeded.
    pub async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse, InvocationError> {
        let ChatRequest {
            question,
            thread_id,
            messages,
        } = request;
        let thread_id = thread_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let fail = |source: PipelineError| InvocationError {
            question: question.clone(),
            thread_id: thread_id.clone(),
            source,
        };
        let start = Instant::now();
        tracing::info!(thread_id = %thread_id, "Invocation started");

        let existing = self
            .store
            .get(&thread_id)
            .await
            .map_err(|e| fail(PipelineError::Checkpoint(e)))?;
        let state = match existing {
            Some(previous) => {
                if messages.is_some() {
                    tracing::debug!(
                        thread_id = %thread_id,
                        "Ignoring seed messages for existing thread"
                    );
                }
                previous.for_next_turn(question.clone())
            }
            None => {
                ConversationState::new(question.clone()).with_history(messages.unwrap_or_default())
            }
        };

        let state = self
            .run(state)
            .await
            .map_err(&fail)?
            .with_metadata("completed_at", Utc::now().to_rfc3339());
        self.store
            .put(&thread_id, &state)
            .await
            .map_err(|e| fail(PipelineError::Checkpoint(e)))?;

        tracing::info!(
            thread_id = %thread_id,
            messages = state.messages().len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Invocation complete"
        );
        Ok(ChatResponse::from_state(thread_id, &state))
    }
}
