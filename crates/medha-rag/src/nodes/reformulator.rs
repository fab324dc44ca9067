//! Rewrites a follow-up question into a self-contained one.
//!
//! "What is their email?" only retrieves well once "their" is replaced by the
//! person named earlier in the thread.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::{elapsed_ms, PipelineNode};
use crate::error::{PipelineError, StateError};
use crate::llm::{GenerationConfig, LanguageModel};
use crate::prompts::reformulation_prompt;
use crate::sanitize::strip_reasoning_trace;
use crate::state::ConversationState;

const NODE: &str = "reformulator";

pub struct QueryReformulator {
    llm: Arc<dyn LanguageModel>,
    generation: GenerationConfig,
}

impl QueryReformulator {
    pub fn new(llm: Arc<dyn LanguageModel>, generation: GenerationConfig) -> Self {
        Self { llm, generation }
    }
}

const REWRITE_LABEL: &str = "rewritten question:";

/// Models like to echo the prompt's label or wrap the rewrite in quotes.
/// Everything else, including further lines, is the question.
fn clean_rewrite(text: &str) -> String {
    let text = text.trim();
    let text = match text.get(..REWRITE_LABEL.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(REWRITE_LABEL) => {
            text[REWRITE_LABEL.len()..].trim()
        }
        _ => text,
    };
    for quote in ['"', '\'', '`'] {
        if text.len() > 1 && text.starts_with(quote) && text.ends_with(quote) {
            return text[1..text.len() - 1].trim().to_string();
        }
    }
    text.to_string()
}

#[async_trait]
impl PipelineNode for QueryReformulator {
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

        let prompt = reformulation_prompt(state.messages(), state.question());
        let raw = self
            .llm
            .generate(&prompt, &self.generation)
            .await
            .map_err(|e| PipelineError::upstream(NODE, e))?;

        let rewritten = clean_rewrite(&strip_reasoning_trace(&raw));
        if rewritten.is_empty() {
            return Err(PipelineError::upstream(
                NODE,
                anyhow!("model returned an empty rewrite"),
            ));
        }

        tracing::debug!(
            original = %state.question(),
            rewritten = %rewritten,
            "Question reformulated"
        );
        let original = state.question().to_string();
        let state = state
            .with_reformulated_question(rewritten.clone())
            .map_err(|e| PipelineError::precondition(NODE, e))?;

        Ok(state
            .with_metadata("original_question", original)
            .with_metadata("reformulated_question", rewritten)
            .with_metadata("reformulator_ms", elapsed_ms(start)))
    }
}
