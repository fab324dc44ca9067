//! Grounded answer generation.
//!
//! The only node that grows the message history: one user message and one
//! assistant message per successful call.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::{elapsed_ms, PipelineNode};
use crate::config::PromptStyle;
use crate::error::{PipelineError, StateError};
use crate::llm::{GenerationConfig, LanguageModel};
use crate::prompts::{
    minimal_system_prompt, render_system_prompt, DEFAULT_SYSTEM_TEMPLATE, MINIMAL_SYSTEM_PROMPT,
};
use crate::sanitize::strip_reasoning_trace;
use crate::state::{ConversationState, Message};

const NODE: &str = "generator";

pub struct AnswerGenerator {
    llm: Arc<dyn LanguageModel>,
    generation: GenerationConfig,
    style: PromptStyle,
    /// Replaces the built-in instructions (minimal) or template (templated).
    system_prompt: Option<String>,
    include_previous_answer: bool,
}

impl AnswerGenerator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        generation: GenerationConfig,
        style: PromptStyle,
    ) -> Self {
        Self {
            llm,
            generation,
            style,
            system_prompt: None,
            include_previous_answer: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_previous_answer(mut self, include: bool) -> Self {
        self.include_previous_answer = include;
        self
    }

    fn system_message(&self, context: &str, history: &[Message]) -> Message {
        let custom = self.system_prompt.as_deref();
        let content = match self.style {
            PromptStyle::Minimal => {
                minimal_system_prompt(custom.unwrap_or(MINIMAL_SYSTEM_PROMPT), context)
            }
            PromptStyle::Templated => {
                render_system_prompt(custom.unwrap_or(DEFAULT_SYSTEM_TEMPLATE), context, history)
            }
        };
        Message::system(content)
    }

    /// System message, then the thread history, then the current question.
    pub fn build_messages(&self, state: &ConversationState) -> Result<Vec<Message>, StateError> {
        if state.question().trim().is_empty() {
            return Err(StateError::Missing { field: "question" });
        }
        let context = match state.context() {
            Some(c) if !c.trim().is_empty() => c,
            _ => return Err(StateError::Missing { field: "context" }),
        };

        // On a carried-over state `answer` still holds the previous turn's reply.
        let context = match state.answer() {
            Some(previous) if self.include_previous_answer => {
                format!("{}\n\nPrevious answer:\n{}", context, previous)
            }
            _ => context.to_string(),
        };

        let mut messages = Vec::with_capacity(state.messages().len() + 2);
        messages.push(self.system_message(&context, state.messages()));
        messages.extend_from_slice(state.messages());
        messages.push(Message::user(state.user_question()));
        Ok(messages)
    }
}

#[async_trait]
impl PipelineNode for AnswerGenerator {
    fn name(&self) -> &'static str {
        NODE
    }

    async fn process(&self, state: ConversationState) -> Result<ConversationState, PipelineError> {
        let messages = self
            .build_messages(&state)
            .map_err(|e| PipelineError::precondition(NODE, e))?;
        let start = Instant::now();

        let raw = self
            .llm
            .chat(&messages, &self.generation)
            .await
            .map_err(|e| PipelineError::upstream(NODE, e))?;

        let answer = strip_reasoning_trace(&raw);
        if answer.is_empty() {
            return Err(PipelineError::upstream(
                NODE,
                anyhow!("model returned an empty answer"),
            ));
        }
        tracing::debug!(answer_chars = answer.len(), "Answer generated");

        let user_message = Message::user(state.user_question());
        let model = self.llm.info().model;
        let state = state
            .with_generated_answer(user_message, answer)
            .map_err(|e| PipelineError::precondition(NODE, e))?;
        Ok(state
            .with_metadata("model", model)
            .with_metadata("generator_ms", elapsed_ms(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Passage, Role};
    use crate::testing::{FailingModel, ScriptedModel};

    fn grounded(question: &str) -> ConversationState {
        ConversationState::new(question)
            .with_retrieved_context(vec![Passage::new(
                "Dr. Asha Mehta is the head of the department.",
            )])
            .unwrap()
    }

    fn generator(llm: Arc<dyn LanguageModel>, style: PromptStyle) -> AnswerGenerator {
        AnswerGenerator::new(llm, GenerationConfig::default(), style)
    }

    #[tokio::test]
    async fn test_answer_is_sanitized_and_history_grows_by_two() {
        let llm = Arc::new(ScriptedModel::new([
            "<think>internal notes</think>Dr. Asha Mehta heads the department.",
        ]));
        let state = grounded("Who is the head of the department?");

        let out = generator(llm, PromptStyle::Minimal)
            .process(state)
            .await
            .unwrap();

        assert_eq!(out.answer(), Some("Dr. Asha Mehta heads the department."));
        assert_eq!(
            out.messages(),
            &[
                Message::user("Who is the head of the department?"),
                Message::assistant("Dr. Asha Mehta heads the department."),
            ]
        );
        assert_eq!(out.source_docs().len(), 1);
        assert_eq!(out.metadata()["model"], "scripted-test");
    }

    #[tokio::test]
    async fn test_missing_context_is_precondition_without_side_effects() {
        let llm = Arc::new(ScriptedModel::new(["unused"]));
        let err = generator(llm.clone(), PromptStyle::Minimal)
            .process(ConversationState::new("Who is the head?"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Precondition { node: "generator", field: "context" }
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_minimal_prompt_layout() {
        let llm = Arc::new(ScriptedModel::new(["Dr. Mehta."]));
        let state = grounded("Who is the head?").with_history(vec![
            Message::user("hello"),
            Message::assistant("Hi, how can I help?"),
        ]);

        generator(llm.clone(), PromptStyle::Minimal)
            .process(state)
            .await
            .unwrap();

        let calls = llm.calls();
        let sent = &calls[0];
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.starts_with(MINIMAL_SYSTEM_PROMPT));
        assert!(sent[0]
            .content
            .ends_with("Context:\nDr. Asha Mehta is the head of the department."));
        assert_eq!(sent[1], Message::user("hello"));
        assert_eq!(sent[3], Message::user("Who is the head?"));
    }

    #[tokio::test]
    async fn test_templated_prompt_includes_transcript() {
        let llm = Arc::new(ScriptedModel::new(["Dr. Mehta."]));
        let state = grounded("Who is the head?").with_history(vec![Message::user("hello")]);

        generator(llm.clone(), PromptStyle::Templated)
            .with_system_prompt("Facts:\n{context}\nSo far:\n{history}")
            .process(state)
            .await
            .unwrap();

        let calls = llm.calls();
        let system = &calls[0][0].content;
        assert_eq!(
            system,
            "Facts:\nDr. Asha Mehta is the head of the department.\nSo far:\nUser: hello"
        );
    }

    #[tokio::test]
    async fn test_previous_answer_appended_to_context() {
        let turn_one = grounded("Who is the head?")
            .with_generated_answer(Message::user("Who is the head?"), "Dr. Asha Mehta.")
            .unwrap();
        let turn_two = turn_one
            .for_next_turn("What is their email?")
            .with_retrieved_context(vec![Passage::new("Email: asha.mehta@univ.edu")])
            .unwrap();

        let with = generator(Arc::new(FailingModel), PromptStyle::Minimal);
        let messages = with.build_messages(&turn_two).unwrap();
        assert!(messages[0]
            .content
            .ends_with("Email: asha.mehta@univ.edu\n\nPrevious answer:\nDr. Asha Mehta."));

        let without =
            generator(Arc::new(FailingModel), PromptStyle::Minimal).with_previous_answer(false);
        let messages = without.build_messages(&turn_two).unwrap();
        assert!(messages[0].content.ends_with("Email: asha.mehta@univ.edu"));
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_history_alone() {
        let err = generator(Arc::new(FailingModel), PromptStyle::Minimal)
            .process(grounded("Who is the head?"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upstream { stage: "generator", .. }));
    }

    #[tokio::test]
    async fn test_unbalanced_trace_keeps_raw_text() {
        let llm = Arc::new(ScriptedModel::new(["<think>unfinished. Dr. Mehta."]));
        let out = generator(llm, PromptStyle::Minimal)
            .process(grounded("Who is the head?"))
            .await
            .unwrap();
        assert_eq!(out.answer(), Some("<think>unfinished. Dr. Mehta."));
    }

    #[tokio::test]
    async fn test_rerun_appends_another_exchange() {
        let llm = Arc::new(ScriptedModel::new(["Dr. Asha Mehta.", "Dr. Asha Mehta."]));
        let node = generator(llm, PromptStyle::Minimal);

        let once = node.process(grounded("Who is the head?")).await.unwrap();
        assert_eq!(once.messages().len(), 2);

        let twice = node.process(once).await.unwrap();
        assert_eq!(twice.messages().len(), 4);
        assert_eq!(twice.messages()[0], twice.messages()[2]);
    }
}
