//! Conversation state threaded through the pipeline.
//!
//! Nodes never mutate a state in place. Each transition consumes the value and
//! returns the next one, and the transition itself refuses to produce a state
//! that breaks the turn invariants:
//! - `context` and `source_docs` are set together, by retrieval only.
//! - `answer` is only set once a context exists.
//! - `messages` only ever grows, two entries per answered turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

pub type Metadata = serde_json::Map<String, Value>;

const CONTEXT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An atomic retrievable unit. Opaque to the pipeline beyond its text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Passage {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Passage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `metadata["source"]` when it is a string.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationState {
    question: String,
    /// Caller's wording of the current question, kept once reformulation
    /// replaces `question`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_question: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    source_docs: Vec<Passage>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    metadata: Metadata,
}

impl ConversationState {
    /// Fresh state for a thread seen for the first time.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    /// Seeds history on a fresh state (caller-supplied prior messages).
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Layers a new turn's question onto a persisted state.
    ///
    /// History, the previous context and the previous answer are carried over
    /// so the generator can consult the prior answer; retrieval replaces the
    /// context before generation runs.
    pub fn for_next_turn(mut self, question: impl Into<String>) -> Self {
        self.question = question.into();
        self.original_question = None;
        self.metadata.clear();
        self
    }

    pub fn with_reformulated_question(
        mut self,
        rewritten: impl Into<String>,
    ) -> Result<Self, StateError> {
        let rewritten = rewritten.into();
        if rewritten.trim().is_empty() {
            return Err(StateError::Missing { field: "question" });
        }
        if self.original_question.is_none() {
            self.original_question = Some(std::mem::take(&mut self.question));
        }
        self.question = rewritten.trim().to_string();
        Ok(self)
    }

    /// Attaches retrieval output. Passages are joined with a blank line in
    /// rank order.
    pub fn with_retrieved_context(mut self, passages: Vec<Passage>) -> Result<Self, StateError> {
        if self.question.trim().is_empty() {
            return Err(StateError::Missing { field: "question" });
        }
        let context = passages
            .iter()
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        self.context = Some(context);
        self.source_docs = passages;
        Ok(self)
    }

    /// Records the answer and appends the user/assistant pair to history.
    pub fn with_generated_answer(
        mut self,
        user_message: Message,
        answer: impl Into<String>,
    ) -> Result<Self, StateError> {
        if self.question.trim().is_empty() {
            return Err(StateError::Missing { field: "question" });
        }
        if !self.has_context() {
            return Err(StateError::Missing { field: "context" });
        }
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(StateError::Missing { field: "answer" });
        }
        self.messages.push(user_message);
        self.messages.push(Message::assistant(answer.clone()));
        self.answer = Some(answer);
        Ok(self)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    /// The question as the caller asked it this turn.
    pub fn user_question(&self) -> &str {
        self.original_question.as_deref().unwrap_or(&self.question)
    }

    /// The self-contained rewrite, if reformulation ran this turn.
    pub fn reformulated_question(&self) -> Option<&str> {
        self.original_question
            .as_ref()
            .map(|_| self.question.as_str())
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn has_context(&self) -> bool {
        self.context.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn source_docs(&self) -> &[Passage] {
        &self.source_docs
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Checks the invariants a deserialized state must satisfy.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        if self.answer.is_some() && self.context.is_none() {
            return Err(StateError::Missing { field: "context" });
        }
        if self.context.is_none() && !self.source_docs.is_empty() {
            return Err(StateError::Missing { field: "context" });
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let preview = match &self.context {
            Some(ctx) => {
                let head: String = ctx.chars().take(CONTEXT_PREVIEW_CHARS).collect();
                if ctx.chars().count() > CONTEXT_PREVIEW_CHARS {
                    format!("{}...", head)
                } else {
                    head
                }
            }
            None => "None".to_string(),
        };
        format!(
            "ConversationState Summary:\n - Question: {}\n - Has Context: {}\n \
             - Context Preview: {}\n - Has Answer: {}\n - Messages: {}\n",
            self.question,
            self.context.is_some(),
            preview,
            self.answer.is_some(),
            self.messages.len()
        )
    }
}
