//! Error types for the pipeline surface.
//!
//! Collaborators (gateway, embeddings, index, checkpoint store) speak
//! `anyhow::Result`. Everything the pipeline hands back to its caller is
//! classified here so a client can tell its own mistakes apart from
//! upstream faults.

use thiserror::Error;

/// A state transition was attempted without one of its required inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("required field `{field}` is missing or empty")]
    Missing { field: &'static str },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A node's required input is absent. Caller-contract violation, never retried.
    #[error("precondition failed in {node}: `{field}` is required")]
    Precondition {
        node: &'static str,
        field: &'static str,
    },

    /// The language model gateway or similarity index failed.
    #[error("upstream failure in {stage}: {source}")]
    Upstream {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint store failure: {0}")]
    Checkpoint(#[source] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn precondition(node: &'static str, err: StateError) -> Self {
        match err {
            StateError::Missing { field } => Self::Precondition { node, field },
        }
    }

    pub(crate) fn upstream(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Upstream { stage, source }
    }

    /// Whether re-running the whole invocation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Checkpoint(_))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

/// Failure of a whole invocation. Carries the caller's question and thread id
/// unchanged so the client can retry without losing its place.
#[derive(Debug, Error)]
#[error("invocation failed for thread {thread_id}: {source}")]
pub struct InvocationError {
    pub question: String,
    pub thread_id: String,
    #[source]
    pub source: PipelineError,
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}
