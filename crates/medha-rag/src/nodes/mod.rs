//! Pipeline stages. Each node consumes a state and returns the next one.

pub mod generator;
pub mod reformulator;
pub mod retriever;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::state::ConversationState;

pub use generator::AnswerGenerator;
pub use reformulator::QueryReformulator;
pub use retriever::{PassagePreview, Retriever};

#[async_trait]
pub trait PipelineNode: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, state: ConversationState) -> Result<ConversationState, PipelineError>;
}

pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
