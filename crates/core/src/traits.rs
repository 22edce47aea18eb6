use crate::{ChatMessage, ChatTurn, HistoryError, IndexError, ScoredChunk, ServiceError};
use async_trait::async_trait;

#[async_trait]
pub trait Retriever {
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError>;
}

#[async_trait]
pub trait ChatModel {
    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError>;
}

/// Ordered, append-only storage of chat turns keyed by session.
#[async_trait]
pub trait ChatHistory {
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatTurn>, HistoryError>;

    async fn add_messages(&self, session_id: &str, turns: &[ChatMessage]) -> Result<(), HistoryError>;
}
