use crate::models::{ChatMessage, ChatTurn};
use crate::traits::ChatHistory;
use crate::HistoryError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Session-scoped history that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    sessions: Mutex<HashMap<String, Vec<ChatTurn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistory for InMemoryHistory {
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatTurn>, HistoryError> {
        let sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn add_messages(&self, session_id: &str, turns: &[ChatMessage]) -> Result<(), HistoryError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = sessions.entry(session_id.to_string()).or_default();
        stored.extend(
            turns
                .iter()
                .cloned()
                .map(|message| ChatTurn::new(session_id, message)),
        );
        Ok(())
    }
}
