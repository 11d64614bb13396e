use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Conversation history for one session. Process-memory only; history does
/// not survive a restart.
#[derive(Debug, Default)]
pub struct ChatSession {
    pub turns: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn record_exchange(&mut self, user: &str, assistant: &str) {
        self.turns.push(ChatMessage::user(user));
        self.turns.push(ChatMessage::assistant(assistant));
    }
}

/// Shared session map. Concurrent requests on the same session id serialize
/// on the per-session async lock; distinct sessions proceed independently.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<ChatSession>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, requested: Option<&str>) -> (String, Arc<AsyncMutex<ChatSession>>) {
        let session_id = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = sessions.entry(session_id.clone()).or_default().clone();
        (session_id, handle)
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_ids_get_a_generated_session() {
        let store = SessionStore::new();
        let (first_id, _) = store.resolve(None);
        let (second_id, _) = store.resolve(None);
        assert_ne!(first_id, second_id);
        assert_eq!(store.session_count(), 2);
    }

    #[test]
    fn the_same_id_resolves_to_the_same_session() {
        let store = SessionStore::new();
        let (_, first) = store.resolve(Some("client-7"));
        let (_, second) = store.resolve(Some("client-7"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn blank_ids_are_treated_as_absent() {
        let store = SessionStore::new();
        let (id, _) = store.resolve(Some("   "));
        assert!(!id.trim().is_empty());
        assert_ne!(id, "   ");
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_serialize() {
        let store = Arc::new(SessionStore::new());
        let (_, handle) = store.resolve(Some("shared"));

        let mut tasks = Vec::new();
        for turn in 0..4 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut session = handle.lock().await;
                let question = format!("question {turn}");
                let answer = format!("answer {turn}");
                // Hold the lock across the whole exchange.
                session.turns.push(ChatMessage::user(&question));
                tokio::task::yield_now().await;
                session.turns.push(ChatMessage::assistant(&answer));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let session = handle.lock().await;
        assert_eq!(session.turns.len(), 8);
        // Each user turn is immediately followed by its own answer.
        for pair in session.turns.chunks(2) {
            let suffix = pair[0].content.trim_start_matches("question ");
            assert_eq!(pair[1].content, format!("answer {suffix}"));
        }
    }
}
