//! In-memory message store for runs that should leave nothing on disk

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use crate::conversation::{ChatMessage, MessageRole, MessageStore, Session};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    /// Creation order; listing reorders by `updated_at`
    sessions: Vec<(Session, Vec<ChatMessage>)>,
}

/// Message store that forgets everything on drop
#[derive(Default)]
pub struct EphemeralStore {
    inner: Mutex<Inner>,
}

impl EphemeralStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageStore for EphemeralStore {
    fn create_session(&self, title: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.lock().sessions.push((session.clone(), Vec::new()));
        Ok(session)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let inner = self.lock();
        let mut sessions: Vec<(usize, Session)> = inner
            .sessions
            .iter()
            .enumerate()
            .map(|(i, (s, _))| (i, s.clone()))
            .collect();
        sessions.sort_by(|(ia, a), (ib, b)| b.updated_at.cmp(&a.updated_at).then(ib.cmp(ia)));
        Ok(sessions.into_iter().map(|(_, s)| s).collect())
    }

    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let mut inner = self.lock();
        let (session, messages) = inner
            .sessions
            .iter_mut()
            .find(|(s, _)| s.id == session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        session.updated_at = Utc::now();
        messages.push(ChatMessage {
            role,
            content: content.to_string(),
        });
        Ok(())
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .find(|(s, _)| s.id == session_id)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip() {
        let store = EphemeralStore::new();
        let session = store.create_session("s").unwrap();

        store
            .save_message(&session.id, MessageRole::User, "hi")
            .unwrap();
        store
            .save_message(&session.id, MessageRole::Assistant, "hello")
            .unwrap();

        assert_eq!(
            store.load_messages(&session.id).unwrap(),
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]
        );
    }

    #[test]
    fn unknown_session() {
        let store = EphemeralStore::new();
        assert!(matches!(
            store.save_message("x", MessageRole::User, "hi"),
            Err(Error::NotFound(_))
        ));
        assert!(store.load_messages("x").unwrap().is_empty());
    }

    #[test]
    fn newest_session_listed_first() {
        let store = EphemeralStore::new();
        let a = store.create_session("a").unwrap();
        let b = store.create_session("b").unwrap();

        let ids: Vec<String> = store.list_sessions().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }
}
