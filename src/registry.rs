use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::backend::{Conversation, GenerativeBackend};
use crate::error::{RelayError, RelayResult};
use crate::session::{ChatSession, Message, SessionId};
use crate::storage::SessionStore;

const EVENT_CAPACITY: usize = 64;

/// Change notifications for whoever renders sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Created { id: SessionId },
    MessageAppended { id: SessionId, index: usize },
    TitleChanged { id: SessionId, title: String },
    ActiveChanged { id: Option<SessionId> },
    Deleted { id: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub message_count: usize,
}

/// In-process owner of every session. Each mutation is written to the
/// store before it becomes visible in memory.
///
/// Lock order: `sessions` before `active`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, ChatSession>>,
    active: RwLock<Option<SessionId>>,
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn GenerativeBackend>,
    system_prompt: String,
    conversations: Mutex<HashMap<SessionId, Arc<dyn Conversation>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, backend: Arc<dyn GenerativeBackend>, system_prompt: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            store,
            backend,
            system_prompt: system_prompt.into(),
            conversations: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Replaces the in-memory view with whatever the store holds.
    pub async fn hydrate(&self) -> RelayResult<usize> {
        let loaded = self.store.get_all_sessions().await.map_err(RelayError::Storage)?;
        let count = loaded.len();
        *self.sessions.write().await = loaded;
        tracing::info!(count, "loaded chat sessions");
        Ok(count)
    }

    pub async fn persisted_active_id(&self) -> RelayResult<Option<SessionId>> {
        self.store.get_active_session_id().await.map_err(RelayError::Storage)
    }

    /// Persists the session and the active pointer before either becomes
    /// visible. A failed pointer write removes the stored session again.
    pub async fn create_session(&self, initial: Message) -> RelayResult<ChatSession> {
        let session = ChatSession::new(initial);
        let id = session.id.clone();
        {
            let mut sessions = self.sessions.write().await;
            let mut active = self.active.write().await;
            self.store.save_session(&session).await.map_err(RelayError::Storage)?;
            if let Err(err) = self.store.set_active_session_id(Some(&id)).await {
                if let Err(undo) = self.store.delete_session(&id).await {
                    tracing::error!(%id, error = %format!("{undo:#}"), "failed to remove partially created session");
                }
                return Err(RelayError::Storage(err));
            }
            sessions.insert(id.clone(), session.clone());
            *active = Some(id.clone());
        }
        self.emit(SessionEvent::Created { id: id.clone() });
        self.emit(SessionEvent::ActiveChanged { id: Some(id.clone()) });
        self.conversation(&id);
        tracing::info!(%id, "created chat session");
        Ok(session)
    }

    /// Appends to an existing session. Unknown ids are rejected without
    /// touching any state.
    pub async fn append_message(&self, id: &SessionId, message: Message) -> RelayResult<ChatSession> {
        let (updated, title_changed) = {
            let mut sessions = self.sessions.write().await;
            let Some(current) = sessions.get(id) else {
                tracing::warn!(%id, "append to unknown session ignored");
                return Err(RelayError::UnknownSession(id.clone()));
            };
            let mut updated = current.clone();
            let title_changed = updated.push(message);
            self.store.save_session(&updated).await.map_err(RelayError::Storage)?;
            sessions.insert(id.clone(), updated.clone());
            (updated, title_changed)
        };
        self.emit(SessionEvent::MessageAppended { id: id.clone(), index: updated.messages.len() - 1 });
        if title_changed {
            self.emit(SessionEvent::TitleChanged { id: id.clone(), title: updated.title.clone() });
        }
        Ok(updated)
    }

    pub async fn select_session(&self, id: &SessionId) -> RelayResult<()> {
        if !self.contains(id).await {
            tracing::warn!(%id, "select of unknown session ignored");
            return Err(RelayError::UnknownSession(id.clone()));
        }
        self.set_active(Some(id.clone())).await
    }

    /// Removes a session. When it was active, the most recent remaining
    /// session takes over, or the pointer is cleared if none is left.
    pub async fn delete_session(&self, id: &SessionId) -> RelayResult<Option<SessionId>> {
        let (next_active, active_changed) = {
            let mut sessions = self.sessions.write().await;
            let mut active = self.active.write().await;
            let Some(removed) = sessions.get(id).cloned() else {
                tracing::warn!(%id, "delete of unknown session ignored");
                return Err(RelayError::UnknownSession(id.clone()));
            };
            let was_active = active.as_ref() == Some(id);
            let next_active = if was_active {
                sessions.keys().filter(|k| *k != id).min_by(|a, b| a.recency_cmp(b)).cloned()
            } else {
                active.clone()
            };

            self.store.delete_session(id).await.map_err(RelayError::Storage)?;
            if was_active {
                if let Err(err) = self.store.set_active_session_id(next_active.as_ref()).await {
                    if let Err(undo) = self.store.save_session(&removed).await {
                        tracing::error!(%id, error = %format!("{undo:#}"), "failed to restore session after aborted delete");
                    }
                    return Err(RelayError::Storage(err));
                }
            }
            sessions.remove(id);
            *active = next_active.clone();
            (next_active, was_active)
        };
        self.conversations.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(id);
        self.emit(SessionEvent::Deleted { id: id.clone() });
        if active_changed {
            self.emit(SessionEvent::ActiveChanged { id: next_active.clone() });
        }
        tracing::info!(%id, "deleted chat session");
        Ok(next_active)
    }

    async fn set_active(&self, id: Option<SessionId>) -> RelayResult<()> {
        let mut active = self.active.write().await;
        if *active == id {
            return Ok(());
        }
        self.store.set_active_session_id(id.as_ref()).await.map_err(RelayError::Storage)?;
        *active = id.clone();
        drop(active);
        tracing::debug!(id = ?id, "active session changed");
        self.emit(SessionEvent::ActiveChanged { id });
        Ok(())
    }

    /// Writes the pointer even when it already matches memory.
    pub(crate) async fn persist_active(&self, id: &SessionId) -> RelayResult<()> {
        if !self.contains(id).await {
            return Err(RelayError::UnknownSession(id.clone()));
        }
        let mut active = self.active.write().await;
        self.store.set_active_session_id(Some(id)).await.map_err(RelayError::Storage)?;
        let changed = active.as_ref() != Some(id);
        *active = Some(id.clone());
        drop(active);
        if changed {
            self.emit(SessionEvent::ActiveChanged { id: Some(id.clone()) });
        }
        Ok(())
    }

    pub async fn active_session_id(&self) -> Option<SessionId> {
        self.active.read().await.clone()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn get_session(&self, id: &SessionId) -> Option<ChatSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Most recent first, recomputed on every call.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSummary> = sessions
            .values()
            .map(|s| SessionSummary { id: s.id.clone(), title: s.title.clone(), message_count: s.messages.len() })
            .collect();
        out.sort_by(|a, b| a.id.recency_cmp(&b.id));
        out
    }

    /// Remote context for a session, created on first use and kept for the
    /// life of the process.
    pub fn conversation(&self, id: &SessionId) -> Arc<dyn Conversation> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .entry(id.clone())
            .or_insert_with(|| self.backend.create_conversation(&self.system_prompt))
            .clone()
    }
}
