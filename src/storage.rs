use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tokio::sync::RwLock;

use crate::session::{ChatSession, Message, SessionId};

const ACTIVE_CHAT_ID_KEY: &str = "activeChatId";

/// Durable home of every chat session plus the active-session pointer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Every persisted session. An empty or never-used store yields an empty map.
    async fn get_all_sessions(&self) -> anyhow::Result<HashMap<SessionId, ChatSession>>;
    /// Upsert by id.
    async fn save_session(&self, session: &ChatSession) -> anyhow::Result<()>;
    /// No-op when the id is absent.
    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()>;
    async fn get_active_session_id(&self) -> anyhow::Result<Option<SessionId>>;
    /// `None` removes the pointer.
    async fn set_active_session_id(&self, id: Option<&SessionId>) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(%url, "session store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("chat_relay");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("chat_relay.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_all_sessions(&self) -> anyhow::Result<HashMap<SessionId, ChatSession>> {
        let rows = sqlx::query("SELECT id, title, messages_json FROM sessions")
            .fetch_all(&self.pool)
            .await?;
        let mut sessions = HashMap::with_capacity(rows.len());
        for r in rows {
            let raw_id: String = r.get("id");
            let Some(id) = SessionId::parse(&raw_id) else {
                tracing::warn!(id = %raw_id, "skipping stored session with malformed id");
                continue;
            };
            let messages_json: String = r.get("messages_json");
            let messages: Vec<Message> = match serde_json::from_str(&messages_json) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(%id, error = %err, "skipping stored session with unreadable messages");
                    continue;
                }
            };
            let title: String = r.get("title");
            sessions.insert(id.clone(), ChatSession { id, title, messages });
        }
        Ok(sessions)
    }

    async fn save_session(&self, session: &ChatSession) -> anyhow::Result<()> {
        let messages_json = serde_json::to_string(&session.messages)?;
        sqlx::query(
            "INSERT INTO sessions (id, title, messages_json, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, messages_json = excluded.messages_json, updated_at = excluded.updated_at",
        )
        .bind(session.id.as_str())
        .bind(&session.title)
        .bind(messages_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_active_session_id(&self) -> anyhow::Result<Option<SessionId>> {
        let row = sqlx::query("SELECT value FROM app_state WHERE key = ?1")
            .bind(ACTIVE_CHAT_ID_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let value: String = r.get("value");
            SessionId::parse(&value)
        }))
    }

    async fn set_active_session_id(&self, id: Option<&SessionId>) -> anyhow::Result<()> {
        match id {
            Some(id) => {
                sqlx::query(
                    "INSERT INTO app_state (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(ACTIVE_CHAT_ID_KEY)
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM app_state WHERE key = ?1")
                    .bind(ACTIVE_CHAT_ID_KEY)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Process-local store used when the durable one cannot be opened.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, ChatSession>>,
    active: RwLock<Option<SessionId>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_all_sessions(&self) -> anyhow::Result<HashMap<SessionId, ChatSession>> {
        Ok(self.sessions.read().await.clone())
    }

    async fn save_session(&self, session: &ChatSession) -> anyhow::Result<()> {
        self.sessions.write().await.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn get_active_session_id(&self) -> anyhow::Result<Option<SessionId>> {
        Ok(self.active.read().await.clone())
    }

    async fn set_active_session_id(&self, id: Option<&SessionId>) -> anyhow::Result<()> {
        *self.active.write().await = id.cloned();
        Ok(())
    }
}

/// Store doubles for exercising failure paths.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to a [`MemorySessionStore`] until a write kind is switched
    /// off, after which that write bails.
    #[derive(Default)]
    pub struct FailingStore {
        pub inner: MemorySessionStore,
        pub fail_save: AtomicBool,
        pub fail_delete: AtomicBool,
        pub fail_pointer: AtomicBool,
    }

    impl FailingStore {
        pub fn fail_all_writes(&self) {
            self.fail_save.store(true, Ordering::SeqCst);
            self.fail_delete.store(true, Ordering::SeqCst);
            self.fail_pointer.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn get_all_sessions(&self) -> anyhow::Result<HashMap<SessionId, ChatSession>> {
            self.inner.get_all_sessions().await
        }

        async fn save_session(&self, session: &ChatSession) -> anyhow::Result<()> {
            if self.fail_save.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.save_session(session).await
        }

        async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.delete_session(id).await
        }

        async fn get_active_session_id(&self) -> anyhow::Result<Option<SessionId>> {
            self.inner.get_active_session_id().await
        }

        async fn set_active_session_id(&self, id: Option<&SessionId>) -> anyhow::Result<()> {
            if self.fail_pointer.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.set_active_session_id(id).await
        }
    }
}
