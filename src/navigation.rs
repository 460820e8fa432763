use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;

use crate::error::RelayResult;
use crate::registry::SessionRegistry;
use crate::session::{Message, SessionId};

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#/chat/(chat_\d+)$").expect("address pattern compiles"));

pub fn address_for(id: &SessionId) -> String {
    format!("#/chat/{id}")
}

/// Extracts the session id from a location ending in `#/chat/<id>`.
/// Full locations such as `https://host/app#/chat/chat_1` are accepted.
pub fn parse_address(address: &str) -> Option<SessionId> {
    let caps = ADDRESS_RE.captures(address.trim())?;
    SessionId::parse(caps.get(1)?.as_str())
}

/// The host's addressable location and its history.
pub trait Navigator: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }
    fn current(&self) -> Option<String>;
    /// Overwrites the current entry.
    fn replace(&self, address: &str);
    /// Adds an entry after the current one, dropping any forward entries.
    fn push(&self, address: &str);
    fn back(&self) -> Option<String>;
    fn forward(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct History {
    entries: Vec<String>,
    cursor: usize,
}

/// In-memory back/forward stack.
#[derive(Debug, Default)]
pub struct HistoryNavigator {
    history: Mutex<History>,
}

impl HistoryNavigator {
    pub fn new(initial: Option<String>) -> Self {
        let entries = initial.into_iter().collect();
        Self { history: Mutex::new(History { entries, cursor: 0 }) }
    }

    fn with<T>(&self, f: impl FnOnce(&mut History) -> T) -> T {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut history)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.with(|h| h.entries.len())
    }
}

impl Navigator for HistoryNavigator {
    fn current(&self) -> Option<String> {
        self.with(|h| h.entries.get(h.cursor).cloned())
    }

    fn replace(&self, address: &str) {
        self.with(|h| match h.entries.get_mut(h.cursor) {
            Some(entry) => *entry = address.to_string(),
            None => {
                h.entries.push(address.to_string());
                h.cursor = h.entries.len() - 1;
            }
        })
    }

    fn push(&self, address: &str) {
        self.with(|h| {
            if !h.entries.is_empty() {
                h.entries.truncate(h.cursor + 1);
            }
            h.entries.push(address.to_string());
            h.cursor = h.entries.len() - 1;
        })
    }

    fn back(&self) -> Option<String> {
        self.with(|h| {
            if h.cursor == 0 {
                return None;
            }
            h.cursor -= 1;
            h.entries.get(h.cursor).cloned()
        })
    }

    fn forward(&self) -> Option<String> {
        self.with(|h| {
            if h.cursor + 1 >= h.entries.len() {
                return None;
            }
            h.cursor += 1;
            h.entries.get(h.cursor).cloned()
        })
    }
}

/// Host without address manipulation.
#[derive(Debug, Default)]
pub struct DisabledNavigator;

impl Navigator for DisabledNavigator {
    fn is_supported(&self) -> bool {
        false
    }
    fn current(&self) -> Option<String> {
        None
    }
    fn replace(&self, _address: &str) {}
    fn push(&self, _address: &str) {}
    fn back(&self) -> Option<String> {
        None
    }
    fn forward(&self) -> Option<String> {
        None
    }
}

/// Where the startup active session came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "id", rename_all = "snake_case")]
pub enum Resolution {
    FoundInAddress(SessionId),
    FoundInPointer(SessionId),
    FoundMostRecent(SessionId),
    NoneExists,
}

impl Resolution {
    pub fn id(&self) -> Option<&SessionId> {
        match self {
            Self::FoundInAddress(id) | Self::FoundInPointer(id) | Self::FoundMostRecent(id) => Some(id),
            Self::NoneExists => None,
        }
    }
}

/// Ordered fallback: address, then persisted pointer, then most recent.
/// `known` must be sorted most recent first.
pub fn resolve_startup(known: &[SessionId], address: Option<SessionId>, pointer: Option<SessionId>) -> Resolution {
    let exists = |id: &SessionId| known.contains(id);
    if let Some(id) = address.filter(exists) {
        return Resolution::FoundInAddress(id);
    }
    if let Some(id) = pointer.filter(exists) {
        return Resolution::FoundInPointer(id);
    }
    match known.first() {
        Some(id) => Resolution::FoundMostRecent(id.clone()),
        None => Resolution::NoneExists,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupOutcome {
    pub resolution: Resolution,
    pub active: SessionId,
}

/// Keeps the active session and the host address in step.
pub struct NavigationSynchronizer {
    registry: Arc<SessionRegistry>,
    navigator: Option<Arc<dyn Navigator>>,
    welcome: String,
}

impl NavigationSynchronizer {
    pub fn new(registry: Arc<SessionRegistry>, navigator: Arc<dyn Navigator>, welcome: impl Into<String>) -> Self {
        let navigator = if navigator.is_supported() {
            Some(navigator)
        } else {
            tracing::info!("address manipulation unavailable; tracking active session only");
            None
        };
        Self { registry, navigator, welcome: welcome.into() }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn current_address(&self) -> Option<String> {
        self.navigator.as_ref().and_then(|n| n.current())
    }

    fn replace(&self, id: &SessionId) {
        if let Some(nav) = &self.navigator {
            nav.replace(&address_for(id));
        }
    }

    fn push(&self, id: &SessionId) {
        if let Some(nav) = &self.navigator {
            nav.push(&address_for(id));
        }
    }

    /// Must complete before anything is rendered.
    pub async fn startup(&self) -> RelayResult<StartupOutcome> {
        let count = self.registry.hydrate().await?;
        if count == 0 {
            let session = self.registry.create_session(Message::model(self.welcome.clone())).await?;
            self.replace(&session.id);
            tracing::info!(id = %session.id, "no stored sessions; started a fresh one");
            return Ok(StartupOutcome { resolution: Resolution::NoneExists, active: session.id });
        }

        let known: Vec<SessionId> = self.registry.list_sessions().await.into_iter().map(|s| s.id).collect();
        let address = self.current_address().as_deref().and_then(parse_address);
        let pointer = self.registry.persisted_active_id().await?;
        let resolution = resolve_startup(&known, address, pointer);
        let Some(active) = resolution.id().cloned() else {
            // `known` is non-empty here, so this cannot happen.
            let session = self.registry.create_session(Message::model(self.welcome.clone())).await?;
            self.replace(&session.id);
            return Ok(StartupOutcome { resolution, active: session.id });
        };

        self.replace(&active);
        self.registry.persist_active(&active).await?;
        tracing::info!(id = %active, resolution = ?resolution, "restored active session");
        Ok(StartupOutcome { resolution, active })
    }

    /// Explicit user selection: new history entry unless `id` is already
    /// active.
    pub async fn select(&self, id: &SessionId) -> RelayResult<()> {
        let already_active = self.registry.active_session_id().await.as_ref() == Some(id);
        self.registry.select_session(id).await?;
        if !already_active {
            self.push(id);
        }
        Ok(())
    }

    pub async fn new_chat(&self) -> RelayResult<SessionId> {
        let session = self.registry.create_session(Message::model(self.welcome.clone())).await?;
        self.push(&session.id);
        Ok(session.id)
    }

    /// Deletes a session. Deleting the last one starts a fresh session so
    /// that something is always active.
    pub async fn delete(&self, id: &SessionId) -> RelayResult<SessionId> {
        match self.registry.delete_session(id).await? {
            Some(active) => {
                self.replace(&active);
                Ok(active)
            }
            None => {
                let session = self.registry.create_session(Message::model(self.welcome.clone())).await?;
                self.replace(&session.id);
                Ok(session.id)
            }
        }
    }

    /// Reaction to an externally driven location change. The host already
    /// owns the history entry, so nothing is pushed.
    pub async fn on_navigate(&self, address: &str) -> RelayResult<Option<SessionId>> {
        let Some(id) = parse_address(address) else {
            tracing::debug!(%address, "ignoring address without a session reference");
            return Ok(None);
        };
        if !self.registry.contains(&id).await {
            tracing::debug!(%id, "ignoring navigation to unknown session");
            return Ok(None);
        }
        self.registry.select_session(&id).await?;
        Ok(Some(id))
    }

    pub async fn back(&self) -> RelayResult<Option<SessionId>> {
        self.step(|nav| nav.back()).await
    }

    pub async fn forward(&self) -> RelayResult<Option<SessionId>> {
        self.step(|nav| nav.forward()).await
    }

    /// Moves through history, skipping entries whose session no longer
    /// exists. When only dead entries remain, the entry the cursor ends on is
    /// rewritten to the active session.
    async fn step(&self, advance: impl Fn(&dyn Navigator) -> Option<String>) -> RelayResult<Option<SessionId>> {
        let Some(nav) = &self.navigator else {
            return Ok(None);
        };
        let mut skipped = false;
        while let Some(address) = advance(nav.as_ref()) {
            if let Some(id) = self.on_navigate(&address).await? {
                return Ok(Some(id));
            }
            skipped = true;
        }
        if skipped {
            if let Some(active) = self.registry.active_session_id().await {
                nav.replace(&address_for(&active));
            }
        }
        Ok(None)
    }
}
