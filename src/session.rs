use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TITLE: &str = "New Chat";
pub const TITLE_MAX_CHARS: usize = 30;

const ID_PREFIX: &str = "chat_";

static LAST_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Session identifier of the form `chat_<unix-millis>`.
///
/// The numeric suffix doubles as the creation timestamp, so ordering ids
/// recovers recency without a separate index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocates a fresh id. Strictly increasing within the process even when
    /// two sessions are created in the same millisecond.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_ID_MILLIS.load(AtomicOrdering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match LAST_ID_MILLIS.compare_exchange_weak(
                last,
                next,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Self(format!("{ID_PREFIX}{next}")),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix(ID_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn millis(&self) -> Option<u128> {
        self.0.strip_prefix(ID_PREFIX)?.parse().ok()
    }

    /// Most recent first.
    pub fn recency_cmp(&self, other: &Self) -> Ordering {
        match (self.millis(), other.millis()) {
            (Some(a), Some(b)) => b.cmp(&a),
            _ => other.0.cmp(&self.0),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: Some(text.into()), image_url: None }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: Some(text.into()), image_url: None }
    }

    pub fn model_with_image(text: Option<String>, image_url: impl Into<String>) -> Self {
        Self { role: Role::Model, text, image_url: Some(image_url.into()) }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
}

impl ChatSession {
    pub fn new(initial: Message) -> Self {
        Self {
            id: SessionId::generate(),
            title: DEFAULT_TITLE.to_string(),
            messages: vec![initial],
        }
    }

    /// Appends a message and returns true when the title changed as a result.
    pub fn push(&mut self, message: Message) -> bool {
        let first_user_turn = message.is_user() && !self.messages.iter().any(Message::is_user);
        let new_title = match (&message.text, first_user_turn) {
            (Some(text), true) => Some(derive_title(text)),
            _ => None,
        };
        self.messages.push(message);
        match new_title {
            Some(title) if title != self.title => {
                self.title = title;
                true
            }
            _ => false,
        }
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.is_user())
            .find_map(|m| m.text.as_deref())
    }
}

pub fn derive_title(prompt: &str) -> String {
    match prompt.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &prompt[..cut]),
        None => prompt.to_string(),
    }
}
