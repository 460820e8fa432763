use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::backend::{ChatReply, GenerativeBackend, ImageOutcome};
use crate::error::{RelayError, RelayResult};
use crate::registry::SessionRegistry;
use crate::session::{ChatSession, Message, SessionId};

pub const IMAGE_KEYWORDS: [&str; 7] = ["draw", "diagram", "graph", "image", "picture", "sketch", "illustrate"];
pub const FOLLOW_UP_MAX_WORDS: usize = 3;
pub const FOLLOW_UP_PREFIX: &str = "A diagram about the physics concept: ";

pub mod replies {
    pub const CHAT_BLOCKED: &str =
        "Sorry, I cannot answer that question as it might violate safety policies. Please ask something else.";
    pub const CHAT_EMPTY: &str = "Sorry, I seem to be at a loss for words. Could you please rephrase your question?";
    pub const IMAGE_BLOCKED: &str =
        "Nenu ee image ni draw cheyalenu, it might be against the safety policy. Vere question adugu please.";
    pub const IMAGE_DECLINED: &str = "Sorry mawa, ee topic ki image generate cheyadam kastam ga undi. Vere la adigi chudu?";
    pub const IMAGE_MISSING: &str = "Sorry, I couldn't draw that for you right now. Try asking in a different way?";
    pub const IMAGE_INVALID: &str = "Sorry, I couldn't generate an image for that. The API returned an empty or invalid response. Please try a different prompt.";
    pub const IMAGE_INTRO: &str = "Chala manchi question! Here is a diagram for you:";
    pub const FAILURE: &str = "Oops! Something went wrong. Konchem sepu aagi try cheyandi.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Text,
    Image,
}

impl Route {
    fn label(self) -> &'static str {
        match self {
            Route::Text => "text",
            Route::Image => "image",
        }
    }
}

/// Keyword heuristic: any image keyword anywhere in the text, ignoring case.
pub fn classify(text: &str) -> Route {
    let lower = text.to_lowercase();
    if IMAGE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Route::Image
    } else {
        Route::Text
    }
}

/// Short requests such as "draw it" borrow the subject of the previous user
/// message.
pub fn image_prompt(text: &str, previous_user_text: Option<&str>) -> String {
    let short = text.split_whitespace().count() <= FOLLOW_UP_MAX_WORDS;
    match previous_user_text.filter(|t| short && !t.trim().is_empty()) {
        Some(prev) => format!("{FOLLOW_UP_PREFIX}{prev}"),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub session_id: SessionId,
    pub route: Route,
    pub reply: Message,
}

struct InFlight<'a> {
    pending: &'a Mutex<HashSet<SessionId>>,
    id: SessionId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&self.id);
    }
}

pub struct ConversationRouter {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn GenerativeBackend>,
    pending: Mutex<HashSet<SessionId>>,
}

impl ConversationRouter {
    pub fn new(registry: Arc<SessionRegistry>, backend: Arc<dyn GenerativeBackend>) -> Self {
        Self { registry, backend, pending: Mutex::new(HashSet::new()) }
    }

    fn begin(&self, id: &SessionId) -> RelayResult<InFlight<'_>> {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !pending.insert(id.clone()) {
            return Err(RelayError::Busy(id.clone()));
        }
        Ok(InFlight { pending: &self.pending, id: id.clone() })
    }

    #[cfg(test)]
    pub fn is_busy(&self, id: &SessionId) -> bool {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(id)
    }

    /// Sends to whichever session is active right now. The reply lands in
    /// that session even if the active session changes while waiting.
    pub async fn send(&self, text: &str) -> RelayResult<Exchange> {
        let id = self.registry.active_session_id().await.ok_or(RelayError::NoActiveSession)?;
        self.send_to(&id, text).await
    }

    pub async fn send_to(&self, id: &SessionId, text: &str) -> RelayResult<Exchange> {
        if text.trim().is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let before = self.registry.get_session(id).await.ok_or_else(|| {
            tracing::warn!(%id, "send to unknown session ignored");
            RelayError::UnknownSession(id.clone())
        })?;
        let _guard = self.begin(id)?;

        self.registry.append_message(id, Message::user(text)).await?;

        let route = classify(text);
        metrics::counter!("chat_relay_messages_total", "route" => route.label()).increment(1);
        tracing::debug!(%id, route = route.label(), "routing message");

        let reply = match route {
            Route::Image => self.image_reply(&before, text).await,
            Route::Text => self.text_reply(id, text).await,
        };
        self.registry.append_message(id, reply.clone()).await?;
        Ok(Exchange { session_id: id.clone(), route, reply })
    }

    async fn text_reply(&self, id: &SessionId, text: &str) -> Message {
        let conversation = self.registry.conversation(id);
        match conversation.send(text).await {
            Ok(ChatReply::Text(reply)) => Message::model(reply),
            Ok(ChatReply::Blocked) => fallback("chat_blocked", replies::CHAT_BLOCKED),
            Ok(ChatReply::Empty) => fallback("chat_empty", replies::CHAT_EMPTY),
            Err(err) => {
                tracing::error!(%id, error = %format!("{err:#}"), "chat request failed");
                fallback("failure", replies::FAILURE)
            }
        }
    }

    async fn image_reply(&self, before: &ChatSession, text: &str) -> Message {
        let prompt = image_prompt(text, before.last_user_text());
        match self.backend.generate_image(&prompt).await {
            Ok(ImageOutcome::Image { bytes, mime_type, caption }) => {
                let url = format!("data:{mime_type};base64,{}", STANDARD.encode(bytes));
                let text = match caption {
                    Some(caption) => format!("{}\n{caption}", replies::IMAGE_INTRO),
                    None => replies::IMAGE_INTRO.to_string(),
                };
                Message::model_with_image(Some(text), url)
            }
            Ok(ImageOutcome::NoImageProduced { explanation: Some(explanation) }) => Message::model(explanation),
            Ok(ImageOutcome::NoImageProduced { explanation: None }) => fallback("image_missing", replies::IMAGE_MISSING),
            Ok(ImageOutcome::Declined) => fallback("image_declined", replies::IMAGE_DECLINED),
            Ok(ImageOutcome::Blocked) => fallback("image_blocked", replies::IMAGE_BLOCKED),
            Ok(ImageOutcome::Invalid) => fallback("image_invalid", replies::IMAGE_INVALID),
            Err(err) => {
                tracing::error!(id = %before.id, error = %format!("{err:#}"), "image request failed");
                fallback("failure", replies::FAILURE)
            }
        }
    }
}

fn fallback(kind: &'static str, text: &str) -> Message {
    metrics::counter!("chat_relay_fallbacks_total", "kind" => kind).increment(1);
    Message::model(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{ScriptedBackend, SharedScripted};
    use crate::storage::MemorySessionStore;

    fn router_with(backend: Arc<ScriptedBackend>) -> (Arc<ConversationRouter>, Arc<SessionRegistry>) {
        let shared: Arc<dyn GenerativeBackend> = Arc::new(SharedScripted(backend));
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemorySessionStore::default()), shared.clone(), "tutor"));
        (Arc::new(ConversationRouter::new(registry.clone(), shared)), registry)
    }

    #[test]
    fn classification_examples() {
        assert_eq!(classify("can you draw a diagram of a pendulum"), Route::Image);
        assert_eq!(classify("what is kinetic energy"), Route::Text);
        assert_eq!(classify("ILLUSTRATE refraction"), Route::Image);
        // substring heuristic, false positives accepted
        assert_eq!(classify("photographic memory"), Route::Image);
    }

    #[test]
    fn short_follow_up_borrows_previous_prompt() {
        assert_eq!(
            image_prompt("draw it", Some("explain projectile motion")),
            "A diagram about the physics concept: explain projectile motion"
        );
        assert_eq!(image_prompt("draw it", None), "draw it");
        let long = "draw a free body diagram for a block";
        assert_eq!(image_prompt(long, Some("explain friction")), long);
    }

    #[tokio::test]
    async fn follow_up_image_request_uses_prior_user_message() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_image(Ok(ImageOutcome::Image { bytes: b"img".to_vec(), mime_type: "image/png".into(), caption: None }));
        let (router, registry) = router_with(backend.clone());
        let s = registry.create_session(Message::model("welcome")).await.unwrap();

        router.send("explain projectile motion").await.unwrap();
        let ex = router.send("draw it").await.unwrap();

        assert_eq!(ex.route, Route::Image);
        assert_eq!(
            backend.image_prompts.lock().unwrap().as_slice(),
            ["A diagram about the physics concept: explain projectile motion"]
        );
        assert_eq!(ex.reply.text.as_deref(), Some(replies::IMAGE_INTRO));
        assert_eq!(ex.reply.image_url.as_deref(), Some("data:image/png;base64,aW1n"));

        let session = registry.get_session(&s.id).await.unwrap();
        assert_eq!(session.messages.len(), 5);
        assert_eq!(session.title, "explain projectile motion");
        assert_eq!(backend.sent_texts.lock().unwrap().as_slice(), ["explain projectile motion"]);
    }

    #[tokio::test]
    async fn text_outcomes_map_to_fixed_replies() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_chat(Ok(ChatReply::Text("Energy of motion".into())));
        backend.push_chat(Ok(ChatReply::Blocked));
        backend.push_chat(Ok(ChatReply::Empty));
        backend.push_chat(Err(anyhow::anyhow!("connection reset")));
        let (router, registry) = router_with(backend);
        registry.create_session(Message::model("welcome")).await.unwrap();

        let texts: Vec<String> = {
            let mut out = Vec::new();
            for q in ["what is kinetic energy", "q2", "q3", "q4"] {
                out.push(router.send(q).await.unwrap().reply.text.unwrap());
            }
            out
        };
        assert_eq!(texts, vec!["Energy of motion", replies::CHAT_BLOCKED, replies::CHAT_EMPTY, replies::FAILURE]);
    }

    #[tokio::test]
    async fn image_outcomes_map_to_fixed_replies() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_image(Ok(ImageOutcome::Blocked));
        backend.push_image(Ok(ImageOutcome::Declined));
        backend.push_image(Ok(ImageOutcome::NoImageProduced { explanation: None }));
        backend.push_image(Ok(ImageOutcome::NoImageProduced { explanation: Some("too abstract".into()) }));
        backend.push_image(Ok(ImageOutcome::Invalid));
        backend.push_image(Err(anyhow::anyhow!("timeout")));
        backend.push_image(Ok(ImageOutcome::Image { bytes: vec![1], mime_type: "image/jpeg".into(), caption: Some("labels".into()) }));
        let (router, registry) = router_with(backend);
        registry.create_session(Message::model("welcome")).await.unwrap();

        let prompt = "sketch the electric field lines around a dipole";
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some(replies::IMAGE_BLOCKED));
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some(replies::IMAGE_DECLINED));
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some(replies::IMAGE_MISSING));
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some("too abstract"));
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some(replies::IMAGE_INVALID));
        assert_eq!(router.send(prompt).await.unwrap().reply.text.as_deref(), Some(replies::FAILURE));
        let last = router.send(prompt).await.unwrap().reply;
        assert_eq!(last.text.as_deref(), Some("Chala manchi question! Here is a diagram for you:\nlabels"));
        assert!(last.image_url.unwrap().starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn reply_lands_in_session_active_at_send_time() {
        let (backend, gate) = ScriptedBackend::gated();
        let (router, registry) = router_with(backend);
        let a = registry.create_session(Message::model("welcome")).await.unwrap();

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.send("what is inertia").await }
        });
        while !router.is_busy(&a.id) {
            tokio::task::yield_now().await;
        }
        let b = registry.create_session(Message::model("welcome")).await.unwrap();
        assert_eq!(registry.active_session_id().await, Some(b.id.clone()));
        gate.notify_one();

        let ex = pending.await.unwrap().unwrap();
        assert_eq!(ex.session_id, a.id);
        assert_eq!(registry.get_session(&a.id).await.unwrap().messages.len(), 3);
        assert_eq!(registry.get_session(&b.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn second_send_while_pending_is_busy() {
        let (backend, gate) = ScriptedBackend::gated();
        let (router, registry) = router_with(backend);
        let a = registry.create_session(Message::model("welcome")).await.unwrap();

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.send("what is inertia").await }
        });
        while !router.is_busy(&a.id) {
            tokio::task::yield_now().await;
        }
        let err = router.send("and momentum?").await.unwrap_err();
        assert!(matches!(err, RelayError::Busy(ref id) if *id == a.id));

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(!router.is_busy(&a.id));
        assert_eq!(registry.get_session(&a.id).await.unwrap().messages.len(), 3);

        gate.notify_one();
        router.send("and momentum?").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_empty_text_and_missing_session() {
        let (router, registry) = router_with(Arc::new(ScriptedBackend::default()));
        assert!(matches!(router.send("hello").await, Err(RelayError::NoActiveSession)));
        let s = registry.create_session(Message::model("welcome")).await.unwrap();
        assert!(matches!(router.send("   ").await, Err(RelayError::EmptyMessage)));
        let ghost = SessionId::parse("chat_1").unwrap();
        assert!(matches!(router.send_to(&ghost, "hi").await, Err(RelayError::UnknownSession(_))));
        assert_eq!(registry.get_session(&s.id).await.unwrap().messages.len(), 1);
    }
}
