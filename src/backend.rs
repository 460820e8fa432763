use std::sync::Arc;

use async_trait::async_trait;

/// Outcome of one turn in a conversation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    Text(String),
    /// Withheld by the provider's safety filter.
    Blocked,
    /// The provider answered with no text.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Image {
        bytes: Vec<u8>,
        mime_type: String,
        caption: Option<String>,
    },
    /// Content came back without an image, possibly with the model's text.
    NoImageProduced {
        explanation: Option<String>,
    },
    /// The model declined to produce an image for the prompt.
    Declined,
    Blocked,
    /// No usable candidate content and no stated reason.
    Invalid,
}

/// Remote conversation context. Holds the turn history so that follow-up
/// questions keep their context.
#[async_trait]
pub trait Conversation: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<ChatReply>;
}

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn create_conversation(&self, system_prompt: &str) -> Arc<dyn Conversation>;
    async fn generate_image(&self, prompt: &str) -> anyhow::Result<ImageOutcome>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend for exercising the registry and router without a network.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    pub struct ScriptedBackend {
        pub chat_replies: Mutex<VecDeque<anyhow::Result<ChatReply>>>,
        pub image_replies: Mutex<VecDeque<anyhow::Result<ImageOutcome>>>,
        pub sent_texts: Mutex<Vec<String>>,
        pub image_prompts: Mutex<Vec<String>>,
        pub conversations_created: AtomicUsize,
        /// When set, every call waits for a permit before answering.
        pub gate: Option<Arc<Notify>>,
    }

    impl ScriptedBackend {
        pub fn gated() -> (Arc<Self>, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let backend = Self { gate: Some(gate.clone()), ..Self::default() };
            (Arc::new(backend), gate)
        }

        pub fn push_chat(&self, reply: anyhow::Result<ChatReply>) {
            self.chat_replies.lock().unwrap().push_back(reply);
        }

        pub fn push_image(&self, outcome: anyhow::Result<ImageOutcome>) {
            self.image_replies.lock().unwrap().push_back(outcome);
        }

        async fn wait_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
    }

    struct ScriptedConversation {
        backend: Arc<ScriptedBackend>,
    }

    #[async_trait]
    impl Conversation for ScriptedConversation {
        async fn send(&self, text: &str) -> anyhow::Result<ChatReply> {
            self.backend.wait_gate().await;
            self.backend.sent_texts.lock().unwrap().push(text.to_string());
            let next = self.backend.chat_replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ChatReply::Text(format!("echo: {text}"))))
        }
    }

    /// Wrapper so the backend can hand out conversations that point back at it.
    pub struct SharedScripted(pub Arc<ScriptedBackend>);

    #[async_trait]
    impl GenerativeBackend for SharedScripted {
        fn create_conversation(&self, _system_prompt: &str) -> Arc<dyn Conversation> {
            self.0.conversations_created.fetch_add(1, Ordering::SeqCst);
            Arc::new(ScriptedConversation { backend: self.0.clone() })
        }

        async fn generate_image(&self, prompt: &str) -> anyhow::Result<ImageOutcome> {
            self.0.wait_gate().await;
            self.0.image_prompts.lock().unwrap().push(prompt.to_string());
            let next = self.0.image_replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ImageOutcome::NoImageProduced { explanation: None }))
        }
    }
}
