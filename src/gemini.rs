//! Google Generative Language REST backend.
//!
//! Text turns go to the chat model with the full turn history replayed on each
//! request; images go to the image model with `responseModalities: ["IMAGE"]`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::{ChatReply, Conversation, GenerativeBackend, ImageOutcome};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const SAFETY: &str = "SAFETY";
const NO_IMAGE: &str = "NO_IMAGE";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: Some(text.to_string()), inline_data: None }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    fn parts(&self) -> &[Part] {
        self.first_candidate()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.first_candidate().and_then(|c| c.finish_reason.as_deref())
    }

    fn blocked_by_safety(&self) -> bool {
        let blocked = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
            == Some(SAFETY);
        blocked || self.finish_reason() == Some(SAFETY)
    }

    fn joined_text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl GeminiClient {
    async fn generate(&self, model: &str, req: &GenerateContentRequest<'_>) -> anyhow::Result<GenerateContentResponse> {
        let url = format!("{}/models/{}:generateContent", self.api_base.trim_end_matches('/'), model);
        let mut rb = self.http.post(url).json(req);
        if let Some(key) = &self.api_key {
            rb = rb.header("x-goog-api-key", key);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            anyhow::bail!("gemini call failed: {status}: {snippet}");
        }
        Ok(resp.json().await?)
    }
}

pub struct GeminiBackend {
    client: Arc<GeminiClient>,
    text_model: String,
    image_model: String,
}

impl GeminiBackend {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, text_model: impl Into<String>, image_model: impl Into<String>) -> Self {
        if api_key.is_none() {
            tracing::warn!("no Gemini API key configured; remote calls will be rejected");
        }
        Self {
            client: Arc::new(GeminiClient {
                http: reqwest::Client::new(),
                api_base: api_base.into(),
                api_key,
            }),
            text_model: text_model.into(),
            image_model: image_model.into(),
        }
    }
}

fn image_prompt_template(prompt: &str) -> String {
    format!(
        "A clear, simple, educational diagram or graph for a 10th-12th grade physics student about: \"{prompt}\". \
         The diagram should be easy to understand, with clear labels on a white background."
    )
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn create_conversation(&self, system_prompt: &str) -> Arc<dyn Conversation> {
        Arc::new(GeminiConversation {
            client: self.client.clone(),
            model: self.text_model.clone(),
            system_prompt: system_prompt.to_string(),
            history: Mutex::new(Vec::new()),
        })
    }

    async fn generate_image(&self, prompt: &str) -> anyhow::Result<ImageOutcome> {
        let contents = [Content::text("user", &image_prompt_template(prompt))];
        let req = GenerateContentRequest {
            contents: &contents,
            system_instruction: None,
            generation_config: Some(GenerationConfig { response_modalities: vec!["IMAGE"] }),
        };
        let resp = self.client.generate(&self.image_model, &req).await?;

        if resp.parts().is_empty() {
            if resp.blocked_by_safety() {
                tracing::warn!("image generation blocked by safety filter");
                return Ok(ImageOutcome::Blocked);
            }
            if resp.finish_reason() == Some(NO_IMAGE) {
                tracing::warn!("image generation finished without an image");
                return Ok(ImageOutcome::Declined);
            }
            tracing::error!(finish_reason = ?resp.finish_reason(), "image response had no candidate content");
            return Ok(ImageOutcome::Invalid);
        }

        let mut image = None;
        let mut caption = None;
        for part in resp.parts() {
            if let Some(inline) = &part.inline_data {
                image = Some((STANDARD.decode(&inline.data)?, inline.mime_type.clone()));
            }
            if let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) {
                caption = Some(text.clone());
            }
        }
        Ok(match image {
            Some((bytes, mime_type)) => ImageOutcome::Image { bytes, mime_type, caption },
            None => ImageOutcome::NoImageProduced { explanation: caption },
        })
    }
}

struct GeminiConversation {
    client: Arc<GeminiClient>,
    model: String,
    system_prompt: String,
    history: Mutex<Vec<Content>>,
}

#[async_trait]
impl Conversation for GeminiConversation {
    async fn send(&self, text: &str) -> anyhow::Result<ChatReply> {
        let mut history = self.history.lock().await;
        history.push(Content::text("user", text));
        let result = {
            let req = GenerateContentRequest {
                contents: &history,
                system_instruction: (!self.system_prompt.is_empty()).then(|| Content {
                    role: None,
                    parts: vec![Part { text: Some(self.system_prompt.clone()), inline_data: None }],
                }),
                generation_config: None,
            };
            self.client.generate(&self.model, &req).await
        };
        let resp = match result {
            Ok(r) => r,
            Err(err) => {
                history.pop();
                return Err(err);
            }
        };

        let reply = resp.joined_text();
        if reply.is_empty() {
            history.pop();
            if resp.blocked_by_safety() {
                tracing::warn!("chat reply blocked by safety filter");
                return Ok(ChatReply::Blocked);
            }
            tracing::warn!(finish_reason = ?resp.finish_reason(), "chat reply was empty");
            return Ok(ChatReply::Empty);
        }
        history.push(Content::text("model", &reply));
        Ok(ChatReply::Text(reply))
    }
}
