use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::gemini::{DEFAULT_API_BASE, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7171";

pub const DEFAULT_WELCOME: &str = "Hey Mawa! I am Joseph, your Physics Assistant. Ask me a physics concept or give me a problem, manam step-by-step solve cheddam!";

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a Physics Tutor AI named "Joseph Physics Assistant".
Help students understand physics concepts and solve problems step-by-step in a simple Telugu-English mix.
Always remember the last topic of conversation so you can answer follow-up questions. Forget the context only when the user types "new problem" or asks a completely unrelated question.

For conceptual questions, give a clear, simple explanation with real-life examples (cycle, bus, rocket). If the user asks "explain in detail" or "why?", elaborate on your previous answer. End with an engaging question like "Arthamainda mawa?".

For numerical problems, break the solution into small steps: given values, then the formula, then the calculation. Do not solve everything at once. End each step with "Mawa, next step cheppala?".

If the user says "new problem", start fresh and acknowledge with "Okay mawa, new problem cheppu!". Explain concepts in Telugu and use English for formulas. Keep the tone energetic and friendly."#;

/// One source of configuration. Every field is optional so layers can be
/// stacked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SettingsLayer {
    pub listen: Option<String>,
    pub database_url: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub system_prompt: Option<String>,
    pub welcome_message: Option<String>,
    /// Initial location, e.g. `#/chat/chat_1700000000000`.
    pub open: Option<String>,
}

impl SettingsLayer {
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let layer: Self = toml::from_str(&raw)?;
        Ok(layer)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listen: get("CHAT_RELAY_LISTEN"),
            database_url: get("CHAT_RELAY_DATABASE_URL"),
            api_base: get("CHAT_RELAY_API_BASE"),
            api_key: get("CHAT_RELAY_API_KEY").or_else(|| get("GEMINI_API_KEY")),
            text_model: get("CHAT_RELAY_TEXT_MODEL"),
            image_model: get("CHAT_RELAY_IMAGE_MODEL"),
            system_prompt: get("CHAT_RELAY_SYSTEM_PROMPT"),
            welcome_message: get("CHAT_RELAY_WELCOME_MESSAGE"),
            open: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub listen: String,
    pub database_url: Option<String>,
    pub api_base: String,
    pub api_key: Option<String>,
    pub text_model: String,
    pub image_model: String,
    pub system_prompt: String,
    pub welcome_message: String,
    pub open: Option<String>,
}

/// Command line over environment over config file over built-in defaults.
pub fn resolve_effective_settings(
    file: &SettingsLayer,
    env: &SettingsLayer,
    cli: &SettingsLayer,
) -> anyhow::Result<EffectiveSettings> {
    macro_rules! pick {
        ($field:ident) => {
            first_set(&cli.$field, &env.$field, &file.$field)
        };
    }

    let api_base = pick!(api_base).unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    url::Url::parse(&api_base).map_err(|e| anyhow::anyhow!("invalid api_base {api_base:?}: {e}"))?;

    Ok(EffectiveSettings {
        listen: pick!(listen).unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        database_url: pick!(database_url),
        api_base,
        api_key: pick!(api_key),
        text_model: pick!(text_model).unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
        image_model: pick!(image_model).unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
        system_prompt: pick!(system_prompt).unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        welcome_message: pick!(welcome_message).unwrap_or_else(|| DEFAULT_WELCOME.to_string()),
        open: pick!(open),
    })
}

fn first_set(cli: &Option<String>, env: &Option<String>, file: &Option<String>) -> Option<String> {
    cli.clone().or_else(|| env.clone()).or_else(|| file.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn precedence_cli_over_env_over_file() {
        let file = SettingsLayer {
            listen: Some("0.0.0.0:1".into()),
            text_model: Some("file-model".into()),
            image_model: Some("file-image".into()),
            welcome_message: Some("hi from file".into()),
            ..SettingsLayer::default()
        };
        let env = SettingsLayer {
            text_model: Some("env-model".into()),
            image_model: Some("env-image".into()),
            api_key: Some("env-key".into()),
            ..SettingsLayer::default()
        };
        let cli = SettingsLayer { image_model: Some("cli-image".into()), ..SettingsLayer::default() };

        let eff = resolve_effective_settings(&file, &env, &cli).unwrap();
        assert_eq!(eff.listen, "0.0.0.0:1"); // from file
        assert_eq!(eff.text_model, "env-model"); // from env
        assert_eq!(eff.image_model, "cli-image"); // from cli
        assert_eq!(eff.api_key.as_deref(), Some("env-key"));
        assert_eq!(eff.welcome_message, "hi from file");
        assert_eq!(eff.api_base, DEFAULT_API_BASE);
        assert_eq!(eff.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert!(eff.database_url.is_none());
    }

    #[test]
    fn invalid_api_base_is_rejected() {
        let cli = SettingsLayer { api_base: Some("not a url".into()), ..SettingsLayer::default() };
        let err = resolve_effective_settings(&SettingsLayer::default(), &SettingsLayer::default(), &cli).unwrap_err();
        assert!(err.to_string().contains("invalid api_base"));
    }

    #[test]
    fn env_lookup_prefers_relay_key_over_gemini_key() {
        let vars: HashMap<&str, &str> = [("GEMINI_API_KEY", "g"), ("CHAT_RELAY_TEXT_MODEL", "m")].into();
        let layer = SettingsLayer::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(layer.api_key.as_deref(), Some("g"));
        assert_eq!(layer.text_model.as_deref(), Some("m"));

        let vars: HashMap<&str, &str> = [("GEMINI_API_KEY", "g"), ("CHAT_RELAY_API_KEY", "r")].into();
        let layer = SettingsLayer::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(layer.api_key.as_deref(), Some("r"));
    }

    #[test]
    fn config_file_parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "text_model = \"gemini-pro\"\nopen = \"#/chat/chat_5\"\n").unwrap();
        let layer = SettingsLayer::load_file(&path).unwrap();
        assert_eq!(layer.text_model.as_deref(), Some("gemini-pro"));
        assert_eq!(layer.open.as_deref(), Some("#/chat/chat_5"));
        assert!(layer.api_key.is_none());
    }
}
