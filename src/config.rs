use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::AgrivaniError;

/// Environment variables checked, in order, for the gateway API key.
pub const API_KEY_ENV_VARS: &[&str] = &["AGRIVANI_API_KEY", "OPENROUTER_API_KEY"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "meta-llama/llama-3-8b-instruct".to_string()
}

fn default_system_prompt() -> String {
    "You are AgriVani, a friendly multilingual AI farming assistant that helps with weather, \
     fertilizer, and crop-related advice. Reply clearly and concisely."
        .to_string()
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversationConfig {
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_quick_questions")]
    pub quick_questions: Vec<String>,
}

fn default_greeting() -> String {
    "Ask me anything about farming...".to_string()
}

fn default_quick_questions() -> Vec<String> {
    vec![
        "What's the weather today?".to_string(),
        "Which fertilizer for wheat?".to_string(),
        "Will it rain tomorrow?".to_string(),
    ]
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            quick_questions: default_quick_questions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeechConfig {
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_rate")]
    pub rate: f32,
    #[serde(default = "default_pitch")]
    pub pitch: f32,
    /// Voice name passed to the synthesizer. Derived from `locale` when unset.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_synthesizers")]
    pub synthesizers: Vec<String>,
    #[serde(default = "default_recognizer_command")]
    pub recognizer_command: String,
    #[serde(default)]
    pub recognizer_args: Vec<String>,
}

fn default_locale() -> String {
    "en-IN".to_string()
}

fn default_rate() -> f32 {
    1.0
}

fn default_pitch() -> f32 {
    1.0
}

fn default_synthesizers() -> Vec<String> {
    vec!["espeak-ng".to_string(), "espeak".to_string()]
}

fn default_recognizer_command() -> String {
    "agrivani-listen".to_string()
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            rate: default_rate(),
            pitch: default_pitch(),
            voice: None,
            synthesizers: default_synthesizers(),
            recognizer_command: default_recognizer_command(),
            recognizer_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub show_dialogs: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { show_dialogs: true }
    }
}

/// `<config_dir>/agrivani/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agrivani/config.toml"))
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        Self::validate_config_path(path)?;

        if !path.exists() {
            debug!("Config file not found at {:?}, creating default", path);
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Take the API key from the environment when one is set there.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty());
        if let Some(key) = key {
            debug!("Using gateway API key from environment");
            self.assistant.api_key = key.trim().to_string();
        }
    }

    /// Copy of the configuration that is safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.assistant.api_key.is_empty() {
            copy.assistant.api_key = "********".to_string();
        }
        copy
    }

    pub fn validate(&self) -> Result<()> {
        let assistant = &self.assistant;
        if assistant.endpoint.trim().is_empty() {
            return Err(AgrivaniError::Config("assistant endpoint cannot be empty".to_string()).into());
        }
        if assistant.model.trim().is_empty() {
            return Err(AgrivaniError::Config("assistant model cannot be empty".to_string()).into());
        }
        if assistant.system_prompt.trim().is_empty() {
            return Err(AgrivaniError::Config(
                "assistant system_prompt cannot be empty".to_string(),
            )
            .into());
        }
        if assistant.timeout_ms < 1000 || assistant.timeout_ms > 120000 {
            return Err(AgrivaniError::Config(
                "assistant timeout_ms must be between 1000 and 120000".to_string(),
            )
            .into());
        }
        if assistant.max_retries > 5 {
            return Err(AgrivaniError::Config(
                "assistant max_retries cannot exceed 5".to_string(),
            )
            .into());
        }
        if assistant.retry_backoff_ms > 10000 {
            return Err(AgrivaniError::Config(
                "assistant retry_backoff_ms cannot exceed 10000".to_string(),
            )
            .into());
        }
        if let Some(t) = assistant.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgrivaniError::Config(
                    "assistant temperature must be between 0.0 and 2.0".to_string(),
                )
                .into());
            }
        }

        if self.conversation.greeting.trim().is_empty() {
            return Err(AgrivaniError::Config(
                "conversation greeting cannot be empty".to_string(),
            )
            .into());
        }

        let speech = &self.speech;
        if speech.locale.trim().is_empty() {
            return Err(AgrivaniError::Config("speech locale cannot be empty".to_string()).into());
        }
        if speech.rate < 0.1 || speech.rate > 10.0 {
            return Err(AgrivaniError::Config(
                "speech rate must be between 0.1 and 10.0".to_string(),
            )
            .into());
        }
        if speech.pitch < 0.0 || speech.pitch > 2.0 {
            return Err(AgrivaniError::Config(
                "speech pitch must be between 0.0 and 2.0".to_string(),
            )
            .into());
        }

        Ok(())
    }

    fn validate_config_path(path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.contains("..") {
            return Err(AgrivaniError::Config(
                "Config path cannot contain path traversal sequences".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
