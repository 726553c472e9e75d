use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::chatbot::credentials::{Credential, CredentialState, ModelSlot};
use crate::chatbot::ledger::WindowKind;
use crate::provider::ProviderFamily;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Unknown IANA timezone name.
    InvalidTimezone { name: String, message: String },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidTimezone { name, message } => {
                write!(f, "invalid timezone '{}': {}", name, message)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidTimezone { .. } | Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Chats the bot answers. Empty = every private chat.
    #[serde(default)]
    allowed_chats: Vec<i64>,
    /// Operator chat for alerts and escalations.
    alert_chat_id: Option<i64>,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    /// IANA timezone used for daily/monthly quota windows.
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_debounce_ms")]
    debounce_ms: u64,
    #[serde(default = "default_debounce_max_ms")]
    debounce_max_ms: u64,
    #[serde(default = "default_idle_evict_secs")]
    idle_evict_secs: u64,
    #[serde(default = "default_max_concurrent")]
    max_concurrent_dispatches: usize,
    #[serde(default = "default_max_queue_depth")]
    max_queue_depth: usize,
    #[serde(default = "default_provider_timeout_ms")]
    provider_timeout_ms: u64,
    #[serde(default = "default_transport_backoff_ms")]
    transport_backoff_ms: u64,
    #[serde(default = "default_ledger_max_retries")]
    ledger_max_retries: u32,
    #[serde(default = "default_refresh_secs")]
    credential_refresh_secs: u64,
    #[serde(default = "default_fallback_reply")]
    fallback_reply: String,
    business_name: Option<String>,
    /// Replaces the generated system prompt.
    system_prompt: Option<String>,
    #[serde(default)]
    credentials: Vec<CredentialFile>,
}

#[derive(Deserialize)]
struct CredentialFile {
    id: String,
    family: ProviderFamily,
    api_key: String,
    #[serde(default)]
    priority: u32,
    models: Vec<ModelFile>,
}

#[derive(Deserialize)]
struct ModelFile {
    name: String,
    limit: u64,
    #[serde(default = "default_window")]
    window: WindowKind,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_debounce_max_ms() -> u64 {
    20_000
}

fn default_idle_evict_secs() -> u64 {
    1800
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_transport_backoff_ms() -> u64 {
    1000
}

fn default_ledger_max_retries() -> u32 {
    5
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_fallback_reply() -> String {
    "Thanks for your message! A member of our team will get back to you shortly.".to_string()
}

fn default_window() -> WindowKind {
    WindowKind::Monthly
}

pub struct Config {
    /// Path to the config file.
    pub config_path: PathBuf,
    pub telegram_bot_token: String,
    pub allowed_chats: HashSet<ChatId>,
    pub alert_chat_id: Option<ChatId>,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub timezone: chrono_tz::Tz,
    pub debounce: Duration,
    pub debounce_max: Duration,
    pub idle_evict: Duration,
    pub max_concurrent_dispatches: usize,
    pub max_queue_depth: usize,
    pub provider_timeout: Duration,
    pub transport_backoff: Duration,
    pub ledger_max_retries: u32,
    pub credential_refresh: Duration,
    pub fallback_reply: String,
    pub business_name: Option<String>,
    pub system_prompt: Option<String>,
    /// Seed credentials, upserted into the database at startup.
    pub credentials: Vec<Credential>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        if file.debounce_ms == 0 {
            return Err(ConfigError::Validation("debounce_ms must be greater than 0".into()));
        }
        if file.debounce_max_ms < file.debounce_ms {
            return Err(ConfigError::Validation(
                "debounce_max_ms must be at least debounce_ms".into()
            ));
        }
        if file.max_concurrent_dispatches == 0 {
            return Err(ConfigError::Validation("max_concurrent_dispatches must be at least 1".into()));
        }
        if file.provider_timeout_ms == 0 {
            return Err(ConfigError::Validation("provider_timeout_ms must be greater than 0".into()));
        }
        if file.fallback_reply.trim().is_empty() {
            return Err(ConfigError::Validation("fallback_reply must not be empty".into()));
        }

        let timezone = file
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| ConfigError::InvalidTimezone { name: file.timezone.clone(), message: e.to_string() })?;

        let credentials = load_credentials(file.credentials)?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path,
            telegram_bot_token: file.telegram_bot_token,
            allowed_chats: file.allowed_chats.into_iter().map(ChatId).collect(),
            alert_chat_id: file.alert_chat_id.map(ChatId),
            data_dir,
            timezone,
            debounce: Duration::from_millis(file.debounce_ms),
            debounce_max: Duration::from_millis(file.debounce_max_ms),
            idle_evict: Duration::from_secs(file.idle_evict_secs),
            max_concurrent_dispatches: file.max_concurrent_dispatches,
            max_queue_depth: file.max_queue_depth,
            provider_timeout: Duration::from_millis(file.provider_timeout_ms),
            transport_backoff: Duration::from_millis(file.transport_backoff_ms),
            ledger_max_retries: file.ledger_max_retries,
            credential_refresh: Duration::from_secs(file.credential_refresh_secs.max(1)),
            fallback_reply: file.fallback_reply,
            business_name: file.business_name,
            system_prompt: file.system_prompt,
            credentials,
        })
    }

    /// Whether the bot should answer messages from `chat_id`.
    pub fn is_allowed_chat(&self, chat_id: ChatId) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.contains(&chat_id)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("relaydesk.db")
    }
}

fn load_credentials(files: Vec<CredentialFile>) -> Result<Vec<Credential>, ConfigError> {
    let mut seen = HashSet::new();
    let mut credentials = Vec::with_capacity(files.len());

    for file in files {
        let id = file.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::Validation("credential id must not be empty".into()));
        }
        if !seen.insert(id.clone()) {
            return Err(ConfigError::Validation(format!("duplicate credential id '{}'", id)));
        }
        if file.api_key.trim().is_empty() {
            return Err(ConfigError::Validation(format!("credential '{}' has no api_key", id)));
        }
        if file.models.is_empty() {
            return Err(ConfigError::Validation(format!("credential '{}' must list at least one model", id)));
        }

        let mut models = BTreeMap::new();
        for model in file.models {
            if model.name.trim().is_empty() {
                return Err(ConfigError::Validation(format!("credential '{}' has a model without a name", id)));
            }
            if model.limit == 0 {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' model '{}' must have a limit greater than 0",
                    id, model.name
                )));
            }
            if models.insert(model.name.clone(), ModelSlot::new(model.limit, model.window)).is_some() {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' lists model '{}' twice",
                    id, model.name
                )));
            }
        }

        credentials.push(Credential {
            id,
            family: file.family,
            api_key: file.api_key,
            state: CredentialState::Enabled,
            priority: file.priority,
            models,
        });
    }

    Ok(credentials)
}
