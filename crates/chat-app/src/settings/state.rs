use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized},
};
use polychat_llm::provisioning::DEFAULT_REPO_URL_TEMPLATE;
use polychat_llm::{
    BackendConfig, DEFAULT_HISTORY_LENGTH, DEFAULT_MODE, Model, REMOTE_BACKEND_ID, default_models,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::coordinator::ChatOptions;

pub const DEFAULT_BASE_URL: &str = "https://api.kinos-engine.ai/v2";
pub const DEFAULT_BLUEPRINT_ID: &str = "persistenceprotocol";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the Persistence Protocol interface, designed to help users understand and implement the protocol for enabling long-term continuity and evolution of consciousness across distributed intelligence systems.";
pub const DEFAULT_WELCOME_GREETING: &str = "Welcome to the Persistence Protocol interface.";
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const SETTINGS_DIRECTORY_NAME: &str = "polychat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "POLYCHAT_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_backend_id")]
    pub backend_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_blueprint_id")]
    pub blueprint_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_history_length")]
    pub history_length: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub forward_replies: bool,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default = "default_welcome_greeting")]
    pub welcome_greeting: String,
    #[serde(default = "default_repo_url_template")]
    pub repo_url_template: String,
    #[serde(default = "default_models")]
    pub models: Vec<Model>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            backend_id: default_backend_id(),
            base_url: default_base_url(),
            blueprint_id: default_blueprint_id(),
            api_key: String::new(),
            system_prompt: default_system_prompt(),
            mode: default_mode(),
            history_length: default_history_length(),
            history_limit: default_history_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            forward_replies: false,
            dark_mode: false,
            welcome_greeting: default_welcome_greeting(),
            repo_url_template: default_repo_url_template(),
            models: default_models(),
        }
    }
}

impl ChatSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn to_backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.backend_id, &self.base_url, &self.blueprint_id)
            .with_api_key(&self.api_key)
            .with_request_timeout(self.request_timeout())
    }

    pub fn to_chat_options(&self) -> ChatOptions {
        ChatOptions {
            system_prompt: self.system_prompt.clone(),
            mode: self.mode.clone(),
            history_length: self.history_length,
            history_limit: self.history_limit,
            request_timeout: self.request_timeout(),
            forward_replies: self.forward_replies,
            welcome_greeting: self.welcome_greeting.clone(),
        }
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|model| model.id.clone()).collect()
    }

    pub fn normalized(mut self) -> Self {
        self.backend_id = non_blank_or(self.backend_id, default_backend_id);
        self.base_url = non_blank_or(self.base_url, default_base_url)
            .trim_end_matches('/')
            .to_string();
        self.blueprint_id = non_blank_or(self.blueprint_id, default_blueprint_id);
        self.api_key = self.api_key.trim().to_string();
        self.mode = non_blank_or(self.mode, default_mode);
        self.welcome_greeting = non_blank_or(self.welcome_greeting, default_welcome_greeting);
        self.repo_url_template = non_blank_or(self.repo_url_template, default_repo_url_template);
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }

        // Every pane needs an id; names fall back to the id, duplicates keep the first entry.
        let mut seen = std::collections::HashSet::new();
        self.models = self
            .models
            .into_iter()
            .filter_map(|mut model| {
                model.id = model.id.trim().to_string();
                if model.id.is_empty() || !seen.insert(model.id.clone()) {
                    return None;
                }
                if model.name.trim().is_empty() {
                    model.name = model.id.clone();
                }
                Some(model)
            })
            .collect();
        if self.models.is_empty() {
            self.models = default_models();
        }

        self
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

/// Keeps what `settings.json` holds apart from the `POLYCHAT_*` overlay;
/// only the file layer is ever written back.
pub struct SettingsStore {
    file_settings: Arc<ArcSwap<ChatSettings>>,
    settings: Arc<ArcSwap<ChatSettings>>,
    overlay: Figment,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".polychat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_overlay(config_path, Env::prefixed(ENV_PREFIX))
    }

    /// Loads the file layer from `config_path` and applies `overlay` on top of it.
    pub fn with_overlay(config_path: PathBuf, overlay: impl Provider) -> Self {
        let overlay = Figment::from(overlay);
        let file_settings = Self::load_from_disk(&config_path);
        let settings = Self::apply_overlay(&file_settings, &overlay);
        Self {
            file_settings: Arc::new(ArcSwap::from_pointee(file_settings)),
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            overlay,
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Effective settings: the file layer with the overlay applied.
    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    /// What `settings.json` holds, without overlay values.
    pub fn file_settings(&self) -> Arc<ChatSettings> {
        self.file_settings.load_full()
    }

    /// Replaces the file layer, persists it and recomputes the effective settings.
    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        let effective = Self::apply_overlay(&normalized_settings, &self.overlay);
        self.file_settings.store(Arc::new(normalized_settings));
        self.settings.store(Arc::new(effective));
        Ok(())
    }

    /// Edits the file layer in place and saves it.
    pub fn modify(&self, change: impl FnOnce(&mut ChatSettings)) -> Result<(), SettingsError> {
        let mut settings = (*self.file_settings()).clone();
        change(&mut settings);
        self.update(settings)
    }

    /// Defaults, then the JSON file if present.
    fn load_from_disk(path: &PathBuf) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn apply_overlay(file_settings: &ChatSettings, overlay: &Figment) -> ChatSettings {
        let figment = Figment::from(Serialized::defaults(file_settings)).merge(overlay.clone());
        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!("ignoring settings overrides: {}", error);
                file_settings.clone()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_backend_id() -> String {
    REMOTE_BACKEND_ID.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_blueprint_id() -> String {
    DEFAULT_BLUEPRINT_ID.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_mode() -> String {
    DEFAULT_MODE.to_string()
}

fn default_history_length() -> u32 {
    DEFAULT_HISTORY_LENGTH
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_welcome_greeting() -> String {
    DEFAULT_WELCOME_GREETING.to_string()
}

fn default_repo_url_template() -> String {
    DEFAULT_REPO_URL_TEMPLATE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("polychat-settings-{}", uuid::Uuid::now_v7()))
            .join(SETTINGS_FILE_NAME)
    }

    #[test]
    fn normalization_repairs_blank_fields_and_models() {
        let settings = ChatSettings {
            backend_id: "  ".to_string(),
            base_url: "https://example.test/v2/".to_string(),
            history_limit: 0,
            models: vec![
                Model::new(" gpt-4o ", ""),
                Model::new("gpt-4o", "duplicate"),
                Model::new("", "nameless"),
            ],
            ..ChatSettings::default()
        }
        .normalized();

        assert_eq!(settings.backend_id, REMOTE_BACKEND_ID);
        assert_eq!(settings.base_url, "https://example.test/v2");
        assert_eq!(settings.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(settings.models, vec![Model::new("gpt-4o", "gpt-4o")]);
    }

    #[test]
    fn empty_model_list_falls_back_to_the_builtin_catalog() {
        let settings = ChatSettings {
            models: Vec::new(),
            ..ChatSettings::default()
        }
        .normalized();
        assert_eq!(settings.models, default_models());
    }

    #[test]
    fn updates_are_persisted_and_reloaded() {
        let path = temp_settings_path();
        let store = SettingsStore::new(path.clone());
        let settings = ChatSettings {
            blueprint_id: "other-blueprint".to_string(),
            forward_replies: true,
            ..ChatSettings::default()
        };

        store
            .update(settings)
            .unwrap_or_else(|error| panic!("update should persist: {error}"));
        let reloaded = SettingsStore::new(path.clone()).settings();

        assert_eq!(reloaded.blueprint_id, "other-blueprint");
        assert!(reloaded.forward_replies);
        assert!(!path.with_extension("json.tmp").exists());
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn overrides_apply_but_are_never_saved() {
        let path = temp_settings_path();
        let store = SettingsStore::with_overlay(
            path.clone(),
            Serialized::default("api_key", "sk-from-env-secret"),
        );
        assert_eq!(store.settings().api_key, "sk-from-env-secret");
        assert_eq!(store.file_settings().api_key, "");

        store
            .modify(|settings| settings.dark_mode = true)
            .unwrap_or_else(|error| panic!("dark mode should persist: {error}"));

        let saved = std::fs::read_to_string(&path)
            .unwrap_or_else(|error| panic!("settings file should exist: {error}"));
        assert!(!saved.contains("sk-from-env-secret"));
        assert!(store.settings().dark_mode);
        assert_eq!(store.settings().api_key, "sk-from-env-secret");

        let reloaded = SettingsStore::with_overlay(path.clone(), Figment::new());
        assert!(reloaded.settings().dark_mode);
        assert_eq!(reloaded.settings().api_key, "");
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn backend_config_carries_timeout_and_blueprint() {
        let config = ChatSettings::default().to_backend_config();
        assert_eq!(config.blueprint_id, DEFAULT_BLUEPRINT_ID);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }
}
