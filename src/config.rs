// src/config.rs
// Vault configuration from <vault>/.vellum/config.toml with env overrides

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How attachments on the latest message are handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentHandling {
    /// Encode the file inline (base64) when the model's capabilities allow it.
    #[default]
    Direct,
    /// Reference the resource by id and rely on its prepared summary.
    DegradeToText,
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Provider + model pair used when a conversation carries no override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model_id: "gpt-4o-mini".into(),
        }
    }
}

/// Per-provider connection settings (API key, endpoint, enabled models).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Models the host has enabled for this provider; empty means "all".
    #[serde(default)]
    pub enabled_models: Vec<String>,
    /// Model used for LLM reranking, when configured.
    #[serde(default)]
    pub rerank_model: Option<String>,
    /// Model used for query/document embeddings.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

/// Top-level configuration for one vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root for conversation/project storage, relative to the vault.
    #[serde(default = "VaultConfig::default_root_folder")]
    pub root_folder: String,
    /// Subfolder (under root) for resource summary notes.
    #[serde(default = "VaultConfig::default_resources_folder")]
    pub resources_summary_folder: String,
    /// Target folder for user-uploaded attachments.
    #[serde(default = "VaultConfig::default_upload_folder")]
    pub upload_folder: String,
    #[serde(default)]
    pub default_model: ModelRef,
    #[serde(default)]
    pub default_output_control: OutputControl,
    #[serde(default)]
    pub attachment_handling_default: AttachmentHandling,
    /// Master switch for user-profile extraction + injection.
    #[serde(default = "VaultConfig::default_profile_enabled")]
    pub profile_enabled: bool,
    /// Profile document path, relative to the vault.
    #[serde(default = "VaultConfig::default_profile_file_path")]
    pub profile_file_path: String,
    #[serde(default)]
    pub llm_provider_configs: HashMap<String, ProviderConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root_folder: Self::default_root_folder(),
            resources_summary_folder: Self::default_resources_folder(),
            upload_folder: Self::default_upload_folder(),
            default_model: ModelRef::default(),
            default_output_control: OutputControl::default(),
            attachment_handling_default: AttachmentHandling::default(),
            profile_enabled: Self::default_profile_enabled(),
            profile_file_path: Self::default_profile_file_path(),
            llm_provider_configs: HashMap::new(),
        }
    }
}

impl VaultConfig {
    fn default_root_folder() -> String {
        "Chats".into()
    }
    fn default_resources_folder() -> String {
        "Resources".into()
    }
    fn default_upload_folder() -> String {
        "Uploads".into()
    }
    fn default_profile_enabled() -> bool {
        true
    }
    fn default_profile_file_path() -> String {
        "User-Profile.md".into()
    }

    /// Load config from `<vault>/.vellum/config.toml`, falling back to
    /// defaults when the file is absent or malformed (malformed logs a WARN,
    /// it never aborts startup).
    pub fn load(vault_root: &Path) -> Self {
        let path = vault_root.join(".vellum/config.toml");
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                debug!("No config file at {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<VaultConfig>(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Malformed config {} ({}), using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Whether profile extraction is on (config field OR env override).
    pub fn profile_is_enabled(&self) -> bool {
        if let Some(v) = parse_bool_env("VELLUM_PROFILE_ENABLED") {
            return v;
        }
        self.profile_enabled
    }

    /// Resolve the configured API key for a provider, preferring the
    /// `VELLUM_<PROVIDER>_API_KEY` environment variable.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        let env_name = format!("VELLUM_{}_API_KEY", provider.to_uppercase());
        if let Ok(key) = std::env::var(&env_name)
            && !key.is_empty()
        {
            return Some(key);
        }
        self.llm_provider_configs
            .get(provider)
            .and_then(|p| p.api_key.clone())
    }

    /// Rerank model for a provider, if one is configured.
    pub fn rerank_model_for(&self, provider: &str) -> Option<String> {
        self.llm_provider_configs
            .get(provider)
            .and_then(|p| p.rerank_model.clone())
    }

    /// Absolute path of the chat root folder.
    pub fn chat_root(&self, vault_root: &Path) -> PathBuf {
        vault_root.join(&self.root_folder)
    }

    /// Absolute path of the resources summary folder.
    pub fn resources_root(&self, vault_root: &Path) -> PathBuf {
        self.chat_root(vault_root).join(&self.resources_summary_folder)
    }

    /// Absolute path of the profile document.
    pub fn profile_path(&self, vault_root: &Path) -> PathBuf {
        vault_root.join(&self.profile_file_path)
    }
}

/// Parse a boolean environment variable ("1"/"true"/"yes" vs "0"/"false"/"no").
pub fn parse_bool_env(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
