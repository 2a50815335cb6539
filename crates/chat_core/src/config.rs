use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposerLimits {
    pub max_text_chars: usize,
    pub max_attachments: usize,
    pub max_images: usize,
    pub max_videos: usize,
    pub max_other_files: usize,
    pub max_file_bytes: u64,
}

impl Default for ComposerLimits {
    fn default() -> Self {
        Self {
            max_text_chars: 2000,
            max_attachments: 10,
            max_images: 10,
            max_videos: 2,
            max_other_files: 5,
            max_file_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub user_id: String,
    pub page_size: u32,
    pub poll_interval_ms: u64,
    pub read_confirm_delay_ms: u64,
    pub highlight_duration_ms: u64,
    pub drafting_idle_ms: u64,
    pub limits: ComposerLimits,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            user_id: String::new(),
            page_size: 20,
            poll_interval_ms: 5_000,
            read_confirm_delay_ms: 500,
            highlight_duration_ms: 2_000,
            drafting_idle_ms: 3_000,
            limits: ComposerLimits::default(),
        }
    }
}

impl ClientSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.read_confirm_delay_ms)
    }

    pub fn highlight_duration(&self) -> Duration {
        Duration::from_millis(self.highlight_duration_ms)
    }

    pub fn drafting_idle(&self) -> Duration {
        Duration::from_millis(self.drafting_idle_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        if self.user_id.trim().is_empty() {
            return Err(anyhow!("user_id is required"));
        }
        if self.page_size == 0 {
            return Err(anyhow!("page_size must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Loads `chat_client.toml` from the working directory when present, then
/// applies `APP__*` environment overrides.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Some(Path::new(DEFAULT_SETTINGS_FILE)))
}

pub fn load_settings_from(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => read_settings_file(path)?,
        _ => ClientSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_settings_file(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str::<ClientSettings>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__USER_ID") {
        settings.user_id = v;
    }
    if let Some(v) = var("APP__PAGE_SIZE").and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = var("APP__POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = var("APP__READ_CONFIRM_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.read_confirm_delay_ms = v;
    }
    if let Some(v) = var("APP__HIGHLIGHT_DURATION_MS").and_then(|v| v.parse().ok()) {
        settings.highlight_duration_ms = v;
    }
    if let Some(v) = var("APP__DRAFTING_IDLE_MS").and_then(|v| v.parse().ok()) {
        settings.drafting_idle_ms = v;
    }
    if let Some(v) = var("APP__MAX_TEXT_CHARS").and_then(|v| v.parse().ok()) {
        settings.limits.max_text_chars = v;
    }
    if let Some(v) = var("APP__MAX_FILE_BYTES").and_then(|v| v.parse().ok()) {
        settings.limits.max_file_bytes = v;
    }
}

pub fn default_settings_path() -> PathBuf {
    PathBuf::from(DEFAULT_SETTINGS_FILE)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
