use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::scope::TrackerScope;
use crate::remote::backoff::BackoffPolicy;

pub const DEFAULT_BASE_URL: &str = "https://rally1.rallydev.com";
const API_KEY_ENV: &str = "SPRINT_WATCH_API_KEY";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub active_tracker: Option<String>,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub trackers: Vec<TrackerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            active_tracker: None,
            tick_seconds: default_tick_seconds(),
            retry: RetryConfig::default(),
            trackers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub workspace_id: String,
    #[serde(default)]
    pub project_ids: Vec<String>,
    /// Unset until a sprint is picked.
    #[serde(default)]
    pub iteration_id: Option<String>,
    #[serde(default)]
    pub iteration_name: Option<String>,
    pub sprint_start: DateTime<Utc>,
    #[serde(default = "default_poll_minutes")]
    pub poll_interval_minutes: u64,
}

impl TrackerConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn poll_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.poll_interval_minutes.max(1) as i64)
    }

    /// Returns `None` when no sprint has been selected yet.
    pub fn scope(&self) -> Option<TrackerScope> {
        let iteration_id = self
            .iteration_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?;
        Some(TrackerScope::new(
            self.workspace_id.clone(),
            self.project_ids.iter().cloned(),
            iteration_id,
            self.sprint_start,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_tick_seconds() -> u64 {
    30
}

fn default_poll_minutes() -> u64 {
    5
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl AppConfig {
    /// The environment variable wins over the file.
    pub fn credential(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .or_else(|| self.api_key.clone())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    pub fn tracker(&self, id: &str) -> Option<&TrackerConfig> {
        self.trackers.iter().find(|t| t.id == id)
    }

    pub fn active_tracker(&self) -> Option<&TrackerConfig> {
        self.active_tracker
            .as_deref()
            .and_then(|id| self.tracker(id))
            .or_else(|| self.trackers.first())
    }
}

fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sprint-watch")
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    toml::from_str(contents).with_context(|| "Failed to parse config.toml")
}
