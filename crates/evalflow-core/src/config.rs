//! EvalFlow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EvalFlowError, Result};
use crate::settings::{self, SettingKey};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalFlowConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Holder id used for cluster locks. Must differ between processes.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

fn default_database_path() -> String { "~/.evalflow/evalflow.db".into() }

fn default_server_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "evalflow".into());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

impl Default for EvalFlowConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            server_id: default_server_id(),
            scheduler: SchedulerConfig::default(),
            batch: BatchConfig::default(),
            notify: NotifyConfig::default(),
            settings: SettingsConfig::default(),
        }
    }
}

impl EvalFlowConfig {
    /// Load config from the default path (~/.evalflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EvalFlowError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EvalFlowError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the EvalFlow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".evalflow")
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }
}

/// Trigger engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max due jobs fired per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay before a failed job is delivered again.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: i64,
}

fn default_poll_interval() -> u64 { 10 }
fn default_batch_size() -> usize { 100 }
fn default_retry_delay() -> i64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Consolidated notification runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// Generously longer than a digest run; a crashed holder frees the lock after this.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_batch_interval() -> u64 { 300 }
fn default_lock_name() -> String { "consolidated_notifications".into() }
fn default_lock_ttl() -> u64 { 1800 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_batch_interval(),
            lock_name: default_lock_name(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Outbound notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// When unset, notifications are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 { 10 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            headers: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Initial values for the shared settings table. Unset fields keep whatever the
/// store already holds (or the built-in default).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default)]
    pub created_wait_secs: Option<i64>,
    #[serde(default)]
    pub created_enabled: Option<bool>,
    #[serde(default)]
    pub created_include_owner: Option<bool>,
    #[serde(default)]
    pub available_include_evaluatees: Option<bool>,
    #[serde(default)]
    pub reminder_audience: Option<String>,
    #[serde(default)]
    pub consolidated_enabled: Option<bool>,
    #[serde(default)]
    pub consolidated_force_available: Option<bool>,
    #[serde(default)]
    pub consolidated_reminder_interval_days: Option<i64>,
    #[serde(default)]
    pub sync_groups_on_state_change: Option<bool>,
}

impl SettingsConfig {
    /// The explicitly configured values as `(key, value)` pairs.
    pub fn pairs(&self) -> Vec<(SettingKey, String)> {
        let mut out = Vec::new();
        let mut push = |key: SettingKey, value: Option<String>| {
            if let Some(v) = value {
                out.push((key, v));
            }
        };
        push(settings::CREATED_WAIT_SECS, self.created_wait_secs.map(|v| v.to_string()));
        push(settings::CREATED_ENABLED, self.created_enabled.map(|v| v.to_string()));
        push(settings::CREATED_INCLUDE_OWNER, self.created_include_owner.map(|v| v.to_string()));
        push(
            settings::AVAILABLE_INCLUDE_EVALUATEES,
            self.available_include_evaluatees.map(|v| v.to_string()),
        );
        push(settings::REMINDER_AUDIENCE, self.reminder_audience.clone());
        push(settings::CONSOLIDATED_ENABLED, self.consolidated_enabled.map(|v| v.to_string()));
        push(
            settings::CONSOLIDATED_FORCE_AVAILABLE,
            self.consolidated_force_available.map(|v| v.to_string()),
        );
        push(
            settings::CONSOLIDATED_REMINDER_INTERVAL_DAYS,
            self.consolidated_reminder_interval_days.map(|v| v.to_string()),
        );
        push(
            settings::SYNC_GROUPS_ON_STATE_CHANGE,
            self.sync_groups_on_state_change.map(|v| v.to_string()),
        );
        out
    }
}
