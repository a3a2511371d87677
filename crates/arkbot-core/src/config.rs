//! ArkBot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArkError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArkConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl ArkConfig {
    /// Load config from the default path (~/.arkbot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ArkError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| ArkError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ArkError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ArkBot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".arkbot")
    }

    /// Environment overrides that should never live in a config file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ARKBOT_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.delivery.webhook_url = Some(url);
            }
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        if self.reminders.tick_interval_secs == 0 || self.lifecycle.tick_interval_secs == 0 {
            return Err(ArkError::config("tick intervals must be greater than zero"));
        }
        if self.reminders.max_attempts == 0 {
            return Err(ArkError::config("reminders.max_attempts must be at least 1"));
        }
        if self.reminders.delivery_timeout_secs == 0 {
            return Err(ArkError::config("reminders.delivery_timeout_secs must be greater than zero"));
        }
        if let Some(o) = self
            .reminders
            .offsets_seconds
            .iter()
            .find(|o| o.unsigned_abs() > MAX_OFFSET_SECS)
        {
            return Err(ArkError::config(format!(
                "reminder offset {o}s is out of range (max ±{MAX_OFFSET_SECS}s)"
            )));
        }
        if self.reminders.grace_window_secs > MAX_GRACE_WINDOW_SECS {
            return Err(ArkError::config(format!(
                "reminders.grace_window_secs must be at most {MAX_GRACE_WINDOW_SECS}"
            )));
        }
        if !(0..=MAX_CHECKIN_OFFSET_HOURS).contains(&self.lifecycle.checkin_offset_hours) {
            return Err(ArkError::config(format!(
                "lifecycle.checkin_offset_hours must be within 0..={MAX_CHECKIN_OFFSET_HOURS}"
            )));
        }
        if !(1..=MAX_MATCH_DURATION_MINUTES).contains(&self.lifecycle.match_duration_minutes) {
            return Err(ArkError::config(format!(
                "lifecycle.match_duration_minutes must be within 1..={MAX_MATCH_DURATION_MINUTES}"
            )));
        }
        if self.supervisor.base_delay_ms > self.supervisor.max_delay_ms {
            return Err(ArkError::config(
                "supervisor.base_delay_ms must not exceed supervisor.max_delay_ms",
            ));
        }
        self.reminders.offsets_seconds.sort_unstable();
        self.reminders.offsets_seconds.dedup();
        Ok(())
    }
}

/// Largest reminder offset accepted, in either direction (one year).
pub const MAX_OFFSET_SECS: u64 = 366 * 86_400;
/// Largest grace window accepted (one week).
pub const MAX_GRACE_WINDOW_SECS: u64 = 7 * 86_400;
pub const MAX_CHECKIN_OFFSET_HOURS: i64 = 7 * 24;
pub const MAX_MATCH_DURATION_MINUTES: i64 = 7 * 24 * 60;

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Where durable state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the JSON marker documents.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// SQLite database backing matches, rosters, preferences and audit log.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_state_dir() -> String { "~/.arkbot/state".into() }
fn default_db_path() -> String { "~/.arkbot/arkbot.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    pub fn state_dir(&self) -> PathBuf {
        expand_path(&self.state_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        expand_path(&self.db_path)
    }
}

/// Notification scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Seconds relative to the match start; negative means before.
    #[serde(default = "default_offsets")]
    pub offsets_seconds: Vec<i64>,
    #[serde(default = "default_reminder_tick")]
    pub tick_interval_secs: u64,
    /// Maximum lateness tolerated before a missed reminder is dropped.
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,
    /// Delivery attempts per marker per tick, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    /// Targets older than this are pruned from every marker document.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_offsets() -> Vec<i64> { vec![-86_400, -43_200, -14_400, -3_600, 0] }
fn default_reminder_tick() -> u64 { 15 }
fn default_grace_window() -> u64 { 900 }
fn default_max_attempts() -> u32 { 3 }
fn default_delivery_timeout() -> u64 { 10 }
fn default_retention_days() -> u32 { 2 }

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            offsets_seconds: default_offsets(),
            tick_interval_secs: default_reminder_tick(),
            grace_window_secs: default_grace_window(),
            max_attempts: default_max_attempts(),
            delivery_timeout_secs: default_delivery_timeout(),
            retention_days: default_retention_days(),
        }
    }
}

impl ReminderConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    /// Saturates instead of overflowing on values `validate` would reject.
    pub fn grace_window(&self) -> chrono::Duration {
        i64::try_from(self.grace_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Lifecycle transition engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_lifecycle_tick")]
    pub tick_interval_secs: u64,
    /// Hours before match start when check-in opens.
    #[serde(default = "default_checkin_offset")]
    pub checkin_offset_hours: i64,
    /// Minutes after match start when the match counts as completed.
    #[serde(default = "default_match_duration")]
    pub match_duration_minutes: i64,
}

fn default_lifecycle_tick() -> u64 { 30 }
fn default_checkin_offset() -> i64 { 12 }
fn default_match_duration() -> i64 { 90 }

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_lifecycle_tick(),
            checkin_offset_hours: default_checkin_offset(),
            match_duration_minutes: default_match_duration(),
        }
    }
}

impl LifecycleConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Task supervisor restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// A unit that ran this long before crashing restarts with a fresh backoff.
    #[serde(default = "default_healthy_reset")]
    pub healthy_reset_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_base_delay() -> u64 { 1_000 }
fn default_max_delay() -> u64 { 60_000 }
fn default_healthy_reset() -> u64 { 600 }
fn default_shutdown_timeout() -> u64 { 10 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            healthy_reset_secs: default_healthy_reset(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn healthy_reset(&self) -> Duration {
        Duration::from_secs(self.healthy_reset_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Outbound chat delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Chat webhook receiving reminder payloads. Unset means log-only delivery.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Display name used for webhook posts.
    #[serde(default)]
    pub username: Option<String>,
}
