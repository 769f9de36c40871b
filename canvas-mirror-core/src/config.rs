use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Lower bound for a single resumable-upload chunk; Drive requires multiples of this.
pub const MIN_CHUNK_BYTES: usize = 256 * 1024;

/// Fully resolved settings for one run. Built by the CLI loader and threaded
/// through every component as plain values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub canvas: CanvasConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub export: ExportToggles,
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Regenerate derived documents even when the change detector would skip them.
    #[serde(default)]
    pub force_regenerate: bool,
}

impl SyncConfig {
    pub fn trace_loaded(&self) {
        info!(
            api_url = %self.canvas.api_url,
            storage = self.storage.kind(),
            force_regenerate = self.force_regenerate,
            "Loaded SyncConfig"
        );
        debug!(export = ?self.export, performance = ?self.performance, "SyncConfig details");
    }

    /// Rejects settings that would only fail later, after network activity began.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.canvas.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("canvas.api_url"));
        }
        if self.canvas.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("canvas.api_key"));
        }
        match &self.storage {
            StorageConfig::Local { root_dir } if root_dir.as_os_str().is_empty() => {
                return Err(ConfigError::Missing("storage.root_dir"));
            }
            StorageConfig::Drive {
                root_folder_name,
                access_token,
            } => {
                if root_folder_name.trim().is_empty() {
                    return Err(ConfigError::Missing("storage.root_folder_name"));
                }
                if access_token.trim().is_empty() {
                    return Err(ConfigError::Missing("GOOGLE_DRIVE_ACCESS_TOKEN"));
                }
            }
            _ => {}
        }
        if self.performance.per_page == 0 {
            return Err(ConfigError::Invalid {
                key: "performance.per_page",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl CanvasConfig {
    /// Base URL without a trailing slash, so paths can be appended verbatim.
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}

/// Destination selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Local {
        root_dir: PathBuf,
    },
    #[serde(rename = "google_drive")]
    Drive {
        root_folder_name: String,
        #[serde(skip_serializing, default)]
        access_token: String,
    },
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Local { .. } => "local",
            StorageConfig::Drive { .. } => "google_drive",
        }
    }
}

/// Per-resource switches. Everything is exported unless turned off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportToggles {
    pub assignments: bool,
    pub modules: bool,
    pub pages: bool,
    pub announcements: bool,
    pub discussions: bool,
    pub quizzes: bool,
    pub enrollments: bool,
    pub calendar: bool,
    pub groups: bool,
    pub analytics: bool,
    pub submissions: bool,
    pub conversations: bool,
}

impl Default for ExportToggles {
    fn default() -> Self {
        Self {
            assignments: true,
            modules: true,
            pages: true,
            announcements: true,
            discussions: true,
            quizzes: true,
            enrollments: true,
            calendar: true,
            groups: true,
            analytics: true,
            submissions: true,
            conversations: true,
        }
    }
}

impl ExportToggles {
    /// Only the core content kinds; auxiliary JSON reports switched off.
    pub fn content_only() -> Self {
        Self {
            announcements: false,
            discussions: false,
            quizzes: false,
            enrollments: false,
            calendar: false,
            groups: false,
            analytics: false,
            submissions: false,
            conversations: false,
            ..Self::default()
        }
    }
}

/// Transport and transfer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub per_page: u32,
    pub pool_size: usize,
    pub chunk_size_mb: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20,
            max_retries: 3,
            backoff_factor: 0.5,
            per_page: 100,
            pool_size: 20,
            chunk_size_mb: 8,
        }
    }
}

impl PerformanceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Chunk size in bytes: never below [`MIN_CHUNK_BYTES`] and always a multiple of it.
    pub fn chunk_bytes(&self) -> usize {
        let requested = self.chunk_size_mb.saturating_mul(1024 * 1024);
        let floored = requested.max(MIN_CHUNK_BYTES);
        floored - floored % MIN_CHUNK_BYTES
    }

    /// Delay before retry number `attempt` (1-based): `backoff_factor * 2^(attempt-1)` seconds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_secs_f64(self.backoff_factor.max(0.0) * f64::from(1u32 << exp))
    }
}
