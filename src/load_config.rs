use anyhow::{Context, Result};
use canvas_mirror_core::config::{
    CanvasConfig, ExportToggles, PerformanceConfig, StorageConfig, SyncConfig,
};
use canvas_mirror_core::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const CANVAS_API_KEY_VAR: &str = "CANVAS_API_KEY";
pub const DRIVE_TOKEN_VAR: &str = "GOOGLE_DRIVE_ACCESS_TOKEN";
pub const DEFAULT_STATE_FILE: &str = ".canvas-mirror-state.json";

#[derive(Deserialize)]
struct StaticConfig {
    canvas: CanvasSection,
    storage: StorageSection,
    #[serde(default)]
    export: ExportToggles,
    #[serde(default)]
    performance: PerformanceConfig,
    #[serde(default)]
    force_regenerate: bool,
    #[serde(default)]
    state_file: Option<PathBuf>,
}

#[derive(Deserialize)]
struct CanvasSection {
    api_url: String,
}

#[derive(Deserialize)]
struct StorageSection {
    kind: String,
    #[serde(default)]
    root_dir: Option<PathBuf>,
    #[serde(default)]
    root_folder_name: Option<String>,
}

/// Settings for one CLI invocation.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub sync: SyncConfig,
    /// Where the last course selection is remembered between runs.
    pub state_file: PathBuf,
}

fn required_env(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            info!(var, "Secret found in env");
            Ok(value)
        }
        _ => {
            error!(var, "Required environment variable not set");
            Err(ConfigError::Missing(var))
        }
    }
}

fn storage_config(section: StorageSection) -> Result<StorageConfig, ConfigError> {
    match section.kind.as_str() {
        "local" => {
            let root_dir = section
                .root_dir
                .ok_or(ConfigError::Missing("storage.root_dir"))?;
            Ok(StorageConfig::Local { root_dir })
        }
        "google_drive" => {
            let root_folder_name = section
                .root_folder_name
                .ok_or(ConfigError::Missing("storage.root_folder_name"))?;
            let access_token = required_env(DRIVE_TOKEN_VAR)?;
            Ok(StorageConfig::Drive {
                root_folder_name,
                access_token,
            })
        }
        other => {
            error!(kind = %other, "Unsupported storage.kind in config");
            Err(ConfigError::InvalidStorageKind(other.to_string()))
        }
    }
}

/// Loads a static YAML config file (no secrets) and injects the secrets from the environment.
///
/// The result is validated, so a returned config never fails for missing settings later.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;
    let static_conf: StaticConfig = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    let storage = storage_config(static_conf.storage)?;
    let api_key = required_env(CANVAS_API_KEY_VAR)?;

    let sync = SyncConfig {
        canvas: CanvasConfig {
            api_url: static_conf.canvas.api_url,
            api_key,
        },
        storage,
        export: static_conf.export,
        performance: static_conf.performance,
        force_regenerate: static_conf.force_regenerate,
    };
    sync.validate().context("Invalid configuration")?;
    sync.trace_loaded();

    let state_file = static_conf
        .state_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    info!(state_file = %state_file.display(), "Config loaded and merged successfully");
    Ok(LoadedConfig { sync, state_file })
}
