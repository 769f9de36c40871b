//! Destination stores behind the [`Storage`] contract.
//!
//! [`Backend`] is the tagged variant the orchestrator holds; it delegates to
//! [`LocalStore`] or [`DriveStore`] so callers never branch on backend kind.

mod drive;
mod local;

pub use drive::DriveStore;
pub use local::LocalStore;

use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use crate::config::{StorageConfig, SyncConfig};
use crate::contract::{DestinationDescriptor, DestinationMetadata, Storage};
use crate::error::StorageError;

/// Characters that may not appear in a path component on any supported platform.
const ILLEGAL_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Strip characters illegal in filesystem paths and trim surrounding whitespace.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

pub enum Backend {
    Local(LocalStore),
    Drive(DriveStore),
}

impl Backend {
    /// Build the backend selected in `config`. Drive resolves (or creates) its root folder here.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, StorageError> {
        match &config.storage {
            StorageConfig::Local { root_dir } => {
                info!(root = %root_dir.display(), "Using local storage backend");
                Ok(Backend::Local(LocalStore::new(root_dir)?))
            }
            StorageConfig::Drive {
                root_folder_name,
                access_token,
            } => {
                info!(root_folder = %root_folder_name, "Using Google Drive storage backend");
                let store =
                    DriveStore::connect(access_token, root_folder_name, &config.performance).await?;
                Ok(Backend::Drive(store))
            }
        }
    }
}

#[async_trait]
impl Storage for Backend {
    fn top(&self) -> DestinationDescriptor {
        match self {
            Backend::Local(store) => store.top(),
            Backend::Drive(store) => store.top(),
        }
    }

    async fn ensure_folder(
        &self,
        parent: &DestinationDescriptor,
        name: &str,
    ) -> Result<DestinationDescriptor, StorageError> {
        match self {
            Backend::Local(store) => store.ensure_folder(parent, name).await,
            Backend::Drive(store) => store.ensure_folder(parent, name).await,
        }
    }

    async fn find_existing(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
    ) -> Result<Option<DestinationMetadata>, StorageError> {
        match self {
            Backend::Local(store) => store.find_existing(folder, filename).await,
            Backend::Drive(store) => store.find_existing(folder, filename).await,
        }
    }

    async fn upsert(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
        local_path: &Path,
        existing_id: Option<String>,
    ) -> Result<bool, StorageError> {
        match self {
            Backend::Local(store) => store.upsert(folder, filename, local_path, existing_id).await,
            Backend::Drive(store) => store.upsert(folder, filename, local_path, existing_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_every_illegal_character() {
        assert_eq!(
            sanitize_filename("  a\\b/c*d?e:f\"g<h>i|j  "),
            "abcdefghij"
        );
    }

    #[test]
    fn sanitize_keeps_ordinary_punctuation() {
        assert_eq!(sanitize_filename("Week 1 - Intro (v2).pdf"), "Week 1 - Intro (v2).pdf");
        assert_eq!(sanitize_filename("???"), "");
    }
}
