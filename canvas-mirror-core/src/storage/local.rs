use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::sanitize_filename;
use crate::contract::{DestinationDescriptor, DestinationMetadata, Location, Storage};
use crate::error::StorageError;

/// Mirror rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create the store, making sure the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir<'a>(&self, folder: &'a DestinationDescriptor) -> Result<&'a Path, StorageError> {
        match &folder.location {
            Location::Path(path) => Ok(path),
            Location::Folder(id) => Err(StorageError::ForeignLocation(id.clone())),
        }
    }
}

#[async_trait]
impl Storage for LocalStore {
    fn top(&self) -> DestinationDescriptor {
        DestinationDescriptor::local(self.root.clone(), "")
    }

    async fn ensure_folder(
        &self,
        parent: &DestinationDescriptor,
        name: &str,
    ) -> Result<DestinationDescriptor, StorageError> {
        let name = sanitize_filename(name);
        let path = self.dir(parent)?.join(&name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(DestinationDescriptor::local(path, parent.child_label(&name)))
    }

    async fn find_existing(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
    ) -> Result<Option<DestinationMetadata>, StorageError> {
        let path = self.dir(folder)?.join(filename);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified_time = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(Some(DestinationMetadata {
            backend_id: Some(path.to_string_lossy().into_owned()),
            size: metadata.len(),
            modified_time,
        }))
    }

    async fn upsert(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
        local_path: &Path,
        existing_id: Option<String>,
    ) -> Result<bool, StorageError> {
        if !tokio::fs::try_exists(local_path).await? {
            return Err(StorageError::MissingArtifact(
                local_path.display().to_string(),
            ));
        }
        // An existing id is the artifact's own path, so copying onto the target replaces it in place.
        let target = match existing_id {
            Some(id) => PathBuf::from(id),
            None => self.dir(folder)?.join(filename),
        };
        let bytes = tokio::fs::copy(local_path, &target).await?;
        debug!(target = %target.display(), bytes, "Wrote local artifact");
        Ok(true)
    }
}
