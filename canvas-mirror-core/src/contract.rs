//! # contract: interfaces between the sync engine and its collaborators
//!
//! Two seams are defined here:
//! - [`SourceApi`]: paginated JSON retrieval and file download from the LMS.
//! - [`Storage`]: the destination capability (ensure folder, look up existing
//!   artifact, upsert), implemented by the local filesystem and Google Drive
//!   backends in [`crate::storage`].
//!
//! Both traits are annotated for `mockall` so tests can script failures.
//!
//! The plain data carried across those seams (source records, destination
//! descriptors and metadata) lives here too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use mockall::automock;

use crate::error::{SourceError, StorageError};

/// The kinds of LMS content the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordKind {
    File,
    Page,
    Assignment,
    Announcement,
    Discussion,
    Quiz,
    Enrollment,
    CalendarEvent,
    Group,
    Conversation,
    AnalyticsEvent,
    Submission,
}

/// A content item as fetched from the LMS. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub kind: RecordKind,
    pub title: String,
    pub body: Option<String>,
    pub size: Option<u64>,
    pub updated_at: Option<String>,
}

/// Where a destination folder lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A directory on the local filesystem.
    Path(PathBuf),
    /// A folder identifier assigned by a remote store.
    Folder(String),
}

/// A folder in the destination store plus the human-readable label used in the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDescriptor {
    pub location: Location,
    pub label: String,
}

impl DestinationDescriptor {
    pub fn local(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            location: Location::Path(path.into()),
            label: label.into(),
        }
    }

    pub fn remote(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            location: Location::Folder(id.into()),
            label: label.into(),
        }
    }

    /// Label for a child folder named `name`. The store root has an empty label.
    pub fn child_label(&self, name: &str) -> String {
        if self.label.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.label, name)
        }
    }
}

/// Observed state of an existing artifact. Absence of the whole value means
/// the artifact does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationMetadata {
    pub backend_id: Option<String>,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

/// One page of results from a paginated listing.
pub type ListingPage = (Vec<Value>, Option<String>);

/// Read access to the LMS.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Fetch one page of a listing, returning its items and the next-page URL if any.
    async fn fetch_page(&self, url: &str) -> Result<ListingPage, SourceError>;

    /// Fetch a single JSON document.
    async fn get_json(&self, url: &str) -> Result<Value, SourceError>;

    /// Stream the body at `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, SourceError>;
}

/// The destination store capability.
///
/// Implementations must make `ensure_folder` idempotent and `upsert` replace
/// content in place when an existing id is supplied.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// The store's top-level container (root directory or the drive root).
    fn top(&self) -> DestinationDescriptor;

    /// Return the folder `name` under `parent`, creating it if missing.
    async fn ensure_folder(
        &self,
        parent: &DestinationDescriptor,
        name: &str,
    ) -> Result<DestinationDescriptor, StorageError>;

    /// Metadata of `filename` inside `folder`, or `None` if it does not exist.
    async fn find_existing(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
    ) -> Result<Option<DestinationMetadata>, StorageError>;

    /// Create `filename` from `local_path`, or overwrite the artifact `existing_id`.
    async fn upsert(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
        local_path: &Path,
        existing_id: Option<String>,
    ) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_label_joins_with_slash() {
        let root = DestinationDescriptor::local("/tmp/root", "");
        assert_eq!(root.child_label("Biology"), "Biology");
        let course = DestinationDescriptor::local("/tmp/root/Biology", "Biology");
        assert_eq!(course.child_label("Pages"), "Biology/Pages");
    }
}
