//! Error types shared across the sync pipeline.
//!
//! Each stage has its own error enum so callers can tell a transport failure
//! from a storage failure; [`SyncError`] folds them together for the
//! per-resource boundary in [`crate::synchronise`].

use thiserror::Error;

/// Failures talking to the LMS.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("request to {url} returned status {status} after {attempts} attempt(s)")]
    Status { url: String, status: u16, attempts: u32 },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("I/O error while downloading: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures on the destination side.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Google Drive API error (status {status_code}): {message}")]
    Api { status_code: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to parse API response: {0}")]
    Parse(String),

    #[error("local artifact missing: {0}")]
    MissingArtifact(String),

    #[error("destination {0} does not belong to this backend")]
    ForeignLocation(String),
}

/// Failures while assembling an output document.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("document has no content")]
    EmptyDocument,

    #[error("failed to serialise export: {0}")]
    Serialise(#[from] serde_json::Error),

    #[error("I/O error writing document: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal configuration problems, detected before any network or filesystem work.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid storage kind '{0}': must be 'local' or 'google_drive'")]
    InvalidStorageKind(String),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Umbrella error for one resource's processing.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("upsert of '{filename}' was not accepted by the destination")]
    UpsertRejected { filename: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StorageError::Api {
            status_code: 404,
            message: "File not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Google Drive API error (status 404): File not found"
        );
    }

    #[test]
    fn test_sync_error_wraps_source_error() {
        let err: SyncError = SourceError::Status {
            url: "https://lms/x".into(),
            status: 503,
            attempts: 4,
        }
        .into();
        assert!(matches!(err, SyncError::Source(_)));
        assert!(err.to_string().contains("503"));
    }
}
