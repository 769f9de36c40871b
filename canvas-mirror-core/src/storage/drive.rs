//! Google Drive v3 backend.
//!
//! Folders are located by name, folder mime type and parent; files by name and
//! parent. Content is sent with the resumable upload protocol: a session is
//! opened with `POST` (new file) or `PATCH files/{id}` (replace content, same
//! id) and the body is streamed in fixed-size chunks, each acknowledged with
//! `308 Resume Incomplete` until the last one. The `Range` header of a 308
//! names the bytes Drive has committed; the next chunk starts right after them.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

use super::sanitize_filename;
use crate::config::PerformanceConfig;
use crate::contract::{DestinationDescriptor, DestinationMetadata, Location, Storage};
use crate::download::is_retryable;
use crate::error::StorageError;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "modifiedTime", default)]
    modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilesListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Quote a value for a Drive search query.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn folder_query(name: &str, parent_id: &str) -> String {
    format!(
        "name={} and mimeType='{}' and {} in parents and trashed=false",
        quote(name),
        FOLDER_MIME_TYPE,
        quote(parent_id)
    )
}

fn file_query(name: &str, parent_id: &str) -> String {
    format!(
        "name={} and {} in parents and trashed=false",
        quote(name),
        quote(parent_id)
    )
}

/// `Content-Range` header for bytes `start..start+len` of a `total`-byte upload.
fn content_range(start: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{}", start, start + len - 1, total)
    }
}

/// Last committed byte from a 308 `Range` header such as `bytes=0-524287`.
fn committed_through(range: Option<&str>) -> Option<u64> {
    let (start, end) = range?.trim().strip_prefix("bytes=")?.split_once('-')?;
    if start.trim() != "0" {
        return None;
    }
    end.trim().parse().ok()
}

/// Google Drive mirror rooted at a named top-level folder.
pub struct DriveStore {
    client: Client,
    access_token: String,
    root: DestinationDescriptor,
    api_base: String,
    upload_base: String,
    chunk_bytes: usize,
    performance: PerformanceConfig,
}

impl DriveStore {
    /// Build the client and resolve (or create) the root folder under "My Drive".
    pub async fn connect(
        access_token: &str,
        root_folder_name: &str,
        performance: &PerformanceConfig,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(performance.request_timeout())
            .pool_max_idle_per_host(performance.pool_size)
            .build()
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let mut store = Self {
            client,
            access_token: access_token.to_string(),
            root: DestinationDescriptor::remote("root", ""),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            chunk_bytes: performance.chunk_bytes(),
            performance: performance.clone(),
        };
        let root_id = store.find_or_create_folder("root", root_folder_name).await?;
        info!(root_folder = %root_folder_name, id = %root_id, "Resolved Drive root folder");
        store.root = DestinationDescriptor::remote(root_id, "");
        Ok(store)
    }

    fn folder_id<'a>(&self, folder: &'a DestinationDescriptor) -> Result<&'a str, StorageError> {
        match &folder.location {
            Location::Folder(id) => Ok(id),
            Location::Path(path) => Err(StorageError::ForeignLocation(path.display().to_string())),
        }
    }

    /// Send the request built by `build`, retrying on 429/5xx and transport errors.
    ///
    /// Any other non-success status except `308` is returned as [`StorageError::Api`].
    async fn execute<F>(&self, build: F) -> Result<Response, StorageError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().bearer_auth(&self.access_token).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::PERMANENT_REDIRECT {
                        return Ok(response);
                    }
                    if is_retryable(status) && attempt <= self.performance.max_retries {
                        let delay = self.performance.backoff_delay(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "Drive request failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(StorageError::Api {
                        status_code: status.as_u16(),
                        message,
                    });
                }
                Err(e) if attempt <= self.performance.max_retries => {
                    let delay = self.performance.backoff_delay(attempt);
                    warn!(error = %e, attempt, ?delay, "Drive request errored, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(StorageError::Network(e.to_string())),
            }
        }
    }

    async fn search(&self, query: &str, fields: &str) -> Result<Vec<DriveFile>, StorageError> {
        let url = format!("{}/files", self.api_base);
        let response = self
            .execute(|| {
                self.client.get(&url).query(&[
                    ("q", query),
                    ("fields", fields),
                    ("spaces", "drive"),
                ])
            })
            .await?;
        let listing: FilesListResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Parse(format!("Failed to parse files list response: {e}")))?;
        Ok(listing.files)
    }

    async fn find_or_create_folder(&self, parent_id: &str, name: &str) -> Result<String, StorageError> {
        let existing = self
            .search(&folder_query(name, parent_id), "files(id,name)")
            .await?;
        if let Some(folder) = existing.into_iter().next() {
            return Ok(folder.id);
        }

        let url = format!("{}/files", self.api_base);
        let body = json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });
        let response = self
            .execute(|| self.client.post(&url).query(&[("fields", "id")]).json(&body))
            .await?;
        let created: DriveFile = response
            .json()
            .await
            .map_err(|e| StorageError::Parse(format!("Failed to parse folder creation response: {e}")))?;
        info!(name, id = %created.id, "Created Drive folder");
        Ok(created.id)
    }

    /// Open a resumable session and return its upload URL.
    async fn open_session(
        &self,
        folder_id: &str,
        filename: &str,
        total: u64,
        existing_id: Option<&str>,
    ) -> Result<String, StorageError> {
        let response = match existing_id {
            Some(id) => {
                let url = format!("{}/files/{}", self.upload_base, urlencoding::encode(id));
                self.execute(|| {
                    self.client
                        .patch(&url)
                        .query(&[("uploadType", "resumable")])
                        .header("X-Upload-Content-Length", total.to_string())
                        .json(&json!({}))
                })
                .await?
            }
            None => {
                let url = format!("{}/files", self.upload_base);
                let metadata = json!({ "name": filename, "parents": [folder_id] });
                self.execute(|| {
                    self.client
                        .post(&url)
                        .query(&[("uploadType", "resumable")])
                        .header("X-Upload-Content-Length", total.to_string())
                        .json(&metadata)
                })
                .await?
            }
        };
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Parse("resumable session response had no Location".into()))
    }

    /// Stream `local_path` to the session in `chunk_bytes` pieces.
    ///
    /// After each 308 the upload resumes at the byte following the committed
    /// `Range`, or from the start when Drive reports none. Gives up with `false`
    /// once `max_retries + 1` rounds in a row commit nothing new.
    async fn send_chunks(&self, session: &str, local_path: &Path, total: u64) -> Result<bool, StorageError> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut buffer = vec![0u8; self.chunk_bytes];
        let mut offset = 0u64;
        let mut stalled = 0;

        loop {
            file.seek(SeekFrom::Start(offset)).await?;
            let mut filled = 0;
            while filled < buffer.len() {
                let n = file.read(&mut buffer[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            let chunk = buffer[..filled].to_vec();
            let range = content_range(offset, filled as u64, total);
            debug!(%range, "Uploading chunk");
            let response = self
                .execute(|| {
                    self.client
                        .put(session)
                        .header(reqwest::header::CONTENT_RANGE, range.as_str())
                        .body(chunk.clone())
                })
                .await?;

            if response.status() != StatusCode::PERMANENT_REDIRECT {
                return Ok(response.status().is_success());
            }
            let committed = response
                .headers()
                .get(reqwest::header::RANGE)
                .and_then(|v| v.to_str().ok());
            let next = committed_through(committed).map_or(0, |last| last + 1);
            if next <= offset {
                stalled += 1;
                if stalled > self.performance.max_retries {
                    warn!(offset, total, "Drive stopped committing uploaded bytes");
                    return Ok(false);
                }
            } else {
                stalled = 0;
            }
            debug!(committed = ?committed, next, "Drive asked for more data");
            offset = next.min(total);
        }
    }
}

#[async_trait]
impl Storage for DriveStore {
    fn top(&self) -> DestinationDescriptor {
        self.root.clone()
    }

    #[instrument(skip(self, parent), fields(parent = %parent.label))]
    async fn ensure_folder(
        &self,
        parent: &DestinationDescriptor,
        name: &str,
    ) -> Result<DestinationDescriptor, StorageError> {
        let name = sanitize_filename(name);
        let id = self.find_or_create_folder(self.folder_id(parent)?, &name).await?;
        Ok(DestinationDescriptor::remote(id, parent.child_label(&name)))
    }

    async fn find_existing(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
    ) -> Result<Option<DestinationMetadata>, StorageError> {
        let files = self
            .search(
                &file_query(filename, self.folder_id(folder)?),
                "files(id,size,modifiedTime)",
            )
            .await?;
        Ok(files.into_iter().next().map(|file| DestinationMetadata {
            size: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
            modified_time: file
                .modified_time
                .as_deref()
                .and_then(crate::change::parse_timestamp),
            backend_id: Some(file.id),
        }))
    }

    #[instrument(skip(self, folder, local_path), fields(folder = %folder.label))]
    async fn upsert(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
        local_path: &Path,
        existing_id: Option<String>,
    ) -> Result<bool, StorageError> {
        let total = match tokio::fs::metadata(local_path).await {
            Ok(m) => m.len(),
            Err(_) => {
                return Err(StorageError::MissingArtifact(
                    local_path.display().to_string(),
                ))
            }
        };
        let session = self
            .open_session(self.folder_id(folder)?, filename, total, existing_id.as_deref())
            .await?;
        let done = self.send_chunks(&session, local_path, total).await?;
        info!(filename, bytes = total, replaced = existing_id.is_some(), done, "Drive upload finished");
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_query_filters_by_parent_and_mime_type() {
        assert_eq!(
            folder_query("Bio 101", "root"),
            "name='Bio 101' and mimeType='application/vnd.google-apps.folder' and 'root' in parents and trashed=false"
        );
    }

    #[test]
    fn queries_escape_quotes() {
        assert_eq!(
            file_query("Tom's notes.pdf", "abc"),
            "name='Tom\\'s notes.pdf' and 'abc' in parents and trashed=false"
        );
    }

    #[test]
    fn content_ranges_are_inclusive() {
        assert_eq!(content_range(0, 262_144, 300_000), "bytes 0-262143/300000");
        assert_eq!(content_range(262_144, 37_856, 300_000), "bytes 262144-299999/300000");
        assert_eq!(content_range(0, 0, 0), "bytes */0");
    }

    #[test]
    fn committed_range_is_parsed_from_the_308_header() {
        assert_eq!(committed_through(Some("bytes=0-524287")), Some(524_287));
        assert_eq!(committed_through(Some(" bytes=0-1 ")), Some(1));
        assert_eq!(committed_through(Some("bytes=5-9")), None);
        assert_eq!(committed_through(Some("items=0-9")), None);
        assert_eq!(committed_through(None), None);
    }

    mod http {
        use super::*;
        use httpmock::prelude::*;
        use httpmock::Method::PATCH;
        use std::io::Write;
        use tempfile::NamedTempFile;

        fn store(server: &MockServer, chunk_bytes: usize) -> DriveStore {
            DriveStore {
                client: Client::new(),
                access_token: "token".into(),
                root: DestinationDescriptor::remote("root", ""),
                api_base: server.url("/drive/v3"),
                upload_base: server.url("/upload/drive/v3"),
                chunk_bytes,
                performance: PerformanceConfig {
                    backoff_factor: 0.0,
                    ..PerformanceConfig::default()
                },
            }
        }

        fn artifact(bytes: &[u8]) -> NamedTempFile {
            let mut file = NamedTempFile::new().unwrap();
            file.write_all(bytes).unwrap();
            file
        }

        fn folder() -> DestinationDescriptor {
            DestinationDescriptor::remote("folder-1", "Bio")
        }

        #[tokio::test]
        async fn existing_files_are_replaced_through_a_patch_session() {
            let server = MockServer::start_async().await;
            let patch = server.mock(|when, then| {
                when.method(PATCH)
                    .path("/upload/drive/v3/files/file-9")
                    .query_param("uploadType", "resumable")
                    .header("x-upload-content-length", "3")
                    .header("authorization", "Bearer token");
                then.status(200).header("location", server.url("/session/1"));
            });
            let create = server.mock(|when, then| {
                when.method(POST).path("/upload/drive/v3/files");
                then.status(200).header("location", server.url("/session/2"));
            });
            let put = server.mock(|when, then| {
                when.method(PUT)
                    .path("/session/1")
                    .header("content-range", "bytes 0-2/3")
                    .body("abc");
                then.status(200).json_body(serde_json::json!({"id": "file-9"}));
            });
            let file = artifact(b"abc");

            let done = store(&server, 4)
                .upsert(&folder(), "notes.txt", file.path(), Some("file-9".into()))
                .await
                .unwrap();

            assert!(done);
            patch.assert();
            put.assert();
            create.assert_hits(0);
        }

        #[tokio::test]
        async fn upload_resumes_after_the_committed_range() {
            let server = MockServer::start_async().await;
            let open = server.mock(|when, then| {
                when.method(POST)
                    .path("/upload/drive/v3/files")
                    .query_param("uploadType", "resumable")
                    .json_body(serde_json::json!({"name": "data.bin", "parents": ["folder-1"]}));
                then.status(200).header("location", server.url("/session"));
            });
            let first = server.mock(|when, then| {
                when.method(PUT).path("/session").header("content-range", "bytes 0-3/10").body("0123");
                then.status(308).header("range", "bytes=0-1");
            });
            let second = server.mock(|when, then| {
                when.method(PUT).path("/session").header("content-range", "bytes 2-5/10").body("2345");
                then.status(308).header("range", "bytes=0-5");
            });
            let last = server.mock(|when, then| {
                when.method(PUT).path("/session").header("content-range", "bytes 6-9/10").body("6789");
                then.status(200).json_body(serde_json::json!({"id": "new"}));
            });
            let file = artifact(b"0123456789");

            let done = store(&server, 4)
                .upsert(&folder(), "data.bin", file.path(), None)
                .await
                .unwrap();

            assert!(done);
            open.assert();
            first.assert();
            second.assert();
            last.assert();
        }

        #[tokio::test]
        async fn missing_range_restarts_from_the_first_byte_until_it_gives_up() {
            let server = MockServer::start_async().await;
            server.mock(|when, then| {
                when.method(POST).path("/upload/drive/v3/files");
                then.status(200).header("location", server.url("/session"));
            });
            let restart = server.mock(|when, then| {
                when.method(PUT).path("/session").header("content-range", "bytes 0-3/10");
                then.status(308);
            });
            let file = artifact(b"0123456789");
            let store = store(&server, 4);

            let done = store.upsert(&folder(), "data.bin", file.path(), None).await.unwrap();

            assert!(!done);
            restart.assert_hits(store.performance.max_retries as usize + 1);
        }

        #[tokio::test]
        async fn transient_failures_are_retried_then_reported() {
            let server = MockServer::start_async().await;
            let search = server.mock(|when, then| {
                when.method(GET).path("/drive/v3/files");
                then.status(503).body("busy");
            });
            let store = store(&server, 4);

            let err = store.find_existing(&folder(), "notes.txt").await.unwrap_err();

            assert!(matches!(err, StorageError::Api { status_code: 503, .. }), "{err:?}");
            search.assert_hits(store.performance.max_retries as usize + 1);
        }

        #[tokio::test]
        async fn existing_file_metadata_is_read_from_the_search() {
            let server = MockServer::start_async().await;
            server.mock(|when, then| {
                when.method(GET)
                    .path("/drive/v3/files")
                    .query_param("q", file_query("notes.txt", "folder-1"));
                then.status(200).json_body(serde_json::json!({"files": [
                    {"id": "file-9", "size": "42", "modifiedTime": "2024-01-01T00:00:00Z"}
                ]}));
            });

            let found = store(&server, 4)
                .find_existing(&folder(), "notes.txt")
                .await
                .unwrap()
                .expect("file is listed");

            assert_eq!(found.size, 42);
            assert_eq!(found.backend_id.as_deref(), Some("file-9"));
            assert!(found.modified_time.is_some());
        }
    }
}
