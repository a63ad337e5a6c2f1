use std::path::Path;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::auth::Auth;
use crate::error::DriveError;
use crate::fs_types::{DriveFile, FileList};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";

// Projection kept to the fields the translator consumes.
const LIST_FIELDS: &str =
    "files(id, name, size, kind, parents, mimeType, createdTime, viewedByMeTime, modifiedByMeTime)";
const FILE_FIELDS: &str =
    "id, name, size, kind, parents, mimeType, createdTime, viewedByMeTime, modifiedByMeTime";

/// What the mount needs from the remote store. The HTTP client implements
/// it for real; tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// First page of children of a container; no continuation.
    async fn list_children(
        &self,
        container_id: &str,
        page_size: u32,
    ) -> Result<Vec<DriveFile>, DriveError>;

    /// Current metadata of a single object, straight from the service.
    async fn fetch_metadata(&self, object_id: &str) -> Result<DriveFile, DriveError>;

    /// Downloads the full object content into `dest`, truncating any
    /// previous copy. A transfer broken partway leaves the partial file
    /// in place and reports `FetchFailed`.
    async fn fetch_content(&self, object_id: &str, dest: &Path) -> Result<(), DriveError>;
}

/// Drive v3 client over HTTPS with bearer auth.
pub struct DriveClient {
    http: Client,
    auth: Auth,
}

impl DriveClient {
    pub fn new(auth: Auth) -> Self {
        DriveClient {
            http: Client::new(),
            auth,
        }
    }
}

#[async_trait]
impl RemoteDrive for DriveClient {
    async fn list_children(
        &self,
        container_id: &str,
        page_size: u32,
    ) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!("'{container_id}' in parents and trashed=false");
        let page = page_size.to_string();
        let token = self.auth.access_token().await?;

        let res = self
            .http
            .get(format!("{DRIVE_API}/files"))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("pageSize", page.as_str()),
                ("fields", LIST_FIELDS),
            ])
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !res.status().is_success() {
            return Err(status_error(res.status(), container_id));
        }

        let list = res
            .json::<FileList>()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;
        debug!("listed {} children of {container_id}", list.files.len());
        Ok(list.files)
    }

    async fn fetch_metadata(&self, object_id: &str) -> Result<DriveFile, DriveError> {
        let token = self.auth.access_token().await?;

        let res = self
            .http
            .get(format!("{DRIVE_API}/files/{object_id}"))
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !res.status().is_success() {
            return Err(status_error(res.status(), object_id));
        }

        res.json::<DriveFile>()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))
    }

    async fn fetch_content(&self, object_id: &str, dest: &Path) -> Result<(), DriveError> {
        let token = self.auth.access_token().await?;

        let mut res = self
            .http
            .get(format!("{DRIVE_API}/files/{object_id}"))
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !res.status().is_success() {
            return Err(status_error(res.status(), object_id));
        }

        let mut out = File::create(dest).await?;
        let mut written = 0u64;
        loop {
            match res.chunk().await {
                Ok(Some(chunk)) => {
                    out.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Ok(None) => break,
                // The partial file stays on disk; callers see the failure.
                Err(e) => {
                    return Err(DriveError::FetchFailed(format!(
                        "{object_id}: {e} after {written} bytes"
                    )));
                }
            }
        }
        out.flush().await?;

        debug!("downloaded {object_id} to {} ({written} bytes)", dest.display());
        Ok(())
    }
}

/// Maps a non-success status onto the error taxonomy.
fn status_error(status: StatusCode, what: &str) -> DriveError {
    match status {
        StatusCode::NOT_FOUND => DriveError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DriveError::PermissionDenied(format!("{what}: HTTP {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => DriveError::QuotaExceeded(what.to_string()),
        _ => DriveError::Network(format!("{what}: HTTP {status}")),
    }
}
