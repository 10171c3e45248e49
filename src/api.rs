//! Typed wrappers over the Dataverse REST API.
//!
//! Native-API calls authenticate with the `X-Dataverse-key` header; the
//! SWORD delete endpoint wants HTTP Basic auth with the token as the
//! username and an empty password. Downloads are streamed by the caller
//! from the returned response; uploads go up as one multipart body since
//! the API has no streaming upload.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::RemoteError;

const API_KEY_HEADER: &str = "X-Dataverse-key";

/// Cap on error bodies echoed into failure messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug)]
pub struct DataverseClient {
    http: Client,
    base_url: String,
    token: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    status: String,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LatestVersionEnvelope {
    #[serde(rename = "latestVersion")]
    latest_version: DatasetVersion,
}

/// One version entry of a dataset, with its file listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetVersion {
    #[serde(rename = "versionState")]
    pub version_state: String,
    #[serde(rename = "versionNumber")]
    pub version_number: Option<i64>,
    #[serde(rename = "versionMinorNumber")]
    pub version_minor_number: Option<i64>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl DatasetVersion {
    pub fn is_released(&self) -> bool {
        self.version_state == "RELEASED"
    }
}

/// A file as listed in a dataset version, or echoed by upload/replace.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "directoryLabel")]
    pub directory_label: Option<String>,
    #[serde(rename = "dataFile")]
    pub data_file: DataFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataFile {
    pub id: i64,
    pub filename: String,
}

impl FileEntry {
    /// The POSIX path this entry occupies in the dataset, in mangled form
    /// (Dataverse stores mangled names; we unmangle only at the host
    /// boundary).
    pub fn path(&self) -> String {
        match self.directory_label.as_deref() {
            Some(dir) if !dir.is_empty() => format!("{dir}/{}", self.data_file.filename),
            _ => self.data_file.filename.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadedFiles {
    files: Vec<FileEntry>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl DataverseClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Idempotent GET, retried once on connect-class failures.
    async fn get_retry(&self, url: &str) -> Result<reqwest::Response, RemoteError> {
        let send = || {
            self.http
                .get(url)
                .header(API_KEY_HEADER, &self.token)
                .send()
        };
        match send().await {
            Err(e) if e.is_connect() || e.is_timeout() => {
                tracing::debug!(url, "retrying GET after transport error: {e}");
                Ok(send().await?)
            }
            other => Ok(other?),
        }
    }

    /// Cheap liveness and token check.
    pub async fn info_version(&self) -> Result<(), RemoteError> {
        let url = format!("{}/api/info/version", self.base_url);
        let resp = self.get_retry(&url).await?;
        let resp = check_status(resp, false).await?;
        let body: StatusEnvelope = resp.json().await?;
        if body.status != "OK" {
            return Err(RemoteError::Transport {
                status: None,
                message: format!("dataverse instance reported status {}", body.status),
            });
        }
        Ok(())
    }

    /// Latest version (draft if one exists) of a dataset, with files.
    pub async fn get_dataset_latest(&self, doi: &str) -> Result<DatasetVersion, RemoteError> {
        let url = format!(
            "{}/api/datasets/:persistentId/?persistentId={doi}",
            self.base_url
        );
        let resp = self.get_retry(&url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::DatasetNotFound(doi.to_string()));
        }
        let resp = check_status(resp, false).await?;
        let body: DataEnvelope<LatestVersionEnvelope> = resp.json().await?;
        Ok(body.data.latest_version)
    }

    /// All known versions of a dataset, as the server lists them.
    pub async fn get_dataset_versions(
        &self,
        doi: &str,
    ) -> Result<Vec<DatasetVersion>, RemoteError> {
        let url = format!(
            "{}/api/datasets/:persistentId/versions?persistentId={doi}",
            self.base_url
        );
        let resp = self.get_retry(&url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::DatasetNotFound(doi.to_string()));
        }
        let resp = check_status(resp, false).await?;
        let body: DataEnvelope<Vec<DatasetVersion>> = resp.json().await?;
        Ok(body.data)
    }

    /// Add a new datafile to the dataset. Returns the echoed file record.
    pub async fn upload_datafile(
        &self,
        doi: &str,
        content: Vec<u8>,
        file_name: &str,
        json_data: &serde_json::Value,
    ) -> Result<FileEntry, RemoteError> {
        let url = format!(
            "{}/api/datasets/:persistentId/add?persistentId={doi}",
            self.base_url
        );
        self.send_multipart(&url, content, file_name, json_data).await
    }

    /// Replace the content of an existing datafile. Dataverse assigns a
    /// fresh file id; the old one stays resolvable in released versions.
    pub async fn replace_datafile(
        &self,
        fid: i64,
        content: Vec<u8>,
        file_name: &str,
        json_data: &serde_json::Value,
    ) -> Result<FileEntry, RemoteError> {
        let url = format!("{}/api/files/{fid}/replace", self.base_url);
        self.send_multipart(&url, content, file_name, json_data).await
    }

    async fn send_multipart(
        &self,
        url: &str,
        content: Vec<u8>,
        file_name: &str,
        json_data: &serde_json::Value,
    ) -> Result<FileEntry, RemoteError> {
        let form = Form::new()
            .part(
                "file",
                Part::bytes(content).file_name(file_name.to_string()),
            )
            .text("jsonData", json_data.to_string());
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.token)
            .multipart(form)
            .send()
            .await?;
        let resp = check_status(resp, true).await?;
        let body: DataEnvelope<UploadedFiles> = resp.json().await?;
        body.data.files.into_iter().next().ok_or_else(|| {
            RemoteError::Transport {
                status: None,
                message: "upload response contained no file record".to_string(),
            }
        })
    }

    /// Update a datafile's metadata (the rename path). Returns the raw
    /// response body; Dataverse answers this endpoint with prose wrapping a
    /// JSON object rather than a JSON document.
    pub async fn update_datafile_metadata(
        &self,
        fid: i64,
        json_data: &serde_json::Value,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/api/files/{fid}/metadata", self.base_url);
        let form = Form::new().text("jsonData", json_data.to_string());
        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.token)
            .multipart(form)
            .send()
            .await?;
        let resp = check_status(resp, false).await?;
        Ok(resp.text().await?)
    }

    /// Delete a datafile from the draft version via the SWORD endpoint.
    pub async fn delete_datafile(&self, fid: i64) -> Result<(), RemoteError> {
        let url = format!(
            "{}/dvn/api/data-deposit/v1.1/swordv2/edit-media/file/{fid}",
            self.base_url
        );
        let resp = self
            .http
            .delete(&url)
            .basic_auth(&self.token, Some(""))
            .send()
            .await?;
        check_status(resp, false).await?;
        Ok(())
    }

    /// Open a streaming download of a datafile. The caller drains
    /// `chunk()` in whatever sizes the transport delivers.
    pub async fn get_datafile(&self, fid: i64) -> Result<reqwest::Response, RemoteError> {
        let url = format!(
            "{}/api/access/datafile/{fid}?format=original",
            self.base_url
        );
        let resp = self.get_retry(&url).await?;
        check_status(resp, false).await
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map non-success statuses to typed errors. With `duplicate_probe`, a 4xx
/// whose JSON body reports duplicate content becomes
/// [`RemoteError::DuplicateContent`] so the store path can treat it as a
/// no-op.
async fn check_status(
    resp: reqwest::Response,
    duplicate_probe: bool,
) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Auth {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("access denied")
                .to_string(),
        });
    }

    let body = resp.text().await.unwrap_or_default();
    if duplicate_probe
        && status.is_client_error()
        && let Some(message) = duplicate_content_message(&body)
    {
        return Err(RemoteError::DuplicateContent(message));
    }
    let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    Err(RemoteError::Transport {
        status: Some(status.as_u16()),
        message: truncated,
    })
}

/// Extract the server message from a duplicate-content error body:
/// `{"status": "ERROR", "message": "... duplicate content ..."}`.
fn duplicate_content_message(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    if parsed.get("status")?.as_str()? != "ERROR" {
        return None;
    }
    let message = parsed.get("message")?.as_str()?;
    if message.contains("duplicate content") {
        Some(message.to_string())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_listing_deserializes() {
        let body = r#"{
            "status": "OK",
            "data": [
                {"versionNumber": 1, "versionMinorNumber": 0,
                 "versionState": "RELEASED",
                 "files": [{"label": "third_file.md",
                            "directoryLabel": "subdir2",
                            "dataFile": {"id": 682, "filename": "third_file.md",
                                         "contentType": "text/plain", "filesize": 9}}]},
                {"versionState": "DRAFT", "files": []}
            ]
        }"#;
        let parsed: DataEnvelope<Vec<DatasetVersion>> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert!(parsed.data[0].is_released());
        assert_eq!(parsed.data[0].files[0].data_file.id, 682);
        assert_eq!(parsed.data[0].files[0].path(), "subdir2/third_file.md");
        assert_eq!(parsed.data[1].version_number, None);
    }

    #[test]
    fn file_entry_path_without_directory() {
        let entry: FileEntry = serde_json::from_str(
            r#"{"dataFile": {"id": 1, "filename": "a.bin"}}"#,
        )
        .unwrap();
        assert_eq!(entry.path(), "a.bin");
    }

    #[test]
    fn duplicate_content_body_is_recognized() {
        let body = r#"{"status":"ERROR","message":"Error! You may not replace a file with duplicate content."}"#;
        assert!(duplicate_content_message(body).is_some());
        assert!(duplicate_content_message(r#"{"status":"OK"}"#).is_none());
        assert!(duplicate_content_message("not json").is_none());
        assert!(
            duplicate_content_message(r#"{"status":"ERROR","message":"quota exceeded"}"#)
                .is_none()
        );
    }
}
