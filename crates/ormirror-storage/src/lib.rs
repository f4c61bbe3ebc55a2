//! OpenReview HTTP client, attachment storage and snapshot archives.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ormirror_core::{Note, Profile};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ormirror-storage";

pub const DEFAULT_BASE_URL: &str = "https://api2.openreview.net";

/// Key under which a snapshot stores its note array.
pub const SNAPSHOT_KEY: &str = "notes";

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub file_name: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Output directory for downloaded attachments. Each file is written once per
/// task through a temp file and renamed into place.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write `bytes` to `<root>/<file_name>`, replacing any previous version.
    pub async fn store_bytes(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment> {
        let path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), file_name));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp attachment file {}", temp_path.display()))?;
        let mut written = file.write_all(bytes).await;
        if written.is_ok() {
            written = file.flush().await;
        }
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing temp attachment file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp attachment {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredAttachment {
            file_name: file_name.to_string(),
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {} is not valid: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("array `{name}` not found in snapshot (available: {})", .available.join(", "))]
    MissingArray { name: String, available: Vec<String> },
    #[error("entry `{0}` in snapshot is not an array")]
    NotAnArray(String),
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    notes: &'a [Note],
}

#[derive(Deserialize)]
struct SnapshotFile {
    notes: Vec<Note>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    }
}

/// Persist the full note listing as a gzip-compressed JSON object.
pub fn write_snapshot(path: &Path, notes: &[Note]) -> Result<(), SnapshotError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let result: Result<(), SnapshotError> = (|| {
        let file = File::create(&temp_path).map_err(io_error(&temp_path))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &SnapshotRef { notes }).map_err(json_error(path))?;
        let mut writer = encoder.finish().map_err(io_error(&temp_path))?;
        writer.flush().map_err(io_error(&temp_path))?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&temp_path);
        SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

pub fn read_snapshot(path: &Path) -> Result<Vec<Note>, SnapshotError> {
    let file = File::open(path).map_err(io_error(path))?;
    let snapshot: SnapshotFile = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
        .map_err(json_error(path))?;
    Ok(snapshot.notes)
}

/// Read one named top-level array without interpreting its elements.
pub fn read_array(path: &Path, name: &str) -> Result<Vec<JsonValue>, SnapshotError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut entries: Map<String, JsonValue> =
        serde_json::from_reader(GzDecoder::new(BufReader::new(file))).map_err(json_error(path))?;
    match entries.remove(name) {
        Some(JsonValue::Array(items)) => Ok(items),
        Some(_) => Err(SnapshotError::NotAnArray(name.to_string())),
        None => Err(SnapshotError::MissingArray {
            name: name.to_string(),
            available: entries.keys().cloned().collect(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            page_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no profile found for {0}")]
    ProfileNotFound(String),
}

/// Listing and attachment retrieval for the mirror.
#[async_trait]
pub trait NoteSource: Send + Sync {
    async fn list_notes(&self, invitation: &str) -> Result<Vec<Note>, FetchError>;

    async fn attachment(&self, note_id: &str, field_name: &str) -> Result<Vec<u8>, FetchError>;
}

/// Author profile retrieval for the converter.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn profile(&self, author_id: &str) -> Result<Profile, FetchError>;
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct NotesPage {
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Deserialize)]
struct ProfilesPage {
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug)]
pub struct OpenReviewClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
    backoff: BackoffPolicy,
}

impl OpenReviewClient {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Exchange credentials for a bearer token used by every later request.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), FetchError> {
        let url = self.endpoint("login");
        let body = serde_json::json!({ "id": username, "password": password });
        let resp = self
            .send_with_retry(|client| client.post(&url).json(&body))
            .await?;
        let login: LoginResponse = decode_json(&url, resp).await?;
        self.token = Some(login.token);
        debug!(username, "authenticated");
        Ok(())
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let mut request = build(&self.client);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    /// Every note under `invitation`, following offset pagination until a short page.
    pub async fn get_all_notes(&self, invitation: &str) -> Result<Vec<Note>, FetchError> {
        let span = info_span!("list_notes", invitation);
        self.fetch_note_pages(invitation).instrument(span).await
    }

    async fn fetch_note_pages(&self, invitation: &str) -> Result<Vec<Note>, FetchError> {
        let url = self.endpoint("notes");
        let mut notes = Vec::new();
        loop {
            let params = [
                ("invitation", invitation.to_string()),
                ("limit", self.page_size.to_string()),
                ("offset", notes.len().to_string()),
            ];
            let resp = self
                .send_with_retry(|client| client.get(&url).query(&params))
                .await?;
            let page: NotesPage = decode_json(&url, resp).await?;
            let received = page.notes.len();
            notes.extend(page.notes);
            debug!(received, total = notes.len(), "fetched notes page");
            if received < self.page_size {
                return Ok(notes);
            }
        }
    }

    pub async fn get_attachment(
        &self,
        note_id: &str,
        field_name: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("get_attachment", note_id, field_name);
        self.fetch_attachment_bytes(note_id, field_name)
            .instrument(span)
            .await
    }

    async fn fetch_attachment_bytes(
        &self,
        note_id: &str,
        field_name: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let url = self.endpoint("attachment");
        let resp = self
            .send_with_retry(|client| {
                client
                    .get(&url)
                    .query(&[("id", note_id), ("name", field_name)])
            })
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Profiles are looked up by email when the author id is an address.
    pub async fn get_profile(&self, author_id: &str) -> Result<Profile, FetchError> {
        let url = self.endpoint("profiles");
        let key = if author_id.contains('@') { "email" } else { "id" };
        let resp = self
            .send_with_retry(|client| client.get(&url).query(&[(key, author_id)]))
            .await?;
        let page: ProfilesPage = decode_json(&url, resp).await?;
        page.profiles
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ProfileNotFound(author_id.to_string()))
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    url: &str,
    resp: reqwest::Response,
) -> Result<T, FetchError> {
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[async_trait]
impl NoteSource for OpenReviewClient {
    async fn list_notes(&self, invitation: &str) -> Result<Vec<Note>, FetchError> {
        self.get_all_notes(invitation).await
    }

    async fn attachment(&self, note_id: &str, field_name: &str) -> Result<Vec<u8>, FetchError> {
        self.get_attachment(note_id, field_name).await
    }
}

#[async_trait]
impl ProfileLookup for OpenReviewClient {
    async fn profile(&self, author_id: &str) -> Result<Profile, FetchError> {
        self.get_profile(author_id).await
    }
}
