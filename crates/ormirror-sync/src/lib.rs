//! Incremental mirror: fetch a channel, snapshot it, download changed attachments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ormirror_core::{attachment_extension, Channel, Note};
use ormirror_storage::{
    read_snapshot, write_snapshot, AttachmentStore, HttpClientConfig, NoteSource,
    OpenReviewClient, StoredAttachment, DEFAULT_BASE_URL,
};
use serde::Serialize;
use tokio::{fs, task};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ormirror-sync";

pub const PDF_FIELD: &str = "pdf";
pub const SUPPLEMENTARY_FIELD: &str = "supplementary_materials";

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub download_workers: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("ormirror/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 60,
            download_workers: 5,
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("OPENREVIEW_BASEURL").unwrap_or(defaults.base_url),
            user_agent: std::env::var("ORMIRROR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("ORMIRROR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            download_workers: std::env::var("ORMIRROR_DOWNLOAD_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.download_workers),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Build a client and log in with the given credentials.
    pub async fn connect(&self, username: &str, password: &str) -> Result<OpenReviewClient> {
        let mut client = OpenReviewClient::new(self.base_url.clone(), self.http_client_config())?;
        client
            .login(username, password)
            .await
            .with_context(|| format!("logging in to {}", self.base_url))?;
        Ok(client)
    }
}

pub fn default_snapshot_path(channel: Channel) -> PathBuf {
    PathBuf::from(format!("{channel}.json.gz"))
}

/// Notes of a previous snapshot keyed by id.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    by_id: HashMap<String, Note>,
}

impl SnapshotIndex {
    pub fn from_notes(notes: Vec<Note>) -> Self {
        Self {
            by_id: notes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading previous snapshot");
        let notes =
            read_snapshot(path).with_context(|| format!("loading snapshot {}", path.display()))?;
        Ok(Self::from_notes(notes))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Note> {
        self.by_id.get(id)
    }

    /// True when the previous copy of `note` is at least as recent as `note`.
    pub fn is_up_to_date(&self, note: &Note) -> bool {
        self.get(&note.id)
            .is_some_and(|previous| previous.mdate >= note.mdate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadTask {
    pub output_dir: PathBuf,
    pub note_id: String,
    pub field_name: String,
    pub extension: String,
}

impl DownloadTask {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.note_id, self.extension)
    }
}

/// Attachments of one note: the PDF and the supplementary material, each
/// only when the field is present and non-empty.
pub fn tasks_for_note(note: &Note, output_dir: &Path) -> Vec<DownloadTask> {
    let mut tasks = Vec::new();
    if note.has_non_empty(PDF_FIELD) {
        tasks.push(DownloadTask {
            output_dir: output_dir.to_path_buf(),
            note_id: note.id.clone(),
            field_name: PDF_FIELD.to_string(),
            extension: "pdf".to_string(),
        });
    }
    if note.has_non_empty(SUPPLEMENTARY_FIELD) {
        if let Some(declared) = note.content_str(SUPPLEMENTARY_FIELD) {
            tasks.push(DownloadTask {
                output_dir: output_dir.to_path_buf(),
                note_id: note.id.clone(),
                field_name: SUPPLEMENTARY_FIELD.to_string(),
                extension: format!("attachment.{}", attachment_extension(declared)),
            });
        }
    }
    tasks
}

/// Downloads for every note that is new or newer than its previous copy.
pub fn plan_downloads(
    notes: &[Note],
    previous: Option<&SnapshotIndex>,
    output_dir: &Path,
) -> Vec<DownloadTask> {
    notes
        .iter()
        .filter(|note| !previous.is_some_and(|index| index.is_up_to_date(note)))
        .flat_map(|note| tasks_for_note(note, output_dir))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub task: DownloadTask,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub stored: Vec<StoredAttachment>,
    pub failures: Vec<DownloadFailure>,
}

async fn download_one(source: &dyn NoteSource, task: &DownloadTask) -> Result<StoredAttachment> {
    let bytes = source
        .attachment(&task.note_id, &task.field_name)
        .await
        .with_context(|| format!("fetching `{}` of {}", task.field_name, task.note_id))?;
    AttachmentStore::new(&task.output_dir)
        .store_bytes(&task.file_name(), &bytes)
        .await
}

/// Run `tasks` with at most `workers` in flight. Failed tasks are collected;
/// the others still run to completion.
pub async fn run_downloads(
    source: &dyn NoteSource,
    tasks: Vec<DownloadTask>,
    workers: usize,
) -> DownloadReport {
    let total = tasks.len();
    let mut report = DownloadReport::default();
    let mut pending = stream::iter(tasks)
        .map(move |task| async move {
            let result = download_one(source, &task).await;
            (task, result)
        })
        .buffer_unordered(workers.max(1));

    while let Some((task, result)) = pending.next().await {
        let done = report.stored.len() + report.failures.len() + 1;
        match result {
            Ok(stored) => {
                info!(done, total, file = %stored.file_name, bytes = stored.byte_size, "downloaded");
                report.stored.push(stored);
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(done, total, file = %task.file_name(), %error, "download failed");
                report.failures.push(DownloadFailure { task, error });
            }
        }
    }
    report
}

#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub channel: Channel,
    /// Snapshot of an earlier run; when set only changed notes are downloaded.
    pub latest: Option<PathBuf>,
    pub snapshot_path: PathBuf,
    pub output_dir: PathBuf,
}

impl MirrorRequest {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            latest: None,
            snapshot_path: default_snapshot_path(channel),
            output_dir: PathBuf::from(channel.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channel: String,
    pub fetched_notes: usize,
    pub previous_notes: Option<usize>,
    pub scheduled_downloads: usize,
    pub downloaded: usize,
    pub snapshot_path: String,
    pub failures: Vec<DownloadFailure>,
}

pub async fn run_mirror(
    source: &dyn NoteSource,
    request: &MirrorRequest,
    workers: usize,
) -> Result<MirrorSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("mirror", %run_id, channel = %request.channel);
    mirror_once(source, request, workers, run_id)
        .instrument(span)
        .await
}

async fn mirror_once(
    source: &dyn NoteSource,
    request: &MirrorRequest,
    workers: usize,
    run_id: Uuid,
) -> Result<MirrorSummary> {
    let started_at = Utc::now();
    let invitation = request.channel.invitation();
    let notes = source
        .list_notes(&invitation)
        .await
        .with_context(|| format!("listing notes for {invitation}"))?;
    info!(notes = notes.len(), %invitation, "fetched notes");

    // The previous snapshot may live at the path about to be overwritten.
    let previous = match &request.latest {
        Some(latest) => {
            let index = load_index(latest.clone()).await?;
            info!(notes = index.len(), path = %latest.display(), "previous snapshot loaded");
            Some(index)
        }
        None => None,
    };

    let notes = save_snapshot(request.snapshot_path.clone(), notes).await?;
    info!(path = %request.snapshot_path.display(), "saved notes");

    if previous.is_none() {
        fs::create_dir(&request.output_dir)
            .await
            .with_context(|| format!("creating {}", request.output_dir.display()))?;
        info!(dir = %request.output_dir.display(), "created output directory");
    }

    let tasks = plan_downloads(&notes, previous.as_ref(), &request.output_dir);
    let scheduled_downloads = tasks.len();
    info!(scheduled_downloads, "items to newly download");

    let report = if tasks.is_empty() {
        DownloadReport::default()
    } else {
        run_downloads(source, tasks, workers).await
    };
    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "some downloads failed");
    }

    Ok(MirrorSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        channel: request.channel.to_string(),
        fetched_notes: notes.len(),
        previous_notes: previous.as_ref().map(SnapshotIndex::len),
        scheduled_downloads,
        downloaded: report.stored.len(),
        snapshot_path: request.snapshot_path.display().to_string(),
        failures: report.failures,
    })
}

async fn load_index(path: PathBuf) -> Result<SnapshotIndex> {
    task::spawn_blocking(move || SnapshotIndex::load(&path))
        .await
        .context("snapshot reader task")?
}

async fn save_snapshot(path: PathBuf, notes: Vec<Note>) -> Result<Vec<Note>> {
    task::spawn_blocking(move || -> Result<Vec<Note>> {
        write_snapshot(&path, &notes)
            .with_context(|| format!("saving snapshot {}", path.display()))?;
        Ok(notes)
    })
    .await
    .context("snapshot writer task")?
}

/// Log in with the environment's mirror settings and run one mirror pass.
pub async fn run_mirror_from_env(
    username: &str,
    password: &str,
    request: &MirrorRequest,
) -> Result<MirrorSummary> {
    let config = MirrorConfig::from_env();
    let client = config.connect(username, password).await?;
    run_mirror(&client, request, config.download_workers).await
}
