//! Background generation of binary patches between archive versions.
//!
//! Jobs are persisted in `patch_jobs` before they are handed to a worker, so
//! a crash mid-job leaves a `queued` or `running` row that `recover` puts
//! back on the queue. Generating a patch twice overwrites the first result.
//!
//! Both archives are held in memory while diffing. Archives larger than the
//! configured limit fail the job with `TooLarge` instead of being read.

use crate::{
    models::patch::{
        PatchArtifact, PatchEvent, PatchJob, STATUS_COMPLETED, STATUS_FAILED, STATUS_QUEUED,
        STATUS_RUNNING,
    },
    services::{
        archive_store::{ArchiveStore, StoreError},
        delta::{self, DeltaError},
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs,
    io::AsyncReadExt,
    sync::{Mutex, broadcast, mpsc},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const JOB_COLUMNS: &str =
    "id, original_archive_id, altered_archive_id, status, attempts, error, created_at, updated_at";
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("no patch from `{0}` to `{1}`")]
    PatchNotFound(Uuid, Uuid),
    #[error("an archive cannot be patched against itself")]
    SameArchive,
    #[error("archive `{0}` or `{1}` was deleted while its patch was generated")]
    SourceDeleted(Uuid, Uuid),
    #[error("archive `{archive_id}` is {size} bytes, above the {limit} byte patch limit")]
    TooLarge { archive_id: Uuid, size: u64, limit: u64 },
    #[error("patch queue is shut down")]
    QueueClosed,
    #[error("patch job aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Computes and stores deltas between two archives.
#[derive(Clone)]
pub struct ArchivePatcher {
    db: Arc<SqlitePool>,
    store: ArchiveStore,
    patch_dir: PathBuf,
    block_size: usize,
    max_archive_bytes: u64,
}

impl ArchivePatcher {
    pub async fn new(
        db: Arc<SqlitePool>,
        store: ArchiveStore,
        patch_dir: impl Into<PathBuf>,
        block_size: usize,
    ) -> io::Result<Self> {
        let patch_dir = patch_dir.into();
        fs::create_dir_all(&patch_dir).await?;
        Ok(Self {
            db,
            store,
            patch_dir,
            block_size,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
        })
    }

    /// Largest archive, in bytes, that is loaded for diffing.
    pub fn with_max_archive_bytes(mut self, limit: u64) -> Self {
        self.max_archive_bytes = limit;
        self
    }

    /// File name of the delta from `original` to `altered`.
    pub fn patch_key(original: Uuid, altered: Uuid) -> String {
        format!("{}_{}.delta", original.simple(), altered.simple())
    }

    async fn read_archive(&self, archive_id: Uuid) -> PatchResult<Vec<u8>> {
        let limit = self.max_archive_bytes;
        let (archive, file) = self.store.open_archive(archive_id).await?;
        let recorded = archive.size_bytes.max(0) as u64;
        if recorded > limit {
            return Err(PatchError::TooLarge { archive_id, size: recorded, limit });
        }

        // The row may understate the file; never read past the limit.
        let mut bytes = Vec::with_capacity(recorded as usize);
        file.take(limit.saturating_add(1)).read_to_end(&mut bytes).await?;
        if bytes.len() as u64 > limit {
            return Err(PatchError::TooLarge {
                archive_id,
                size: bytes.len() as u64,
                limit,
            });
        }
        Ok(bytes)
    }

    /// Diff two archives and store the result, replacing any earlier patch
    /// for the same pair.
    pub async fn generate_patch(&self, original_id: Uuid, altered_id: Uuid) -> PatchResult<PatchArtifact> {
        if original_id == altered_id {
            return Err(PatchError::SameArchive);
        }
        let original = self.read_archive(original_id).await?;
        let altered = self.read_archive(altered_id).await?;

        let block_size = self.block_size;
        let patch = tokio::task::spawn_blocking(move || delta::diff(&original, &altered, block_size))
            .await
            .map_err(|err| PatchError::Aborted(err.to_string()))?;

        let artifact = self.store_patch(original_id, altered_id, &patch).await?;
        info!(
            "generated patch {} -> {} ({} bytes)",
            original_id, altered_id, artifact.size_bytes
        );
        Ok(artifact)
    }

    /// Write the delta file and record it. The row is only written while
    /// both archives still exist; otherwise the file is removed again.
    async fn store_patch(
        &self,
        original_id: Uuid,
        altered_id: Uuid,
        patch: &[u8],
    ) -> PatchResult<PatchArtifact> {
        let patch_key = Self::patch_key(original_id, altered_id);
        let final_path = self.patch_dir.join(&patch_key);
        let tmp_path = self.patch_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp_path, patch).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let recorded = sqlx::query_as::<_, PatchArtifact>(
            "INSERT INTO archive_patches (
                original_archive_id, altered_archive_id, patch_key, size_bytes, created_at
            )
            SELECT ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM archives WHERE id = ?)
              AND EXISTS (SELECT 1 FROM archives WHERE id = ?)
            ON CONFLICT(original_archive_id, altered_archive_id) DO UPDATE SET
                patch_key = excluded.patch_key,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at
            RETURNING original_archive_id, altered_archive_id, patch_key, size_bytes, created_at",
        )
        .bind(original_id)
        .bind(altered_id)
        .bind(&patch_key)
        .bind(patch.len() as i64)
        .bind(Utc::now())
        .bind(original_id)
        .bind(altered_id)
        .fetch_optional(&*self.db)
        .await;

        match recorded {
            Ok(Some(artifact)) => Ok(artifact),
            Ok(None) => {
                discard_patch_file(&final_path).await;
                Err(PatchError::SourceDeleted(original_id, altered_id))
            }
            Err(err) => {
                discard_patch_file(&final_path).await;
                Err(err.into())
            }
        }
    }

    /// Look up a stored patch and its file path.
    pub async fn fetch_patch(&self, original_id: Uuid, altered_id: Uuid) -> PatchResult<(PatchArtifact, PathBuf)> {
        let artifact = sqlx::query_as::<_, PatchArtifact>(
            "SELECT original_archive_id, altered_archive_id, patch_key, size_bytes, created_at
             FROM archive_patches WHERE original_archive_id = ? AND altered_archive_id = ?",
        )
        .bind(original_id)
        .bind(altered_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(PatchError::PatchNotFound(original_id, altered_id))?;
        let path = self.patch_dir.join(&artifact.patch_key);
        Ok((artifact, path))
    }
}

async fn discard_patch_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("removed unrecorded patch file {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove patch file {}: {}", path.display(), err),
    }
}

struct Shared {
    db: Arc<SqlitePool>,
    patcher: ArchivePatcher,
    events: broadcast::Sender<PatchEvent>,
}

/// Persistent job queue drained by a fixed set of worker tasks.
#[derive(Clone)]
pub struct PatchQueue {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Uuid>,
}

impl PatchQueue {
    /// Spawn `workers` worker tasks on the current runtime.
    pub fn start(db: Arc<SqlitePool>, patcher: ArchivePatcher, workers: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            db,
            patcher,
            events,
        });

        for worker in 0..workers.max(1) {
            let shared = shared.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job_id) = next else { break };
                    shared.run_job(worker, job_id).await;
                }
                debug!("patch worker {} stopped", worker);
            });
        }

        Self { shared, sender }
    }

    pub fn patcher(&self) -> &ArchivePatcher {
        &self.shared.patcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PatchEvent> {
        self.shared.events.subscribe()
    }

    /// Persist a job for the pair and hand it to the workers. Re-enqueuing a
    /// pair resets its job to `queued`.
    pub async fn enqueue(&self, original_id: Uuid, altered_id: Uuid) -> PatchResult<PatchJob> {
        if original_id == altered_id {
            return Err(PatchError::SameArchive);
        }
        let now = Utc::now();
        let job = sqlx::query_as::<_, PatchJob>(&format!(
            "INSERT INTO patch_jobs (
                id, original_archive_id, altered_archive_id, status, attempts, error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT(original_archive_id, altered_archive_id) DO UPDATE SET
                status = excluded.status,
                error = NULL,
                updated_at = excluded.updated_at
            RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(original_id)
        .bind(altered_id)
        .bind(STATUS_QUEUED)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.shared.db)
        .await?;

        self.sender.send(job.id).map_err(|_| PatchError::QueueClosed)?;
        debug!("queued patch job {} ({} -> {})", job.id, original_id, altered_id);
        Ok(job)
    }

    /// Requeue jobs left `queued` or `running` by a previous process.
    pub async fn recover(&self) -> PatchResult<usize> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM patch_jobs WHERE status IN (?, ?) ORDER BY created_at",
        )
        .bind(STATUS_QUEUED)
        .bind(STATUS_RUNNING)
        .fetch_all(&*self.shared.db)
        .await?;
        for id in &ids {
            self.sender.send(*id).map_err(|_| PatchError::QueueClosed)?;
        }
        if !ids.is_empty() {
            info!("requeued {} interrupted patch jobs", ids.len());
        }
        Ok(ids.len())
    }

    pub async fn job(&self, job_id: Uuid) -> PatchResult<Option<PatchJob>> {
        Ok(sqlx::query_as::<_, PatchJob>(&format!(
            "SELECT {} FROM patch_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&*self.shared.db)
        .await?)
    }
}

impl Shared {
    async fn run_job(&self, worker: usize, job_id: Uuid) {
        let claimed = sqlx::query_as::<_, PatchJob>(&format!(
            "UPDATE patch_jobs SET status = ?, attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status IN (?, ?)
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(STATUS_RUNNING)
        .bind(Utc::now())
        .bind(job_id)
        .bind(STATUS_QUEUED)
        .bind(STATUS_RUNNING)
        .fetch_optional(&*self.db)
        .await;

        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("patch job {} no longer pending", job_id);
                return;
            }
            Err(err) => {
                warn!("worker {} could not claim patch job {}: {}", worker, job_id, err);
                return;
            }
        };

        // Each job runs in its own task so a panic only fails this job.
        let patcher = self.patcher.clone();
        let (original, altered) = (job.original_archive_id, job.altered_archive_id);
        let outcome = tokio::spawn(async move { patcher.generate_patch(original, altered).await })
            .await
            .map_err(|err| PatchError::Aborted(err.to_string()))
            .and_then(|result| result);

        match outcome {
            Ok(artifact) => {
                self.finish(job_id, STATUS_COMPLETED, None).await;
                let _ = self.events.send(PatchEvent::Completed { job_id, artifact });
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    "patch job {} ({} -> {}) failed: {}",
                    job_id, original, altered, message
                );
                self.finish(job_id, STATUS_FAILED, Some(&message)).await;
                let _ = self.events.send(PatchEvent::Failed {
                    job_id,
                    original_archive_id: original,
                    altered_archive_id: altered,
                    error: message,
                });
            }
        }
    }

    async fn finish(&self, job_id: Uuid, status: &str, error: Option<&str>) {
        let result = sqlx::query(
            "UPDATE patch_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&*self.db)
        .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => {
                debug!("patch job {} was removed before it finished as {}", job_id, status);
            }
            Ok(_) => {}
            Err(err) => warn!("could not record outcome of patch job {}: {}", job_id, err),
        }
    }
}
