//! Patch job bookkeeping and generated patch artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// A persisted request to diff two archives.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PatchJob {
    pub id: Uuid,
    pub original_archive_id: Uuid,
    pub altered_archive_id: Uuid,
    /// One of `queued`, `running`, `completed`, `failed`.
    pub status: String,
    pub attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A generated delta turning the original archive into the altered one.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PatchArtifact {
    pub original_archive_id: Uuid,
    pub altered_archive_id: Uuid,
    /// File name of the delta inside the patch directory.
    pub patch_key: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Patch worker notifications.
#[derive(Clone, Debug)]
pub enum PatchEvent {
    Completed {
        job_id: Uuid,
        artifact: PatchArtifact,
    },
    Failed {
        job_id: Uuid,
        original_archive_id: Uuid,
        altered_archive_id: Uuid,
        error: String,
    },
}
