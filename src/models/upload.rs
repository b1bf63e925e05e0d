//! Wire and status types for chunked upload sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returned after every accepted chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkAck {
    pub key: String,
    /// True once the received ranges cover `[0, total)`.
    pub complete: bool,
    /// Distinct bytes received so far.
    pub received_bytes: u64,
    /// End of the contiguous range starting at byte 0.
    pub high_water_mark: u64,
}

/// Point-in-time view of an upload session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionStatus {
    pub key: String,
    pub storage_location_id: String,
    pub total_size: Option<u64>,
    pub received_bytes: u64,
    pub high_water_mark: u64,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Upload lifecycle notifications published on the assembler's channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    Started { key: String, storage_location_id: String },
    ChunkWritten { key: String, start: u64, end: u64 },
    Completed { key: String, total_size: u64 },
    Promoted { key: String, storage_location_id: String },
    Cancelled { key: String },
    Expired { key: String },
}
