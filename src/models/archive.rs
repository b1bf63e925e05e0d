//! Catalog records referenced by the storage core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A game owning zero or more archives.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Game {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A redistributable package (runtimes, installers) owning archives.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Redistributable {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A stored archive file belonging to exactly one game or redistributable.
///
/// The row stores where the bytes live, not the bytes themselves: the
/// `object_key` is resolved inside `storage_location_id` by the storage
/// backend registered for that location.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Archive {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owning game, mutually exclusive with `redistributable_id`.
    pub game_id: Option<Uuid>,

    /// Owning redistributable, mutually exclusive with `game_id`.
    pub redistributable_id: Option<Uuid>,

    /// Key allocated for the upload session this archive was promoted from.
    pub object_key: String,

    /// Storage location the object key is scoped within.
    pub storage_location_id: String,

    /// Free-form version label.
    pub version: String,

    /// Previous archive this one supersedes; patches are generated against it.
    pub last_version_id: Option<Uuid>,

    /// Size of the promoted file in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the promoted bytes.
    pub etag: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Columns selected whenever an `Archive` is loaded.
pub const ARCHIVE_COLUMNS: &str = "id, game_id, redistributable_id, object_key, storage_location_id, \
     version, last_version_id, size_bytes, etag, created_at";
