//! Server-side key generation for upload sessions and stored objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Opaque identifier of an upload session and, once promoted, of the stored
/// object. Always the simple (unhyphenated, lowercase) form of a UUID, so a
/// parsed key is safe to use as a file name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Parse a client-supplied key. Returns `None` for anything the allocator
    /// could not have produced.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != 32 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Uuid::try_parse(trimmed)
            .ok()
            .map(|uuid| Self(uuid.simple().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self.0)
    }
}

/// Issues keys for new upload sessions.
#[derive(Clone, Debug, Default)]
pub struct ObjectKeyAllocator;

impl ObjectKeyAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Allocate a fresh key. Keys are globally unique, so the location only
    /// shows up in logs.
    pub fn allocate(&self, storage_location_id: &str) -> ObjectKey {
        let key = ObjectKey(Uuid::new_v4().simple().to_string());
        debug!("allocated key {} for location {}", key, storage_location_id);
        key
    }
}
