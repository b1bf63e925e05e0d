//! In-process cache of archive content trees.
//!
//! Bounded by entry count and idle time. Every invalidation bumps a
//! generation counter; a tree computed under an older generation is not
//! inserted, so a listing that raced a delete never repopulates the cache.

use crate::models::entry::ArchiveEntryNode;
use mini_moka::sync::{Cache, ConcurrentCacheExt};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: u64 = 256;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
#[error("contents cache lock poisoned")]
pub struct CacheError;

#[derive(Clone)]
struct CachedTree {
    game_id: Option<Uuid>,
    tree: Arc<ArchiveEntryNode>,
}

/// Content trees keyed by archive id, remembering the owning game so a whole
/// game's entries can be dropped at once.
#[derive(Clone)]
pub struct ContentsCache {
    entries: Cache<Uuid, CachedTree>,
    generation: Arc<Mutex<u64>>,
}

impl Default for ContentsCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ContentsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(IDLE_TIMEOUT)
                .build(),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    pub fn get(&self, archive_id: Uuid) -> Option<Arc<ArchiveEntryNode>> {
        self.entries.get(&archive_id).map(|cached| cached.tree)
    }

    /// Current invalidation generation. Read it before loading the archive
    /// row and pass it to `insert_if_current`.
    pub fn generation(&self) -> u64 {
        self.generation.lock().map(|g| *g).unwrap_or(u64::MAX)
    }

    /// Insert unless an invalidation happened since `generation` was read.
    /// Returns whether the tree was cached.
    pub fn insert_if_current(
        &self,
        generation: u64,
        archive_id: Uuid,
        game_id: Option<Uuid>,
        tree: Arc<ArchiveEntryNode>,
    ) -> bool {
        let Ok(current) = self.generation.lock() else {
            return false;
        };
        if *current != generation {
            return false;
        }
        self.entries.insert(archive_id, CachedTree { game_id, tree });
        true
    }

    /// Drop cached trees for the given archives and for every archive of the
    /// given games.
    pub fn invalidate(&self, archive_ids: &[Uuid], game_ids: &[Uuid]) -> Result<usize, CacheError> {
        let mut generation = self.generation.lock().map_err(|_| CacheError)?;
        *generation = generation.wrapping_add(1);

        let doomed: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| {
                archive_ids.contains(entry.key())
                    || entry.value().game_id.is_some_and(|game| game_ids.contains(&game))
            })
            .map(|entry| *entry.key())
            .collect();
        for archive_id in &doomed {
            self.entries.invalidate(archive_id);
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.entries.sync();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
