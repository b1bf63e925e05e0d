//! Keeps archive files and archive rows from diverging on deletion.
//!
//! A save runs in two phases around the database transaction:
//!
//! 1. `saving_changes` (inside the transaction, before commit) cascades game
//!    and redistributable deletions to their archives and resolves the
//!    physical location of every archive about to disappear.
//! 2. `saved_changes` (after a successful commit) removes those files.
//!
//! If the transaction never commits, the reconciler is dropped and nothing on
//! disk is touched.

use crate::services::{
    archive_store::{fetch_archive_on, resolve_archive},
    backend::{PhysicalLocation, StorageLocations},
    contents_cache::ContentsCache,
    key_allocator::ObjectKey,
};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedEntity {
    Game(Uuid),
    Redistributable(Uuid),
    Archive(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Unchanged,
    Deleted,
}

/// Entities touched by one save operation and the state each is in.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: Vec<(TrackedEntity, EntityState)>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, entity: TrackedEntity, state: EntityState) {
        match self.entries.iter_mut().find(|(e, _)| *e == entity) {
            Some(entry) => entry.1 = state,
            None => self.entries.push((entity, state)),
        }
    }

    pub fn delete(&mut self, entity: TrackedEntity) {
        self.track(entity, EntityState::Deleted);
    }

    pub fn state(&self, entity: TrackedEntity) -> Option<EntityState> {
        self.entries
            .iter()
            .find(|(e, _)| *e == entity)
            .map(|(_, state)| *state)
    }

    fn deleted(&self) -> impl Iterator<Item = TrackedEntity> + '_ {
        self.entries
            .iter()
            .filter(|(_, state)| *state == EntityState::Deleted)
            .map(|(entity, _)| *entity)
    }

    pub fn deleted_games(&self) -> Vec<Uuid> {
        self.deleted()
            .filter_map(|e| match e {
                TrackedEntity::Game(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_redistributables(&self) -> Vec<Uuid> {
        self.deleted()
            .filter_map(|e| match e {
                TrackedEntity::Redistributable(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_archives(&self) -> Vec<Uuid> {
        self.deleted()
            .filter_map(|e| match e {
                TrackedEntity::Archive(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted().next().is_none()
    }
}

/// A file to remove once the deleting transaction has committed.
#[derive(Debug, Clone)]
pub struct PendingDeletion {
    pub archive_id: Uuid,
    pub game_id: Option<Uuid>,
    pub storage_location_id: String,
    pub key: ObjectKey,
    pub location: PhysicalLocation,
}

/// Outcome of a committed save.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub rows_deleted: u64,
    pub deleted_files: usize,
    /// Files that were already gone; not an error.
    pub missing_files: usize,
    /// Files left behind because removal failed; logged for a later sweep.
    pub failed_files: usize,
    pub deleted_patches: usize,
    pub cache_entries_invalidated: usize,
}

/// Pre-commit / post-commit hook pair for a single save operation.
pub struct DeletionReconciler {
    locations: Arc<StorageLocations>,
    cache: ContentsCache,
    patch_dir: PathBuf,
    pending: Vec<PendingDeletion>,
    pending_patch_files: Vec<PathBuf>,
    deleted_archives: Vec<Uuid>,
    deleted_games: Vec<Uuid>,
}

impl DeletionReconciler {
    pub fn new(locations: Arc<StorageLocations>, cache: ContentsCache, patch_dir: PathBuf) -> Self {
        Self {
            locations,
            cache,
            patch_dir,
            pending: Vec::new(),
            pending_patch_files: Vec::new(),
            deleted_archives: Vec::new(),
            deleted_games: Vec::new(),
        }
    }

    pub fn pending(&self) -> &[PendingDeletion] {
        &self.pending
    }

    /// Pre-commit hook. Marks the archives of deleted games and
    /// redistributables as deleted, then records where every deleted
    /// archive's bytes live while the rows are still readable.
    pub async fn saving_changes(
        &mut self,
        tracker: &mut ChangeTracker,
        conn: &mut SqliteConnection,
    ) -> Result<(), ReconcileError> {
        for game_id in tracker.deleted_games() {
            let owned: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM archives WHERE game_id = ?")
                .bind(game_id)
                .fetch_all(&mut *conn)
                .await?;
            cascade(tracker, "game", game_id, owned);
            self.deleted_games.push(game_id);
        }

        for redist_id in tracker.deleted_redistributables() {
            let owned: Vec<Uuid> =
                sqlx::query_scalar("SELECT id FROM archives WHERE redistributable_id = ?")
                    .bind(redist_id)
                    .fetch_all(&mut *conn)
                    .await?;
            cascade(tracker, "redistributable", redist_id, owned);
        }

        for archive_id in tracker.deleted_archives() {
            let Some(archive) = fetch_archive_on(&mut *conn, archive_id).await? else {
                debug!("archive {} already gone, nothing to clean up", archive_id);
                continue;
            };
            self.deleted_archives.push(archive_id);

            match resolve_archive(&self.locations, &archive) {
                Ok(resolved) => self.pending.push(PendingDeletion {
                    archive_id,
                    game_id: archive.game_id,
                    storage_location_id: archive.storage_location_id.clone(),
                    key: resolved.key,
                    location: resolved.location,
                }),
                Err(err) => warn!(
                    "archive {} will be deleted but its file cannot be located: {}",
                    archive_id, err
                ),
            }

            let patch_keys: Vec<String> = sqlx::query_scalar(
                "SELECT patch_key FROM archive_patches
                 WHERE original_archive_id = ? OR altered_archive_id = ?",
            )
            .bind(archive_id)
            .bind(archive_id)
            .fetch_all(&mut *conn)
            .await?;
            self.pending_patch_files
                .extend(patch_keys.into_iter().map(|key| self.patch_dir.join(key)));
        }

        self.pending_patch_files.sort();
        self.pending_patch_files.dedup();
        debug!(
            "{} archive files and {} patches pending deletion",
            self.pending.len(),
            self.pending_patch_files.len()
        );
        Ok(())
    }

    /// Post-commit hook. Consumes the reconciler so each pending file is
    /// handled exactly once. Never fails: the committed rows are
    /// authoritative and leftovers are only logged.
    pub async fn saved_changes(self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for pending in &self.pending {
            let Some(backend) = self.locations.get(&pending.storage_location_id) else {
                report.failed_files += 1;
                continue;
            };
            match backend.delete(&pending.key).await {
                Ok(true) => report.deleted_files += 1,
                Ok(false) => {
                    debug!(
                        "file for archive {} already absent at {}",
                        pending.archive_id, pending.location
                    );
                    report.missing_files += 1;
                }
                Err(err) => {
                    warn!(
                        "orphaned file for deleted archive {} at {}: {}",
                        pending.archive_id, pending.location, err
                    );
                    report.failed_files += 1;
                }
            }
        }

        for path in &self.pending_patch_files {
            match fs::remove_file(path).await {
                Ok(()) => report.deleted_patches += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("orphaned patch {}: {}", path.display(), err),
            }
        }

        let mut game_ids = self.deleted_games.clone();
        game_ids.extend(self.pending.iter().filter_map(|p| p.game_id));
        match self.cache.invalidate(&self.deleted_archives, &game_ids) {
            Ok(count) => report.cache_entries_invalidated = count,
            Err(err) => warn!("failed to invalidate contents cache: {}", err),
        }

        info!(
            "deletion cleanup: {} removed, {} already missing, {} failed, {} patches",
            report.deleted_files, report.missing_files, report.failed_files, report.deleted_patches
        );
        report
    }
}

fn cascade(tracker: &mut ChangeTracker, owner: &str, owner_id: Uuid, archives: Vec<Uuid>) {
    for archive_id in archives {
        let entity = TrackedEntity::Archive(archive_id);
        if tracker.state(entity) != Some(EntityState::Deleted) {
            debug!("cascading {} {} deletion to archive {}", owner, owner_id, archive_id);
            tracker.delete(entity);
        }
    }
}

/// Remove every row the tracker marks as deleted, children first.
async fn delete_tracked_rows(
    tracker: &ChangeTracker,
    conn: &mut SqliteConnection,
) -> Result<u64, sqlx::Error> {
    let mut rows = 0;
    let archives = tracker.deleted_archives();

    for id in &archives {
        sqlx::query("DELETE FROM patch_jobs WHERE original_archive_id = ? OR altered_archive_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "DELETE FROM archive_patches WHERE original_archive_id = ? OR altered_archive_id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        sqlx::query("UPDATE archives SET last_version_id = NULL WHERE last_version_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    for id in &archives {
        rows += sqlx::query("DELETE FROM archives WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    for id in tracker.deleted_games() {
        rows += sqlx::query("DELETE FROM games WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    for id in tracker.deleted_redistributables() {
        rows += sqlx::query("DELETE FROM redistributables WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(rows)
}

/// Shared dependencies for starting save operations.
#[derive(Clone)]
pub struct SaveContext {
    db: Arc<SqlitePool>,
    locations: Arc<StorageLocations>,
    cache: ContentsCache,
    patch_dir: PathBuf,
}

impl SaveContext {
    pub fn new(
        db: Arc<SqlitePool>,
        locations: Arc<StorageLocations>,
        cache: ContentsCache,
        patch_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            locations,
            cache,
            patch_dir,
        }
    }

    /// Start a save operation with its own tracker and reconciler.
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork {
            context: self.clone(),
            tracker: ChangeTracker::new(),
        }
    }

    pub fn reconciler(&self) -> DeletionReconciler {
        DeletionReconciler::new(
            self.locations.clone(),
            self.cache.clone(),
            self.patch_dir.clone(),
        )
    }
}

/// One logical save: tracked deletions applied in a single transaction.
pub struct UnitOfWork {
    context: SaveContext,
    tracker: ChangeTracker,
}

impl UnitOfWork {
    pub fn delete_game(&mut self, id: Uuid) -> &mut Self {
        self.tracker.delete(TrackedEntity::Game(id));
        self
    }

    pub fn delete_redistributable(&mut self, id: Uuid) -> &mut Self {
        self.tracker.delete(TrackedEntity::Redistributable(id));
        self
    }

    pub fn delete_archive(&mut self, id: Uuid) -> &mut Self {
        self.tracker.delete(TrackedEntity::Archive(id));
        self
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Commit the tracked deletions, then clean up their files.
    pub async fn save(mut self) -> Result<CleanupReport, ReconcileError> {
        let mut reconciler = self.context.reconciler();
        let mut tx = self.context.db.begin().await?;

        reconciler.saving_changes(&mut self.tracker, &mut tx).await?;
        let rows_deleted = delete_tracked_rows(&self.tracker, &mut tx).await?;
        tx.commit().await?;

        let mut report = reconciler.saved_changes().await;
        report.rows_deleted = rows_deleted;
        Ok(report)
    }
}
