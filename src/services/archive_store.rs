//! Bridges archive records and the bytes behind them.
//!
//! Promotion turns a completed upload session into a permanent object; an
//! archive row is only ever inserted for an object that was promoted in the
//! same call, and the object is removed again if the insert fails.

use crate::{
    models::{
        archive::{ARCHIVE_COLUMNS, Archive},
        entry::ArchiveEntryNode,
    },
    services::{
        archive_tree::{build_tree, list_zip_entries},
        backend::{BackendError, PhysicalLocation, StorageBackend, StorageLocations},
        catalog::Catalog,
        chunk_assembler::{ChunkAssembler, PromotionTicket, UploadError},
        contents_cache::ContentsCache,
        key_allocator::ObjectKey,
    },
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::{
    io::{self, ErrorKind},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::AsyncReadExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("storage location `{0}` is not configured")]
    InvalidStorageLocation(String),
    #[error("archive `{0}` not found")]
    ArchiveNotFound(Uuid),
    #[error("file for archive `{archive_id}` is missing at {location}")]
    FileNotFound {
        archive_id: Uuid,
        location: PhysicalLocation,
    },
    #[error("invalid archive owner: {0}")]
    InvalidOwner(String),
    #[error("archive `{0}` is not a readable zip: {1}")]
    CorruptArchive(Uuid, String),
    #[error("archive `{archive_id}` has malformed object key `{key}`")]
    InvalidObjectKey { archive_id: Uuid, key: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A completed upload moved into its permanent location.
#[derive(Debug, Clone)]
pub struct PromotedObject {
    pub key: ObjectKey,
    pub storage_location_id: String,
    pub location: PhysicalLocation,
    pub size_bytes: u64,
    pub etag: String,
}

/// Request to register an uploaded session as an archive.
#[derive(Debug, Clone, Deserialize)]
pub struct NewArchive {
    pub session_key: String,
    pub game_id: Option<Uuid>,
    pub redistributable_id: Option<Uuid>,
    pub version: String,
    pub last_version_id: Option<Uuid>,
}

/// A resolved archive: the backend holding it, its key, and where it lives.
pub struct ResolvedArchive {
    pub backend: Arc<dyn StorageBackend>,
    pub key: ObjectKey,
    pub location: PhysicalLocation,
}

/// Resolve an archive row against the configured storage locations. Pure
/// lookup; the file may or may not exist.
pub fn resolve_archive(
    locations: &StorageLocations,
    archive: &Archive,
) -> StoreResult<ResolvedArchive> {
    let backend = locations
        .get(&archive.storage_location_id)
        .ok_or_else(|| StoreError::InvalidStorageLocation(archive.storage_location_id.clone()))?;
    let key = ObjectKey::parse(&archive.object_key).ok_or_else(|| StoreError::InvalidObjectKey {
        archive_id: archive.id,
        key: archive.object_key.clone(),
    })?;
    let location = backend.resolve(&key);
    Ok(ResolvedArchive {
        backend,
        key,
        location,
    })
}

/// Load one archive row through any connection, including one inside an
/// open transaction.
pub async fn fetch_archive_on(
    conn: &mut SqliteConnection,
    archive_id: Uuid,
) -> Result<Option<Archive>, sqlx::Error> {
    sqlx::query_as::<_, Archive>(&format!(
        "SELECT {} FROM archives WHERE id = ?",
        ARCHIVE_COLUMNS
    ))
    .bind(archive_id)
    .fetch_optional(conn)
    .await
}

#[derive(Clone)]
pub struct ArchiveStore {
    pub db: Arc<SqlitePool>,
    locations: Arc<StorageLocations>,
    assembler: ChunkAssembler,
    cache: ContentsCache,
    catalog: Catalog,
}

impl ArchiveStore {
    pub fn new(
        db: Arc<SqlitePool>,
        locations: Arc<StorageLocations>,
        assembler: ChunkAssembler,
        cache: ContentsCache,
    ) -> Self {
        let catalog = Catalog::new(db.clone());
        Self {
            db,
            locations,
            assembler,
            cache,
            catalog,
        }
    }

    pub fn cache(&self) -> &ContentsCache {
        &self.cache
    }

    /// Move a completed session's staging file into the permanent store.
    ///
    /// Fails with `IncompleteUpload` before every byte has arrived. Only one
    /// concurrent caller can promote a given session; the others see
    /// `SessionFinalized`.
    pub async fn promote(&self, session_key: &str) -> StoreResult<PromotedObject> {
        let ticket = self.assembler.begin_promotion(session_key).await?;
        match self.promote_ticket(&ticket).await {
            Ok(promoted) => {
                self.assembler.finish_promotion(ticket).await;
                info!(
                    "promoted {} into {} ({} bytes)",
                    promoted.key, promoted.storage_location_id, promoted.size_bytes
                );
                Ok(promoted)
            }
            Err(err) => {
                warn!("promotion of {} failed: {}", ticket.key, err);
                self.assembler.abort_promotion(ticket).await;
                Err(err)
            }
        }
    }

    async fn promote_ticket(&self, ticket: &PromotionTicket) -> StoreResult<PromotedObject> {
        let backend = self
            .locations
            .get(&ticket.storage_location_id)
            .ok_or_else(|| StoreError::InvalidStorageLocation(ticket.storage_location_id.clone()))?;

        let (size_bytes, etag) = hash_staged_file(ticket).await?;
        if size_bytes != ticket.total_size {
            return Err(UploadError::IncompleteUpload {
                key: ticket.key.to_string(),
                received: size_bytes,
                total: Some(ticket.total_size),
            }
            .into());
        }

        let location = backend.promote(&ticket.staging_path, &ticket.key).await?;
        Ok(PromotedObject {
            key: ticket.key.clone(),
            storage_location_id: ticket.storage_location_id.clone(),
            location,
            size_bytes,
            etag,
        })
    }

    /// Promote the session and insert the archive row referencing it.
    pub async fn create_archive(&self, request: NewArchive) -> StoreResult<Archive> {
        match (request.game_id, request.redistributable_id) {
            (Some(game_id), None) => {
                if !self.catalog.game_exists(game_id).await? {
                    return Err(StoreError::InvalidOwner(format!("game `{}` not found", game_id)));
                }
            }
            (None, Some(redist_id)) => {
                if !self.catalog.redistributable_exists(redist_id).await? {
                    return Err(StoreError::InvalidOwner(format!(
                        "redistributable `{}` not found",
                        redist_id
                    )));
                }
            }
            _ => {
                return Err(StoreError::InvalidOwner(
                    "exactly one of game_id or redistributable_id is required".into(),
                ));
            }
        }
        if let Some(last) = request.last_version_id {
            self.fetch_archive(last).await?;
        }

        let promoted = self.promote(&request.session_key).await?;

        let insert_result = sqlx::query_as::<_, Archive>(&format!(
            "INSERT INTO archives (
                id, game_id, redistributable_id, object_key, storage_location_id,
                version, last_version_id, size_bytes, etag, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}",
            ARCHIVE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(request.game_id)
        .bind(request.redistributable_id)
        .bind(promoted.key.as_str())
        .bind(&promoted.storage_location_id)
        .bind(&request.version)
        .bind(request.last_version_id)
        .bind(promoted.size_bytes as i64)
        .bind(&promoted.etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(archive) => {
                info!(
                    "registered archive {} (version {}) as {}",
                    archive.id, archive.version, archive.object_key
                );
                Ok(archive)
            }
            Err(err) => {
                if let Some(backend) = self.locations.get(&promoted.storage_location_id) {
                    if let Err(cleanup) = backend.delete(&promoted.key).await {
                        warn!(
                            "could not remove {} after failed insert: {}",
                            promoted.location, cleanup
                        );
                    }
                }
                Err(StoreError::Sqlx(err))
            }
        }
    }

    pub async fn fetch_archive(&self, archive_id: Uuid) -> StoreResult<Archive> {
        let mut conn = self.db.acquire().await?;
        fetch_archive_on(&mut conn, archive_id)
            .await?
            .ok_or(StoreError::ArchiveNotFound(archive_id))
    }

    /// Resolve an archive to its physical location without touching it.
    pub fn get_location(&self, archive: &Archive) -> StoreResult<PhysicalLocation> {
        Ok(resolve_archive(&self.locations, archive)?.location)
    }

    pub async fn get_archive_file_location(&self, archive_id: Uuid) -> StoreResult<PhysicalLocation> {
        let archive = self.fetch_archive(archive_id).await?;
        self.get_location(&archive)
    }

    /// Resolve a local path for reading, distinguishing a missing row from a
    /// missing file.
    async fn local_path(&self, archive: &Archive) -> StoreResult<std::path::PathBuf> {
        let resolved = resolve_archive(&self.locations, archive)?;
        let Some(path) = resolved.location.as_local().map(|p| p.to_path_buf()) else {
            return Err(StoreError::Backend(BackendError::Unsupported {
                location: archive.storage_location_id.clone(),
                operation: "reading archive contents",
            }));
        };
        if !tokio::fs::try_exists(&path).await? {
            return Err(self.missing_file(archive.id, resolved.location));
        }
        Ok(path)
    }

    fn missing_file(&self, archive_id: Uuid, location: PhysicalLocation) -> StoreError {
        warn!(
            "data integrity: archive {} has a record but no file at {}",
            archive_id, location
        );
        StoreError::FileNotFound {
            archive_id,
            location,
        }
    }

    /// Open an archive's file for streaming out.
    pub async fn open_archive(&self, archive_id: Uuid) -> StoreResult<(Archive, File)> {
        let archive = self.fetch_archive(archive_id).await?;
        let path = self.local_path(&archive).await?;
        match File::open(&path).await {
            Ok(file) => Ok((archive, file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(self.missing_file(archive_id, PhysicalLocation::Local(path)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Directory tree of the entries inside an archive, cached per archive.
    ///
    /// A tree computed while the archive was being deleted is returned but
    /// not cached.
    pub async fn get_contents(&self, archive_id: Uuid) -> StoreResult<Arc<ArchiveEntryNode>> {
        if let Some(tree) = self.cache.get(archive_id) {
            return Ok(tree);
        }

        let generation = self.cache.generation();
        let archive = self.fetch_archive(archive_id).await?;
        let path = self.local_path(&archive).await?;
        let listed = tokio::task::spawn_blocking(move || {
            list_zip_entries(&path).map(|entries| build_tree(&entries))
        })
        .await
        .map_err(|err| StoreError::Io(io::Error::other(err.to_string())))?;
        let tree = match listed {
            Ok(tree) => Arc::new(tree),
            Err(zip::result::ZipError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                let location = self.get_location(&archive)?;
                return Err(self.missing_file(archive_id, location));
            }
            Err(err) => return Err(StoreError::CorruptArchive(archive_id, err.to_string())),
        };

        if !self
            .cache
            .insert_if_current(generation, archive_id, archive.game_id, tree.clone())
        {
            debug!("contents of archive {} changed while listing; not cached", archive_id);
        }
        Ok(tree)
    }
}

/// Sync the staging file and compute its length and hex MD5.
async fn hash_staged_file(ticket: &PromotionTicket) -> StoreResult<(u64, String)> {
    let mut file = File::open(&ticket.staging_path).await?;
    file.sync_all().await?;

    let mut digest = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digest.consume(&buf[..read]);
        size += read as u64;
    }
    Ok((size, format!("{:x}", digest.compute())))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        db::tests::test_pool,
        services::chunk_assembler::{AssemblerConfig, ChunkWrite, tests::test_locations},
    };
    use bytes::Bytes;
    use std::{io::Write, path::Path, time::Duration};
    use zip::write::SimpleFileOptions;

    pub(crate) struct Fixture {
        pub store: ArchiveStore,
        pub assembler: ChunkAssembler,
        pub catalog: Catalog,
        pub db: Arc<SqlitePool>,
        pub locations: Arc<StorageLocations>,
    }

    pub(crate) async fn fixture(root: &Path) -> Fixture {
        let db = Arc::new(test_pool(root).await);
        let locations = test_locations(root).await;
        let assembler = ChunkAssembler::new(
            AssemblerConfig {
                staging_dir: root.join("staging"),
                session_timeout: Duration::from_secs(3600),
            },
            locations.clone(),
        )
        .await
        .unwrap();
        let store = ArchiveStore::new(
            db.clone(),
            locations.clone(),
            assembler.clone(),
            ContentsCache::new(),
        );
        Fixture {
            store,
            assembler,
            catalog: Catalog::new(db.clone()),
            db,
            locations,
        }
    }

    /// Upload `data` in one chunk and return the session key.
    pub(crate) async fn upload(assembler: &ChunkAssembler, data: &[u8]) -> String {
        let key = assembler.init_session("games", None, None).await.unwrap();
        assembler
            .write_chunk(
                key.as_str(),
                ChunkWrite {
                    start: 0,
                    end: data.len() as u64 - 1,
                    total: data.len() as u64,
                    index: Some(0),
                    payload: Bytes::copy_from_slice(data),
                    checksum: None,
                },
            )
            .await
            .unwrap();
        key.to_string()
    }

    pub(crate) async fn archive_for(fx: &Fixture, game_id: Uuid, data: &[u8]) -> Archive {
        let session_key = upload(&fx.assembler, data).await;
        fx.store
            .create_archive(NewArchive {
                session_key,
                game_id: Some(game_id),
                redistributable_id: None,
                version: "1.0".into(),
                last_version_id: None,
            })
            .await
            .unwrap()
    }

    pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Deterministic content for chunk `index` of a large virtual file.
    fn virtual_chunk(index: u64, len: usize) -> Vec<u8> {
        let mut state = index.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn large_out_of_order_upload_promotes_byte_for_byte() {
        const CHUNK: usize = 50 * 1024 * 1024;
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let total = (CHUNK * 3) as u64;
        let key = fx.assembler.init_session("games", None, Some(total)).await.unwrap();

        let mut expected = md5::Context::new();
        for index in 0..3u64 {
            expected.consume(virtual_chunk(index, CHUNK));
        }
        let expected = format!("{:x}", expected.compute());

        for (n, index) in [2u64, 0, 1].into_iter().enumerate() {
            let start = index * CHUNK as u64;
            let ack = fx
                .assembler
                .write_chunk(
                    key.as_str(),
                    ChunkWrite {
                        start,
                        end: start + CHUNK as u64 - 1,
                        total,
                        index: Some(index),
                        payload: Bytes::from(virtual_chunk(index, CHUNK)),
                        checksum: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(ack.complete, n == 2, "after chunk {}", index);
            if n < 2 {
                assert!(matches!(
                    fx.store.promote(key.as_str()).await,
                    Err(StoreError::Upload(UploadError::IncompleteUpload { .. }))
                ));
            }
        }

        let promoted = fx.store.promote(key.as_str()).await.unwrap();
        assert_eq!(promoted.size_bytes, total);
        assert_eq!(promoted.etag, expected);
        let path = promoted.location.as_local().unwrap();
        assert_eq!(tokio::fs::metadata(path).await.unwrap().len(), total);
        assert!(!fx.assembler.staging_dir().join(format!("{}.part", key)).exists());
    }

    #[tokio::test]
    async fn location_is_unresolvable_until_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let session_key = upload(&fx.assembler, b"complete bytes").await;
        let key = ObjectKey::parse(&session_key).unwrap();
        let backend = fx.locations.get("games").unwrap();

        assert!(!backend.exists(&key).await.unwrap());
        let promoted = fx.store.promote(&session_key).await.unwrap();
        assert!(backend.exists(&key).await.unwrap());
        assert_eq!(
            tokio::fs::read(promoted.location.as_local().unwrap())
                .await
                .unwrap(),
            b"complete bytes"
        );
        assert!(matches!(
            fx.store.promote(&session_key).await,
            Err(StoreError::Upload(UploadError::SessionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn concurrent_promotions_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let session_key = upload(&fx.assembler, &[9u8; 4096]).await;

        let (a, b) = tokio::join!(fx.store.promote(&session_key), fx.store.promote(&session_key));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn create_archive_requires_single_existing_owner() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let session_key = upload(&fx.assembler, b"abc").await;

        let err = fx
            .store
            .create_archive(NewArchive {
                session_key: session_key.clone(),
                game_id: None,
                redistributable_id: None,
                version: "1".into(),
                last_version_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOwner(_)));

        let err = fx
            .store
            .create_archive(NewArchive {
                session_key: session_key.clone(),
                game_id: Some(Uuid::new_v4()),
                redistributable_id: None,
                version: "1".into(),
                last_version_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOwner(_)));

        // The session survives failed validation.
        assert!(fx.assembler.is_complete(&session_key).await.unwrap());

        let redist = fx.catalog.create_redistributable("vcredist").await.unwrap();
        let archive = fx
            .store
            .create_archive(NewArchive {
                session_key,
                game_id: None,
                redistributable_id: Some(redist.id),
                version: "2015".into(),
                last_version_id: None,
            })
            .await
            .unwrap();
        assert_eq!(archive.size_bytes, 3);
        assert_eq!(archive.etag.as_deref(), Some(format!("{:x}", md5::compute(b"abc")).as_str()));
    }

    #[tokio::test]
    async fn missing_file_is_reported_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let game = fx.catalog.create_game("Quake").await.unwrap();
        let archive = archive_for(&fx, game.id, b"bytes").await;

        let location = fx.store.get_archive_file_location(archive.id).await.unwrap();
        tokio::fs::remove_file(location.as_local().unwrap()).await.unwrap();

        assert!(matches!(
            fx.store.open_archive(archive.id).await,
            Err(StoreError::FileNotFound { .. })
        ));
        assert!(matches!(
            fx.store.open_archive(Uuid::new_v4()).await,
            Err(StoreError::ArchiveNotFound(_))
        ));
    }

    #[tokio::test]
    async fn contents_are_listed_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let game = fx.catalog.create_game("Doom").await.unwrap();
        let data = zip_bytes(&[("base/pak0.pk3", b"pak"), ("doom.exe", b"MZ")]);
        let archive = archive_for(&fx, game.id, &data).await;

        let tree = fx.store.get_contents(archive.id).await.unwrap();
        assert_eq!(tree.find("/base/pak0.pk3").unwrap().size, 3);
        assert!(tree.find("/base/").unwrap().is_directory);
        assert_eq!(fx.store.cache().len(), 1);

        let again = fx.store.get_contents(archive.id).await.unwrap();
        assert!(Arc::ptr_eq(&tree, &again));
    }

    #[tokio::test]
    async fn non_zip_archive_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let game = fx.catalog.create_game("Hexen").await.unwrap();
        let archive = archive_for(&fx, game.id, b"definitely not a zip").await;
        assert!(matches!(
            fx.store.get_contents(archive.id).await,
            Err(StoreError::CorruptArchive(..))
        ));
    }
}
