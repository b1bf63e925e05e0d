//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        archive_store::ArchiveStore,
        backend::StorageLocations,
        catalog::Catalog,
        chunk_assembler::{AssemblerConfig, ChunkAssembler},
        contents_cache::ContentsCache,
        patcher::{ArchivePatcher, PatchQueue},
        reconciler::SaveContext,
    },
};
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub assembler: ChunkAssembler,
    pub store: ArchiveStore,
    pub catalog: Catalog,
    pub saves: SaveContext,
    pub patches: PatchQueue,
}

impl AppState {
    /// Wire every service from configuration. Must run inside a Tokio
    /// runtime, since patch workers are spawned here.
    pub async fn from_config(db: Arc<SqlitePool>, cfg: &AppConfig) -> Result<Self> {
        let locations = Arc::new(
            StorageLocations::from_specs(&cfg.locations)
                .await
                .context("initializing storage locations")?,
        );
        tracing::info!("storage locations: {:?}", locations.ids());
        let assembler = ChunkAssembler::new(
            AssemblerConfig {
                staging_dir: PathBuf::from(&cfg.staging_dir),
                session_timeout: Duration::from_secs(cfg.session_timeout_secs),
            },
            locations.clone(),
        )
        .await
        .context("initializing staging directory")?;

        let cache = ContentsCache::with_capacity(cfg.contents_cache_capacity);
        let store = ArchiveStore::new(db.clone(), locations.clone(), assembler.clone(), cache.clone());
        let saves = SaveContext::new(
            db.clone(),
            locations,
            cache,
            PathBuf::from(&cfg.patch_dir),
        );
        let patcher = ArchivePatcher::new(db.clone(), store.clone(), &cfg.patch_dir, cfg.patch_block_size)
            .await
            .context("initializing patch directory")?
            .with_max_archive_bytes(cfg.patch_max_archive_bytes);
        let patches = PatchQueue::start(db.clone(), patcher, cfg.patch_workers);

        Ok(Self {
            catalog: Catalog::new(db.clone()),
            db,
            assembler,
            store,
            saves,
            patches,
        })
    }
}
