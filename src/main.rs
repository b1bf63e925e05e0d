use anyhow::Result;
use archive_vault::{
    config::AppConfig,
    db,
    models::{patch::PatchEvent, upload::UploadEvent},
    routes,
    services::{chunk_assembler::ChunkAssembler, patcher::PatchQueue},
    state::AppState,
};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting archive-vault with config: {:?}", cfg);

    // --- Ensure the SQLite file's directory exists ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Schema is idempotent; `--migrate` stops after applying it ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize services ---
    let state = AppState::from_config(db.clone(), &cfg).await?;
    state.patches.recover().await?;
    spawn_session_sweeper(
        state.assembler.clone(),
        Duration::from_secs(cfg.sweep_interval_secs.max(1)),
    );
    spawn_event_log(&state.assembler, &state.patches);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically discard idle upload sessions and their staging files.
fn spawn_session_sweeper(assembler: ChunkAssembler, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = assembler.sweep_expired().await;
            if removed > 0 {
                tracing::info!("Swept {} expired upload sessions", removed);
            }
        }
    });
}

/// Mirror upload and patch lifecycle events into the debug log.
fn spawn_event_log(assembler: &ChunkAssembler, patches: &PatchQueue) {
    let mut uploads = assembler.subscribe();
    tokio::spawn(async move {
        loop {
            match uploads.recv().await {
                Ok(UploadEvent::ChunkWritten { key, start, end }) => {
                    tracing::trace!("upload {} wrote {}-{}", key, start, end)
                }
                Ok(event) => tracing::debug!("upload event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("upload event log skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut patch_events = patches.subscribe();
    tokio::spawn(async move {
        loop {
            match patch_events.recv().await {
                Ok(PatchEvent::Completed { job_id, artifact }) => tracing::debug!(
                    "patch job {} completed ({} bytes)",
                    job_id,
                    artifact.size_bytes
                ),
                Ok(PatchEvent::Failed { job_id, error, .. }) => {
                    tracing::debug!("patch job {} failed: {}", job_id, error)
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("patch event log skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
