//! HTTP handlers for games, redistributables, archives and patches.
//! File bodies are streamed to avoid buffering whole archives in memory.

use crate::{
    errors::AppError,
    models::{
        archive::{Archive, Game, Redistributable},
        entry::ArchiveEntryNode,
        patch::PatchJob,
    },
    services::{archive_store::NewArchive, reconciler::CleanupReport},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use std::io::ErrorKind;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateNamedReq {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePatchReq {
    pub original_archive_id: Uuid,
}

fn require_name(req: &CreateNamedReq) -> Result<&str, AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    Ok(name)
}

/// POST `/games`
pub async fn create_game(
    State(state): State<AppState>,
    Json(req): Json<CreateNamedReq>,
) -> Result<(StatusCode, Json<Game>), AppError> {
    let game = state.catalog.create_game(require_name(&req)?).await?;
    Ok((StatusCode::CREATED, Json(game)))
}

/// POST `/redistributables`
pub async fn create_redistributable(
    State(state): State<AppState>,
    Json(req): Json<CreateNamedReq>,
) -> Result<(StatusCode, Json<Redistributable>), AppError> {
    let redist = state
        .catalog
        .create_redistributable(require_name(&req)?)
        .await?;
    Ok((StatusCode::CREATED, Json(redist)))
}

/// GET `/games/{id}/archives`
pub async fn list_game_archives(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> Result<Json<Vec<Archive>>, AppError> {
    if !state.catalog.game_exists(game_id).await? {
        return Err(AppError::not_found(format!("game `{}` not found", game_id)));
    }
    Ok(Json(state.catalog.archives_for_game(game_id).await?))
}

/// POST `/archives`: promote a finished upload session and register it.
/// When the archive names a previous version, a patch job is queued.
pub async fn create_archive(
    State(state): State<AppState>,
    Json(req): Json<NewArchive>,
) -> Result<(StatusCode, Json<Archive>), AppError> {
    let archive = state.store.create_archive(req).await?;

    if let Some(previous) = archive.last_version_id {
        if let Err(err) = state.patches.enqueue(previous, archive.id).await {
            tracing::warn!(
                "could not queue patch {} -> {}: {}",
                previous,
                archive.id,
                err
            );
        }
    }

    Ok((StatusCode::CREATED, Json(archive)))
}

/// GET `/archives/{id}`
pub async fn get_archive(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
) -> Result<Json<Archive>, AppError> {
    Ok(Json(state.store.fetch_archive(archive_id).await?))
}

/// GET `/archives/{id}/download`
pub async fn download_archive(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (archive, file) = state.store.open_archive(archive_id).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_archive_headers(response.headers_mut(), &archive);
    Ok(response)
}

fn set_archive_headers(headers: &mut HeaderMap, archive: &Archive) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(archive.size_bytes.max(0) as u64));
    if let Some(etag) = archive.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}.zip\"", archive.id))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// GET `/archives/{id}/contents`
pub async fn archive_contents(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
) -> Result<Json<ArchiveEntryNode>, AppError> {
    let tree = state.store.get_contents(archive_id).await?;
    Ok(Json(ArchiveEntryNode::clone(&tree)))
}

/// DELETE `/archives/{id}`
pub async fn delete_archive(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
) -> Result<Json<CleanupReport>, AppError> {
    state.store.fetch_archive(archive_id).await?;
    let mut uow = state.saves.unit_of_work();
    uow.delete_archive(archive_id);
    Ok(Json(uow.save().await?))
}

/// DELETE `/games/{id}`: removes the game and every archive it owns.
pub async fn delete_game(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> Result<Json<CleanupReport>, AppError> {
    if !state.catalog.game_exists(game_id).await? {
        return Err(AppError::not_found(format!("game `{}` not found", game_id)));
    }
    let mut uow = state.saves.unit_of_work();
    uow.delete_game(game_id);
    Ok(Json(uow.save().await?))
}

/// DELETE `/redistributables/{id}`
pub async fn delete_redistributable(
    State(state): State<AppState>,
    Path(redist_id): Path<Uuid>,
) -> Result<Json<CleanupReport>, AppError> {
    if !state.catalog.redistributable_exists(redist_id).await? {
        return Err(AppError::not_found(format!(
            "redistributable `{}` not found",
            redist_id
        )));
    }
    let mut uow = state.saves.unit_of_work();
    uow.delete_redistributable(redist_id);
    Ok(Json(uow.save().await?))
}

/// POST `/archives/{id}/patches`: queue a patch from another archive to
/// this one. Returns immediately with the persisted job.
pub async fn request_patch(
    State(state): State<AppState>,
    Path(altered_id): Path<Uuid>,
    Json(req): Json<CreatePatchReq>,
) -> Result<(StatusCode, Json<PatchJob>), AppError> {
    state.store.fetch_archive(req.original_archive_id).await?;
    state.store.fetch_archive(altered_id).await?;
    let job = state
        .patches
        .enqueue(req.original_archive_id, altered_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET `/patches/{original}/{altered}`
pub async fn download_patch(
    State(state): State<AppState>,
    Path((original_id, altered_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let (artifact, path) = state
        .patches
        .patcher()
        .fetch_patch(original_id, altered_id)
        .await?;
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(
                "data integrity: patch {} -> {} has a record but no file at {}",
                original_id,
                altered_id,
                path.display()
            );
            return Err(AppError::not_found(format!(
                "patch file for `{}` -> `{}` is missing",
                original_id, altered_id
            )));
        }
        Err(err) => return Err(AppError::internal(err.to_string())),
    };

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(artifact.size_bytes.max(0) as u64),
    );
    Ok(response)
}
