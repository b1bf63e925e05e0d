//! HTTP handlers for chunked uploads.
//! A session is opened with `init`, fed with multipart chunks in any order,
//! and later consumed by archive creation.

use crate::{
    errors::AppError,
    models::upload::{ChunkAck, SessionStatus},
    services::chunk_assembler::ChunkWrite,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub storage_location_id: String,
    /// Resume an existing session instead of opening a new one.
    pub key: Option<String>,
    pub total_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResp {
    pub key: String,
}

/// POST `/upload/init`
pub async fn init_upload(
    State(state): State<AppState>,
    Json(req): Json<InitUploadReq>,
) -> Result<Json<InitUploadResp>, AppError> {
    let key = state
        .assembler
        .init_session(&req.storage_location_id, req.key.as_deref(), req.total_size)
        .await?;
    Ok(Json(InitUploadResp {
        key: key.to_string(),
    }))
}

#[derive(Default)]
struct ChunkForm {
    key: Option<String>,
    start: Option<u64>,
    end: Option<u64>,
    total: Option<u64>,
    index: Option<u64>,
    checksum: Option<String>,
    file: Option<Bytes>,
}

fn parse_number(name: &str, value: &str) -> Result<u64, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("field `{}` must be an unsigned integer", name)))
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::bad_request(format!("missing field `{}`", name)))
}

/// POST `/upload/chunk`: multipart with `file`, `start`, `end` (inclusive),
/// `key`, `total`, and optional `index` and `checksum` fields.
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkAck>, AppError> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => form.file = Some(field.bytes().await?),
            "key" => form.key = Some(field.text().await?),
            "start" => form.start = Some(parse_number("start", &field.text().await?)?),
            "end" => form.end = Some(parse_number("end", &field.text().await?)?),
            "total" => form.total = Some(parse_number("total", &field.text().await?)?),
            "index" => form.index = Some(parse_number("index", &field.text().await?)?),
            "checksum" => {
                let value = field.text().await?;
                form.checksum = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            other => tracing::debug!("ignoring unknown chunk field `{}`", other),
        }
    }

    let key = required(form.key, "key")?;
    let chunk = ChunkWrite {
        start: required(form.start, "start")?,
        end: required(form.end, "end")?,
        total: required(form.total, "total")?,
        index: form.index,
        payload: required(form.file, "file")?,
        checksum: form.checksum,
    };

    let ack = state.assembler.write_chunk(key.trim(), chunk).await?;
    Ok(Json(ack))
}

/// GET `/upload/{key}`
pub async fn upload_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(state.assembler.status(&key).await?))
}

/// DELETE `/upload/{key}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    state.assembler.cancel(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
