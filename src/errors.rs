use crate::services::{
    archive_store::StoreError, backend::BackendError, chunk_assembler::UploadError,
    patcher::PatchError, reconciler::ReconcileError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error; the cause is logged here.
    pub fn internal(msg: impl Into<String>) -> Self {
        let message = msg.into();
        tracing::error!("internal error: {}", message);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::InvalidStorageLocation(_)
            | UploadError::InvalidRange { .. }
            | UploadError::ChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionExpired(_) => StatusCode::GONE,
            UploadError::SessionFinalized(_) | UploadError::IncompleteUpload { .. } => {
                StatusCode::CONFLICT
            }
            UploadError::Io(_) => return AppError::internal(err.to_string()),
        };
        AppError::new(status, err.to_string())
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unsupported { .. } => {
                AppError::new(StatusCode::NOT_IMPLEMENTED, err.to_string())
            }
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Upload(inner) => inner.into(),
            StoreError::Backend(inner) => inner.into(),
            StoreError::InvalidStorageLocation(_) | StoreError::InvalidOwner(_) => {
                AppError::bad_request(err.to_string())
            }
            StoreError::ArchiveNotFound(_) | StoreError::FileNotFound { .. } => {
                AppError::not_found(err.to_string())
            }
            StoreError::CorruptArchive(..) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            StoreError::InvalidObjectKey { .. } | StoreError::Sqlx(_) | StoreError::Io(_) => {
                AppError::internal(err.to_string())
            }
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<PatchError> for AppError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Store(inner) => inner.into(),
            PatchError::PatchNotFound(..) => AppError::not_found(err.to_string()),
            PatchError::SameArchive => AppError::bad_request(err.to_string()),
            PatchError::SourceDeleted(..) => AppError::not_found(err.to_string()),
            PatchError::TooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            PatchError::QueueClosed => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            PatchError::Delta(_) | PatchError::Aborted(_) | PatchError::Sqlx(_) | PatchError::Io(_) => {
                AppError::internal(err.to_string())
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}
