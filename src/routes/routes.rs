//! Defines routes for uploads, archives and patches.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST   /upload/init`: open or resume a session
//!   - `POST   /upload/chunk`: write one multipart chunk
//!   - `GET    /upload/{key}`: session status
//!   - `DELETE /upload/{key}`: cancel a session
//!
//! - **Catalog**
//!   - `POST   /games`, `POST /redistributables`
//!   - `GET    /games/{id}/archives`
//!   - `DELETE /games/{id}`, `DELETE /redistributables/{id}`: cascade to archives
//!
//! - **Archives**
//!   - `POST   /archives`: register a completed upload
//!   - `GET    /archives/{id}`, `/archives/{id}/download`, `/archives/{id}/contents`
//!   - `DELETE /archives/{id}`
//!   - `POST   /archives/{id}/patches`: queue a patch from another version
//!   - `GET    /patches/{original}/{altered}`: download a generated patch

use crate::{
    handlers::{
        archive_handlers::{
            archive_contents, create_archive, create_game, create_redistributable,
            delete_archive, delete_game, delete_redistributable, download_archive,
            download_patch, get_archive, list_game_archives, request_patch,
        },
        health_handlers::{healthz, readyz},
        upload_handlers::{cancel_upload, init_upload, upload_chunk, upload_status},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Multipart framing allowance on top of the chunk payload itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router. `max_chunk_bytes` bounds the body of chunk uploads.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Uploads
        .route("/upload/init", post(init_upload))
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(
                max_chunk_bytes.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/upload/{key}", get(upload_status).delete(cancel_upload))
        // Catalog
        .route("/games", post(create_game))
        .route("/games/{id}", delete(delete_game))
        .route("/games/{id}/archives", get(list_game_archives))
        .route("/redistributables", post(create_redistributable))
        .route("/redistributables/{id}", delete(delete_redistributable))
        // Archives
        .route("/archives", post(create_archive))
        .route("/archives/{id}", get(get_archive).delete(delete_archive))
        .route("/archives/{id}/download", get(download_archive))
        .route("/archives/{id}/contents", get(archive_contents))
        .route("/archives/{id}/patches", post(request_patch))
        .route("/patches/{original}/{altered}", get(download_patch))
}
