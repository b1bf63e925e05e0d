//! Shared router-level test harness.

use archive_vault::{
    config::{AppConfig, LocationSpec},
    db,
    routes,
    state::AppState,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::Value;
use std::{io::Write, sync::Arc};
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "archive-vault-test-boundary";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Local `games` location plus a remote `mirror` location.
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let root = temp_dir.path();

        let cfg = AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: format!("sqlite://{}", root.join("vault.db").display()),
            staging_dir: root.join("staging").display().to_string(),
            patch_dir: root.join("patches").display().to_string(),
            locations: vec![
                LocationSpec {
                    id: "games".into(),
                    target: root.join("games").display().to_string(),
                },
                LocationSpec {
                    id: "mirror".into(),
                    target: "s3://archive-mirror/games".into(),
                },
            ],
            session_timeout_secs: 3600,
            sweep_interval_secs: 60,
            max_chunk_bytes: 1024 * 1024,
            patch_workers: 1,
            patch_block_size: 64,
            patch_max_archive_bytes: 64 * 1024 * 1024,
            contents_cache_capacity: 32,
        };

        let pool = db::connect(&cfg.database_url, 4)
            .await
            .expect("Failed to open database");
        db::run_migrations(&pool).await.expect("Failed to migrate");
        let state = AppState::from_config(Arc::new(pool), &cfg)
            .await
            .expect("Failed to build state");
        let router = routes::routes::routes(cfg.max_chunk_bytes).with_state(state.clone());

        Self {
            router,
            state,
            temp_dir,
        }
    }

    pub async fn response(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.response(request).await;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        let (status, bytes) = self.send(builder.body(body).unwrap()).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Open a session on `location`; returns the key.
    pub async fn init_upload(&self, location: &str, total: u64) -> String {
        let (status, body) = self
            .json(
                "POST",
                "/upload/init",
                Some(serde_json::json!({
                    "storage_location_id": location,
                    "total_size": total,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["key"].as_str().unwrap().to_string()
    }

    /// Send `data[start..=end]` as one multipart chunk.
    pub async fn send_chunk(
        &self,
        key: &str,
        data: &[u8],
        start: usize,
        end: usize,
        checksum: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut fields = vec![
            ("key", key.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("total", data.len().to_string()),
        ];
        if let Some(checksum) = checksum {
            fields.push(("checksum", checksum.to_string()));
        }
        let body = multipart_body(&fields, &data[start..=end]);
        let request = Request::builder()
            .method("POST")
            .uri("/upload/chunk")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Upload `data` in chunks of `chunk` bytes and register it for `game_id`.
    pub async fn upload_archive(&self, game_id: &str, data: &[u8], chunk: usize) -> Value {
        let key = self.init_upload("games", data.len() as u64).await;
        for start in (0..data.len()).step_by(chunk) {
            let end = (start + chunk).min(data.len()) - 1;
            let (status, ack) = self.send_chunk(&key, data, start, end, None).await;
            assert_eq!(status, StatusCode::OK, "{}", ack);
        }
        let (status, archive) = self
            .json(
                "POST",
                "/archives",
                Some(serde_json::json!({
                    "session_key": key,
                    "game_id": game_id,
                    "version": "1.0",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", archive);
        archive
    }

    pub async fn create_game(&self, name: &str) -> String {
        let (status, game) = self
            .json("POST", "/games", Some(serde_json::json!({ "name": name })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        game["id"].as_str().unwrap().to_string()
    }
}

/// Hand-built multipart body with text `fields` and one `file` part.
#[allow(dead_code)]
pub fn multipart_body(fields: &[(&str, String)], file: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        write!(
            body,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        )
        .unwrap();
    }
    write!(
        body,
        "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"chunk.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        BOUNDARY
    )
    .unwrap();
    body.extend_from_slice(file);
    write!(body, "\r\n--{}--\r\n", BOUNDARY).unwrap();
    body
}

/// Zip archive containing `files`, built in memory.
#[allow(dead_code)]
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
