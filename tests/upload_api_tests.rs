//! Router-level tests for chunked uploads.

mod common;

use axum::{body::Body, http::{Request, StatusCode}};
use base64::{Engine as _, engine::general_purpose};
use common::{BOUNDARY, TestServer, multipart_body};
use serde_json::json;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn chunks_out_of_order_complete_the_upload() {
    let server = TestServer::new().await;
    let game_id = server.create_game("Commander Keen").await;
    let data = pattern(3000);
    let key = server.init_upload("games", data.len() as u64).await;

    let (status, ack) = server.send_chunk(&key, &data, 2000, 2999, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["complete"], json!(false));
    assert_eq!(ack["high_water_mark"], json!(0));

    let (_, ack) = server.send_chunk(&key, &data, 0, 999, None).await;
    assert_eq!(ack["complete"], json!(false));
    assert_eq!(ack["high_water_mark"], json!(1000));

    // Retrying a chunk is harmless.
    let (status, _) = server.send_chunk(&key, &data, 0, 999, None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, ack) = server.send_chunk(&key, &data, 1000, 1999, None).await;
    assert_eq!(ack["complete"], json!(true));
    assert_eq!(ack["received_bytes"], json!(3000));

    let (status, session) = server.json("GET", &format!("/upload/{}", key), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["complete"], json!(true));

    let (status, archive) = server
        .json(
            "POST",
            "/archives",
            Some(json!({ "session_key": key, "game_id": game_id, "version": "1.4" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", archive);
    assert_eq!(archive["size_bytes"], json!(3000));

    let request = Request::builder()
        .uri(format!("/archives/{}/download", archive["id"].as_str().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = server.response(request).await;
    let etag = response.headers()["etag"].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{:x}\"", md5::compute(&data)));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), data.as_slice());

    // The session is consumed by promotion.
    let (status, _) = server.json("GET", &format!("/upload/{}", key), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let server = TestServer::new().await;

    let (status, _) = server
        .json("POST", "/upload/init", Some(json!({ "storage_location_id": "nowhere" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let data = pattern(100);
    let (status, _) = server
        .send_chunk("0123456789abcdef0123456789abcdef", &data, 0, 99, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let key = server.init_upload("games", 100).await;
    let fields = [
        ("key", key.clone()),
        ("start", "50".to_string()),
        ("end", "149".to_string()),
        ("total", "100".to_string()),
    ];
    let request = Request::builder()
        .method("POST")
        .uri("/upload/chunk")
        .header("Content-Type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(multipart_body(&fields, &pattern(100))))
        .unwrap();
    let (status, _) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server
        .json(
            "POST",
            "/archives",
            Some(json!({ "session_key": key, "game_id": uuid::Uuid::new_v4(), "version": "1" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
}

#[tokio::test]
async fn chunk_checksum_is_verified() {
    let server = TestServer::new().await;
    let data = pattern(512);
    let key = server.init_upload("games", 512).await;

    let wrong = general_purpose::STANDARD.encode([0u8; 16]);
    let (status, _) = server.send_chunk(&key, &data, 0, 511, Some(&wrong)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let right = general_purpose::STANDARD.encode(md5::compute(&data).0);
    let (status, ack) = server.send_chunk(&key, &data, 0, 511, Some(&right)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["complete"], json!(true));
}

#[tokio::test]
async fn incomplete_upload_cannot_become_an_archive() {
    let server = TestServer::new().await;
    let game_id = server.create_game("Cosmo").await;
    let data = pattern(2048);
    let key = server.init_upload("games", 2048).await;
    server.send_chunk(&key, &data, 0, 1023, None).await;

    let (status, _) = server
        .json(
            "POST",
            "/archives",
            Some(json!({ "session_key": key, "game_id": game_id, "version": "1" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The session stays open for the missing half.
    let (_, ack) = server.send_chunk(&key, &data, 1024, 2047, None).await;
    assert_eq!(ack["complete"], json!(true));
}

#[tokio::test]
async fn cancelled_session_is_gone() {
    let server = TestServer::new().await;
    let key = server.init_upload("games", 10).await;

    let (status, _) = server.json("DELETE", &format!("/upload/{}", key), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = server.json("GET", &format!("/upload/{}", key), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remote_location_cannot_promote_yet() {
    let server = TestServer::new().await;
    let game_id = server.create_game("Duke").await;
    let data = pattern(64);
    let key = server.init_upload("mirror", 64).await;
    let (status, _) = server.send_chunk(&key, &data, 0, 63, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .json(
            "POST",
            "/archives",
            Some(json!({ "session_key": key, "game_id": game_id, "version": "1" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn oversized_chunk_body_is_rejected() {
    let server = TestServer::new().await;
    let data = pattern(2 * 1024 * 1024);
    let key = server.init_upload("games", data.len() as u64).await;
    let (status, _) = server.send_chunk(&key, &data, 0, data.len() - 1, None).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
