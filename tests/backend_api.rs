mod common;

use base64::{Engine as _, engine::general_purpose};
use common::{TestServer, can_bind_localhost, spawn_backend};
use reqwest::{Client, StatusCode, header};
use serde_json::{Value, json};

async fn initiate(client: &Client, server: &TestServer, body: Value) -> Value {
    let resp = client
        .post(server.url("/api/upload/initiate"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.unwrap()
}

async fn sign_part(client: &Client, server: &TestServer, key: &str, upload_id: &str, n: u32) -> String {
    let resp = client
        .post(server.url("/api/upload/sign-part"))
        .json(&json!({ "key": key, "uploadId": upload_id, "partNumber": n }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    body["url"].as_str().unwrap().to_string()
}

fn content_md5(body: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(body).0)
}

async fn put_part(client: &Client, url: &str, body: Vec<u8>) -> reqwest::Response {
    let md5 = content_md5(&body);
    client
        .put(url)
        .header("Content-MD5", md5)
        .body(body)
        .send()
        .await
        .unwrap()
}

fn etag_of(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(header::ETAG)
        .expect("ETag header")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn health_endpoints_answer() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let health: Value = client
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({ "status": "healthy", "service": "backend" }));

    let ready = client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let ready: Value = ready.json().await.unwrap();
    assert_eq!(ready["checks"]["sqlite"]["open_uploads"], 0);
}

#[tokio::test]
async fn multipart_round_trip_through_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let opened = initiate(
        &client,
        &server,
        json!({
            "filename": "demo.webm",
            "size": 0,
            "contentType": "video/webm",
            "desiredKey": "users/u1/recordings/demo.webm",
            "userId": "u1"
        }),
    )
    .await;
    let key = opened["key"].as_str().unwrap().to_string();
    let upload_id = opened["uploadId"].as_str().unwrap().to_string();
    assert_eq!(key, "users/u1/recordings/demo.webm");
    assert_eq!(opened["partSize"], 1024);
    assert_eq!(opened["urls"], json!([]));

    let first = vec![1u8; 1500];
    let second = vec![2u8; 100];

    let url = sign_part(&client, &server, &key, &upload_id, 1).await;
    let resp = put_part(&client, &url, first.clone()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let etag1 = etag_of(&resp);
    assert_eq!(etag1, format!("\"{:x}\"", md5::compute(&first)));

    let url = sign_part(&client, &server, &key, &upload_id, 2).await;
    let resp = put_part(&client, &url, second.clone()).await;
    let etag2 = etag_of(&resp);

    let done = client
        .post(server.url("/api/upload/complete"))
        .json(&json!({
            "key": key,
            "uploadId": upload_id,
            "parts": [
                { "PartNumber": 1, "ETag": etag1 },
                { "PartNumber": 2, "ETag": etag2 }
            ],
            "userId": "u1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(done.status(), StatusCode::OK);
    let done: Value = done.json().await.unwrap();
    assert_eq!(done["success"], true);
    assert_eq!(
        done["location"],
        format!("{}/objects/users/u1/recordings/demo.webm", server.base_url)
    );

    let object = client.get(server.url(&format!("/objects/{}", key))).send().await.unwrap();
    assert_eq!(object.status(), StatusCode::OK);
    assert!(etag_of(&object).ends_with("-2\""));
    let bytes = object.bytes().await.unwrap();
    assert_eq!(bytes.len(), 1600);
    assert_eq!(&bytes[..1500], &first[..]);
    assert_eq!(&bytes[1500..], &second[..]);

    let marker: Value = client
        .get(server.url("/objects/users/u1/recordings/date.data"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(marker["finishedAt"].is_string());
}

#[tokio::test]
async fn known_size_gets_one_target_per_part() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let opened = initiate(
        &client,
        &server,
        json!({ "filename": "clip.mp4", "size": 2500, "contentType": "video/mp4" }),
    )
    .await;

    assert_eq!(opened["urls"].as_array().unwrap().len(), 3);
    let key = opened["key"].as_str().unwrap();
    assert!(key.starts_with("videos/") && key.ends_with(".mp4"));
}

#[tokio::test]
async fn write_targets_are_single_use_and_digest_checked() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let opened = initiate(
        &client,
        &server,
        json!({ "filename": "a.webm", "contentType": "video/webm" }),
    )
    .await;
    let key = opened["key"].as_str().unwrap();
    let upload_id = opened["uploadId"].as_str().unwrap();

    let url = sign_part(&client, &server, key, upload_id, 1).await;
    let bad = client
        .put(&url)
        .header("Content-MD5", content_md5(b"something else"))
        .body(vec![0u8; 10])
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let url = sign_part(&client, &server, key, upload_id, 1).await;
    assert_eq!(put_part(&client, &url, vec![0u8; 10]).await.status(), StatusCode::OK);
    assert_eq!(
        put_part(&client, &url, vec![0u8; 10]).await.status(),
        StatusCode::FORBIDDEN
    );
}

#[tokio::test]
async fn completion_rejects_bad_part_lists() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let opened = initiate(
        &client,
        &server,
        json!({ "filename": "a.webm", "contentType": "video/webm" }),
    )
    .await;
    let key = opened["key"].as_str().unwrap();
    let upload_id = opened["uploadId"].as_str().unwrap();

    let complete = |parts: Value| {
        client
            .post(server.url("/api/upload/complete"))
            .json(&json!({ "key": key, "uploadId": upload_id, "parts": parts, "userId": "u1" }))
            .send()
    };

    let empty = complete(json!([])).await.unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = empty.json().await.unwrap();
    assert_eq!(body["status"], 400);

    let url = sign_part(&client, &server, key, upload_id, 1).await;
    let small = vec![3u8; 10];
    let etag = etag_of(&put_part(&client, &url, small.clone()).await);
    let url = sign_part(&client, &server, key, upload_id, 2).await;
    let etag2 = etag_of(&put_part(&client, &url, small).await);

    let gap = complete(json!([{ "PartNumber": 2, "ETag": etag2 }]))
        .await
        .unwrap();
    assert_eq!(gap.status(), StatusCode::BAD_REQUEST);

    let too_small = complete(json!([
        { "PartNumber": 1, "ETag": etag },
        { "PartNumber": 2, "ETag": etag2 }
    ]))
    .await
    .unwrap();
    assert_eq!(too_small.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn live_fragments_are_stored_under_their_seq() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let signed: Value = client
        .post(server.url("/api/upload/sign-chunk"))
        .json(&json!({
            "userId": "u1",
            "recordingId": "rec-1",
            "seq": 4,
            "ext": "webm",
            "contentType": "video/webm"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(signed["key"], "users/u1/latest/parts/rec-1/part-000004.webm");
    let url = signed["url"].as_str().unwrap();

    let wrong_type = client
        .put(url)
        .header(header::CONTENT_TYPE, "text/plain")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_type.status(), StatusCode::BAD_REQUEST);

    let stored = client
        .put(url)
        .header(header::CONTENT_TYPE, "video/webm")
        .body("fragment-4")
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), StatusCode::OK);

    let fetched = client
        .get(server.url("/objects/users/u1/latest/parts/rec-1/part-000004.webm"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        fetched.headers().get(header::CONTENT_TYPE).unwrap(),
        "video/webm"
    );
    assert_eq!(fetched.text().await.unwrap(), "fragment-4");
}

#[tokio::test]
async fn aborted_upload_takes_no_more_parts() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;
    let client = Client::new();

    let opened = initiate(
        &client,
        &server,
        json!({ "filename": "a.webm", "contentType": "video/webm" }),
    )
    .await;
    let key = opened["key"].as_str().unwrap();
    let upload_id = opened["uploadId"].as_str().unwrap();
    let url = sign_part(&client, &server, key, upload_id, 1).await;

    let aborted = client
        .delete(server.url("/api/upload/abort"))
        .query(&[("upload_id", upload_id), ("key", key)])
        .send()
        .await
        .unwrap();
    assert_eq!(aborted.status(), StatusCode::OK);

    assert_eq!(
        put_part(&client, &url, vec![1u8; 4]).await.status(),
        StatusCode::FORBIDDEN
    );
    let resign = client
        .post(server.url("/api/upload/sign-part"))
        .json(&json!({ "key": key, "uploadId": upload_id, "partNumber": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resign.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_exposes_etag() {
    if !can_bind_localhost() {
        eprintln!("Skipping backend tests: cannot bind to localhost");
        return;
    }
    let server = spawn_backend(1024).await;

    let resp = Client::new()
        .get(server.url("/healthz"))
        .header(header::ORIGIN, "http://localhost:3000")
        .send()
        .await
        .unwrap();

    let exposed = resp
        .headers()
        .get(header::ACCESS_CONTROL_EXPOSE_HEADERS)
        .expect("expose header")
        .to_str()
        .unwrap()
        .to_ascii_lowercase();
    assert!(exposed.contains("etag"));
}
