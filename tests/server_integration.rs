use axum::body::Body;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crawlsink::coordinator::Coordinator;
use crawlsink::server::build_router;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app() -> (TempDir, Router, Arc<Coordinator>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let coordinator = Arc::new(Coordinator::new(tmp.path()).expect("Coordinator::new"));
    let app = build_router(coordinator.clone());
    (tmp, app, coordinator)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(v) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let resp = app.clone().oneshot(request).await.expect("request");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("body").to_bytes();
    let value: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("valid JSON response")
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_roots() {
    let (_tmp, app, _c) = test_app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert!(body["root"].as_str().is_some());
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn dedupe_level_subtracts_prior_levels() {
    let (_tmp, app, c) = test_app();

    // Level 1: visit the root, discover /a
    let (status, body) = send(
        &app,
        "POST",
        "/dedupe/level",
        Some(json!({
            "level": 1,
            "visited": ["https://h.example/root"],
            "pages": ["https://h.example/a"],
            "files": []
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["domain"], json!("h.example"));

    // Level 2: /a rediscovered, /b new, one file
    let (status, body) = send(
        &app,
        "POST",
        "/dedupe/level",
        Some(json!({
            "level": 2,
            "visited": ["https://h.example/a"],
            "pages": ["https://h.example/b", "https://h.example/a"],
            "files": [{"url": "https://h.example/f.pdf", "ext": "pdf",
                       "source_page_url": "https://h.example/a"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["summary"]["next_frontier_total"], json!(1));

    let paths = c.paths("h.example");
    let urls = crawlsink::artifacts::read_url_rows(
        &paths.artifacts_dir().join("urls-level-3.json"),
    )
    .unwrap();
    assert_eq!(urls, vec!["https://h.example/b"]);
    let files = crawlsink::artifacts::read_file_rows(
        &paths.artifacts_dir().join("files-level-2.json"),
    )
    .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].url, "https://h.example/f.pdf");
}

#[tokio::test]
async fn dedupe_level_rejects_bad_level() {
    let (_tmp, app, _c) = test_app();
    for bad in [json!({}), json!({"level": 0}), json!({"level": -2})] {
        let (status, body) = send(&app, "POST", "/dedupe/level", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("level"));
    }
}

#[tokio::test]
async fn streaming_run_finalize_is_idempotent() {
    let (_tmp, app, c) = test_app();
    let hint = json!("https://h.example/");

    let (status, _) = send(
        &app,
        "POST",
        "/runs/start/urls",
        Some(json!({"level": 3, "run_id": "r1", "crawl_root": hint})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    send(
        &app,
        "POST",
        "/runs/append/urls",
        Some(json!({"level": 3, "run_id": "r1", "crawl_root": hint,
                    "visited": ["https://h.example/u1"], "pages": ["https://h.example/u2"]})),
    )
    .await;
    send(
        &app,
        "POST",
        "/runs/append/urls",
        Some(json!({"level": 3, "run_id": "r1", "crawl_root": hint,
                    "pages": ["https://h.example/u2", "https://h.example/u3"]})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/runs/finalize/urls",
        Some(json!({"level": 3, "run_id": "r1", "crawl_root": hint})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["summary"]["already_done"], json!(false));
    assert_eq!(body["summary"]["next_frontier_total"], json!(2));

    let paths = c.paths("h.example");
    let artifact = paths.artifacts_dir().join("urls-level-4.json");
    let urls = crawlsink::artifacts::read_url_rows(&artifact).unwrap();
    assert_eq!(urls, vec!["https://h.example/u2", "https://h.example/u3"]);
    let bytes = std::fs::read(&artifact).unwrap();

    // Second finalize: marker short-circuits, artifacts untouched
    let (status, body) = send(
        &app,
        "POST",
        "/runs/finalize/urls",
        Some(json!({"level": 3, "run_id": "r1", "crawl_root": hint})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["already_done"], json!(true));
    assert_eq!(bytes, std::fs::read(&artifact).unwrap());
}

#[tokio::test]
async fn finalize_without_hint_locates_bucket() {
    let (_tmp, app, _c) = test_app();
    let hint = json!("https://elsewhere.example/");

    send(
        &app,
        "POST",
        "/runs/start/urls",
        Some(json!({"level": 2, "run_id": "lost", "crawl_root": hint})),
    )
    .await;
    send(
        &app,
        "POST",
        "/runs/append/urls",
        Some(json!({"level": 2, "run_id": "lost", "crawl_root": hint,
                    "pages": ["https://elsewhere.example/x"]})),
    )
    .await;

    // No domain hint at all: the sink finds the bucket across domains
    let (status, body) = send(
        &app,
        "POST",
        "/runs/finalize/urls",
        Some(json!({"level": 2, "run_id": "lost"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["domain"], json!("elsewhere.example"));
    assert_eq!(body["summary"]["already_done"], json!(false));
}

#[tokio::test]
async fn upload_dedupes_by_sha() {
    let (tmp, app, c) = test_app();
    let payload = BASE64.encode(b"identical-bytes");

    let (status, first) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/one.csv", "content_base64": payload,
                    "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["skipped"], json!(false));

    let (status, second) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/two.csv", "content_base64": payload,
                    "bfs_level": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["skipped"], json!(true));
    assert_eq!(second["note"], json!("duplicate_content_skipped"));
    assert_eq!(second["sha256"], first["sha256"]);

    // One file on disk, two source observations in the registry
    let paths = c.paths("h.example");
    let registry = c.store().load_registry(&paths).unwrap();
    let record = &registry[first["sha256"].as_str().unwrap()];
    assert_eq!(record.sources.len(), 2);
    assert!(tmp
        .path()
        .join(record.saved_to.as_deref().unwrap())
        .is_file());
}

#[tokio::test]
async fn upload_quarantines_html_posing_as_pdf() {
    let (tmp, app, _c) = test_app();
    let payload = BASE64.encode(b"<html><body>session expired</body></html>");

    let (status, body) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/report.pdf", "content_base64": payload,
                    "ext": "pdf", "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["note"], json!("bad_pdf_got_html"));
    let saved_to = body["saved_to"].as_str().unwrap();
    assert!(saved_to.contains("/_bad/"));
    assert!(saved_to.ends_with("report__bad_pdf_got_html.html"));
    assert!(tmp.path().join(saved_to).is_file());
}

#[tokio::test]
async fn upload_validation_errors() {
    let (_tmp, app, _c) = test_app();

    let (status, body) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"content_base64": "aGk=", "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("url"));

    let (status, _) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h/x", "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h/x", "content_base64": "!!!not-base64!!!",
                    "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn electorate_metadata_roundtrip() {
    let (_tmp, app, _c) = test_app();

    let (status, body) = send(
        &app,
        "POST",
        "/meta/electorates",
        Some(json!({"termKey": "2022", "domain": "h.example",
                    "official_order": {"1": "Banks", "2": "Adelaide"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["electorates"], json!(2));

    let (status, body) = send(&app, "GET", "/meta/electorates?domain=h.example", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["terms"]["2022"]["alphabetical_order"]["Adelaide"],
        json!(1)
    );
    assert_eq!(body["terms"]["2022"]["alphabetical_order"]["Banks"], json!(2));

    let (status, _) = send(
        &app,
        "POST",
        "/meta/electorates/reset",
        Some(json!({"domain": "h.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, "GET", "/meta/electorates?domain=h.example", None).await;
    assert_eq!(body["terms"], json!({}));
}

#[tokio::test]
async fn terms_route_uploads_into_buckets() {
    let (_tmp, app, _c) = test_app();

    send(
        &app,
        "POST",
        "/meta/electorates",
        Some(json!({"termKey": "2022", "domain": "h.example",
                    "official_order": {"1": "Cook"}})),
    )
    .await;

    let payload = BASE64.encode(b"booth,votes\n");
    let (status, body) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/2022/Cook/booths.csv",
                    "content_base64": payload, "bfs_level": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        body["saved_to"],
        json!("downloads/h.example/2022/Cook/booths.csv")
    );
}

#[tokio::test]
async fn probe_change_feeds_download_queue() {
    let (_tmp, app, c) = test_app();

    // The level artifact knows this file
    send(
        &app,
        "POST",
        "/dedupe/level",
        Some(json!({
            "level": 2,
            "visited": ["https://h.example/page"],
            "pages": [],
            "files": [{"url": "https://h.example/f.csv", "ext": "csv",
                       "source_page_url": "https://h.example/page"}]
        })),
    )
    .await;

    let probe = |etag: &str| {
        json!({"url": "https://h.example/f.csv", "level": 2,
               "head": {"etag": etag, "content_length": 10}})
    };
    let (status, body) = send(&app, "POST", "/probe/meta", Some(probe("\"v1\""))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["changed"], json!(false));

    let (_, body) = send(&app, "POST", "/probe/meta", Some(probe("\"v2\""))).await;
    assert_eq!(body["changed"], json!(true));

    let paths = c.paths("h.example");
    let diff = crawlsink::artifacts::read_file_rows(
        &paths.artifacts_dir().join("files-diff-level-2.json"),
    )
    .unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].ext, "csv");
    assert_eq!(
        diff[0].source_page_url.as_deref(),
        Some("https://h.example/page")
    );
}

#[tokio::test]
async fn chunk_files_reports_remainder() {
    let (_tmp, app, _c) = test_app();

    // Two expected files at level 1; one of them gets uploaded
    send(
        &app,
        "POST",
        "/dedupe/level",
        Some(json!({
            "level": 1,
            "visited": ["https://h.example/"],
            "pages": [],
            "files": ["https://h.example/a.csv", "https://h.example/b.csv"]
        })),
    )
    .await;
    let payload = BASE64.encode(b"data");
    send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/a.csv", "content_base64": payload,
                    "bfs_level": 1})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/runs/chunk/files",
        Some(json!({"level": 1, "domain": "h.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["expected"], json!(2));
    assert_eq!(body["remaining"], json!(1));

    // The sweep endpoint sees the same incomplete level
    let (status, body) = send(
        &app,
        "POST",
        "/runs/chunk/files/incomplete",
        Some(json!({"domain": "h.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["incomplete"][0]["level"], json!(1));
    assert_eq!(body["incomplete"][0]["remaining"], json!(1));
}

#[tokio::test]
async fn level_reset_preserves_cross_level_files() {
    let (tmp, app, _c) = test_app();

    let shared = BASE64.encode(b"shared-bytes");
    let only = BASE64.encode(b"only-level-2");
    // Shared bytes cited at levels 1 and 2; other bytes only at level 2
    send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/shared.csv", "content_base64": shared,
                    "bfs_level": 1})),
    )
    .await;
    send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/shared2.csv", "content_base64": shared,
                    "bfs_level": 2})),
    )
    .await;
    let (_, only_body) = send(
        &app,
        "POST",
        "/upload/file",
        Some(json!({"url": "https://h.example/only.csv", "content_base64": only,
                    "bfs_level": 2})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/runs/start/files",
        Some(json!({"level": 2, "domain": "h.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["summary"]["deleted_files"], json!(1));
    assert_eq!(body["summary"]["kept_files"], json!(1));

    assert!(!tmp
        .path()
        .join(only_body["saved_to"].as_str().unwrap())
        .exists());
}

#[tokio::test]
async fn url_normalization_applies_at_the_boundary() {
    let (_tmp, app, c) = test_app();

    send(
        &app,
        "POST",
        "/dedupe/level",
        Some(json!({
            "level": 1,
            "visited": ["https://h.example//start/index.html"],
            "pages": ["https://h.example/p?a=1&amp;b=2#frag",
                      "https://h.example/p?a=1&b=2"],
            "files": []
        })),
    )
    .await;

    let paths = c.paths("h.example");
    let urls = crawlsink::artifacts::read_url_rows(
        &paths.artifacts_dir().join("urls-level-2.json"),
    )
    .unwrap();
    // Both spellings collapse to one canonical URL
    assert_eq!(urls, vec!["https://h.example/p?a=1&b=2"]);
}
