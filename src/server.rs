//! The sink's HTTP surface.
//!
//! All request and response bodies are JSON. Success responses carry
//! `{ok: true, …}`; failures carry `{ok: false, error}` with 4xx for
//! validation problems and 5xx for internal ones. Every URL-bearing field
//! is normalized at this boundary, so the core never sees raw strings, and
//! every mutating handler runs under the coordinator's mutation lock.

use crate::artifacts;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::domain::{self, DomainPaths, DEFAULT_DOMAIN};
use crate::frontier::{self, MergeOptions};
use crate::models::{FileCandidate, TermEntry};
use crate::probe::{self, ProbeInput};
use crate::runs;
use crate::storage::StorageError;
use crate::upload::{self, UploadInput};
use crate::url_norm;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // base64 inflates payloads by 4/3; the decoded cap is enforced below
    let body_limit = Config::MAX_UPLOAD_BYTES / 3 * 4 + 1024 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/meta/electorates", post(handle_terms_upsert).get(handle_terms_get))
        .route("/meta/electorates/reset", post(handle_terms_reset))
        .route("/dedupe/level", post(handle_dedupe_level))
        .route("/runs/start/urls", post(handle_runs_start))
        .route("/runs/append/urls", post(handle_runs_append))
        .route("/runs/finalize/urls", post(handle_runs_finalize))
        .route("/runs/chunk/urls", post(handle_chunk_urls))
        .route("/runs/chunk/files", post(handle_chunk_files))
        .route("/runs/chunk/files/incomplete", post(handle_chunk_files_incomplete))
        .route("/runs/start/files", post(handle_files_reset))
        .route("/upload/file", post(handle_upload_file))
        .route("/probe/meta", post(handle_probe_meta))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(coordinator)
}

// ============ Error envelope ============

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "ok": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!("Internal failure: {}", e);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ============ Domain resolution ============

/// Optional domain hints accepted on every request body.
#[derive(Debug, Clone, Default, Deserialize)]
struct DomainHints {
    #[serde(default)]
    domain_key: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    crawl_root: Option<String>,
    #[serde(default)]
    root_url: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
}

impl DomainHints {
    fn explicit(&self) -> Option<&str> {
        self.domain_key
            .as_deref()
            .or(self.domain.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Resolution precedence: explicit key, root-ish URLs, the request's
    /// own URL, then the first URL in any payload list.
    fn resolve(&self, url: Option<&str>, lists: &[Option<&str>]) -> String {
        let mut candidates: Vec<Option<&str>> = vec![
            self.crawl_root.as_deref(),
            self.root_url.as_deref(),
            self.base_url.as_deref(),
            url,
        ];
        candidates.extend_from_slice(lists);
        domain::resolve_key(self.explicit(), candidates)
    }

    fn has_any(&self) -> bool {
        self.explicit().is_some()
            || self.crawl_root.is_some()
            || self.root_url.is_some()
            || self.base_url.is_some()
    }
}

fn require_level(level: Option<i64>) -> Result<u32, ApiError> {
    match level {
        Some(l) if l >= 1 && l <= u32::MAX as i64 => Ok(l as u32),
        _ => Err(bad_request("level must be a positive integer")),
    }
}

fn require_run_id(run_id: Option<&str>) -> Result<String, ApiError> {
    match run_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(r) => Ok(r.to_string()),
        None => Err(bad_request("run_id is required")),
    }
}

fn normalize_all(urls: Vec<String>) -> Vec<String> {
    urls.iter().map(|u| url_norm::normalize(u)).collect()
}

/// File specs arrive as objects or bare URL strings; both normalize into
/// [`FileCandidate`]s.
fn parse_file_specs(values: Vec<Value>) -> Vec<FileCandidate> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(FileCandidate::new(url_norm::normalize(&s), None, None)),
            Value::Object(map) => {
                let url = map.get("url").and_then(|u| u.as_str())?;
                let ext = map
                    .get("ext")
                    .and_then(|e| e.as_str())
                    .filter(|e| !e.is_empty())
                    .map(|e| e.to_string());
                let source = map
                    .get("source_page_url")
                    .and_then(|s| s.as_str())
                    .map(url_norm::normalize);
                Some(FileCandidate::new(url_norm::normalize(url), ext, source))
            }
            _ => None,
        })
        .collect()
}

fn first_str(urls: &[String]) -> Option<&str> {
    urls.first().map(|s| s.as_str())
}

// ============ GET /health ============

async fn handle_health(State(c): State<Arc<Coordinator>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "root": c.root().display().to_string(),
        "downloads_root": c.root().join("downloads").display().to_string(),
        "default_domain": DEFAULT_DOMAIN,
    }))
}

// ============ /meta/electorates ============

#[derive(Deserialize)]
struct TermsUpsertBody {
    #[serde(rename = "termKey")]
    term_key: String,
    #[serde(default)]
    official_order: BTreeMap<String, String>,
    /// Accepted for compatibility; always rebuilt from the official names.
    #[serde(default, rename = "alphabetical_order")]
    _alphabetical_order: Option<Value>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_terms_upsert(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<TermsUpsertBody>,
) -> ApiResult {
    if body.term_key.trim().is_empty() {
        return Err(bad_request("termKey is required"));
    }
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let mut terms = c.store().load_terms(&paths)?;
    let mut entry = TermEntry {
        official_order: body.official_order.clone(),
        ..Default::default()
    };
    entry.rebuild_alphabetical();
    let electorates = entry.official_order.len();
    terms.insert(body.term_key.clone(), entry);
    crate::storage::append_jsonl(
        &paths.terms_log_path(),
        &json!({
            "ts": crate::models::now_ms(),
            "termKey": &body.term_key,
            "official_order": &body.official_order,
        }),
    )?;
    c.store().save_terms(&paths, &terms)?;
    c.invalidate_terms(&key);

    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "termKey": body.term_key,
        "electorates": electorates,
        "terms": terms.len(),
    })))
}

#[derive(Deserialize, Default)]
struct DomainQuery {
    #[serde(default)]
    domain_key: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

async fn handle_terms_get(
    State(c): State<Arc<Coordinator>>,
    Query(q): Query<DomainQuery>,
) -> ApiResult {
    let hints = DomainHints {
        domain_key: q.domain_key,
        domain: q.domain,
        ..Default::default()
    };
    let key = hints.resolve(None, &[]);
    let paths = c.paths(&key);
    let terms = c.store().load_terms(&paths)?;
    Ok(Json(json!({ "ok": true, "domain": key, "terms": terms })))
}

#[derive(Deserialize, Default)]
struct ResetBody {
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_terms_reset(
    State(c): State<Arc<Coordinator>>,
    body: Option<Json<ResetBody>>,
) -> ApiResult {
    let hints = body.map(|Json(b)| b.hints).unwrap_or_default();
    let key = hints.resolve(None, &[]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    c.store().save_terms(&paths, &Default::default())?;
    c.invalidate_terms(&key);
    Ok(Json(json!({ "ok": true, "domain": key, "cleared": true })))
}

// ============ POST /dedupe/level ============

#[derive(Deserialize)]
struct DedupeLevelBody {
    level: Option<i64>,
    #[serde(default)]
    visited: Vec<String>,
    #[serde(default)]
    pages: Vec<String>,
    #[serde(default)]
    files: Vec<Value>,
    #[serde(default)]
    update: bool,
    /// With `update`: overwrite the main artifact instead of patching it.
    #[serde(default)]
    full: bool,
    #[serde(default)]
    prune: bool,
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_dedupe_level(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<DedupeLevelBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let visited = normalize_all(body.visited);
    let pages = normalize_all(body.pages);
    let files = parse_file_specs(body.files);

    let key = body.hints.resolve(
        None,
        &[
            first_str(&visited),
            first_str(&pages),
            files.first().map(|f| f.url.as_str()),
        ],
    );
    let paths = c.paths(&key);
    let opts = MergeOptions {
        update: body.update,
        patch: body.update && !body.full,
        prune: body.prune,
        replace: body.replace,
    };

    let _guard = c.lock().await;
    let writer = c.writer(&paths)?;
    let summary = frontier::merge_level(
        c.store(),
        &paths,
        &writer,
        level,
        visited,
        pages,
        files,
        opts,
        body.chunk_size.unwrap_or(Config::DEFAULT_CHUNK_SIZE),
    )?;
    Ok(Json(json!({ "ok": true, "domain": key, "summary": summary })))
}

// ============ /runs/… streaming ============

#[derive(Deserialize)]
struct RunKeyBody {
    level: Option<i64>,
    run_id: Option<String>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_runs_start(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<RunKeyBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let run_id = require_run_id(body.run_id.as_deref())?;
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let bucket = runs::start_run(&paths, level, &run_id)?;
    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "bucket": crate::storage::rel_to_root(c.root(), &bucket),
    })))
}

#[derive(Deserialize)]
struct RunAppendBody {
    level: Option<i64>,
    run_id: Option<String>,
    #[serde(default)]
    visited: Vec<String>,
    #[serde(default)]
    pages: Vec<String>,
    #[serde(default)]
    files: Vec<Value>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_runs_append(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<RunAppendBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let run_id = require_run_id(body.run_id.as_deref())?;
    let visited = normalize_all(body.visited);
    let pages = normalize_all(body.pages);
    let files = parse_file_specs(body.files);

    let key = body.hints.resolve(
        None,
        &[
            first_str(&visited),
            first_str(&pages),
            files.first().map(|f| f.url.as_str()),
        ],
    );
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    runs::append_run(&paths, level, &run_id, visited, pages, files)?;
    Ok(Json(json!({ "ok": true, "domain": key, "appended": true })))
}

async fn handle_runs_finalize(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<RunKeyBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let run_id = require_run_id(body.run_id.as_deref())?;

    let mut key = body.hints.resolve(None, &[]);
    // A client that only knows (level, run_id) finalizes against whatever
    // domain actually holds the bucket.
    if !body.hints.has_any() {
        let default_bucket = runs::bucket_path(&c.paths(&key), level, &run_id);
        if !default_bucket.exists() {
            if let Some(found) = runs::locate_bucket_domain(c.store(), level, &run_id) {
                key = found;
            }
        }
    }
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let summary = runs::finalize_run(&c, &paths, level, &run_id, Config::DEFAULT_CHUNK_SIZE)?;
    Ok(Json(json!({ "ok": true, "domain": key, "summary": summary })))
}

// ============ /runs/chunk/… ============

#[derive(Deserialize)]
struct ChunkBody {
    level: Option<i64>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_chunk_urls(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<ChunkBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);
    let writer = c.writer(&paths)?;

    // Re-chunking a stable artifact tolerates eventual consistency; no lock.
    let name = artifacts::urls_level(level);
    let urls = artifacts::read_url_rows(&writer.path_of(&name))?;
    let manifest = writer.chunk_urls(
        &name,
        "urls",
        level,
        &urls,
        body.chunk_size.unwrap_or(Config::DEFAULT_CHUNK_SIZE),
    )?;
    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "level": level,
        "total": manifest.total,
        "parts": manifest.parts.len(),
    })))
}

/// Remaining files for one level: expected candidates minus registry
/// entries whose sources cite the level.
fn level_file_remainder(
    c: &Coordinator,
    paths: &DomainPaths,
    level: u32,
) -> Result<(Vec<FileCandidate>, usize), StorageError> {
    let writer = c.writer(paths)?;
    let expected = artifacts::read_file_rows(&writer.path_of(&artifacts::files_level(level)))?;
    let registry = c.store().load_registry(paths)?;
    let downloaded: std::collections::HashSet<&str> = registry
        .values()
        .flat_map(|r| r.sources.iter())
        .filter(|s| s.level == level)
        .map(|s| s.url.as_str())
        .collect();
    let total = expected.len();
    let remaining: Vec<FileCandidate> = expected
        .into_iter()
        .filter(|f| !downloaded.contains(f.url.as_str()))
        .collect();
    Ok((remaining, total))
}

async fn handle_chunk_files(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<ChunkBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);
    let chunk_size = body.chunk_size.unwrap_or(Config::DEFAULT_CHUNK_SIZE);

    let _guard = c.lock().await;
    let (remaining, expected) = level_file_remainder(&c, &paths, level)?;
    let writer = c.writer(&paths)?;
    let name = artifacts::files_remaining_level(level);
    writer.write_files(&name, "files-remaining", level, &remaining)?;
    let manifest = writer.chunk_files(&name, "files-remaining", level, &remaining, chunk_size)?;
    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "level": level,
        "expected": expected,
        "remaining": remaining.len(),
        "parts": manifest.parts.len(),
    })))
}

async fn handle_chunk_files_incomplete(
    State(c): State<Arc<Coordinator>>,
    body: Option<Json<ChunkBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or(ChunkBody {
        level: None,
        chunk_size: None,
        hints: DomainHints::default(),
    });
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);
    let chunk_size = body.chunk_size.unwrap_or(Config::DEFAULT_CHUNK_SIZE);

    let _guard = c.lock().await;
    let mut levels = Vec::new();
    for level in artifacts::file_artifact_levels(&paths.artifacts_dir()) {
        let (remaining, expected) = level_file_remainder(&c, &paths, level)?;
        if remaining.is_empty() {
            continue;
        }
        let writer = c.writer(&paths)?;
        let name = artifacts::files_remaining_level(level);
        writer.write_files(&name, "files-remaining", level, &remaining)?;
        writer.chunk_files(&name, "files-remaining", level, &remaining, chunk_size)?;
        levels.push(json!({
            "level": level,
            "expected": expected,
            "remaining": remaining.len(),
        }));
    }
    Ok(Json(json!({ "ok": true, "domain": key, "incomplete": levels })))
}

// ============ POST /runs/start/files ============

#[derive(Deserialize)]
struct FilesResetBody {
    level: Option<i64>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_files_reset(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<FilesResetBody>,
) -> ApiResult {
    let level = require_level(body.level)?;
    let key = body.hints.resolve(None, &[]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let summary = c.store().reset_file_level(&paths, level)?;
    Ok(Json(json!({ "ok": true, "domain": key, "summary": summary })))
}

// ============ POST /upload/file ============

#[derive(Deserialize)]
struct UploadBody {
    url: Option<String>,
    content_base64: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    source_page_url: Option<String>,
    bfs_level: Option<i64>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_upload_file(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<UploadBody>,
) -> ApiResult {
    let raw_url = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("url is required"))?;
    let encoded = body
        .content_base64
        .as_deref()
        .ok_or_else(|| bad_request("content_base64 is required"))?;
    let level = require_level(body.bfs_level)
        .map_err(|_| bad_request("bfs_level must be a positive integer"))?;

    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {e}")))?;
    if bytes.len() > Config::MAX_UPLOAD_BYTES {
        return Err(bad_request(format!(
            "payload of {} bytes exceeds the {} byte cap",
            bytes.len(),
            Config::MAX_UPLOAD_BYTES
        )));
    }

    let url = url_norm::normalize(raw_url);
    let source = body.source_page_url.as_deref().map(url_norm::normalize);
    let key = body.hints.resolve(Some(&url), &[source.as_deref()]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let terms = c.terms(&paths)?;
    let receipt = upload::handle_upload(
        c.store(),
        &paths,
        c.policy(),
        &terms,
        UploadInput {
            url,
            bytes,
            ext: body.ext,
            filename: body.filename,
            source_page_url: source,
            level,
        },
    )?;
    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "sha256": receipt.sha256,
        "saved_to": receipt.saved_to,
        "bytes": receipt.bytes,
        "skipped": receipt.skipped,
        "note": receipt.note,
    })))
}

// ============ POST /probe/meta ============

#[derive(Deserialize)]
struct ProbeBody {
    url: Option<String>,
    #[serde(default)]
    level: Option<i64>,
    #[serde(default)]
    head: Option<Value>,
    #[serde(default)]
    get_range: Option<Value>,
    #[serde(flatten)]
    hints: DomainHints,
}

async fn handle_probe_meta(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<ProbeBody>,
) -> ApiResult {
    let raw_url = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("url is required"))?;
    let level = match body.level {
        None => None,
        some => Some(require_level(some)?),
    };
    let url = url_norm::normalize(raw_url);
    let key = body.hints.resolve(Some(&url), &[]);
    let paths = c.paths(&key);

    let _guard = c.lock().await;
    let writer = c.writer(&paths)?;
    let outcome = probe::ingest_probe(
        c.store(),
        &paths,
        &writer,
        ProbeInput {
            url,
            level,
            head: body.head,
            get_range: body.get_range,
        },
    )?;
    Ok(Json(json!({
        "ok": true,
        "domain": key,
        "changed": outcome.changed,
        "signature": outcome.signature,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_specs_accepts_strings_and_objects() {
        let specs = parse_file_specs(vec![
            json!("https://h/a.pdf"),
            json!({"url": "https://h/b", "ext": "csv", "source_page_url": "https://h/p"}),
            json!(42),
        ]);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].ext, "pdf");
        assert_eq!(specs[1].ext, "csv");
        assert_eq!(specs[1].source_page_url.as_deref(), Some("https://h/p"));
    }

    #[test]
    fn test_require_level() {
        assert!(require_level(None).is_err());
        assert!(require_level(Some(0)).is_err());
        assert!(require_level(Some(-3)).is_err());
        assert_eq!(require_level(Some(7)).unwrap(), 7);
    }

    #[test]
    fn test_domain_hints_precedence() {
        let hints = DomainHints {
            crawl_root: Some("https://roots.example/start".into()),
            ..Default::default()
        };
        assert_eq!(
            hints.resolve(Some("https://other.example/u"), &[]),
            "roots.example"
        );
        let explicit = DomainHints {
            domain: Some("Chosen.Example".into()),
            crawl_root: Some("https://roots.example/".into()),
            ..Default::default()
        };
        assert_eq!(explicit.resolve(None, &[]), "chosen.example");
        assert_eq!(DomainHints::default().resolve(None, &[]), DEFAULT_DOMAIN);
    }
}
