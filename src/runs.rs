//! Streaming discovery runs and their auto-finalize watchdog.
//!
//! A long discovery run appends JSONL fragments under a
//! `(domain, level, run_id)` bucket as it works. Finalization replays the
//! bucket, feeds the union through the frontier engine exactly as if the
//! whole batch had arrived at once, emits the remaining-work artifact, and
//! drops a `.done` marker so repeats are no-ops. Buckets abandoned mid-run
//! are picked up by the watchdog once they go idle.

use crate::artifacts;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::domain::DomainPaths;
use crate::frontier::{self, MergeOptions};
use crate::models::{merge_candidates, now_ms, stable_uniq, FileCandidate};
use crate::state::StateStore;
use crate::storage::{self, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Filesystem-safe run id: anything outside `[A-Za-z0-9._-]` becomes `_`,
/// capped at 120 characters.
pub fn safe_run_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(Config::RUN_ID_MAX_LEN)
        .collect()
}

pub fn bucket_filename(level: u32, run_id: &str) -> String {
    format!("discover_level_{level}_{}.jsonl", safe_run_id(run_id))
}

pub fn bucket_path(paths: &DomainPaths, level: u32, run_id: &str) -> PathBuf {
    paths.runs_dir().join(bucket_filename(level, run_id))
}

pub fn done_path(bucket: &Path) -> PathBuf {
    let mut name = bucket
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".done");
    bucket.with_file_name(name)
}

/// `(level, run_id)` recovered from a bucket filename.
pub fn parse_bucket_filename(name: &str) -> Option<(u32, String)> {
    let stem = name
        .strip_prefix("discover_level_")?
        .strip_suffix(".jsonl")?;
    let (level, run_id) = stem.split_once('_')?;
    Some((level.parse().ok()?, run_id.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub ts: i64,
    pub level: u32,
    pub run_id: String,
    #[serde(default)]
    pub visited: Vec<String>,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeSummary {
    pub level: u32,
    pub run_id: String,
    #[serde(default)]
    pub already_done: bool,
    pub records: usize,
    pub visited: usize,
    pub pages: usize,
    pub files: usize,
    pub next_frontier_total: usize,
    pub remaining: usize,
    pub ts: i64,
}

/// Truncate the bucket and clear any stale `.done` marker.
pub fn start_run(paths: &DomainPaths, level: u32, run_id: &str) -> Result<PathBuf, StorageError> {
    let bucket = bucket_path(paths, level, run_id);
    if let Some(parent) = bucket.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    fs::write(&bucket, b"").map_err(|e| StorageError::io(&bucket, e))?;
    let _ = fs::remove_file(done_path(&bucket));
    Ok(bucket)
}

/// Append one discovery fragment to the bucket.
pub fn append_run(
    paths: &DomainPaths,
    level: u32,
    run_id: &str,
    visited: Vec<String>,
    pages: Vec<String>,
    files: Vec<FileCandidate>,
) -> Result<(), StorageError> {
    let bucket = bucket_path(paths, level, run_id);
    storage::append_jsonl(
        &bucket,
        &RunRecord {
            ts: now_ms(),
            level,
            run_id: safe_run_id(run_id),
            visited,
            pages,
            files,
        },
    )
}

/// Reduce the bucket into state and artifacts. Idempotent: a `.done` marker
/// short-circuits, and replaying the same JSONL produces the same outputs.
pub fn finalize_run(
    coordinator: &Coordinator,
    paths: &DomainPaths,
    level: u32,
    run_id: &str,
    chunk_size: usize,
) -> Result<FinalizeSummary, StorageError> {
    let store = coordinator.store();
    let bucket = bucket_path(paths, level, run_id);
    let marker = done_path(&bucket);

    if marker.exists() {
        let mut summary: FinalizeSummary = storage::read_json_or(
            &marker,
            FinalizeSummary {
                level,
                run_id: safe_run_id(run_id),
                already_done: true,
                records: 0,
                visited: 0,
                pages: 0,
                files: 0,
                next_frontier_total: 0,
                remaining: 0,
                ts: 0,
            },
        )?;
        summary.already_done = true;
        return Ok(summary);
    }

    let records: Vec<RunRecord> = storage::read_jsonl(&bucket)?;
    let visited = stable_uniq(records.iter().flat_map(|r| r.visited.iter().cloned()));
    let pages = stable_uniq(records.iter().flat_map(|r| r.pages.iter().cloned()));
    let files = merge_candidates(records.iter().flat_map(|r| r.files.iter().cloned()));

    let writer = coordinator.writer(paths)?;
    let merge = frontier::merge_level(
        store,
        paths,
        &writer,
        level,
        visited.clone(),
        pages.clone(),
        files.clone(),
        MergeOptions::default(),
        chunk_size,
    )?;

    // Remaining work for this level: the frontier it was fed, minus what
    // this run actually visited.
    let frontier_in =
        artifacts::read_url_rows(&writer.path_of(&artifacts::urls_level(level)))?;
    let visited_set: HashSet<&String> = visited.iter().collect();
    let remaining: Vec<String> = frontier_in
        .iter()
        .filter(|u| !visited_set.contains(*u))
        .cloned()
        .collect();
    let remaining_name = artifacts::urls_remaining_level(level);
    writer.write_urls(&remaining_name, "urls-remaining", level, &remaining)?;
    writer.chunk_urls(&remaining_name, "urls-remaining", level, &remaining, chunk_size)?;

    let summary = FinalizeSummary {
        level,
        run_id: safe_run_id(run_id),
        already_done: false,
        records: records.len(),
        visited: visited.len(),
        pages: pages.len(),
        files: files.len(),
        next_frontier_total: merge.next_frontier_total,
        remaining: remaining.len(),
        ts: now_ms(),
    };
    storage::write_json_atomic(&marker, &summary)?;
    Ok(summary)
}

/// Locate a bucket by filename across every domain's runs directory,
/// preferring the largest match. Used when a finalize request carries no
/// domain hint and the default namespace has nothing.
pub fn locate_bucket_domain(store: &StateStore, level: u32, run_id: &str) -> Option<String> {
    let filename = bucket_filename(level, run_id);
    let runs_root = store.paths(crate::domain::DEFAULT_DOMAIN).runs_root();
    let mut best: Option<(u64, String)> = None;
    let entries = fs::read_dir(&runs_root).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let candidate = entry.path().join(&filename);
        if let Ok(meta) = fs::metadata(&candidate) {
            let size = meta.len();
            let key = entry.file_name().to_string_lossy().into_owned();
            if best.as_ref().map(|(s, _)| size > *s).unwrap_or(true) {
                best = Some((size, key));
            }
        }
    }
    best.map(|(_, key)| key)
}

/// Background watchdog: finalizes idle, non-empty, unmarked buckets.
pub fn spawn_watchdog(
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval_ms = coordinator.watchdog_interval_ms;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = watchdog_tick(&coordinator).await {
                        tracing::warn!("Auto-finalize tick failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Auto-finalize watchdog stopped");
    })
}

/// One watchdog pass over all domains, under the mutation lock. Ticks that
/// queue up behind a slow pass coalesce: `.done`-marked buckets are skipped.
pub async fn watchdog_tick(coordinator: &Coordinator) -> Result<usize, StorageError> {
    let _guard = coordinator.lock().await;
    let store = coordinator.store();
    let runs_root = store.paths(crate::domain::DEFAULT_DOMAIN).runs_root();
    let idle = Duration::from_millis(coordinator.idle_finalize_ms);

    let mut finalized = 0usize;
    let domains = match fs::read_dir(&runs_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::io(&runs_root, e)),
    };
    for domain_entry in domains.filter_map(|e| e.ok()) {
        if !domain_entry.path().is_dir() {
            continue;
        }
        let domain_key = domain_entry.file_name().to_string_lossy().into_owned();
        let Ok(buckets) = fs::read_dir(domain_entry.path()) else {
            continue;
        };
        for bucket_entry in buckets.filter_map(|e| e.ok()) {
            let name = bucket_entry.file_name().to_string_lossy().into_owned();
            let Some((level, run_id)) = parse_bucket_filename(&name) else {
                continue;
            };
            let bucket = bucket_entry.path();
            if done_path(&bucket).exists() {
                continue;
            }
            let Ok(meta) = fs::metadata(&bucket) else {
                continue;
            };
            if meta.len() == 0 {
                continue;
            }
            let idle_enough = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age >= idle)
                .unwrap_or(false);
            if !idle_enough {
                continue;
            }

            let paths = store.paths(&domain_key);
            match finalize_run(coordinator, &paths, level, &run_id, Config::DEFAULT_CHUNK_SIZE) {
                Ok(summary) => {
                    finalized += 1;
                    tracing::info!(
                        "Auto-finalized idle bucket {}/{} (level {}, {} records)",
                        domain_key,
                        name,
                        level,
                        summary.records
                    );
                }
                Err(e) => {
                    tracing::warn!("Auto-finalize of {}/{} failed: {}", domain_key, name, e);
                }
            }
        }
    }
    Ok(finalized)
}
