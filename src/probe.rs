//! HEAD / ranged-GET probe ingestion and modification detection.
//!
//! The external client probes file URLs between crawls and posts the raw
//! response metadata here. A signature is derived (HEAD wins when it carries
//! any strong field), compared to the previous sighting, and changed URLs
//! are merged into the level's download-queue diff artifacts.

use crate::artifacts::{self, ArtifactWriter};
use crate::domain::DomainPaths;
use crate::models::{now_ms, FileCandidate, ProbeEntry, ProbeSignature};
use crate::state::StateStore;
use crate::storage::{self, StorageError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ProbeInput {
    /// Normalized file URL.
    pub url: String,
    pub level: Option<u32>,
    pub head: Option<Value>,
    pub get_range: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub changed: bool,
    pub signature: ProbeSignature,
}

#[derive(Debug, Serialize)]
struct ProbeLogRecord<'a> {
    ts: i64,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    head: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    get_range: Option<&'a Value>,
    signature: &'a ProbeSignature,
}

fn signature_from(value: &Value) -> ProbeSignature {
    let get_str = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    let content_length = match value.get("content_length") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    ProbeSignature {
        etag: get_str("etag"),
        last_modified: get_str("last_modified"),
        content_length,
        content_type: get_str("content_type"),
    }
}

/// Signature for one probe: HEAD wins when it carries any of etag,
/// last_modified, or content_length; otherwise the ranged GET is used.
pub fn build_signature(head: Option<&Value>, get_range: Option<&Value>) -> ProbeSignature {
    let head_sig = head.map(signature_from).unwrap_or_default();
    if head_sig.has_strong_field() {
        return head_sig;
    }
    let range_sig = get_range.map(signature_from).unwrap_or_default();
    if range_sig.is_empty() {
        head_sig
    } else {
        range_sig
    }
}

/// Ingest one probe: log it, update the index, and on a signature change
/// merge the URL into the level's diff artifacts. Runs under the global
/// mutation lock.
pub fn ingest_probe(
    store: &StateStore,
    paths: &DomainPaths,
    writer: &ArtifactWriter,
    input: ProbeInput,
) -> Result<ProbeOutcome, StorageError> {
    let signature = build_signature(input.head.as_ref(), input.get_range.as_ref());
    let ts = now_ms();

    // Raw record first, so the index is reconstructible from the log.
    storage::append_jsonl(
        &paths.probes_log_path(),
        &ProbeLogRecord {
            ts,
            url: &input.url,
            level: input.level,
            head: input.head.as_ref(),
            get_range: input.get_range.as_ref(),
            signature: &signature,
        },
    )?;

    let mut index = store.load_probe_index(paths)?;
    let changed = match index.get(&input.url) {
        Some(prev) => {
            let p = &prev.signature;
            p.etag != signature.etag
                || p.last_modified != signature.last_modified
                || p.content_length != signature.content_length
                || p.content_type != signature.content_type
        }
        None => false,
    };
    index.insert(
        input.url.clone(),
        ProbeEntry {
            last_seen_ts: ts,
            level: input.level,
            signature: signature.clone(),
            head: input.head.clone(),
            get_range: input.get_range.clone(),
        },
    );
    store.save_probe_index(paths, &index)?;

    if changed {
        if let Some(level) = input.level {
            merge_into_diffs(writer, level, &input.url)?;
        }
    }

    Ok(ProbeOutcome { changed, signature })
}

/// Append a modified URL to `files-meta-diff-level-L` and merge it into the
/// download-queue diff, resolving ext/source from the level's file artifact.
fn merge_into_diffs(
    writer: &ArtifactWriter,
    level: u32,
    url: &str,
) -> Result<(), StorageError> {
    let meta_name = artifacts::files_meta_diff_level(level);
    let mut modified = artifacts::read_url_rows(&writer.path_of(&meta_name))?;
    if !modified.iter().any(|u| u == url) {
        modified.push(url.to_string());
    }
    writer.write_modified_urls(&meta_name, level, &modified)?;

    let level_rows = artifacts::read_file_rows(&writer.path_of(&artifacts::files_level(level)))?;
    let candidate = level_rows
        .into_iter()
        .find(|f| f.url == url)
        .unwrap_or_else(|| FileCandidate::new(url.to_string(), None, None));

    let diff_name = artifacts::files_diff_level(level);
    let mut diff_rows = artifacts::read_file_rows(&writer.path_of(&diff_name))?;
    if !diff_rows.iter().any(|f| f.url == url) {
        diff_rows.push(candidate);
        writer.write_files(&diff_name, "files-diff", level, &diff_rows)?;
    }
    Ok(())
}
