//! Per-level artifact files: the canonical, human-readable record of what a
//! crawl discovered.
//!
//! Two row encodings exist. The default packs the artifact metadata into the
//! first real row (`_meta: true` plus `level`/`kind`/`count`), keeping the
//! remaining rows minimal; the legacy shape repeats `level` and `kind` on
//! every row. Readers must treat row 0 as a real data row in both shapes —
//! its extra keys are metadata, not a header to skip.
//!
//! Artifact content is deterministic: identical input rows produce
//! byte-identical files, so recrawl diffs are exact.

use crate::config::Config;
use crate::models::FileCandidate;
use crate::storage::{self, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub fn urls_level(level: u32) -> String {
    format!("urls-level-{level}.json")
}

pub fn urls_remaining_level(level: u32) -> String {
    format!("urls-level-{level}.remaining.json")
}

pub fn files_level(level: u32) -> String {
    format!("files-level-{level}.json")
}

pub fn files_remaining_level(level: u32) -> String {
    format!("files-level-{level}.remaining.json")
}

pub fn urls_diff_level(level: u32) -> String {
    format!("urls-diff-level-{level}.json")
}

pub fn urls_removed_level(level: u32) -> String {
    format!("urls-removed-level-{level}.json")
}

pub fn files_diff_level(level: u32) -> String {
    format!("files-diff-level-{level}.json")
}

pub fn files_removed_level(level: u32) -> String {
    format!("files-removed-level-{level}.json")
}

pub fn files_meta_diff_level(level: u32) -> String {
    format!("files-meta-diff-level-{level}.json")
}

/// Writes artifacts for one domain.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    artifacts_dir: PathBuf,
    root: PathBuf,
    legacy: bool,
}

impl ArtifactWriter {
    pub fn new(root: &Path, artifacts_dir: PathBuf, legacy: bool) -> Self {
        Self {
            artifacts_dir,
            root: root.to_path_buf(),
            legacy,
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.artifacts_dir.join(name)
    }

    fn encode(&self, kind: &str, level: u32, mut rows: Vec<Map<String, Value>>) -> Value {
        if self.legacy {
            for row in &mut rows {
                row.insert("level".to_string(), Value::from(level));
                row.insert("kind".to_string(), Value::from(kind));
            }
            return Value::Array(rows.into_iter().map(Value::Object).collect());
        }
        let count = rows.len();
        let mut out = Vec::with_capacity(count);
        for (i, row) in rows.into_iter().enumerate() {
            if i == 0 {
                // Meta keys lead, then the first real row's own fields.
                let mut meta = Map::new();
                meta.insert("_meta".to_string(), Value::Bool(true));
                meta.insert("level".to_string(), Value::from(level));
                meta.insert("kind".to_string(), Value::from(kind));
                meta.insert("count".to_string(), Value::from(count));
                for (k, v) in row {
                    meta.entry(k).or_insert(v);
                }
                out.push(Value::Object(meta));
            } else {
                out.push(Value::Object(row));
            }
        }
        Value::Array(out)
    }

    fn write_rows(
        &self,
        name: &str,
        kind: &str,
        level: u32,
        rows: Vec<Map<String, Value>>,
    ) -> Result<PathBuf, StorageError> {
        let path = self.path_of(name);
        let body = serde_json::to_string_pretty(&self.encode(kind, level, rows))
            .map_err(|e| StorageError::json(&path, e))?;
        storage::write_text_atomic(&path, &body)?;
        Ok(path)
    }

    pub fn write_urls(
        &self,
        name: &str,
        kind: &str,
        level: u32,
        urls: &[String],
    ) -> Result<PathBuf, StorageError> {
        let rows = urls.iter().map(|u| url_row(u)).collect();
        self.write_rows(name, kind, level, rows)
    }

    pub fn write_files(
        &self,
        name: &str,
        kind: &str,
        level: u32,
        files: &[FileCandidate],
    ) -> Result<PathBuf, StorageError> {
        let rows = files.iter().map(file_row).collect();
        self.write_rows(name, kind, level, rows)
    }

    /// Rows marked `"modified"` for the probe meta-diff artifact.
    pub fn write_modified_urls(
        &self,
        name: &str,
        level: u32,
        urls: &[String],
    ) -> Result<PathBuf, StorageError> {
        let rows = urls
            .iter()
            .map(|u| {
                let mut row = url_row(u);
                row.insert("status".to_string(), Value::from("modified"));
                row
            })
            .collect();
        self.write_rows(name, "files-meta-diff", level, rows)
    }

    /// Chunk `rows` under the artifact base name (e.g. `urls-level-3.json`
    /// yields `urls-level-3.part-0001-of-000N.json` siblings plus a
    /// `urls-level-3.parts.json` manifest). Empty input removes any stale
    /// parts and manifest from a previous run.
    pub fn write_chunked(
        &self,
        base_name: &str,
        kind: &str,
        level: u32,
        rows: Vec<Map<String, Value>>,
        chunk_size: usize,
    ) -> Result<ChunkManifest, StorageError> {
        let chunk_size = chunk_size.max(1);
        let stem = base_name.strip_suffix(".json").unwrap_or(base_name);
        self.remove_parts(stem)?;

        let manifest_path = self.path_of(&format!("{stem}.parts.json"));
        if rows.is_empty() {
            let _ = fs::remove_file(&manifest_path);
            return Ok(ChunkManifest {
                kind: kind.to_string(),
                level,
                chunk_size,
                total: 0,
                parts: Vec::new(),
            });
        }

        let chunks: Vec<&[Map<String, Value>]> = rows.chunks(chunk_size).collect();
        let n = chunks.len();
        let width = Config::CHUNK_PAD_WIDTH.max(n.to_string().len());

        let mut parts = Vec::with_capacity(n);
        for (i, chunk) in chunks.iter().enumerate() {
            let index = i + 1;
            let name = format!(
                "{stem}.part-{index:0width$}-of-{n:0width$}.json",
                index = index,
                n = n,
                width = width
            );
            let path = self.path_of(&name);
            let values: Vec<Value> = chunk.iter().cloned().map(Value::Object).collect();
            let body = serde_json::to_string_pretty(&values)
                .map_err(|e| StorageError::json(&path, e))?;
            storage::write_text_atomic(&path, &body)?;
            parts.push(ChunkPart {
                index,
                path: storage::rel_to_root(&self.root, &path),
                count: chunk.len(),
            });
        }

        let manifest = ChunkManifest {
            kind: kind.to_string(),
            level,
            chunk_size,
            total: rows.len(),
            parts,
        };
        storage::write_json_atomic(&manifest_path, &manifest)?;
        Ok(manifest)
    }

    pub fn chunk_urls(
        &self,
        base_name: &str,
        kind: &str,
        level: u32,
        urls: &[String],
        chunk_size: usize,
    ) -> Result<ChunkManifest, StorageError> {
        let rows = urls.iter().map(|u| url_row(u)).collect();
        self.write_chunked(base_name, kind, level, rows, chunk_size)
    }

    pub fn chunk_files(
        &self,
        base_name: &str,
        kind: &str,
        level: u32,
        files: &[FileCandidate],
        chunk_size: usize,
    ) -> Result<ChunkManifest, StorageError> {
        let rows = files.iter().map(file_row).collect();
        self.write_chunked(base_name, kind, level, rows, chunk_size)
    }

    fn remove_parts(&self, stem: &str) -> Result<(), StorageError> {
        let prefix = format!("{stem}.part-");
        let dir = &self.artifacts_dir;
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPart {
    pub index: usize,
    pub path: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub kind: String,
    pub level: u32,
    pub chunk_size: usize,
    pub total: usize,
    pub parts: Vec<ChunkPart>,
}

pub fn url_row(url: &str) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("url".to_string(), Value::from(url));
    row
}

pub fn file_row(f: &FileCandidate) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("url".to_string(), Value::from(f.url.as_str()));
    row.insert("ext".to_string(), Value::from(f.ext.as_str()));
    if let Some(src) = &f.source_page_url {
        row.insert("source_page_url".to_string(), Value::from(src.as_str()));
    }
    row
}

/// Levels that have a plain `files-level-<L>.json` artifact in `dir`.
pub fn file_artifact_levels(dir: &Path) -> Vec<u32> {
    let mut levels = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name
                .strip_prefix("files-level-")
                .and_then(|s| s.strip_suffix(".json"))
            {
                if let Ok(level) = stem.parse::<u32>() {
                    levels.push(level);
                }
            }
        }
    }
    levels.sort_unstable();
    levels
}

/// Read URL rows from an artifact, in order. Row 0 is a real row whatever
/// metadata keys it carries; plain-string rows are also accepted.
/// Missing file reads as empty.
pub fn read_url_rows(path: &Path) -> Result<Vec<String>, StorageError> {
    let rows: Option<Vec<Value>> = storage::read_json_opt(path)?;
    let mut out = Vec::new();
    for row in rows.unwrap_or_default() {
        match row {
            Value::String(s) => out.push(s),
            Value::Object(map) => {
                if let Some(Value::String(u)) = map.get("url") {
                    out.push(u.clone());
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Read file rows from an artifact. Metadata keys on row 0 are ignored;
/// a missing `ext` is derived from the URL.
pub fn read_file_rows(path: &Path) -> Result<Vec<FileCandidate>, StorageError> {
    let rows: Option<Vec<Value>> = storage::read_json_opt(path)?;
    let mut out = Vec::new();
    for row in rows.unwrap_or_default() {
        let Value::Object(map) = row else { continue };
        let Some(Value::String(url)) = map.get("url") else {
            continue;
        };
        let ext = match map.get("ext") {
            Some(Value::String(e)) if !e.is_empty() => Some(e.clone()),
            _ => None,
        };
        let source = match map.get("source_page_url") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        out.push(FileCandidate::new(url.clone(), ext, source));
    }
    Ok(out)
}
