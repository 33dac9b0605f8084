//! Filesystem primitives shared by every persistent structure.
//!
//! This module provides:
//! - Atomic JSON writes (unique temp file in the same directory, then rename)
//! - Append-only JSONL logs with a tolerant line reader
//! - Read-with-default for optional state files
//! - Project-root-relative path bookkeeping
//! - A move helper that falls back to copy+unlink across devices

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique temp name beside `target`: PID + timestamp + monotonic counter so
/// concurrent writers in the same directory never collide.
fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let ts = chrono::Utc::now().timestamp_millis();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{}.{}.{}.{}.tmp", name, std::process::id(), ts, seq))
}

/// Write `value` as pretty-printed JSON atomically: temp file, flush+fsync,
/// rename over the target. The parent directory is created on demand.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let body = serde_json::to_string_pretty(value).map_err(|e| StorageError::json(path, e))?;

    let tmp = temp_sibling(path);
    let write_result = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(body.as_bytes())?;
        f.write_all(b"\n")?;
        f.sync_all()?;
        Ok(())
    })();
    if let Err(e) = write_result {
        // Leave the temp file behind; the next write overwrites a fresh name.
        return Err(StorageError::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

/// Write raw pre-serialized JSON text atomically (used when byte-stable
/// output matters more than re-serialization).
pub fn write_text_atomic(path: &Path, body: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let tmp = temp_sibling(path);
    let write_result = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(body.as_bytes())?;
        f.sync_all()?;
        Ok(())
    })();
    if let Err(e) = write_result {
        return Err(StorageError::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

/// Read a JSON file, returning `default` when the file does not exist.
pub fn read_json_or<T: DeserializeOwned>(path: &Path, default: T) -> Result<T, StorageError> {
    match fs::read_to_string(path) {
        Ok(body) => serde_json::from_str(&body).map_err(|e| StorageError::json(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Read a JSON file, `None` when missing.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read_to_string(path) {
        Ok(body) => serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| StorageError::json(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Append one record as a single JSON line. Creates the file and parent
/// directories on first use.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let mut line = serde_json::to_string(record).map_err(|e| StorageError::json(path, e))?;
    line.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))?;
    f.write_all(line.as_bytes())
        .map_err(|e| StorageError::io(path, e))
}

/// Read all records from a JSONL file. Missing file yields an empty vec;
/// unparseable lines are skipped with a warning rather than failing the
/// whole replay.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let reader = BufReader::new(f);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| StorageError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(rec) => out.push(rec),
            Err(e) => {
                tracing::warn!(
                    "Skipping malformed JSONL line {} in {}: {}",
                    idx + 1,
                    path.display(),
                    e
                );
            }
        }
    }
    Ok(out)
}

/// Move a file, falling back to copy+unlink when rename fails (e.g. across
/// devices). The destination directory is created on demand.
pub fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "rename {} -> {} failed ({}), falling back to copy",
                from.display(),
                to.display(),
                rename_err
            );
            fs::copy(from, to).map_err(|e| StorageError::io(to, e))?;
            fs::remove_file(from).map_err(|e| StorageError::io(from, e))
        }
    }
}

/// The `__dupN` sibling of a path: `dir/stem__dupN.ext`.
pub fn dup_sibling(path: &Path, n: u32) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name.as_str(), ""),
    };
    dir.join(format!("{stem}__dup{n}{ext}"))
}

/// First free `__dupN` sibling, scanning 1..=max. `None` when every slot is
/// occupied.
pub fn first_free_dup_sibling(path: &Path, max: u32) -> Option<PathBuf> {
    (1..=max).map(|n| dup_sibling(path, n)).find(|p| !p.exists())
}

/// Stem of a filename with any `__dupN` suffix stripped, for twin detection.
pub fn strip_dup_suffix(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    if let Some(idx) = stem.rfind("__dup") {
        let tail = &stem[idx + "__dup".len()..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return format!("{}{}", &stem[..idx], ext);
        }
    }
    format!("{stem}{ext}")
}

/// Render `path` relative to `root` with forward slashes, the form stored in
/// all persistent state.
pub fn rel_to_root(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let s = rel.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Resolve a stored root-relative path back to an absolute path.
pub fn abs_from_root(root: &Path, rel: &str) -> PathBuf {
    let p = Path::new(rel);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}
