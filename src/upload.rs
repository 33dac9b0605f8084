//! Upload pipeline: content-addressed persistence of downloaded file bytes.
//!
//! Bytes are hashed, routed, sniffed (expected PDFs that are not PDFs go to
//! quarantine), then written once. A SHA already in the registry only gains
//! a new source observation; the bytes on disk stay where they are, except
//! when the new routing is strictly more specific, in which case the file is
//! upgraded to the better location.

use crate::config::Config;
use crate::domain::DomainPaths;
use crate::models::{now_ms, HashRecord, ManifestEntry, SourceObservation};
use crate::routing::{Placement, RouteRequest, RoutingPolicy, UNKNOWN_TERM};
use crate::state::StateStore;
use crate::storage::{self, StorageError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;

pub const NOTE_DUPLICATE: &str = "duplicate_content_skipped";
pub const NOTE_BAD_PDF_HTML: &str = "bad_pdf_got_html";
pub const NOTE_BAD_PDF_OTHER: &str = "bad_pdf_not_pdf";

#[derive(Debug, Clone)]
pub struct UploadInput {
    /// Normalized file URL.
    pub url: String,
    pub bytes: Vec<u8>,
    pub ext: Option<String>,
    pub filename: Option<String>,
    /// Normalized referring page URL.
    pub source_page_url: Option<String>,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub sha256: String,
    pub saved_to: String,
    pub bytes: u64,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileSaveRecord<'a> {
    ts: i64,
    sha256: &'a str,
    url: &'a str,
    saved_to: &'a str,
    bytes: u64,
    level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DedupeRecord<'a> {
    ts: i64,
    sha256: &'a str,
    url: &'a str,
    saved_to: &'a str,
    level: u32,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();
    trimmed.starts_with('<') || trimmed.to_ascii_lowercase().contains("<html")
}

/// Re-route an expected-PDF payload that failed the `%PDF-` sniff into the
/// bucket's `_bad/` directory. Returns the quarantine note.
fn quarantine(placement: &mut Placement, bytes: &[u8]) -> &'static str {
    let note = if looks_like_html(bytes) {
        NOTE_BAD_PDF_HTML
    } else {
        NOTE_BAD_PDF_OTHER
    };
    let suffix_ext = if note == NOTE_BAD_PDF_HTML { "html" } else { "bin" };
    let stem = match placement.filename.rfind('.') {
        Some(dot) if dot > 0 => placement.filename[..dot].to_string(),
        _ => placement.filename.clone(),
    };
    placement.filename = format!("{stem}__{note}.{suffix_ext}");
    match &placement.bucket {
        Some(_) => placement.sub_bucket = Some("_bad".to_string()),
        None => placement.bucket = Some("_bad".to_string()),
    }
    note
}

/// Persist one uploaded file. Runs under the global mutation lock.
pub fn handle_upload(
    store: &StateStore,
    paths: &DomainPaths,
    policy: &dyn RoutingPolicy,
    terms: &crate::models::TermMap,
    input: UploadInput,
) -> Result<UploadReceipt, StorageError> {
    let sha = sha256_hex(&input.bytes);
    let ts = now_ms();
    let size = input.bytes.len() as u64;

    let mut placement = policy.route(
        &RouteRequest {
            file_url: &input.url,
            source_page_url: input.source_page_url.as_deref(),
            ext: input.ext.as_deref(),
            filename_override: input.filename.as_deref(),
        },
        terms,
    );

    let expects_pdf =
        placement.ext == "pdf" || placement.filename.to_ascii_lowercase().ends_with(".pdf");
    let mut note: Option<String> = None;
    if expects_pdf && !input.bytes.starts_with(b"%PDF-") {
        note = Some(quarantine(&mut placement, &input.bytes).to_string());
    }

    if placement.bucket.is_none() {
        tracing::info!(
            "No bucket inferred for {}; placing at the domain root",
            input.url
        );
    }

    let root = store.root();
    let desired_abs = placement.out_path(&paths.downloads_dir());

    let mut registry = store.load_registry(paths)?;
    let obs = SourceObservation {
        url: input.url.clone(),
        source_page_url: input.source_page_url.clone(),
        level: input.level,
        ts,
    };

    let existing_present = registry
        .get(&sha)
        .and_then(|r| r.saved_to.as_ref())
        .map(|rel| storage::abs_from_root(root, rel).is_file())
        .unwrap_or(false);

    let receipt = if existing_present {
        // Duplicate content: keep the canonical bytes, maybe upgrade their
        // placement, record the new provenance.
        let record = registry.get_mut(&sha).expect("checked above");
        record.last_seen_ts = ts;

        let current_rel = record.saved_to.clone().expect("checked above");
        let current_abs = storage::abs_from_root(root, &current_rel);
        let more_specific = (record.term_key == UNKNOWN_TERM
            && placement.term_key != UNKNOWN_TERM)
            || (placement.sub_bucket.is_some() && record.electorate_folder.is_none());
        if more_specific && desired_abs != current_abs && !desired_abs.exists() {
            storage::move_file(&current_abs, &desired_abs)?;
            record.saved_to = Some(storage::rel_to_root(root, &desired_abs));
            record.term_key = placement.term_key.clone();
            record.electorate_folder = placement.electorate_folder.clone();
            tracing::info!(
                "Upgraded placement of {}: {} -> {}",
                &sha[..8],
                current_rel,
                record.saved_to.as_deref().unwrap_or("")
            );
        }
        record.add_source(obs);

        let saved_to = record.saved_to.clone().unwrap_or_default();
        storage::append_jsonl(
            &paths.dedupe_log_path(),
            &DedupeRecord {
                ts,
                sha256: &sha,
                url: &input.url,
                saved_to: &saved_to,
                level: input.level,
            },
        )?;
        UploadReceipt {
            sha256: sha.clone(),
            saved_to,
            bytes: size,
            skipped: true,
            note: Some(NOTE_DUPLICATE.to_string()),
        }
    } else {
        // Fresh bytes (or a record whose file vanished): write at the routed
        // location, suffixing when another file already owns the name.
        let target = if desired_abs.exists() {
            storage::first_free_dup_sibling(&desired_abs, Config::DUP_SUFFIX_MAX)
                .unwrap_or_else(|| desired_abs.clone())
        } else {
            desired_abs.clone()
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        fs::write(&target, &input.bytes).map_err(|e| StorageError::io(&target, e))?;
        let rel = storage::rel_to_root(root, &target);

        match registry.get_mut(&sha) {
            Some(record) => {
                // Record identity and source history survive a vanished file
                record.saved_to = Some(rel.clone());
                record.bytes = size;
                record.ext = placement.ext.clone();
                record.term_key = placement.term_key.clone();
                record.electorate_folder = placement.electorate_folder.clone();
                record.last_seen_ts = ts;
                if note.is_some() {
                    record.note = note.clone();
                }
                record.add_source(obs);
            }
            None => {
                registry.insert(
                    sha.clone(),
                    HashRecord {
                        sha256: sha.clone(),
                        saved_to: Some(rel.clone()),
                        bytes: size,
                        ext: placement.ext.clone(),
                        term_key: placement.term_key.clone(),
                        electorate_folder: placement.electorate_folder.clone(),
                        first_seen_ts: ts,
                        last_seen_ts: ts,
                        note: note.clone(),
                        sources: vec![obs],
                    },
                );
            }
        }
        UploadReceipt {
            sha256: sha.clone(),
            saved_to: rel,
            bytes: size,
            skipped: false,
            note: note.clone(),
        }
    };

    store.save_registry(paths, &registry)?;
    store.append_manifest_entry(
        paths,
        input.level,
        ManifestEntry {
            sha256: sha.clone(),
            saved_to: receipt.saved_to.clone(),
        },
    )?;
    storage::append_jsonl(
        &paths.file_saves_log_path(),
        &FileSaveRecord {
            ts,
            sha256: &sha,
            url: &input.url,
            saved_to: &receipt.saved_to,
            bytes: size,
            level: input.level,
            note: receipt.note.as_deref(),
        },
    )?;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TermEntry, TermMap};
    use crate::routing::ElectoralPolicy;
    use tempfile::TempDir;

    fn terms() -> TermMap {
        let mut map = TermMap::new();
        let mut t = TermEntry::default();
        t.official_order.insert("1".into(), "Cook".into());
        t.rebuild_alphabetical();
        map.insert("2022".into(), t);
        map
    }

    fn upload(
        store: &StateStore,
        paths: &DomainPaths,
        url: &str,
        bytes: &[u8],
        level: u32,
    ) -> UploadReceipt {
        handle_upload(
            store,
            paths,
            &ElectoralPolicy,
            &terms(),
            UploadInput {
                url: url.to_string(),
                bytes: bytes.to_vec(),
                ext: None,
                filename: None,
                source_page_url: None,
                level,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_upload_lands_in_bucket() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let receipt = upload(&store, &paths, "https://h/2022/Cook/booths.csv", b"a,b\n1,2\n", 1);
        assert!(!receipt.skipped);
        assert_eq!(
            receipt.saved_to,
            "downloads/h.example/2022/Cook/booths.csv"
        );
        assert!(dir.path().join(&receipt.saved_to).is_file());

        let reg = store.load_registry(&paths).unwrap();
        let rec = &reg[&receipt.sha256];
        assert_eq!(rec.term_key, "2022");
        assert_eq!(rec.electorate_folder.as_deref(), Some("Cook"));
        assert_eq!(rec.sources.len(), 1);

        let manifest = store.load_manifest(&paths, 1).unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_duplicate_content_is_skipped_with_provenance() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let r1 = upload(&store, &paths, "https://h/2022/Cook/a.csv", b"same-bytes", 1);
        let r2 = upload(&store, &paths, "https://h/2022/Cook/b.csv", b"same-bytes", 2);

        assert!(!r1.skipped);
        assert!(r2.skipped);
        assert_eq!(r2.note.as_deref(), Some(NOTE_DUPLICATE));
        assert_eq!(r1.sha256, r2.sha256);
        // One file on disk, two source observations
        assert_eq!(r2.saved_to, r1.saved_to);
        let reg = store.load_registry(&paths).unwrap();
        assert_eq!(reg[&r1.sha256].sources.len(), 2);
        // Both level manifests cite the sha
        assert_eq!(store.load_manifest(&paths, 1).unwrap().len(), 1);
        assert_eq!(store.load_manifest(&paths, 2).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_upload_is_idempotent_per_source() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        upload(&store, &paths, "https://h/2022/a.csv", b"x", 1);
        upload(&store, &paths, "https://h/2022/a.csv", b"x", 1);
        let reg = store.load_registry(&paths).unwrap();
        let rec = reg.values().next().unwrap();
        assert_eq!(rec.sources.len(), 1);
    }

    #[test]
    fn test_placement_upgrade_moves_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        // First sighting has no electorate context
        let r1 = upload(&store, &paths, "https://h/2022/misc.csv", b"payload", 1);
        assert_eq!(r1.saved_to, "downloads/h.example/2022/misc.csv");

        // Same bytes later seen under an electorate folder
        let r2 = upload(&store, &paths, "https://h/2022/Cook/misc.csv", b"payload", 2);
        assert!(r2.skipped);
        assert_eq!(r2.saved_to, "downloads/h.example/2022/Cook/misc.csv");
        assert!(dir.path().join(&r2.saved_to).is_file());
        assert!(!dir.path().join(&r1.saved_to).exists());
    }

    #[test]
    fn test_pdf_quarantine_html() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let receipt = upload(
            &store,
            &paths,
            "https://h/2022/report.pdf",
            b"<html><body>error page</body></html>",
            1,
        );
        assert!(!receipt.skipped);
        assert_eq!(receipt.note.as_deref(), Some(NOTE_BAD_PDF_HTML));
        assert!(receipt.saved_to.contains("/_bad/"));
        assert!(receipt.saved_to.ends_with("report__bad_pdf_got_html.html"));

        let reg = store.load_registry(&paths).unwrap();
        assert_eq!(
            reg[&receipt.sha256].note.as_deref(),
            Some(NOTE_BAD_PDF_HTML)
        );
    }

    #[test]
    fn test_pdf_quarantine_binary() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let receipt = upload(&store, &paths, "https://h/2022/report.pdf", &[0u8, 1, 2, 3], 1);
        assert_eq!(receipt.note.as_deref(), Some(NOTE_BAD_PDF_OTHER));
        assert!(receipt.saved_to.ends_with("report__bad_pdf_not_pdf.bin"));
    }

    #[test]
    fn test_real_pdf_is_not_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let receipt = upload(&store, &paths, "https://h/2022/report.pdf", b"%PDF-1.7 ...", 1);
        assert!(receipt.note.is_none());
        assert!(receipt.saved_to.ends_with("/2022/report.pdf"));
    }

    #[test]
    fn test_name_collision_gets_dup_suffix() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        upload(&store, &paths, "https://h/2022/data.csv", b"one", 1);
        let r2 = upload(&store, &paths, "https://h/2022/other/../data.csv", b"two", 1);
        // Different bytes, same routed name: second file gets a suffix
        assert!(r2.saved_to.ends_with("data__dup1.csv"), "{}", r2.saved_to);
        assert!(dir.path().join(&r2.saved_to).is_file());
    }

    #[test]
    fn test_vanished_file_rewritten_preserving_history() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let paths = store.paths("h.example");

        let r1 = upload(&store, &paths, "https://h/2022/gone.csv", b"bytes", 1);
        std::fs::remove_file(dir.path().join(&r1.saved_to)).unwrap();

        let r2 = upload(&store, &paths, "https://h/2022/gone2.csv", b"bytes", 3);
        assert!(!r2.skipped);
        assert!(r2.saved_to.ends_with("gone2.csv"));
        let reg = store.load_registry(&paths).unwrap();
        let rec = &reg[&r1.sha256];
        // Source history survived the rewrite
        assert_eq!(rec.sources.len(), 2);
        assert!(rec.cites_level(1));
        assert!(rec.cites_level(3));
    }
}
