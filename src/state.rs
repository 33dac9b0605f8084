//! Per-domain persistent state: frontier cache, content-hash registry,
//! per-level download manifests, and the probe index.
//!
//! `state.json` is a cache over the artifact files; when it is missing it is
//! rebuilt from them on first load. Everything is written atomically via the
//! storage primitives and stored with project-root-relative paths.

use crate::artifacts;
use crate::domain::DomainPaths;
use crate::models::{
    now_ms, stable_uniq, DomainState, HashRecord, LevelState, ManifestEntry, ProbeEntry, TermMap,
};
use crate::storage::{self, StorageError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type Registry = BTreeMap<String, HashRecord>;
pub type ProbeIndex = BTreeMap<String, ProbeEntry>;

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, domain_key: &str) -> DomainPaths {
        DomainPaths::new(&self.root, domain_key)
    }

    /// Load the frontier state, rebuilding from artifacts when the cache
    /// file is missing but artifacts exist.
    pub fn load_state(&self, paths: &DomainPaths) -> Result<DomainState, StorageError> {
        if let Some(state) = storage::read_json_opt::<DomainState>(&paths.state_path())? {
            return Ok(state);
        }
        self.rebuild_state_from_artifacts(paths)
    }

    pub fn save_state(&self, paths: &DomainPaths, state: &DomainState) -> Result<(), StorageError> {
        storage::write_json_atomic(&paths.state_path(), state)
    }

    /// Reconstruct the frontier cache from the artifact files.
    ///
    /// `urls-level-L.json` holds the frontier fed into level L; the visited
    /// set of level L is that frontier minus `urls-level-L.remaining.json`
    /// when a remainder was recorded, else the whole frontier.
    /// `files-level-L.json` holds the files first discovered at L, and
    /// `urls-level-(L+1).json` the pages first discovered at L.
    pub fn rebuild_state_from_artifacts(
        &self,
        paths: &DomainPaths,
    ) -> Result<DomainState, StorageError> {
        let dir = paths.artifacts_dir();
        let mut levels_present: Vec<u32> = Vec::new();
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(level) = parse_level(&name, "urls-level-", ".json") {
                    levels_present.push(level);
                }
                if let Some(level) = parse_level(&name, "files-level-", ".json") {
                    levels_present.push(level);
                }
            }
        }
        levels_present.sort_unstable();
        levels_present.dedup();

        let mut state = DomainState::default();
        for level in levels_present {
            let frontier = artifacts::read_url_rows(&dir.join(artifacts::urls_level(level)))?;
            let remaining =
                artifacts::read_url_rows(&dir.join(artifacts::urls_remaining_level(level)))?;
            let remaining_set: std::collections::HashSet<&String> = remaining.iter().collect();
            let visited: Vec<String> = frontier
                .iter()
                .filter(|u| !remaining_set.contains(u))
                .cloned()
                .collect();

            let discovered_pages =
                artifacts::read_url_rows(&dir.join(artifacts::urls_level(level + 1)))?;
            let discovered_files =
                artifacts::read_file_rows(&dir.join(artifacts::files_level(level)))?;

            if visited.is_empty() && discovered_pages.is_empty() && discovered_files.is_empty() {
                continue;
            }
            state.levels.insert(
                level,
                LevelState {
                    visited: stable_uniq(visited),
                    discovered_pages: stable_uniq(discovered_pages),
                    discovered_files,
                },
            );
        }
        Ok(state)
    }

    pub fn load_registry(&self, paths: &DomainPaths) -> Result<Registry, StorageError> {
        storage::read_json_or(&paths.registry_path(), Registry::new())
    }

    pub fn save_registry(&self, paths: &DomainPaths, reg: &Registry) -> Result<(), StorageError> {
        storage::write_json_atomic(&paths.registry_path(), reg)
    }

    pub fn load_manifest(
        &self,
        paths: &DomainPaths,
        level: u32,
    ) -> Result<Vec<ManifestEntry>, StorageError> {
        storage::read_json_or(&paths.manifest_path(level), Vec::new())
    }

    pub fn save_manifest(
        &self,
        paths: &DomainPaths,
        level: u32,
        entries: &[ManifestEntry],
    ) -> Result<(), StorageError> {
        storage::write_json_atomic(&paths.manifest_path(level), &entries)
    }

    /// Append to a level manifest unless the `(sha256, saved_to)` pair is
    /// already present.
    pub fn append_manifest_entry(
        &self,
        paths: &DomainPaths,
        level: u32,
        entry: ManifestEntry,
    ) -> Result<bool, StorageError> {
        let mut entries = self.load_manifest(paths, level)?;
        if entries.iter().any(|e| *e == entry) {
            return Ok(false);
        }
        entries.push(entry);
        self.save_manifest(paths, level, &entries)?;
        Ok(true)
    }

    /// Level numbers that have a manifest on disk.
    pub fn manifest_levels(&self, paths: &DomainPaths) -> Vec<u32> {
        let mut levels = Vec::new();
        if let Ok(entries) = fs::read_dir(paths.level_files_dir()) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(level) = stem.parse::<u32>() {
                        levels.push(level);
                    }
                }
            }
        }
        levels.sort_unstable();
        levels
    }

    pub fn load_probe_index(&self, paths: &DomainPaths) -> Result<ProbeIndex, StorageError> {
        storage::read_json_or(&paths.probe_index_path(), ProbeIndex::new())
    }

    pub fn save_probe_index(
        &self,
        paths: &DomainPaths,
        index: &ProbeIndex,
    ) -> Result<(), StorageError> {
        storage::write_json_atomic(&paths.probe_index_path(), index)
    }

    pub fn load_terms(&self, paths: &DomainPaths) -> Result<TermMap, StorageError> {
        storage::read_json_or(&paths.terms_path(), TermMap::new())
    }

    pub fn save_terms(&self, paths: &DomainPaths, terms: &TermMap) -> Result<(), StorageError> {
        storage::write_json_atomic(&paths.terms_path(), terms)
    }

    /// Hard reset of one file-download level.
    ///
    /// Files whose registry record also cites another level survive; files
    /// used only at this level are deleted from disk. Sources for this level
    /// are dropped, and records left with no sources are dropped entirely.
    pub fn reset_file_level(
        &self,
        paths: &DomainPaths,
        level: u32,
    ) -> Result<LevelResetSummary, StorageError> {
        let mut registry = self.load_registry(paths)?;
        let mut deleted_files = 0usize;
        let mut kept_files = 0usize;
        let mut dropped_records = 0usize;

        let shas: Vec<String> = registry
            .values()
            .filter(|r| r.cites_level(level))
            .map(|r| r.sha256.clone())
            .collect();

        for sha in shas {
            let Some(record) = registry.get_mut(&sha) else {
                continue;
            };
            record.sources.retain(|s| s.level != level);
            if record.sources.is_empty() {
                if let Some(rel) = &record.saved_to {
                    let abs = storage::abs_from_root(&self.root, rel);
                    match fs::remove_file(&abs) {
                        Ok(()) => deleted_files += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            tracing::warn!("Level reset could not delete {}: {}", abs.display(), e)
                        }
                    }
                }
                registry.remove(&sha);
                dropped_records += 1;
            } else {
                kept_files += 1;
            }
        }

        self.save_registry(paths, &registry)?;
        let _ = fs::remove_file(paths.manifest_path(level));

        let summary = LevelResetSummary {
            level,
            deleted_files,
            kept_files,
            dropped_records,
            ts: now_ms(),
        };
        storage::append_jsonl(&paths.level_resets_log_path(), &summary)?;
        Ok(summary)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LevelResetSummary {
    pub level: u32,
    pub deleted_files: usize,
    pub kept_files: usize,
    pub dropped_records: usize,
    pub ts: i64,
}

fn parse_level(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let stem = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    // Reject diff/remaining/part variants; the plain artifact is digits only
    stem.parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactWriter;
    use crate::models::{FileCandidate, SourceObservation};
    use tempfile::TempDir;

    fn store_and_paths(dir: &TempDir) -> (StateStore, DomainPaths) {
        let store = StateStore::new(dir.path());
        let paths = store.paths("t.example");
        (store, paths)
    }

    #[test]
    fn test_state_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (store, paths) = store_and_paths(&dir);

        let mut state = DomainState::default();
        state.levels.insert(
            1,
            LevelState {
                visited: vec!["https://h/root".into()],
                discovered_pages: vec!["https://h/a".into()],
                discovered_files: vec![],
            },
        );
        store.save_state(&paths, &state).unwrap();
        let back = store.load_state(&paths).unwrap();
        assert_eq!(back.levels[&1].visited, vec!["https://h/root"]);
    }

    #[test]
    fn test_state_rebuild_from_artifacts() {
        let dir = TempDir::new().unwrap();
        let (store, paths) = store_and_paths(&dir);
        let w = ArtifactWriter::new(dir.path(), paths.artifacts_dir(), false);

        // Level 2 frontier of three pages, one left unvisited
        let frontier = vec![
            "https://h/a".to_string(),
            "https://h/b".to_string(),
            "https://h/c".to_string(),
        ];
        w.write_urls(&artifacts::urls_level(2), "urls", 2, &frontier)
            .unwrap();
        w.write_urls(
            &artifacts::urls_remaining_level(2),
            "urls-remaining",
            2,
            &["https://h/c".to_string()],
        )
        .unwrap();
        w.write_urls(
            &artifacts::urls_level(3),
            "urls",
            3,
            &["https://h/d".to_string()],
        )
        .unwrap();
        let files = vec![FileCandidate::new(
            "https://h/f.pdf".into(),
            Some("pdf".into()),
            Some("https://h/a".into()),
        )];
        w.write_files(&artifacts::files_level(2), "files", 2, &files)
            .unwrap();

        // No state.json on disk: load_state falls back to the rebuild
        let state = store.load_state(&paths).unwrap();
        let l2 = &state.levels[&2];
        assert_eq!(l2.visited, vec!["https://h/a", "https://h/b"]);
        assert_eq!(l2.discovered_pages, vec!["https://h/d"]);
        assert_eq!(l2.discovered_files, files);
    }

    #[test]
    fn test_manifest_append_dedupes() {
        let dir = TempDir::new().unwrap();
        let (store, paths) = store_and_paths(&dir);
        let entry = ManifestEntry {
            sha256: "ab".into(),
            saved_to: "downloads/t/x.pdf".into(),
        };
        assert!(store.append_manifest_entry(&paths, 2, entry.clone()).unwrap());
        assert!(!store.append_manifest_entry(&paths, 2, entry).unwrap());
        assert_eq!(store.load_manifest(&paths, 2).unwrap().len(), 1);
    }

    fn record(sha: &str, saved_to: Option<&str>, levels: &[u32]) -> HashRecord {
        HashRecord {
            sha256: sha.to_string(),
            saved_to: saved_to.map(|s| s.to_string()),
            bytes: 4,
            ext: "pdf".into(),
            term_key: "2022".into(),
            electorate_folder: None,
            first_seen_ts: 1,
            last_seen_ts: 1,
            note: None,
            sources: levels
                .iter()
                .map(|l| SourceObservation {
                    url: format!("https://h/f{l}"),
                    source_page_url: None,
                    level: *l,
                    ts: *l as i64,
                })
                .collect(),
        }
    }

    #[test]
    fn test_reset_file_level_preserves_multi_level_files() {
        let dir = TempDir::new().unwrap();
        let (store, paths) = store_and_paths(&dir);

        let only_l2 = dir.path().join("downloads/t.example/a.pdf");
        let both = dir.path().join("downloads/t.example/b.pdf");
        fs::create_dir_all(only_l2.parent().unwrap()).unwrap();
        fs::write(&only_l2, b"aaaa").unwrap();
        fs::write(&both, b"bbbb").unwrap();

        let mut reg = Registry::new();
        reg.insert(
            "a1".into(),
            record("a1", Some("downloads/t.example/a.pdf"), &[2]),
        );
        reg.insert(
            "b2".into(),
            record("b2", Some("downloads/t.example/b.pdf"), &[1, 2]),
        );
        store.save_registry(&paths, &reg).unwrap();
        store
            .save_manifest(
                &paths,
                2,
                &[ManifestEntry {
                    sha256: "a1".into(),
                    saved_to: "downloads/t.example/a.pdf".into(),
                }],
            )
            .unwrap();

        let summary = store.reset_file_level(&paths, 2).unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.kept_files, 1);
        assert_eq!(summary.dropped_records, 1);

        assert!(!only_l2.exists());
        assert!(both.exists());
        assert!(!paths.manifest_path(2).exists());

        let reg = store.load_registry(&paths).unwrap();
        assert!(!reg.contains_key("a1"));
        // The surviving record no longer cites level 2
        assert!(!reg["b2"].cites_level(2));
        assert!(reg["b2"].cites_level(1));

        // Reset is logged
        let resets: Vec<LevelResetSummary> =
            storage::read_jsonl(&paths.level_resets_log_path()).unwrap();
        assert_eq!(resets.len(), 1);
    }

    #[test]
    fn test_parse_level_rejects_variants() {
        assert_eq!(parse_level("urls-level-3.json", "urls-level-", ".json"), Some(3));
        assert_eq!(
            parse_level("urls-level-3.remaining.json", "urls-level-", ".json"),
            None
        );
        assert_eq!(
            parse_level("urls-level-3.part-0001-of-0002.json", "urls-level-", ".json"),
            None
        );
    }
}
