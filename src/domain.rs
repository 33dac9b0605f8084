//! Domain namespace resolution and the per-domain directory layout.
//!
//! Every piece of persistent state is scoped by a filesystem-safe domain
//! key derived from the host the crawl is working. The layout under the
//! project root is fixed:
//!
//! ```text
//! BFS_crawl/_meta/<domain>/          state, registry, probe index, artifacts
//! BFS_crawl/runs/<domain>/           streaming buckets + append-only logs
//! downloads/<domain>/<bucket>/...    routed file payloads
//! ```

use crate::url_norm;
use std::path::{Path, PathBuf};

pub const DEFAULT_DOMAIN: &str = "default";

/// Filesystem-safe key for a host: lowercase, `www.` stripped, anything
/// outside `[a-z0-9.-]` replaced with `_`, leading/trailing underscores
/// trimmed. Empty input maps to `"default"`.
pub fn key_from_host(host: &str) -> String {
    let lower = host.trim().to_ascii_lowercase();
    let stripped = lower.strip_prefix("www.").unwrap_or(&lower);
    let mut key: String = stripped
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    key = key.trim_matches('_').to_string();
    if key.is_empty() {
        DEFAULT_DOMAIN.to_string()
    } else {
        key
    }
}

/// Domain key for a URL, `None` when the URL has no parseable host.
pub fn key_for_url(url: &str) -> Option<String> {
    url_norm::host_of(url).map(|h| key_from_host(&h))
}

/// Resolve the domain key for one request. `explicit` wins; otherwise the
/// first URL candidate with a parseable host, in caller-supplied precedence
/// order; otherwise `"default"`.
pub fn resolve_key<'a>(
    explicit: Option<&str>,
    url_candidates: impl IntoIterator<Item = Option<&'a str>>,
) -> String {
    if let Some(d) = explicit {
        let d = d.trim();
        if !d.is_empty() {
            return key_from_host(d);
        }
    }
    for cand in url_candidates.into_iter().flatten() {
        if let Some(key) = key_for_url(cand) {
            return key;
        }
    }
    DEFAULT_DOMAIN.to_string()
}

/// All paths for one `(project root, domain)` namespace.
#[derive(Debug, Clone)]
pub struct DomainPaths {
    root: PathBuf,
    key: String,
}

impl DomainPaths {
    pub fn new(root: &Path, key: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("BFS_crawl").join("_meta").join(&self.key)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.meta_dir().join("artifacts")
    }

    pub fn level_files_dir(&self) -> PathBuf {
        self.meta_dir().join("level_files")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("BFS_crawl").join("runs").join(&self.key)
    }

    /// Parent of all per-domain runs directories, for cross-domain bucket
    /// lookup.
    pub fn runs_root(&self) -> PathBuf {
        self.root.join("BFS_crawl").join("runs")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads").join(&self.key)
    }

    pub fn state_path(&self) -> PathBuf {
        self.meta_dir().join("state.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.meta_dir().join("downloaded_hash_index.json")
    }

    pub fn probe_index_path(&self) -> PathBuf {
        self.meta_dir().join("probe_meta_index.json")
    }

    pub fn terms_path(&self) -> PathBuf {
        self.meta_dir().join("electorates_by_term.json")
    }

    pub fn terms_log_path(&self) -> PathBuf {
        self.meta_dir().join("electorates_by_term.jsonl")
    }

    pub fn level_resets_log_path(&self) -> PathBuf {
        self.meta_dir().join("level_resets.jsonl")
    }

    pub fn probes_log_path(&self) -> PathBuf {
        self.meta_dir().join("meta_probes.jsonl")
    }

    pub fn manifest_path(&self, level: u32) -> PathBuf {
        self.level_files_dir().join(format!("{level}.json"))
    }

    pub fn dedupe_log_path(&self) -> PathBuf {
        self.runs_dir().join("dedupe_log.jsonl")
    }

    pub fn file_saves_log_path(&self) -> PathBuf {
        self.runs_dir().join("file_saves.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_host() {
        assert_eq!(key_from_host("www.Results.Example.COM"), "results.example.com");
        assert_eq!(key_from_host("host:8080"), "host_8080");
        assert_eq!(key_from_host("__weird__"), "weird");
        assert_eq!(key_from_host(""), "default");
        assert_eq!(key_from_host("***"), "default");
    }

    #[test]
    fn test_key_for_url() {
        assert_eq!(
            key_for_url("https://www.vote.example/results"),
            Some("vote.example".to_string())
        );
        assert_eq!(key_for_url("not-a-url"), None);
    }

    #[test]
    fn test_resolve_precedence() {
        // Explicit wins over URLs
        assert_eq!(
            resolve_key(Some("a.example"), [Some("https://b.example/")]),
            "a.example"
        );
        // First parseable URL wins
        assert_eq!(
            resolve_key(None, [None, Some("junk"), Some("https://c.example/x")]),
            "c.example"
        );
        // Nothing resolvable
        assert_eq!(resolve_key(None, [None, Some("junk")]), "default");
    }

    #[test]
    fn test_layout_paths() {
        let p = DomainPaths::new(Path::new("/srv/sink"), "vote.example");
        assert_eq!(
            p.state_path(),
            Path::new("/srv/sink/BFS_crawl/_meta/vote.example/state.json")
        );
        assert_eq!(
            p.manifest_path(4),
            Path::new("/srv/sink/BFS_crawl/_meta/vote.example/level_files/4.json")
        );
        assert_eq!(
            p.dedupe_log_path(),
            Path::new("/srv/sink/BFS_crawl/runs/vote.example/dedupe_log.jsonl")
        );
        assert_eq!(p.downloads_dir(), Path::new("/srv/sink/downloads/vote.example"));
    }
}
