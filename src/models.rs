//! Core records shared across the sink: frontier state, the content-hash
//! registry, manifests, probes, and routing-policy metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current timestamp in epoch milliseconds, the `ts` unit everywhere.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Keep the first occurrence of every string, preserving order.
pub fn stable_uniq<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// A file URL discovered while fetching a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCandidate {
    /// Normalized URL; the unique key.
    pub url: String,
    /// Lowercase extension, `"bin"` when none could be derived.
    #[serde(default = "default_ext")]
    pub ext: String,
    /// Normalized URL of the page the file link was found on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page_url: Option<String>,
}

fn default_ext() -> String {
    "bin".to_string()
}

impl FileCandidate {
    pub fn new(url: String, ext: Option<String>, source_page_url: Option<String>) -> Self {
        let ext = ext
            .filter(|e| !e.is_empty())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| crate::url_norm::extension(&url));
        Self {
            url,
            ext,
            source_page_url,
        }
    }

    /// Merge another observation of the same URL: prefer a known source page
    /// and a real extension over `"bin"`.
    pub fn absorb(&mut self, other: &FileCandidate) {
        if self.source_page_url.is_none() && other.source_page_url.is_some() {
            self.source_page_url = other.source_page_url.clone();
        }
        if self.ext == "bin" && other.ext != "bin" {
            self.ext = other.ext.clone();
        }
    }
}

/// Merge candidates by URL, first occurrence wins position, later
/// observations can only fill in missing detail.
pub fn merge_candidates(items: impl IntoIterator<Item = FileCandidate>) -> Vec<FileCandidate> {
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut out: Vec<FileCandidate> = Vec::new();
    for cand in items {
        match index.get(&cand.url) {
            Some(&i) => out[i].absorb(&cand),
            None => {
                index.insert(cand.url.clone(), out.len());
                out.push(cand);
            }
        }
    }
    out
}

/// One crawl observation of a content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceObservation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page_url: Option<String>,
    pub level: u32,
    pub ts: i64,
}

impl SourceObservation {
    /// Identity inside a record's source list.
    pub fn key(&self) -> (String, Option<String>, u32) {
        (self.url.clone(), self.source_page_url.clone(), self.level)
    }
}

/// Registry entry for one SHA-256 of downloaded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRecord {
    pub sha256: String,
    /// Path relative to the project root; absent for registration
    /// placeholders whose bytes never landed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
    pub bytes: u64,
    pub ext: String,
    #[serde(rename = "termKey")]
    pub term_key: String,
    #[serde(
        rename = "electorateFolder",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub electorate_folder: Option<String>,
    pub first_seen_ts: i64,
    pub last_seen_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceObservation>,
}

impl HashRecord {
    /// Append a source observation unless the `(url, source, level)` triple
    /// is already present. Returns true when something was added.
    pub fn add_source(&mut self, obs: SourceObservation) -> bool {
        if self.sources.iter().any(|s| s.key() == obs.key()) {
            return false;
        }
        self.sources.push(obs);
        true
    }

    /// Most recent observation by `ts`, else the first recorded.
    pub fn best_source(&self) -> Option<&SourceObservation> {
        self.sources
            .iter()
            .max_by_key(|s| s.ts)
            .or_else(|| self.sources.first())
    }

    /// Whether any source cites the given level.
    pub fn cites_level(&self, level: u32) -> bool {
        self.sources.iter().any(|s| s.level == level)
    }
}

/// Frontier bookkeeping for one level. `discovered_pages` and
/// `discovered_files` hold only the entries first seen at this level, so the
/// union over lower levels is exactly everything already seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelState {
    #[serde(default)]
    pub visited: Vec<String>,
    #[serde(default)]
    pub discovered_pages: Vec<String>,
    #[serde(default)]
    pub discovered_files: Vec<FileCandidate>,
}

/// Per-domain frontier state. A cache over the artifact files; can be
/// rebuilt from them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainState {
    #[serde(default)]
    pub levels: BTreeMap<u32, LevelState>,
    /// Selects the legacy artifact row shape for this domain.
    #[serde(default)]
    pub legacy_artifacts: bool,
}

impl DomainState {
    /// Union of everything seen strictly below `level`: visited pages,
    /// discovered pages, and discovered file URLs.
    pub fn seen_before(&self, level: u32) -> std::collections::HashSet<String> {
        let mut seen = std::collections::HashSet::new();
        for (l, ls) in &self.levels {
            if *l >= level {
                break;
            }
            seen.extend(ls.visited.iter().cloned());
            seen.extend(ls.discovered_pages.iter().cloned());
            seen.extend(ls.discovered_files.iter().map(|f| f.url.clone()));
        }
        seen
    }
}

/// One `{sha256, saved_to}` row in a per-level download manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub sha256: String,
    pub saved_to: String,
}

/// Probe signature derived from HEAD / ranged-GET metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeSignature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl ProbeSignature {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none()
            && self.last_modified.is_none()
            && self.content_length.is_none()
            && self.content_type.is_none()
    }

    /// HEAD is authoritative when it carries any strong field.
    pub fn has_strong_field(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some() || self.content_length.is_some()
    }
}

/// Per-URL entry in the probe index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeEntry {
    pub last_seen_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    pub signature: ProbeSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_range: Option<serde_json::Value>,
}

/// Routing-policy metadata for one term: directory ordinals and the derived
/// alphabetical ranking of names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermEntry {
    /// ordinal (as string) -> official name
    #[serde(default)]
    pub official_order: BTreeMap<String, String>,
    /// name -> alphabetical rank, rebuilt from `official_order` on upsert
    #[serde(default)]
    pub alphabetical_order: BTreeMap<String, u32>,
}

impl TermEntry {
    /// Rebuild `alphabetical_order` from the official names, ranked by a
    /// case-insensitive sort.
    pub fn rebuild_alphabetical(&mut self) {
        let mut names: Vec<&String> = self.official_order.values().collect();
        names.sort_by_key(|n| n.to_lowercase());
        names.dedup();
        self.alphabetical_order = names
            .into_iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32 + 1))
            .collect();
    }
}

/// TermKey -> metadata, the whole policy map for one domain.
pub type TermMap = BTreeMap<String, TermEntry>;
