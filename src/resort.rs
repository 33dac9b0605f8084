//! Reconciliation between the content-hash registry and the download tree.
//!
//! Routing rules evolve; operators move files by hand. A resort pass walks
//! the registry and re-derives every record's canonical placement, then
//! sweeps the tree for orphans. Outcomes per entry:
//!
//! - `move`      the canonical location was free; the file moved there
//! - `dedupe`    two locations held the same bytes; one survives
//! - `displace`  a non-canonical occupant was suffixed aside
//! - `dup`       the incoming file itself was suffixed (occupant canonical)
//! - `promote`   an orphan filled in a missing canonical file
//! - `adopt`     an orphan became the canonical file of a placeholder record
//!
//! Dry-run is the default; apply mode performs the filesystem and registry
//! mutations. A second apply pass is a fixed point.

use crate::config::Config;
use crate::domain::DomainPaths;
use crate::models::now_ms;
use crate::routing::{RouteRequest, RoutingPolicy};
use crate::state::{Registry, StateStore};
use crate::storage::{self, StorageError};
use crate::upload::sha256_hex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Suffix,
    Skip,
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suffix" => Ok(Self::Suffix),
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResortOptions {
    pub apply: bool,
    pub conflict: ConflictPolicy,
    /// Cap on registry entries examined in the registry-driven phase.
    pub limit: Option<usize>,
}

impl Default for ResortOptions {
    fn default() -> Self {
        Self {
            apply: false,
            conflict: ConflictPolicy::Suffix,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResortAction {
    pub ts: i64,
    pub kind: String,
    pub dry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Default)]
pub struct ResortReport {
    pub actions: Vec<ResortAction>,
    pub counts: BTreeMap<String, usize>,
}

impl ResortReport {
    fn push(&mut self, action: ResortAction) {
        *self.counts.entry(action.kind.clone()).or_default() += 1;
        trace_action(&action);
        self.actions.push(action);
    }

    pub fn count(&self, kind: &str) -> usize {
        self.counts.get(kind).copied().unwrap_or(0)
    }
}

fn trace_action(action: &ResortAction) {
    let tag = if action.dry {
        "DRY".to_string()
    } else {
        action.kind.to_uppercase()
    };
    let sha8 = action
        .sha256
        .as_deref()
        .map(|s| &s[..s.len().min(8)])
        .unwrap_or("--------");
    match (&action.from, &action.to) {
        (Some(from), Some(to)) => {
            println!("[{tag}] {} {sha8}\u{2026} {from}", action.kind);
            println!("           -> {to}");
        }
        (Some(from), None) => println!("[{tag}] {} {sha8}\u{2026} {from}", action.kind),
        _ => println!(
            "[{tag}] {} {sha8}\u{2026} {}",
            action.kind,
            action.note.as_deref().unwrap_or("")
        ),
    }
}

fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    Ok(sha256_hex(&fs::read(path)?))
}

/// Whether `candidate` is a `__dupN` sibling of `canonical`.
fn is_dup_variant(candidate: &Path, canonical: &Path) -> bool {
    if candidate.parent() != canonical.parent() || candidate == canonical {
        return false;
    }
    match (candidate.file_name(), canonical.file_name()) {
        (Some(c), Some(k)) => {
            let c = c.to_string_lossy();
            c != k.to_string_lossy()
                && storage::strip_dup_suffix(&c) == k.to_string_lossy()
        }
        _ => false,
    }
}

/// Run one reconciliation pass for a domain.
pub fn run_resort(
    store: &StateStore,
    paths: &DomainPaths,
    policy: &dyn RoutingPolicy,
    opts: ResortOptions,
) -> Result<ResortReport, StorageError> {
    let root = store.root();
    let terms = store.load_terms(paths)?;
    let mut registry = store.load_registry(paths)?;
    let mut report = ResortReport::default();
    let downloads = paths.downloads_dir();
    // sha -> new relative path, for the manifest rewrite at the end
    let mut relocated: HashMap<String, String> = HashMap::new();
    let mut registry_dirty = false;

    // ---- Phase A: registry-driven walk ----
    let shas: Vec<String> = registry.keys().cloned().collect();
    let examined = match opts.limit {
        Some(n) => &shas[..shas.len().min(n)],
        None => &shas[..],
    };

    for sha in examined {
        let Some(record) = registry.get(sha).cloned() else {
            continue;
        };
        let ts = now_ms();

        let Some(current_rel) = record.saved_to.clone() else {
            report.push(ResortAction {
                ts,
                kind: "missing".into(),
                dry: !opts.apply,
                sha256: Some(sha.clone()),
                from: None,
                to: None,
                note: Some("no saved_to".into()),
            });
            continue;
        };
        let current_abs = storage::abs_from_root(root, &current_rel);
        if !current_abs.is_file() {
            report.push(ResortAction {
                ts,
                kind: "missing".into(),
                dry: !opts.apply,
                sha256: Some(sha.clone()),
                from: Some(current_rel.clone()),
                to: None,
                note: Some("file not on disk".into()),
            });
            continue;
        }

        let Some(best) = record.best_source().cloned() else {
            continue;
        };
        let basename = current_abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let placement = policy.route(
            &RouteRequest {
                file_url: &best.url,
                source_page_url: best.source_page_url.as_deref(),
                ext: Some(&record.ext),
                filename_override: Some(&basename),
            },
            &terms,
        );
        let desired_abs = placement.out_path(&downloads);
        let desired_rel = storage::rel_to_root(root, &desired_abs);

        if desired_abs == current_abs {
            // Placement already canonical; refresh derived fields.
            if let Some(rec) = registry.get_mut(sha) {
                if rec.term_key != placement.term_key
                    || rec.electorate_folder != placement.electorate_folder
                {
                    rec.term_key = placement.term_key.clone();
                    rec.electorate_folder = placement.electorate_folder.clone();
                    registry_dirty = true;
                }
            }
            continue;
        }

        if !desired_abs.exists() {
            if opts.apply {
                storage::move_file(&current_abs, &desired_abs)?;
                finish_relocation(
                    &mut registry,
                    sha,
                    &desired_rel,
                    &placement.term_key,
                    placement.electorate_folder.as_deref(),
                );
                relocated.insert(sha.clone(), desired_rel.clone());
                registry_dirty = true;
            }
            report.push(ResortAction {
                ts,
                kind: "move".into(),
                dry: !opts.apply,
                sha256: Some(sha.clone()),
                from: Some(current_rel),
                to: Some(desired_rel),
                note: None,
            });
            continue;
        }

        // Occupied target: hash the occupant to decide.
        let occupant_sha = match hash_file(&desired_abs) {
            Ok(h) => h,
            Err(e) => {
                report.push(ResortAction {
                    ts,
                    kind: "hash_error".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(desired_rel.clone()),
                    to: None,
                    note: Some(e.to_string()),
                });
                continue;
            }
        };

        if occupant_sha == *sha {
            // Same bytes in two places: the canonical path wins, the extra
            // copy goes away.
            if opts.apply {
                fs::remove_file(&current_abs).map_err(|e| StorageError::io(&current_abs, e))?;
                finish_relocation(
                    &mut registry,
                    sha,
                    &desired_rel,
                    &placement.term_key,
                    placement.electorate_folder.as_deref(),
                );
                relocated.insert(sha.clone(), desired_rel.clone());
                registry_dirty = true;
            }
            report.push(ResortAction {
                ts,
                kind: "dedupe".into(),
                dry: !opts.apply,
                sha256: Some(sha.clone()),
                from: Some(current_rel),
                to: Some(desired_rel),
                note: None,
            });
            continue;
        }

        // Occupant holds different bytes. It wins only when the registry
        // says this exact path is where its own best source routes to.
        let occupant_wins = registry
            .get(&occupant_sha)
            .and_then(|occ| {
                let occ_best = occ.best_source()?;
                let occ_basename = desired_abs
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let occ_placement = policy.route(
                    &RouteRequest {
                        file_url: &occ_best.url,
                        source_page_url: occ_best.source_page_url.as_deref(),
                        ext: Some(&occ.ext),
                        filename_override: Some(&occ_basename),
                    },
                    &terms,
                );
                Some(occ_placement.out_path(&downloads) == desired_abs)
            })
            .unwrap_or(false);

        if !occupant_wins {
            // Rule A: suffix the occupant aside, take the canonical name.
            let Some(slot) = storage::first_free_dup_sibling(&desired_abs, Config::DUP_SUFFIX_MAX)
            else {
                report.push(ResortAction {
                    ts,
                    kind: "conflict_skip".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(current_rel),
                    to: Some(desired_rel),
                    note: Some("dup suffixes exhausted".into()),
                });
                continue;
            };
            let slot_rel = storage::rel_to_root(root, &slot);
            if opts.apply {
                storage::move_file(&desired_abs, &slot)?;
                storage::move_file(&current_abs, &desired_abs)?;
                if let Some(occ) = registry.get_mut(&occupant_sha) {
                    if occ.saved_to.as_deref() == Some(desired_rel.as_str()) {
                        occ.saved_to = Some(slot_rel.clone());
                        relocated.insert(occupant_sha.clone(), slot_rel.clone());
                    }
                }
                finish_relocation(
                    &mut registry,
                    sha,
                    &desired_rel,
                    &placement.term_key,
                    placement.electorate_folder.as_deref(),
                );
                relocated.insert(sha.clone(), desired_rel.clone());
                registry_dirty = true;
            }
            report.push(ResortAction {
                ts,
                kind: "displace".into(),
                dry: !opts.apply,
                sha256: Some(sha.clone()),
                from: Some(current_rel),
                to: Some(desired_rel),
                note: Some(format!("occupant -> {slot_rel}")),
            });
            continue;
        }

        // Rule B: the occupant is canonical; this file is the residual.
        if is_dup_variant(&current_abs, &desired_abs) {
            // Already parked in a dup slot next to the canonical file.
            continue;
        }
        match opts.conflict {
            ConflictPolicy::Skip => {
                report.push(ResortAction {
                    ts,
                    kind: "conflict_skip".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(current_rel),
                    to: Some(desired_rel),
                    note: Some("occupant canonical".into()),
                });
            }
            ConflictPolicy::Overwrite => {
                if opts.apply {
                    fs::remove_file(&desired_abs)
                        .map_err(|e| StorageError::io(&desired_abs, e))?;
                    storage::move_file(&current_abs, &desired_abs)?;
                    if let Some(occ) = registry.get_mut(&occupant_sha) {
                        if occ.saved_to.as_deref() == Some(desired_rel.as_str()) {
                            occ.saved_to = None;
                        }
                    }
                    finish_relocation(
                        &mut registry,
                        sha,
                        &desired_rel,
                        &placement.term_key,
                        placement.electorate_folder.as_deref(),
                    );
                    relocated.insert(sha.clone(), desired_rel.clone());
                    registry_dirty = true;
                }
                report.push(ResortAction {
                    ts,
                    kind: "overwrite".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(current_rel),
                    to: Some(desired_rel),
                    note: None,
                });
            }
            ConflictPolicy::Suffix => {
                let Some(slot) =
                    storage::first_free_dup_sibling(&desired_abs, Config::DUP_SUFFIX_MAX)
                else {
                    report.push(ResortAction {
                        ts,
                        kind: "conflict_skip".into(),
                        dry: !opts.apply,
                        sha256: Some(sha.clone()),
                        from: Some(current_rel),
                        to: Some(desired_rel),
                        note: Some("dup suffixes exhausted".into()),
                    });
                    continue;
                };
                let slot_rel = storage::rel_to_root(root, &slot);
                if opts.apply {
                    storage::move_file(&current_abs, &slot)?;
                    finish_relocation(
                        &mut registry,
                        sha,
                        &slot_rel,
                        &placement.term_key,
                        placement.electorate_folder.as_deref(),
                    );
                    relocated.insert(sha.clone(), slot_rel.clone());
                    registry_dirty = true;
                }
                report.push(ResortAction {
                    ts,
                    kind: "dup".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(current_rel),
                    to: Some(slot_rel),
                    note: Some("occupant canonical".into()),
                });
            }
        }
    }

    // ---- Phase B: disk-driven sweep ----
    let referenced: HashSet<PathBuf> = registry
        .values()
        .filter_map(|r| r.saved_to.as_deref())
        .map(|rel| storage::abs_from_root(root, rel))
        .collect();

    let mut strays: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(&downloads).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && !referenced.contains(entry.path()) {
            strays.push(entry.into_path());
        }
    }
    strays.sort();

    for stray in strays {
        let ts = now_ms();
        let stray_rel = storage::rel_to_root(root, &stray);
        let sha = match hash_file(&stray) {
            Ok(h) => h,
            Err(e) => {
                report.push(ResortAction {
                    ts,
                    kind: "hash_error".into(),
                    dry: !opts.apply,
                    sha256: None,
                    from: Some(stray_rel),
                    to: None,
                    note: Some(e.to_string()),
                });
                continue;
            }
        };

        if let Some(rec) = registry.get_mut(&sha) {
            match rec.saved_to.clone() {
                Some(rel) => {
                    let canonical = storage::abs_from_root(root, &rel);
                    if canonical.is_file() {
                        // Canonical copy exists elsewhere; the stray is a
                        // disk-level duplicate.
                        if opts.apply {
                            fs::remove_file(&stray).map_err(|e| StorageError::io(&stray, e))?;
                        }
                        report.push(ResortAction {
                            ts,
                            kind: "dedupe".into(),
                            dry: !opts.apply,
                            sha256: Some(sha.clone()),
                            from: Some(stray_rel),
                            to: Some(rel),
                            note: Some("disk duplicate".into()),
                        });
                    } else {
                        if opts.apply {
                            storage::move_file(&stray, &canonical)?;
                        }
                        report.push(ResortAction {
                            ts,
                            kind: "promote".into(),
                            dry: !opts.apply,
                            sha256: Some(sha.clone()),
                            from: Some(stray_rel),
                            to: Some(rel),
                            note: None,
                        });
                    }
                }
                None => {
                    if opts.apply {
                        rec.saved_to = Some(stray_rel.clone());
                        rec.last_seen_ts = ts;
                        registry_dirty = true;
                    }
                    report.push(ResortAction {
                        ts,
                        kind: "adopt".into(),
                        dry: !opts.apply,
                        sha256: Some(sha.clone()),
                        from: Some(stray_rel.clone()),
                        to: Some(stray_rel),
                        note: None,
                    });
                }
            }
            continue;
        }

        // Unindexed bytes: left alone unless a twin sits beside them.
        let name = stray
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name != storage::strip_dup_suffix(&name) {
            // Already suffixed; stable.
            continue;
        }
        let has_twin = stray
            .parent()
            .and_then(|dir| fs::read_dir(dir).ok())
            .map(|entries| {
                entries.filter_map(|e| e.ok()).any(|e| {
                    let sib = e.file_name().to_string_lossy().into_owned();
                    e.path() != stray && storage::strip_dup_suffix(&sib) == name
                })
            })
            .unwrap_or(false);
        if has_twin {
            if let Some(slot) = storage::first_free_dup_sibling(&stray, Config::DUP_SUFFIX_MAX) {
                let slot_rel = storage::rel_to_root(root, &slot);
                if opts.apply {
                    storage::move_file(&stray, &slot)?;
                }
                report.push(ResortAction {
                    ts,
                    kind: "dup".into(),
                    dry: !opts.apply,
                    sha256: Some(sha.clone()),
                    from: Some(stray_rel),
                    to: Some(slot_rel),
                    note: Some("unindexed twin".into()),
                });
            }
        }
    }

    // ---- Persist outcomes ----
    // A dry run leaves the disk untouched, audit log included.
    if opts.apply {
        if registry_dirty {
            store.save_registry(paths, &registry)?;
        }
        rewrite_manifests(store, paths, &relocated)?;
        for action in &report.actions {
            storage::append_jsonl(&paths.dedupe_log_path(), action)?;
        }
    }
    Ok(report)
}

fn finish_relocation(
    registry: &mut Registry,
    sha: &str,
    new_rel: &str,
    term_key: &str,
    electorate: Option<&str>,
) {
    if let Some(rec) = registry.get_mut(sha) {
        rec.saved_to = Some(new_rel.to_string());
        rec.term_key = term_key.to_string();
        rec.electorate_folder = electorate.map(|s| s.to_string());
        let ts = now_ms();
        if rec.first_seen_ts == 0 {
            rec.first_seen_ts = ts;
        }
        rec.last_seen_ts = ts;
    }
}

/// Point every level manifest at the post-resort path for each relocated
/// SHA, dropping rows that became exact duplicates.
fn rewrite_manifests(
    store: &StateStore,
    paths: &DomainPaths,
    relocated: &HashMap<String, String>,
) -> Result<(), StorageError> {
    if relocated.is_empty() {
        return Ok(());
    }
    for level in store.manifest_levels(paths) {
        let mut entries = store.load_manifest(paths, level)?;
        let mut changed = false;
        for entry in &mut entries {
            if let Some(new_rel) = relocated.get(&entry.sha256) {
                if entry.saved_to != *new_rel {
                    entry.saved_to = new_rel.clone();
                    changed = true;
                }
            }
        }
        if changed {
            let mut seen = HashSet::new();
            entries.retain(|e| seen.insert((e.sha256.clone(), e.saved_to.clone())));
            store.save_manifest(paths, level, &entries)?;
        }
    }
    Ok(())
}
