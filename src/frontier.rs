//! BFS frontier bookkeeping across partial runs.
//!
//! A level's call carries what was visited and what those visits discovered.
//! Everything already seen at lower levels is subtracted, the novel
//! remainder is merged into state, and the per-level artifacts (plus diffs
//! against the previous recrawl, when requested) are rewritten.

use crate::artifacts::{self, ArtifactWriter};
use crate::domain::DomainPaths;
use crate::models::{merge_candidates, stable_uniq, FileCandidate, LevelState};
use crate::state::StateStore;
use crate::storage::StorageError;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Diff against the previous artifacts and emit `*-diff-*` /
    /// `*-removed-*` companions.
    pub update: bool,
    /// With `update`: patch adds into the main artifact instead of
    /// overwriting it, so partial part-runs stay non-destructive.
    pub patch: bool,
    /// With `patch`: also apply removals to the main artifact.
    pub prune: bool,
    /// Overwrite the stored level instead of merging into it.
    pub replace: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeSummary {
    pub level: u32,
    pub visited: usize,
    pub pages_in: usize,
    pub files_in: usize,
    pub next_frontier_total: usize,
    pub files_total: usize,
    pub urls_added: usize,
    pub urls_removed: usize,
    pub files_added: usize,
    pub files_removed: usize,
}

/// Merge one level's discoveries into state and rewrite its artifacts.
/// All URL-bearing inputs must already be normalized.
#[allow(clippy::too_many_arguments)]
pub fn merge_level(
    store: &StateStore,
    paths: &DomainPaths,
    writer: &ArtifactWriter,
    level: u32,
    visited: Vec<String>,
    pages: Vec<String>,
    files: Vec<FileCandidate>,
    opts: MergeOptions,
    chunk_size: usize,
) -> Result<MergeSummary, StorageError> {
    let mut state = store.load_state(paths)?;

    let visited = stable_uniq(visited);
    let pages = stable_uniq(pages);
    let files = merge_candidates(files);
    let pages_in = pages.len();
    let files_in = files.len();

    let seen_prior = state.seen_before(level);
    let visited_set: HashSet<&String> = visited.iter().collect();

    // Novel pages: not seen below this level, and not a seed repeated in
    // this level's own visited set.
    let novel_pages: Vec<String> = pages
        .into_iter()
        .filter(|p| !seen_prior.contains(p) && !visited_set.contains(p))
        .collect();
    let novel_files: Vec<FileCandidate> = files
        .into_iter()
        .filter(|f| !seen_prior.contains(&f.url))
        .collect();

    let merged = if opts.replace {
        LevelState {
            visited,
            discovered_pages: novel_pages,
            discovered_files: novel_files,
        }
    } else {
        let existing = state.levels.remove(&level).unwrap_or_default();
        LevelState {
            visited: stable_uniq(existing.visited.into_iter().chain(visited)),
            discovered_pages: stable_uniq(
                existing.discovered_pages.into_iter().chain(novel_pages),
            ),
            discovered_files: merge_candidates(
                existing.discovered_files.into_iter().chain(novel_files),
            ),
        }
    };

    let visited_count = merged.visited.len();
    state.levels.insert(level, merged.clone());
    store.save_state(paths, &state)?;

    write_level_artifacts(writer, level, &merged, opts, chunk_size)
        .map(|(urls_added, urls_removed, files_added, files_removed)| MergeSummary {
            level,
            visited: visited_count,
            pages_in,
            files_in,
            next_frontier_total: merged.discovered_pages.len(),
            files_total: merged.discovered_files.len(),
            urls_added,
            urls_removed,
            files_added,
            files_removed,
        })
}

/// Rewrite the main artifacts for a level, emitting diffs in update mode.
/// Returns (urls_added, urls_removed, files_added, files_removed).
fn write_level_artifacts(
    writer: &ArtifactWriter,
    level: u32,
    merged: &LevelState,
    opts: MergeOptions,
    chunk_size: usize,
) -> Result<(usize, usize, usize, usize), StorageError> {
    let urls_name = artifacts::urls_level(level + 1);
    let files_name = artifacts::files_level(level);

    let mut out_urls = merged.discovered_pages.clone();
    let mut out_files = merged.discovered_files.clone();
    let mut counts = (0usize, 0usize, 0usize, 0usize);

    if opts.update {
        let old_urls = artifacts::read_url_rows(&writer.path_of(&urls_name))?;
        let old_files = artifacts::read_file_rows(&writer.path_of(&files_name))?;

        let new_url_set: HashSet<&String> = out_urls.iter().collect();
        let old_url_set: HashSet<&String> = old_urls.iter().collect();
        let urls_added: Vec<String> = out_urls
            .iter()
            .filter(|u| !old_url_set.contains(*u))
            .cloned()
            .collect();
        let urls_removed: Vec<String> = old_urls
            .iter()
            .filter(|u| !new_url_set.contains(*u))
            .cloned()
            .collect();

        let new_file_urls: HashSet<&String> = out_files.iter().map(|f| &f.url).collect();
        let old_file_urls: HashSet<&String> = old_files.iter().map(|f| &f.url).collect();
        let files_added: Vec<FileCandidate> = out_files
            .iter()
            .filter(|f| !old_file_urls.contains(&f.url))
            .cloned()
            .collect();
        let files_removed: Vec<FileCandidate> = old_files
            .iter()
            .filter(|f| !new_file_urls.contains(&f.url))
            .cloned()
            .collect();

        writer.write_urls(
            &artifacts::urls_diff_level(level + 1),
            "urls-diff",
            level + 1,
            &urls_added,
        )?;
        writer.write_urls(
            &artifacts::urls_removed_level(level + 1),
            "urls-removed",
            level + 1,
            &urls_removed,
        )?;
        writer.write_files(
            &artifacts::files_diff_level(level),
            "files-diff",
            level,
            &files_added,
        )?;
        writer.write_files(
            &artifacts::files_removed_level(level),
            "files-removed",
            level,
            &files_removed,
        )?;

        if opts.patch {
            // Patch: previous artifact rows stay put, adds are appended.
            let mut patched = stable_uniq(old_urls.into_iter().chain(urls_added.iter().cloned()));
            let mut patched_files =
                merge_candidates(old_files.into_iter().chain(files_added.iter().cloned()));
            if opts.prune {
                let removed_set: HashSet<&String> = urls_removed.iter().collect();
                patched.retain(|u| !removed_set.contains(u));
                let removed_files: HashSet<&String> =
                    files_removed.iter().map(|f| &f.url).collect();
                patched_files.retain(|f| !removed_files.contains(&f.url));
            }
            out_urls = patched;
            out_files = patched_files;
        }

        counts = (
            urls_added.len(),
            urls_removed.len(),
            files_added.len(),
            files_removed.len(),
        );
    }

    writer.write_urls(&urls_name, "urls", level + 1, &out_urls)?;
    writer.write_files(&files_name, "files", level, &out_files)?;
    writer.chunk_urls(&urls_name, "urls", level + 1, &out_urls, chunk_size)?;
    writer.chunk_files(&files_name, "files", level, &out_files, chunk_size)?;

    Ok(counts)
}
