//! Placement engine: maps a file URL (plus its referring page and the
//! per-domain term metadata) to a directory bucket, optional sub-bucket,
//! and a safe filename under `downloads/<domain>/`.
//!
//! The electoral policy shipped here interprets term keys as election
//! years and sub-buckets as electorate folders. Other domains plug in a
//! different [`RoutingPolicy`] with the same signature; the rest of the
//! sink only sees the trait.

use crate::config::Config;
use crate::models::TermMap;
use crate::url_norm;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use url::Url;

pub const UNKNOWN_TERM: &str = "unknown";
pub const FALLBACK_FILENAME: &str = "download.bin";

#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub file_url: &'a str,
    pub source_page_url: Option<&'a str>,
    pub ext: Option<&'a str>,
    pub filename_override: Option<&'a str>,
}

/// Where a file belongs. `bucket: None` is the unrouted sentinel: the file
/// lands directly under `downloads/<domain>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub bucket: Option<String>,
    pub sub_bucket: Option<String>,
    pub filename: String,
    pub ext: String,
    pub term_key: String,
    pub electorate_folder: Option<String>,
}

impl Placement {
    pub fn out_path(&self, downloads_dir: &Path) -> PathBuf {
        let mut path = downloads_dir.to_path_buf();
        if let Some(bucket) = &self.bucket {
            path.push(bucket);
            if let Some(sub) = &self.sub_bucket {
                path.push(sub);
            }
        }
        path.join(&self.filename)
    }
}

/// Pure placement function; same inputs, same outputs.
pub trait RoutingPolicy: Send + Sync {
    fn route(&self, req: &RouteRequest<'_>, terms: &TermMap) -> Placement;
}

/// Decode one level of percent-encoding, and a second level when the first
/// pass still left an encoded name (double-encoded links are common in
/// result listings).
fn decode_component(raw: &str) -> String {
    let once = percent_decode_str(raw).decode_utf8_lossy().into_owned();
    if once.contains('%') {
        let twice = percent_decode_str(&once).decode_utf8_lossy().into_owned();
        if twice != once {
            return twice;
        }
    }
    once
}

/// Filename sanitizer: path separators become `_`, control characters are
/// dropped, length is capped in UTF-16 code units.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut units = 0usize;
    for c in name.chars() {
        let c = match c {
            '/' | '\\' => '_',
            c if c.is_control() => continue,
            c => c,
        };
        let w = c.len_utf16();
        if units + w > Config::FILENAME_MAX_UTF16 {
            break;
        }
        units += w;
        out.push(c);
    }
    out
}

/// Derive the output filename: explicit override, else the URL path
/// basename (decoded, possibly twice), else `download.bin`.
pub fn derive_filename(req: &RouteRequest<'_>) -> String {
    if let Some(name) = req.filename_override {
        let name = sanitize_filename(name.trim());
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(url) = Url::parse(req.file_url) {
        if let Some(segments) = url.path_segments() {
            if let Some(last) = segments.filter(|s| !s.is_empty()).last() {
                let name = sanitize_filename(&decode_component(last));
                if !name.is_empty() {
                    return name;
                }
            }
        }
    }
    FALLBACK_FILENAME.to_string()
}

/// Routing policy for electoral result sites: term keys are election years,
/// sub-buckets are electorate folders from the term metadata.
#[derive(Debug, Default, Clone)]
pub struct ElectoralPolicy;

impl ElectoralPolicy {
    fn term_for_year(&self, year: i32, terms: &TermMap) -> Option<String> {
        let mut best: Option<(i32, &String)> = None;
        for key in terms.keys() {
            if let Ok(y) = key.parse::<i32>() {
                if y <= year && best.map_or(true, |(b, _)| y > b) {
                    best = Some((y, key));
                }
            }
        }
        // Federal terms run on a 3-year cadence; a year more than one term
        // past the newest known key is out of range.
        match best {
            Some((y, key)) if year - y < 3 => Some(key.clone()),
            _ => None,
        }
    }

    fn infer_term(&self, req: &RouteRequest<'_>, terms: &TermMap) -> Option<String> {
        // Exact path-segment match against a known term key wins.
        for candidate in [Some(req.file_url), req.source_page_url].into_iter().flatten() {
            for seg in path_segments_decoded(candidate) {
                if terms.keys().any(|k| k.eq_ignore_ascii_case(&seg)) {
                    return terms
                        .keys()
                        .find(|k| k.eq_ignore_ascii_case(&seg))
                        .cloned();
                }
            }
        }
        // A full date in the URL disambiguates files published around an
        // event boundary better than a bare year.
        for candidate in [Some(req.file_url), req.source_page_url].into_iter().flatten() {
            if let Some(year) = find_date_year(candidate) {
                if let Some(term) = self.term_for_year(year, terms) {
                    return Some(term);
                }
            }
        }
        for candidate in [Some(req.file_url), req.source_page_url].into_iter().flatten() {
            if let Some(year) = find_bare_year(candidate) {
                if let Some(term) = self.term_for_year(year, terms) {
                    return Some(term);
                }
            }
        }
        None
    }

    fn infer_electorate(
        &self,
        req: &RouteRequest<'_>,
        term_key: &str,
        terms: &TermMap,
    ) -> Option<String> {
        let entry = terms.get(term_key)?;
        for candidate in [Some(req.file_url), req.source_page_url].into_iter().flatten() {
            for seg in path_segments_decoded(candidate) {
                let norm = fold_name(&seg);
                if norm.is_empty() {
                    continue;
                }
                for name in entry.official_order.values() {
                    if fold_name(name) == norm {
                        return Some(name.clone());
                    }
                }
            }
        }
        None
    }
}

impl RoutingPolicy for ElectoralPolicy {
    fn route(&self, req: &RouteRequest<'_>, terms: &TermMap) -> Placement {
        let ext = req
            .ext
            .filter(|e| !e.is_empty())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| url_norm::extension(req.file_url));
        let filename = derive_filename(req);

        // Event-class fallbacks trump term buckets.
        let haystack = format!(
            "{} {}",
            req.file_url.to_ascii_lowercase(),
            req.source_page_url.unwrap_or("").to_ascii_lowercase()
        );
        if haystack.contains("by-election") || haystack.contains("byelection") {
            return Placement {
                bucket: Some("by-elections".to_string()),
                sub_bucket: None,
                filename,
                ext,
                term_key: UNKNOWN_TERM.to_string(),
                electorate_folder: None,
            };
        }
        if haystack.contains("referend") {
            return Placement {
                bucket: Some("referenda".to_string()),
                sub_bucket: None,
                filename,
                ext,
                term_key: UNKNOWN_TERM.to_string(),
                electorate_folder: None,
            };
        }

        match self.infer_term(req, terms) {
            Some(term_key) => {
                let electorate = self.infer_electorate(req, &term_key, terms);
                let sub_bucket = electorate.as_deref().map(folder_name);
                Placement {
                    bucket: Some(term_key.clone()),
                    sub_bucket,
                    filename,
                    ext,
                    term_key,
                    electorate_folder: electorate,
                }
            }
            None => Placement {
                bucket: None,
                sub_bucket: None,
                filename,
                ext,
                term_key: UNKNOWN_TERM.to_string(),
                electorate_folder: None,
            },
        }
    }
}

fn path_segments_decoded(url: &str) -> Vec<String> {
    match Url::parse(url) {
        Ok(u) => u
            .path_segments()
            .map(|segs| {
                segs.filter(|s| !s.is_empty())
                    .map(decode_component)
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Case/fold comparison key for electorate names: lowercase with the usual
/// separator variants unified to single spaces.
fn fold_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_space = false;
    for c in lowered.chars() {
        if c == '-' || c == '_' || c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    // Strip a filename extension so "curtin.csv" still matches
    if let Some(dot) = out.rfind('.') {
        let ext = &out[dot + 1..];
        if !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            out.truncate(dot);
        }
    }
    out
}

fn folder_name(name: &str) -> String {
    sanitize_filename(name)
}

/// Year from a full date (`YYYY-MM-DD` or `YYYYMMDD`) appearing anywhere in
/// the string, validated as a plausible calendar date.
fn find_date_year(s: &str) -> Option<i32> {
    let bytes = s.as_bytes();
    let digit = |i: usize| bytes.get(i).map(|b| b.is_ascii_digit()).unwrap_or(false);
    for i in 0..bytes.len() {
        if !digit(i) {
            continue;
        }
        // YYYY-MM-DD
        if digit(i + 1) && digit(i + 2) && digit(i + 3) && bytes.get(i + 4) == Some(&b'-') {
            if digit(i + 5) && digit(i + 6) && bytes.get(i + 7) == Some(&b'-') && digit(i + 8) && digit(i + 9) {
                if let Some(year) = parse_date_parts(&s[i..i + 4], &s[i + 5..i + 7], &s[i + 8..i + 10]) {
                    return Some(year);
                }
            }
        }
        // YYYYMMDD
        if (i..i + 8).all(|j| digit(j)) && !digit(i + 8) && (i == 0 || !digit(i - 1)) {
            if let Some(year) = parse_date_parts(&s[i..i + 4], &s[i + 4..i + 6], &s[i + 6..i + 8]) {
                return Some(year);
            }
        }
    }
    None
}

fn parse_date_parts(y: &str, m: &str, d: &str) -> Option<i32> {
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    let day: u32 = d.parse().ok()?;
    if (1900..2100).contains(&year) && (1..=12).contains(&month) && (1..=31).contains(&day) {
        Some(year)
    } else {
        None
    }
}

/// First plausible standalone year (19xx/20xx) in the string.
fn find_bare_year(s: &str) -> Option<i32> {
    let bytes = s.as_bytes();
    let digit = |i: usize| bytes.get(i).map(|b| b.is_ascii_digit()).unwrap_or(false);
    for i in 0..bytes.len().saturating_sub(3) {
        if digit(i) && digit(i + 1) && digit(i + 2) && digit(i + 3) && !digit(i + 4) && (i == 0 || !digit(i - 1)) {
            if let Ok(year) = s[i..i + 4].parse::<i32>() {
                if (1900..2100).contains(&year) {
                    return Some(year);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TermEntry;

    fn terms() -> TermMap {
        let mut map = TermMap::new();
        let mut t2019 = TermEntry::default();
        t2019.official_order.insert("1".into(), "Adelaide".into());
        t2019.official_order.insert("2".into(), "Curtin".into());
        t2019.rebuild_alphabetical();
        map.insert("2019".into(), t2019);
        let mut t2022 = TermEntry::default();
        t2022.official_order.insert("1".into(), "Adelaide".into());
        t2022.official_order.insert("2".into(), "Cook".into());
        t2022.rebuild_alphabetical();
        map.insert("2022".into(), t2022);
        map
    }

    fn route(url: &str, source: Option<&str>) -> Placement {
        ElectoralPolicy.route(
            &RouteRequest {
                file_url: url,
                source_page_url: source,
                ext: None,
                filename_override: None,
            },
            &terms(),
        )
    }

    #[test]
    fn test_term_from_path_segment() {
        let p = route("https://h/results/2022/first-prefs.csv", None);
        assert_eq!(p.bucket.as_deref(), Some("2022"));
        assert_eq!(p.term_key, "2022");
        assert_eq!(p.filename, "first-prefs.csv");
        assert_eq!(p.ext, "csv");
    }

    #[test]
    fn test_term_from_year_cadence() {
        // 2023 falls inside the 2022 term window
        let p = route("https://h/results/tally-2023.csv", None);
        assert_eq!(p.bucket.as_deref(), Some("2022"));
        // 2027 is past the newest term plus cadence
        let p = route("https://h/results/tally-2027.csv", None);
        assert_eq!(p.bucket, None);
        assert_eq!(p.term_key, UNKNOWN_TERM);
    }

    #[test]
    fn test_full_date_beats_bare_year() {
        // Listing page is full of other years; the dated filename decides
        let p = route(
            "https://h/dl/2019-05-18-declaration.pdf",
            Some("https://h/archive/2022/index"),
        );
        assert_eq!(p.bucket.as_deref(), Some("2019"));
    }

    #[test]
    fn test_electorate_sub_bucket() {
        let p = route("https://h/2022/Cook/booths.csv", None);
        assert_eq!(p.sub_bucket.as_deref(), Some("Cook"));
        assert_eq!(p.electorate_folder.as_deref(), Some("Cook"));
        // Case and separators fold
        let p = route("https://h/2019/cur-tin/x.csv", None);
        assert_eq!(p.sub_bucket, None); // "cur tin" != "curtin"
        let p = route("https://h/2019/CURTIN/x.csv", None);
        assert_eq!(p.sub_bucket.as_deref(), Some("Curtin"));
    }

    #[test]
    fn test_fallback_buckets() {
        let p = route("https://h/by-election/2022/res.csv", None);
        assert_eq!(p.bucket.as_deref(), Some("by-elections"));
        let p = route("https://h/referendum/2023/res.csv", None);
        assert_eq!(p.bucket.as_deref(), Some("referenda"));
    }

    #[test]
    fn test_unrouted_sentinel_places_at_root() {
        let p = route("https://h/misc/file.bin", None);
        assert_eq!(p.bucket, None);
        assert_eq!(
            p.out_path(Path::new("/d/downloads/h")),
            Path::new("/d/downloads/h/file.bin")
        );
    }

    #[test]
    fn test_filename_override_and_decoding() {
        let p = ElectoralPolicy.route(
            &RouteRequest {
                file_url: "https://h/2022/report%2520final.pdf",
                source_page_url: None,
                ext: None,
                filename_override: None,
            },
            &terms(),
        );
        // Double-encoded space recovered
        assert_eq!(p.filename, "report final.pdf");

        let p = ElectoralPolicy.route(
            &RouteRequest {
                file_url: "https://h/2022/x.pdf",
                source_page_url: None,
                ext: None,
                filename_override: Some("nice name.pdf"),
            },
            &terms(),
        );
        assert_eq!(p.filename, "nice name.pdf");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c.pdf"), "a_b_c.pdf");
        assert_eq!(sanitize_filename("ctrl\u{0007}char"), "ctrlchar");
        let long = "x".repeat(500);
        assert!(sanitize_filename(&long).encode_utf16().count() <= Config::FILENAME_MAX_UTF16);
    }

    #[test]
    fn test_route_is_pure() {
        let a = route("https://h/2022/Cook/booths.csv", Some("https://h/2022/"));
        let b = route("https://h/2022/Cook/booths.csv", Some("https://h/2022/"));
        assert_eq!(a, b);
    }
}
