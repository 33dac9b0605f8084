//! URL canonicalization for every URL-bearing field that enters the sink.
//!
//! Crawled markup leaks HTML entities into hrefs (`&amp;` chains, sometimes
//! double-encoded), repeats identical query pairs, and mixes `/index.html`
//! with bare directory URLs. Everything is folded to one canonical form
//! before it touches state, so set membership works on strings.

use crate::config::Config;
use url::Url;

/// Iteratively strip HTML-entity leakage until a fixed point (capped).
fn clean_entities(input: &str) -> String {
    let mut s = input.trim().to_string();
    for _ in 0..Config::ENTITY_CLEANUP_MAX_PASSES {
        let next = s
            .replace("%26amp%3B", "&")
            .replace("&amp;", "&")
            .replace("amp%3B", "")
            .replace("amp;", "");
        if next == s {
            break;
        }
        s = next;
    }
    s
}

/// Canonicalize a URL.
///
/// - entity cleanup to a fixed point
/// - fragment cleared
/// - trailing `/index.html` folded to `/`
/// - runs of `/` in the path collapsed
/// - query pairs deduplicated, first occurrence wins, order preserved
///
/// Unparseable input is returned trimmed and entity-cleaned; normalization
/// is idempotent either way.
pub fn normalize(raw: &str) -> String {
    let cleaned = clean_entities(raw);
    let mut url = match Url::parse(&cleaned) {
        Ok(u) => u,
        Err(_) => return cleaned,
    };

    url.set_fragment(None);

    let mut path = url.path().to_string();
    if path.ends_with("/index.html") {
        path.truncate(path.len() - "index.html".len());
    }
    path = collapse_slashes(&path);
    url.set_path(&path);

    match url.query() {
        Some(q) if !q.is_empty() => {
            let deduped = dedupe_query(q);
            if deduped.is_empty() {
                url.set_query(None);
            } else {
                url.set_query(Some(&deduped));
            }
        }
        _ => url.set_query(None),
    }

    url.to_string()
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Keep the first occurrence of each raw `key=value` pair, in order.
fn dedupe_query(query: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        if seen.insert(pair.to_string()) {
            kept.push(pair);
        }
    }
    kept.join("&")
}

/// Lowercased file extension from a URL path, `"bin"` when none is present.
/// Matches an alphanumeric run after the final `.` and before `?`/`#`/end.
pub fn extension(url: &str) -> String {
    let base = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);
    if let Some(dot) = base.rfind('.') {
        let ext = &base[dot + 1..];
        if !ext.is_empty()
            && ext.len() <= 16
            && ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return ext.to_ascii_lowercase();
        }
    }
    "bin".to_string()
}

/// Host of a URL, if it parses.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}
