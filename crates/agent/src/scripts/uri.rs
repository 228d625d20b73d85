//! Classify script references into local paths, plain URLs and
//! object-storage locations.

use std::path::PathBuf;

use reqwest::Url;

use crate::error::{AgentError, Result};

pub const STORAGE_SCHEME: &str = "gs";
pub const STORAGE_HOSTS: [&str; 2] = ["storage.googleapis.com", "commondatastorage.googleapis.com"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedReference {
    Local(PathBuf),
    Http(Url),
    Storage { bucket: String, object: String },
}

impl ResolvedReference {
    /// Path component the script type is inferred from.
    pub fn file_name_hint(&self) -> String {
        match self {
            ResolvedReference::Local(p) => p.to_string_lossy().into_owned(),
            ResolvedReference::Http(u) => u.path().to_string(),
            ResolvedReference::Storage { object, .. } => object.clone(),
        }
    }
}

enum Match {
    Found(ResolvedReference),
    NoMatch,
    Malformed,
}

type Matcher = fn(&Url) -> Match;

// First match wins.
const MATCHERS: [(&str, Matcher); 4] = [
    ("storage-scheme", storage_scheme),
    ("virtual-hosted", virtual_hosted),
    ("path-style", path_style),
    ("http", plain_http),
];

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn storage_scheme(url: &Url) -> Match {
    if url.scheme() != STORAGE_SCHEME {
        return Match::NoMatch;
    }
    let bucket = url.host_str().unwrap_or_default();
    let object = url.path().trim_start_matches('/');
    if bucket.is_empty() || object.is_empty() {
        return Match::Malformed;
    }
    Match::Found(ResolvedReference::Storage {
        bucket: bucket.to_string(),
        object: object.to_string(),
    })
}

fn virtual_hosted(url: &Url) -> Match {
    if !is_http(url) {
        return Match::NoMatch;
    }
    let host = url.host_str().unwrap_or_default();
    let bucket = STORAGE_HOSTS
        .iter()
        .find_map(|h| host.strip_suffix(h).and_then(|b| b.strip_suffix('.')));
    let Some(bucket) = bucket.filter(|b| !b.is_empty()) else {
        return Match::NoMatch;
    };
    let object = url.path().trim_start_matches('/');
    if object.is_empty() {
        return Match::Malformed;
    }
    Match::Found(ResolvedReference::Storage {
        bucket: bucket.to_string(),
        object: object.to_string(),
    })
}

fn path_style(url: &Url) -> Match {
    if !is_http(url) {
        return Match::NoMatch;
    }
    let host = url.host_str().unwrap_or_default();
    if !STORAGE_HOSTS.contains(&host) {
        return Match::NoMatch;
    }
    let segments: Vec<&str> = match url.path_segments() {
        Some(s) => s.collect(),
        None => return Match::Malformed,
    };
    match segments.split_first() {
        Some((bucket, rest)) if !bucket.is_empty() && rest.iter().any(|s| !s.is_empty()) => {
            Match::Found(ResolvedReference::Storage {
                bucket: bucket.to_string(),
                object: rest.join("/"),
            })
        }
        _ => Match::Malformed,
    }
}

fn plain_http(url: &Url) -> Match {
    if is_http(url) && url.host_str().is_some() {
        Match::Found(ResolvedReference::Http(url.clone()))
    } else {
        Match::NoMatch
    }
}

/// Resolve a script reference.
///
/// Strings that do not parse as an absolute URL (and Windows drive paths,
/// which do) are local paths. Parsed URLs must be claimed by a matcher.
pub fn resolve(reference: &str) -> Result<ResolvedReference> {
    let trimmed = reference.trim();
    let url = match Url::parse(trimmed) {
        Ok(url) if url.scheme().len() > 1 => url,
        _ => return Ok(ResolvedReference::Local(PathBuf::from(trimmed))),
    };
    if url.scheme() == "file" {
        return url
            .to_file_path()
            .map(ResolvedReference::Local)
            .map_err(|_| AgentError::UnrecognizedReference(reference.to_string()));
    }
    for (_name, matcher) in MATCHERS.iter() {
        match matcher(&url) {
            Match::Found(resolved) => return Ok(resolved),
            Match::Malformed => break,
            Match::NoMatch => continue,
        }
    }
    Err(AgentError::UnrecognizedReference(reference.to_string()))
}
