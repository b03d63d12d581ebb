//! Cache entry naming and lifecycle types

use crate::error::MediaDownloadError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of media blob held in the cache; fixes the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "m4a",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    /// Accepts both the media kind name and the memory kind that carries it
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" | "images" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown media kind: {}", other)),
        }
    }
}

/// Materialization state of a cached blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Absent,
    Downloading,
    Present,
}

/// A remote media URL and the local file it maps to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub filename: String,
    pub state: CacheState,
}

/// A materialized local copy of a media blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHandle {
    pub filename: String,
    pub path: PathBuf,
}

/// Derive the flat cache filename for a remote URL: `<basename>.<ext>`.
///
/// The basename is the last path segment with query and fragment removed.
/// Storage URLs that encode object paths as `%2F` are split on it as well.
pub fn filename_for(url: &str, kind: MediaKind) -> Result<String, MediaDownloadError> {
    let base = basename(url)
        .ok_or_else(|| MediaDownloadError::new(url, "URL has no usable file name"))?;
    Ok(format!("{}.{}", base, kind.extension()))
}

fn basename(url: &str) -> Option<String> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let last = path.rsplit('/').next().unwrap_or_default();
    let last = split_encoded_slash(last);

    if last.is_empty() || last == "." || last == ".." || last.contains('\\') {
        return None;
    }
    Some(last.to_string())
}

/// Last component after any `%2F`/`%2f` escape
fn split_encoded_slash(segment: &str) -> &str {
    let lower = segment.to_ascii_lowercase();
    match lower.rfind("%2f") {
        Some(pos) => &segment[pos + 3..],
        None => segment,
    }
}
