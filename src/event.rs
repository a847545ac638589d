//! Download event model.
//!
//! A `DownloadEvent` is one artifact download as recorded by the CDN,
//! serialized verbatim as a BigQuery row. Events are immutable once built;
//! the parser is the only producer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ua::UserAgent;

/// One parsed package download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadEvent {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub project: String,
    pub version: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// The raw user agent, retained only when no recognizer matched it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// The structured user agent sub-record (`details` in the table schema).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<UserAgent>,
}

/// What a download URL decomposes into.
///
/// The CDN lays packages out as `/packages/<hash-dirs>/<filename>`, and the
/// filename carries `{project}-{version}[-…].{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub project: String,
    pub version: String,
    pub filename: String,
}

// Extensions whose stem ends in `{project}-{version}` with no trailing
// compatibility tags.
const SDIST_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz", ".tar.bz2", ".zip"];

/// Decompose a download URL path into project, version, and filename.
///
/// Returns `None` when the path is not under `/packages/` or the filename
/// does not carry a recoverable `{project}-{version}` structure; callers
/// skip the event in that case.
pub fn decompose_url(url: &str) -> Option<FileRef> {
    // Strip any scheme/host and query string; only the path matters.
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = match path.find("/packages/") {
        Some(idx) => &path[idx + "/packages/".len()..],
        None => return None,
    };
    let filename = path.rsplit('/').next().unwrap_or("");
    if filename.is_empty() {
        return None;
    }

    let (project, version) = split_filename(filename)?;
    Some(FileRef {
        project: project.to_owned(),
        version: version.to_owned(),
        filename: filename.to_owned(),
    })
}

fn split_filename(filename: &str) -> Option<(&str, &str)> {
    if let Some(stem) = filename
        .strip_suffix(".whl")
        .or_else(|| filename.strip_suffix(".egg"))
    {
        // {project}-{version}(-{build})?-{python}-{abi}-{platform}
        let mut parts = stem.split('-');
        let project = parts.next().filter(|p| !p.is_empty())?;
        let version = parts.next().filter(|v| !v.is_empty())?;
        return Some((project, version));
    }

    for ext in SDIST_EXTENSIONS {
        if let Some(stem) = filename.strip_suffix(ext) {
            return split_sdist_stem(stem);
        }
    }
    None
}

// The version starts at the last `-` whose successor is a digit, so that
// dashed project names (`python-dateutil-2.8.2`) split correctly.
fn split_sdist_stem(stem: &str) -> Option<(&str, &str)> {
    for (idx, _) in stem.match_indices('-').collect::<Vec<_>>().into_iter().rev() {
        let version = &stem[idx + 1..];
        if version.starts_with(|c: char| c.is_ascii_digit()) {
            let project = &stem[..idx];
            if project.is_empty() {
                return None;
            }
            return Some((project, version));
        }
    }
    None
}
