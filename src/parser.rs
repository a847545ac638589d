//! Syslog line parsing.
//!
//! Turns one framed syslog line into at most one `DownloadEvent`. Every
//! failure is a skip, never an error that could tear down the connection;
//! callers count skips and move on.
//!
//! # Stages
//! 1. Syslog envelope: `<pri>timestamp hostname tag: message`
//! 2. Token authentication (when the server is configured with one)
//! 3. Record fields: pipe- or space-delimited, chosen by a leading
//!    single-digit format marker (`2|…`)
//! 4. URL decomposition into project/version/filename
//! 5. User agent classification

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::event::{decompose_url, DownloadEvent};
use crate::ua::{self, UserAgent};

/// Why a line produced no event. `AuthReject` is counted separately from the
/// parse-failure metric and never logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseSkip {
    #[error("not a syslog line")]
    Envelope,
    #[error("authentication token mismatch")]
    AuthReject,
    #[error("missing record fields")]
    Fields,
    #[error("unparseable event timestamp")]
    Timestamp,
    #[error("URL does not identify a package file")]
    Url,
}

static ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\d{1,3}>(\S+) (\S+) (\S+): (.*)$").unwrap());

/// Parse one raw syslog line into a `DownloadEvent`.
///
/// Pure and deterministic: the same line with the same token always yields
/// the same outcome.
pub fn parse_line(line: &str, token: Option<&str>) -> Result<DownloadEvent, ParseSkip> {
    let caps = ENVELOPE.captures(line).ok_or(ParseSkip::Envelope)?;
    let message = caps.get(4).map_or("", |m| m.as_str());

    let body = authenticate(message, token)?;

    let record = parse_record(body)?;
    let timestamp = parse_timestamp(record.timestamp)?;
    let file = decompose_url(record.url).ok_or(ParseSkip::Url)?;

    let (user_agent, details) = match record.user_agent {
        Some(raw) => match ua::classify(raw) {
            Some(parsed) => (None, Some(parsed)),
            None => (Some(raw.to_owned()), Some(UserAgent::unknown())),
        },
        None => (None, None),
    };

    Ok(DownloadEvent {
        timestamp,
        url: record.url.to_owned(),
        project: file.project,
        version: file.version,
        filename: file.filename,
        tls_protocol: record.tls_protocol.map(str::to_owned),
        tls_cipher: record.tls_cipher.map(str::to_owned),
        country_code: record.country_code.map(str::to_owned),
        user_agent,
        details,
    })
}

// When a token is configured, the first whitespace-delimited field of the
// message must equal it exactly; the field is then stripped.
fn authenticate<'a>(message: &'a str, token: Option<&str>) -> Result<&'a str, ParseSkip> {
    match token {
        None => Ok(message),
        Some(expected) => {
            let mut parts = message.splitn(2, char::is_whitespace);
            if parts.next() != Some(expected) {
                return Err(ParseSkip::AuthReject);
            }
            Ok(parts.next().unwrap_or("").trim_start())
        }
    }
}

struct Record<'a> {
    timestamp: &'a str,
    url: &'a str,
    tls_protocol: Option<&'a str>,
    tls_cipher: Option<&'a str>,
    country_code: Option<&'a str>,
    user_agent: Option<&'a str>,
}

fn parse_record(body: &str) -> Result<Record<'_>, ParseSkip> {
    let bytes = body.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_digit() && bytes[1] == b'|' {
        parse_piped(body)
    } else {
        parse_spaced(body)
    }
}

// `V|timestamp|url|tls_protocol|tls_cipher|country_code|user_agent`
// The user agent is the final field and may itself contain pipes.
fn parse_piped(body: &str) -> Result<Record<'_>, ParseSkip> {
    let mut fields = body.splitn(7, '|');
    let _marker = fields.next();
    let timestamp = fields.next().ok_or(ParseSkip::Fields)?;
    let url = fields.next().filter(|u| !u.is_empty()).ok_or(ParseSkip::Fields)?;
    Ok(Record {
        timestamp,
        url,
        tls_protocol: fields.next().and_then(optional),
        tls_cipher: fields.next().and_then(optional),
        country_code: fields.next().and_then(optional),
        user_agent: fields.next().and_then(optional),
    })
}

// Legacy form: `timestamp url tls_protocol tls_cipher country_code ua…`,
// the user agent running to the end of the line.
fn parse_spaced(body: &str) -> Result<Record<'_>, ParseSkip> {
    let mut fields = body.splitn(6, ' ');
    let timestamp = fields.next().ok_or(ParseSkip::Fields)?;
    let url = fields.next().filter(|u| !u.is_empty()).ok_or(ParseSkip::Fields)?;
    Ok(Record {
        timestamp,
        url,
        tls_protocol: fields.next().and_then(optional),
        tls_cipher: fields.next().and_then(optional),
        country_code: fields.next().and_then(optional),
        user_agent: fields.next().and_then(optional),
    })
}

// Empty fields and the CDN's `-` placeholder both mean absent.
fn optional(field: &str) -> Option<&str> {
    match field {
        "" | "-" => None,
        _ => Some(field),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseSkip> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ParseSkip::Timestamp)
}
