//! Link parsing for the three supported source families.
//!
//! A `SourceDescriptor` is the protocol-specific locator carried by a
//! `DownloadRequest`. Resolving web pages into formats is left to callers;
//! this module only understands direct links.

use std::fmt;

use log::warn;
use serde::Serialize;
use url::Url;

use crate::download::DownloadKind;
use crate::error::SourceError;

const MAGNET_HASH_PREFIX: &str = "urn:btih:";
const ED2K_PREFIX: &str = "ed2k://";
const DEFAULT_FILENAME: &str = "download.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Http {
        url: Url,
    },
    Magnet {
        info_hash: String,
        display_name: Option<String>,
        trackers: Vec<Url>,
    },
    Ed2k {
        name: String,
        size: u64,
        hash: String,
    },
}

impl SourceDescriptor {
    pub fn scheme(&self) -> &'static str {
        match self {
            SourceDescriptor::Http { .. } => "http",
            SourceDescriptor::Magnet { .. } => "magnet",
            SourceDescriptor::Ed2k { .. } => "ed2k",
        }
    }

    pub fn default_kind(&self) -> DownloadKind {
        match self {
            SourceDescriptor::Http { .. } => DownloadKind::Video,
            SourceDescriptor::Magnet { .. } => DownloadKind::Torrent,
            SourceDescriptor::Ed2k { .. } => DownloadKind::Ed2k,
        }
    }

    pub fn size_hint(&self) -> Option<u64> {
        match self {
            SourceDescriptor::Ed2k { size, .. } => Some(*size),
            _ => None,
        }
    }

    pub fn suggested_filename(&self) -> String {
        match self {
            SourceDescriptor::Http { url } => url
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .filter(|name| !name.trim().is_empty())
                .map(decode_component)
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
            SourceDescriptor::Magnet {
                info_hash,
                display_name,
                ..
            } => display_name.clone().unwrap_or_else(|| info_hash.clone()),
            SourceDescriptor::Ed2k { name, .. } => name.clone(),
        }
    }

    /// Canonical form used when deriving task identifiers.
    pub fn locator(&self) -> String {
        match self {
            SourceDescriptor::Http { url } => url.to_string(),
            SourceDescriptor::Magnet { info_hash, .. } => format!("magnet:{info_hash}"),
            SourceDescriptor::Ed2k { hash, size, .. } => format!("ed2k:{hash}:{size}"),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Http { url } => write!(f, "{url}"),
            SourceDescriptor::Magnet {
                info_hash,
                trackers,
                ..
            } => write!(f, "magnet {info_hash} ({} trackers)", trackers.len()),
            SourceDescriptor::Ed2k { name, size, hash } => {
                write!(f, "ed2k {name} [{hash}, {size} bytes]")
            }
        }
    }
}

pub fn parse_link(input: &str) -> Result<SourceDescriptor, SourceError> {
    let trimmed = input.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("magnet:") {
        parse_magnet(trimmed)
    } else if lowered.starts_with(ED2K_PREFIX) {
        parse_ed2k(trimmed)
    } else {
        parse_http(trimmed)
    }
}

fn parse_http(input: &str) -> Result<SourceDescriptor, SourceError> {
    let url = Url::parse(input).map_err(|err| SourceError::InvalidUrl {
        url: input.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(SourceDescriptor::Http { url }),
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}

fn parse_magnet(input: &str) -> Result<SourceDescriptor, SourceError> {
    let url = Url::parse(input).map_err(|err| SourceError::InvalidMagnet(err.to_string()))?;

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                if let Some(hash) = value.strip_prefix(MAGNET_HASH_PREFIX) {
                    info_hash.get_or_insert_with(|| hash.to_ascii_lowercase());
                }
            }
            "dn" if !value.trim().is_empty() => display_name = Some(value.into_owned()),
            "tr" => match Url::parse(&value) {
                Ok(tracker) if matches!(tracker.scheme(), "http" | "https" | "udp") => {
                    trackers.push(tracker)
                }
                _ => warn!("ignoring invalid tracker {value}"),
            },
            _ => {}
        }
    }

    let info_hash = info_hash
        .ok_or_else(|| SourceError::InvalidMagnet("missing urn:btih info hash".into()))?;
    if info_hash.len() != 40 || !info_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SourceError::InvalidMagnet(format!(
            "info hash must be 40 hex characters, got {info_hash:?}"
        )));
    }

    Ok(SourceDescriptor::Magnet {
        info_hash,
        display_name,
        trackers,
    })
}

/// `ed2k://|file|<name>|<size>|<md4 hash>|/`
fn parse_ed2k(input: &str) -> Result<SourceDescriptor, SourceError> {
    let body = &input[ED2K_PREFIX.len()..];
    let body = body.trim_end_matches('/');
    let parts: Vec<&str> = body.split('|').filter(|p| !p.is_empty()).collect();
    if parts.len() < 4 {
        return Err(SourceError::InvalidEd2k(format!(
            "expected |file|name|size|hash|, got {input}"
        )));
    }
    if !parts[0].eq_ignore_ascii_case("file") {
        return Err(SourceError::InvalidEd2k(format!(
            "unsupported link type {:?}",
            parts[0]
        )));
    }

    let name = decode_component(parts[1]);
    if name.trim().is_empty() {
        return Err(SourceError::InvalidEd2k("empty file name".into()));
    }
    let size: u64 = parts[2]
        .parse()
        .map_err(|_| SourceError::InvalidEd2k(format!("invalid size {:?}", parts[2])))?;
    let hash = parts[3].to_ascii_lowercase();
    if hash.len() != 32 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SourceError::InvalidEd2k(format!(
            "hash must be 32 hex characters, got {:?}",
            parts[3]
        )));
    }

    Ok(SourceDescriptor::Ed2k { name, size, hash })
}

/// Falls back to the raw text when the escapes do not decode to UTF-8.
fn decode_component(input: &str) -> String {
    urlencoding::decode(input)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| input.to_string())
}
