#![forbid(unsafe_code)]

//! Request and descriptor types that flow through the resolution chain.

use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use url::Url;

use crate::error::ResolveError;

/// Characters that are never allowed in a served filename.
const FORBIDDEN_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];
const FALLBACK_STEM: &str = "download";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Unknown or missing values resolve to video, like the public API always did.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(ref value) if value == "audio" => Self::Audio,
            _ => Self::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    fn default_content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Audio => "audio/mpeg",
        }
    }

    fn mime_top_level(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    P1080,
    P720,
    P480,
}

impl Quality {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(ref value) if value == "720p" || value == "720" => Self::P720,
            Some(ref value) if value == "480p" || value == "480" => Self::P480,
            _ => Self::P1080,
        }
    }

    /// Maximum vertical resolution accepted for this quality.
    pub fn height(self) -> u32 {
        match self {
            Self::P1080 => 1080,
            Self::P720 => 720,
            Self::P480 => 480,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
        }
    }
}

/// One inbound resolution request. Built once per HTTP request and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub source_url: String,
    pub media_kind: MediaKind,
    pub quality: Quality,
    pub probe_only: bool,
}

impl ResolveRequest {
    pub fn new(
        source_url: &str,
        media_kind: MediaKind,
        quality: Quality,
        probe_only: bool,
    ) -> Result<Self, ResolveError> {
        let trimmed = source_url.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::InvalidRequest("Missing URL".to_string()));
        }
        let parsed = Url::parse(trimmed)
            .map_err(|_| ResolveError::InvalidRequest("Invalid URL".to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ResolveError::InvalidRequest("Invalid URL".to_string()));
        }

        Ok(Self {
            source_url: trimmed.to_string(),
            media_kind,
            quality,
            probe_only,
        })
    }
}

/// Which strategy produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Primary,
    Mirror,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Mirror => "mirror",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, directly fetchable media asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub direct_url: String,
    pub filename: String,
    pub file_extension: String,
    pub content_type: String,
    pub upstream_headers: BTreeMap<String, String>,
    pub source: Strategy,
}

impl MediaDescriptor {
    /// Builds a descriptor whose filename, extension and content type all agree
    /// with `kind`. Returns `None` when the direct URL is blank.
    pub fn new(
        kind: MediaKind,
        direct_url: &str,
        title: Option<&str>,
        raw_extension: Option<&str>,
        upstream_headers: BTreeMap<String, String>,
        source: Strategy,
    ) -> Option<Self> {
        let direct_url = direct_url.trim();
        if direct_url.is_empty() {
            return None;
        }

        let file_extension = normalize_extension(kind, raw_extension);
        let stem = sanitize_filename(title.unwrap_or(FALLBACK_STEM));
        Some(Self {
            direct_url: direct_url.to_string(),
            filename: format!("{stem}.{file_extension}"),
            content_type: content_type_for(kind, &file_extension),
            file_extension,
            upstream_headers,
            source,
        })
    }
}

/// Removes the characters browsers and filesystems choke on, plus control
/// characters that would break a header value.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !FORBIDDEN_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn normalize_extension(kind: MediaKind, raw: Option<&str>) -> String {
    let raw = raw
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    let Some(ext) = raw else {
        return kind.default_extension().to_string();
    };
    match (kind, ext.as_str()) {
        (MediaKind::Audio, "mp4") => "m4a".to_string(),
        (MediaKind::Audio, "mpga" | "mpeg") => "mp3".to_string(),
        _ => ext,
    }
}

/// Content type for a normalized extension. The result always starts with the
/// top-level type of `kind`.
pub fn content_type_for(kind: MediaKind, extension: &str) -> String {
    let known = match (kind, extension) {
        (MediaKind::Video, "mp4" | "m4v") => Some("video/mp4"),
        (MediaKind::Video, "webm") => Some("video/webm"),
        (MediaKind::Video, "mkv") => Some("video/x-matroska"),
        (MediaKind::Audio, "m4a") => Some("audio/mp4"),
        (MediaKind::Audio, "mp3") => Some("audio/mpeg"),
        (MediaKind::Audio, "webm") => Some("audio/webm"),
        (MediaKind::Audio, "opus" | "ogg") => Some("audio/ogg"),
        _ => None,
    };
    if let Some(known) = known {
        return known.to_string();
    }

    mime_guess::from_ext(extension)
        .iter()
        .find(|mime| mime.type_().as_str() == kind.mime_top_level())
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| kind.default_content_type().to_string())
}
