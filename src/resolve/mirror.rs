#![forbid(unsafe_code)]

//! Fallback strategy: a pool of interchangeable conversion APIs that accept a
//! source URL and answer with a direct download link.

use std::{collections::BTreeMap, time::Duration};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Resolver;
use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::media::{MediaDescriptor, MediaKind, ResolveRequest, Strategy};

pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://api.cobalt.tools/api/json",
    "https://cobalt.steamodded.com/api/json",
    "https://dl.khub.ky/api/json",
    "https://api.succoon.com/api/json",
    "https://cobalt.rayrad.net/api/json",
    "https://cobalt.slpy.one/api/json",
    "https://cobalt.soapless.dev/api/json",
    "https://api.wuk.sh/api/json",
    "https://co.wuk.sh/api/json",
];

/// Stem used for mirror downloads; mirrors expose no title.
const MIRROR_FILENAME_STEM: &str = "download";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MirrorEndpoint {
    pub base_url: String,
}

impl MirrorEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        DEFAULT_MIRRORS.iter().copied().map(Self::new).collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MirrorQuery<'a> {
    url: &'a str,
    v_quality: &'static str,
    is_audio_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    a_format: Option<&'static str>,
    filename_pattern: &'static str,
}

impl<'a> MirrorQuery<'a> {
    fn for_request(request: &'a ResolveRequest) -> Self {
        let is_audio_only = request.media_kind == MediaKind::Audio;
        Self {
            url: &request.source_url,
            v_quality: match request.quality.height() {
                1080 => "1080",
                720 => "720",
                _ => "480",
            },
            is_audio_only,
            a_format: is_audio_only.then_some("mp3"),
            filename_pattern: "basic",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PickerItem {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MirrorReply {
    status: Option<String>,
    url: Option<String>,
    #[serde(default)]
    picker: Vec<PickerItem>,
}

impl MirrorReply {
    /// Direct link for "stream"/"redirect"/"tunnel" replies, or the first
    /// candidate of a "picker". Any other shape yields nothing.
    fn into_direct_url(self) -> Option<String> {
        let status = self.status.as_deref().unwrap_or_default();
        let url = match status {
            "stream" | "redirect" | "tunnel" => self.url,
            "picker" => self.picker.into_iter().find_map(|item| item.url),
            _ => None,
        };
        url.filter(|url| !url.trim().is_empty())
    }
}

pub struct MirrorResolver {
    endpoints: Vec<MirrorEndpoint>,
    agent: ureq::Agent,
    timeout: Duration,
    max_attempts: usize,
    shuffle: bool,
}

impl MirrorResolver {
    pub fn new(endpoints: Vec<MirrorEndpoint>, timeout: Duration, max_attempts: usize) -> Self {
        Self {
            endpoints,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            timeout,
            max_attempts: max_attempts.max(1),
            shuffle: true,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.mirrors.clone(),
            config.mirror_timeout,
            config.mirror_max_attempts,
        )
        .with_shuffle(config.mirror_shuffle)
    }

    /// `false` tries mirrors in the configured order.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    fn attempt_order(&self) -> Vec<&MirrorEndpoint> {
        let mut order: Vec<&MirrorEndpoint> = self.endpoints.iter().collect();
        if self.shuffle {
            order.shuffle(&mut rand::thread_rng());
        }
        order.truncate(self.max_attempts);
        order
    }

    /// One mirror round trip. Every failure is returned as a short message
    /// for the debug log; none of them abort the pool.
    fn query(&self, endpoint: &MirrorEndpoint, body: &MirrorQuery<'_>) -> Result<String, String> {
        let response = self
            .agent
            .post(&endpoint.base_url)
            .timeout(self.timeout)
            .set("Accept", "application/json")
            .send_json(body)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => format!("status {code}"),
                ureq::Error::Transport(transport) => transport.to_string(),
            })?;

        let reply: MirrorReply = response
            .into_json()
            .map_err(|err| format!("malformed body: {err}"))?;
        let status = reply.status.clone().unwrap_or_default();
        reply
            .into_direct_url()
            .ok_or_else(|| format!("unusable reply status {status:?}"))
    }
}

impl Resolver for MirrorResolver {
    fn strategy(&self) -> Strategy {
        Strategy::Mirror
    }

    fn resolve(&self, request: &ResolveRequest) -> Result<MediaDescriptor, ResolveError> {
        let body = MirrorQuery::for_request(request);
        let order = self.attempt_order();

        for endpoint in &order {
            match self.query(endpoint, &body) {
                Ok(url) => {
                    let descriptor = MediaDescriptor::new(
                        request.media_kind,
                        &url,
                        Some(MIRROR_FILENAME_STEM),
                        None,
                        BTreeMap::new(),
                        Strategy::Mirror,
                    );
                    if let Some(descriptor) = descriptor {
                        return Ok(descriptor);
                    }
                }
                Err(reason) => {
                    debug!(mirror = %endpoint.base_url, %reason, "mirror skipped");
                }
            }
        }

        Err(ResolveError::MirrorsExhausted {
            attempted: order.len(),
        })
    }
}
