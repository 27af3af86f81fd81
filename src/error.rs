#![forbid(unsafe_code)]

//! Failure kinds shared by the resolvers, the relay and the HTTP boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Missing or malformed input. Never retried.
    #[error("{0}")]
    InvalidRequest(String),

    /// The primary extractor could not produce a usable stream.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The origin answered with a sign-in / rate-limit challenge.
    #[error("origin blocked the request: {0}")]
    BotDetected(String),

    #[error("all {attempted} mirrors failed")]
    MirrorsExhausted { attempted: usize },

    /// Every strategy in the chain failed.
    #[error("no resolver produced a usable media URL")]
    Unavailable,

    /// Upstream media host refused the asset before any byte was relayed.
    #[error("upstream responded with status {0}")]
    UpstreamStatus(u16),

    #[error("could not reach upstream: {0}")]
    UpstreamConnect(String),

    /// The relay broke after headers were sent; only ever logged.
    #[error("upstream stream interrupted: {0}")]
    UpstreamStream(String),
}

impl ResolveError {
    pub fn is_bot_detected(&self) -> bool {
        matches!(self, Self::BotDetected(_))
    }
}
