#![forbid(unsafe_code)]

//! Resolution chain: a fixed priority list of strategies that each try to
//! turn a [`ResolveRequest`] into a [`MediaDescriptor`].
//!
//! Every strategy performs blocking network or subprocess work, so callers on
//! an async runtime run [`ResolutionCoordinator::resolve`] inside
//! `spawn_blocking`.

pub mod mirror;
pub mod primary;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::media::{MediaDescriptor, ResolveRequest, Strategy};

pub use mirror::{MirrorEndpoint, MirrorResolver};
pub use primary::{MetadataExtractor, PrimaryResolver, YtDlp};

/// A thing that can resolve a source URL to a descriptor or fail.
pub trait Resolver: Send + Sync {
    fn strategy(&self) -> Strategy;

    fn resolve(&self, request: &ResolveRequest) -> Result<MediaDescriptor, ResolveError>;
}

/// Tries each strategy in order and returns the first success.
pub struct ResolutionCoordinator {
    strategies: Vec<Arc<dyn Resolver>>,
}

impl ResolutionCoordinator {
    pub fn new(strategies: Vec<Arc<dyn Resolver>>) -> Self {
        Self { strategies }
    }

    /// Primary extractor first, mirrors second.
    pub fn from_config(config: &RuntimeConfig) -> (Self, Arc<MirrorResolver>) {
        let primary: Arc<dyn Resolver> = Arc::new(PrimaryResolver::new(YtDlp::from_config(config)));
        let mirrors = Arc::new(MirrorResolver::from_config(config));
        let fallback: Arc<dyn Resolver> = mirrors.clone();
        let chain = Self::new(vec![primary, fallback]);
        (chain, mirrors)
    }

    /// Failures inside one strategy only ever mean "try the next one". When
    /// every strategy fails the result is [`ResolveError::Unavailable`],
    /// unless one of them hit a bot challenge, which is reported as such so
    /// the caller can steer the client to another delivery path.
    pub fn resolve(&self, request: &ResolveRequest) -> Result<MediaDescriptor, ResolveError> {
        let mut bot_challenge: Option<ResolveError> = None;

        for strategy in &self.strategies {
            match strategy.resolve(request) {
                Ok(descriptor) => {
                    info!(
                        strategy = %strategy.strategy(),
                        kind = %request.media_kind,
                        quality = request.quality.label(),
                        filename = %descriptor.filename,
                        "resolved media"
                    );
                    return Ok(descriptor);
                }
                Err(err) => {
                    warn!(
                        strategy = %strategy.strategy(),
                        url = %request.source_url,
                        error = %err,
                        "resolver failed, trying next"
                    );
                    if err.is_bot_detected() && bot_challenge.is_none() {
                        bot_challenge = Some(err);
                    }
                }
            }
        }

        Err(bot_challenge.unwrap_or(ResolveError::Unavailable))
    }
}
