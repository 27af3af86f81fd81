#![forbid(unsafe_code)]

//! Byte relay between a resolved media URL and the HTTP client.
//!
//! The upstream is read by a blocking `ureq` reader on the blocking pool and
//! written into a bounded in-memory pipe; the response body pulls from the
//! other end of that pipe. Nothing ever holds more than the pipe capacity in
//! memory. When the client goes away the body is dropped, the pipe closes,
//! the next write fails and the upstream connection is released.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use tokio::io::DuplexStream;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::media::MediaDescriptor;

pub const RELAY_CHUNK_SIZE: usize = 8 * 1024;
/// Chunks buffered between the upstream reader and the response body.
const RELAY_PIPE_CHUNKS: usize = 4;
/// Upper bound on a single stalled read once the transfer has started.
const UPSTREAM_READ_STALL: Duration = Duration::from_secs(60);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub struct StreamProxy {
    agent: ureq::Agent,
}

impl StreamProxy {
    /// `connect_timeout` bounds connection setup only, never the transfer.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(connect_timeout)
                .timeout_read(UPSTREAM_READ_STALL)
                .build(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.upstream_connect_timeout)
    }

    /// Connects to the descriptor's URL and checks the status before any byte
    /// is handed out. Blocking.
    pub fn open(&self, descriptor: &MediaDescriptor) -> Result<UpstreamBody, ResolveError> {
        let mut request = self.agent.get(&descriptor.direct_url);
        let mut has_user_agent = false;
        for (name, value) in &descriptor.upstream_headers {
            has_user_agent |= name.eq_ignore_ascii_case("user-agent");
            request = request.set(name, value);
        }
        if !has_user_agent {
            request = request.set("User-Agent", DEFAULT_USER_AGENT);
        }

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(code, _) => ResolveError::UpstreamStatus(code),
            ureq::Error::Transport(transport) => {
                ResolveError::UpstreamConnect(transport.to_string())
            }
        })?;

        Ok(UpstreamBody {
            reader: response.into_reader(),
        })
    }
}

/// An upstream response that already answered with a success status.
pub struct UpstreamBody {
    reader: Box<dyn Read + Send + Sync + 'static>,
}

impl UpstreamBody {
    /// Starts relaying and returns the client-facing chunk stream. Must be
    /// called from within a Tokio runtime.
    pub fn into_stream(self) -> ReaderStream<DuplexStream> {
        let (writer, reader) = tokio::io::duplex(RELAY_CHUNK_SIZE * RELAY_PIPE_CHUNKS);
        let sink = SyncIoBridge::new(writer);
        tokio::task::spawn_blocking(move || self.pump(sink));
        ReaderStream::with_capacity(reader, RELAY_CHUNK_SIZE)
    }

    /// Copies upstream into `sink` chunk by chunk. An upstream failure ends
    /// the body early; a failed write means the client is gone.
    fn pump<W: Write>(mut self, mut sink: W) {
        let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
        let mut relayed: u64 = 0;

        loop {
            let read = match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let err = ResolveError::UpstreamStream(err.to_string());
                    warn!(error = %err, relayed, "upstream dropped mid-transfer");
                    break;
                }
            };

            if sink.write_all(&buf[..read]).is_err() {
                debug!(relayed, "client disconnected, closing upstream");
                return;
            }
            relayed += read as u64;
        }

        let _ = sink.flush();
        debug!(relayed, "relay finished");
    }
}
