#![forbid(unsafe_code)]

//! Primary strategy: ask a metadata extractor (yt-dlp) for a single direct
//! media URL without downloading anything.

use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    process::{Output, Stdio},
    time::Duration,
};

use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    runtime::Handle,
    task::JoinHandle,
};
use tracing::debug;

use super::Resolver;
use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::media::{MediaDescriptor, MediaKind, Quality, ResolveRequest, Strategy};

/// Lower-cased fragments of extractor output that mean the origin challenged
/// us instead of serving the page.
const BOT_CHALLENGE_MARKERS: &[&str] = &[
    "sign in to confirm",
    "not a bot",
    "http error 403",
    "http error 429",
    "too many requests",
];

/// Attributes yt-dlp appends to each cookie; never sent back as cookies.
const COOKIE_ATTRIBUTES: &[&str] = &[
    "domain",
    "path",
    "expires",
    "max-age",
    "secure",
    "httponly",
    "samesite",
    "comment",
    "version",
    "priority",
    "partitioned",
];

/// Subset of yt-dlp's `--dump-single-json` payload for one selected format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedMedia {
    pub title: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    pub cookies: Option<String>,
}

pub trait MetadataExtractor: Send + Sync {
    /// Returns metadata for the single format selected by `format_filter`.
    fn extract(&self, url: &str, format_filter: &str) -> Result<ExtractedMedia, ResolveError>;
}

/// Runs the `yt-dlp` binary as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    cookies: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: PathBuf, cookies: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary,
            cookies,
            timeout,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.ytdlp_bin.clone(),
            config.ytdlp_cookies.clone(),
            config.extractor_timeout,
        )
    }

    fn command(&self, url: &str, format_filter: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--socket-timeout")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg("-f")
            .arg(format_filter);

        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }

        command.arg("--").arg(url);
        command
    }
}

impl MetadataExtractor for YtDlp {
    /// Blocking: drives the subprocess on the ambient Tokio runtime, so it
    /// must be called from the blocking pool.
    fn extract(&self, url: &str, format_filter: &str) -> Result<ExtractedMedia, ResolveError> {
        debug!(binary = %self.binary.display(), %url, format_filter, "running extractor");
        let runtime = Handle::try_current()
            .map_err(|err| ResolveError::Extraction(format!("no runtime for extractor: {err}")))?;
        let output = runtime.block_on(run_with_timeout(
            self.command(url, format_filter),
            self.timeout,
        ))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| ResolveError::Extraction(format!("parsing extractor output: {err}")))
    }
}

/// Spawns `command` and kills it once `timeout` elapses.
async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, ResolveError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ResolveError::Extraction(format!("launching extractor: {err}")))?;

    let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe)));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status
            .map_err(|err| ResolveError::Extraction(format!("waiting for extractor: {err}")))?,
        Err(_) => {
            if let Err(err) = child.kill().await {
                debug!(error = %err, "extractor already gone");
            }
            stdout.iter().chain(stderr.iter()).for_each(JoinHandle::abort);
            return Err(ResolveError::Extraction(format!(
                "extractor timed out after {:.1}s",
                timeout.as_secs_f64()
            )));
        }
    };

    Ok(Output {
        status,
        stdout: collect_pipe(stdout, "stdout").await?,
        stderr: collect_pipe(stderr, "stderr").await?,
    })
}

async fn read_pipe(mut pipe: impl AsyncRead + Unpin) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect_pipe(
    task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    name: &str,
) -> Result<Vec<u8>, ResolveError> {
    let Some(task) = task else {
        return Ok(Vec::new());
    };
    task.await
        .map_err(|err| ResolveError::Extraction(format!("extractor {name} task failed: {err}")))?
        .map_err(|err| ResolveError::Extraction(format!("reading extractor {name}: {err}")))
}

/// Reduces yt-dlp's Set-Cookie style `cookies` field (`A=b; Domain=.x; Path=/;
/// Secure; C=d; ...`) to a request `Cookie` header value.
pub fn cookie_header(raw: &str) -> Option<String> {
    let pairs: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|part| {
            let Some((name, _)) = part.split_once('=') else {
                return false;
            };
            let name = name.trim();
            !name.is_empty()
                && !COOKIE_ATTRIBUTES
                    .iter()
                    .any(|attr| name.eq_ignore_ascii_case(attr))
        })
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Maps extractor stderr to an error kind. Bot challenges are reported
/// separately so the HTTP layer can point the client at another path.
pub fn classify_failure(stderr: &str) -> ResolveError {
    let message = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("extractor exited without output")
        .to_string();

    let lowered = stderr.to_ascii_lowercase();
    if BOT_CHALLENGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        ResolveError::BotDetected(message)
    } else {
        ResolveError::Extraction(message)
    }
}

/// yt-dlp format selector for the requested kind and quality. Video prefers a
/// muxed mp4 at or below the target height; audio prefers m4a.
pub fn format_filter(kind: MediaKind, quality: Quality) -> String {
    match kind {
        MediaKind::Video => {
            let height = quality.height();
            format!(
                "best[height<={height}][ext=mp4][vcodec!=none][acodec!=none]\
                 /best[height<={height}][vcodec!=none][acodec!=none]\
                 /best[vcodec!=none][acodec!=none]\
                 /best"
            )
        }
        MediaKind::Audio => "bestaudio[ext=m4a]/bestaudio/best[acodec!=none]".to_string(),
    }
}

pub struct PrimaryResolver {
    extractor: Box<dyn MetadataExtractor>,
}

impl PrimaryResolver {
    pub fn new(extractor: impl MetadataExtractor + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
        }
    }
}

impl Resolver for PrimaryResolver {
    fn strategy(&self) -> Strategy {
        Strategy::Primary
    }

    fn resolve(&self, request: &ResolveRequest) -> Result<MediaDescriptor, ResolveError> {
        let filter = format_filter(request.media_kind, request.quality);
        let media = self.extractor.extract(&request.source_url, &filter)?;

        let mut headers = media.http_headers;
        if let Some(cookies) = media.cookies.as_deref().and_then(cookie_header) {
            headers.insert("Cookie".to_string(), cookies);
        }

        MediaDescriptor::new(
            request.media_kind,
            media.url.as_deref().unwrap_or_default(),
            media.title.as_deref(),
            media.ext.as_deref(),
            headers,
            Strategy::Primary,
        )
        .ok_or_else(|| ResolveError::Extraction("extractor returned no direct media URL".into()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeExtractor;
    use super::*;
    use std::sync::Arc;

    fn request(kind: MediaKind, quality: Quality) -> ResolveRequest {
        ResolveRequest::new("https://example.com/v/abc", kind, quality, false).unwrap()
    }

    #[test]
    fn video_filter_caps_height_and_prefers_muxed_mp4() {
        let filter = format_filter(MediaKind::Video, Quality::P720);
        assert!(filter.starts_with("best[height<=720][ext=mp4][vcodec!=none][acodec!=none]/"));
        assert!(filter.ends_with("/best"));
        assert!(!filter.contains(' '));
    }

    #[test]
    fn audio_filter_prefers_m4a() {
        let filter = format_filter(MediaKind::Audio, Quality::P1080);
        assert!(filter.starts_with("bestaudio[ext=m4a]/bestaudio"));
    }

    #[test]
    fn classify_failure_detects_bot_challenges() {
        let err = classify_failure(
            "WARNING: something\nERROR: [youtube] abc: Sign in to confirm you're not a bot\n",
        );
        assert!(err.is_bot_detected());
        assert!(err.to_string().contains("Sign in to confirm"));

        let err = classify_failure("ERROR: unable to download video data: HTTP Error 403: Forbidden");
        assert!(err.is_bot_detected());
    }

    #[test]
    fn classify_failure_defaults_to_extraction() {
        let err = classify_failure("ERROR: Unsupported URL: https://example.com\n");
        assert!(matches!(err, ResolveError::Extraction(ref msg) if msg.contains("Unsupported URL")));
        assert!(matches!(
            classify_failure(""),
            ResolveError::Extraction(ref msg) if msg == "extractor exited without output"
        ));
    }

    #[test]
    fn resolve_builds_sanitized_audio_descriptor() {
        let extractor = Arc::new(FakeExtractor::new(|| {
            Ok(ExtractedMedia {
                title: Some("Song: Title?".into()),
                url: Some("https://cdn.example/audio".into()),
                ext: Some("m4a".into()),
                http_headers: BTreeMap::from([("User-Agent".into(), "yt".into())]),
                cookies: Some("SID=1".into()),
            })
        }));
        let resolver = PrimaryResolver::new(extractor.clone());

        let descriptor = resolver
            .resolve(&request(MediaKind::Audio, Quality::P1080))
            .unwrap();
        assert_eq!(descriptor.filename, "Song Title.m4a");
        assert_eq!(descriptor.file_extension, "m4a");
        assert!(descriptor.content_type.starts_with("audio/"));
        assert_eq!(descriptor.source, Strategy::Primary);
        assert_eq!(descriptor.upstream_headers["User-Agent"], "yt");
        assert_eq!(descriptor.upstream_headers["Cookie"], "SID=1");
        assert_eq!(
            extractor.filters.lock().unwrap().as_slice(),
            [format_filter(MediaKind::Audio, Quality::P1080)]
        );
    }

    #[test]
    fn cookie_header_drops_set_cookie_attributes() {
        let raw = "VISITOR=abc; Domain=.example.com; Path=/; Secure; \
                   Expires=Fri, 16 Oct 2026 10:00:00 GMT; HttpOnly; PREF=f6=40000000; \
                   Domain=.example.com; Path=/; Max-Age=3600; SameSite=None";
        assert_eq!(
            cookie_header(raw).as_deref(),
            Some("VISITOR=abc; PREF=f6=40000000")
        );
        assert_eq!(cookie_header("Domain=.x.com; Path=/; Secure"), None);
        assert_eq!(cookie_header("  "), None);
    }

    #[test]
    fn resolve_forwards_only_cookie_pairs() {
        let resolver = PrimaryResolver::new(FakeExtractor::new(|| {
            Ok(ExtractedMedia {
                title: Some("Clip".into()),
                url: Some("https://cdn.example/video".into()),
                ext: Some("mp4".into()),
                cookies: Some(
                    "SID=1; Domain=.example.com; Path=/; Secure; Expires=Fri, 16 Oct 2026 10:00:00 GMT"
                        .into(),
                ),
                ..ExtractedMedia::default()
            })
        }));
        let descriptor = resolver
            .resolve(&request(MediaKind::Video, Quality::P720))
            .unwrap();
        assert_eq!(descriptor.upstream_headers["Cookie"], "SID=1");

        let resolver = PrimaryResolver::new(FakeExtractor::new(|| {
            Ok(ExtractedMedia {
                url: Some("https://cdn.example/video".into()),
                cookies: Some("Path=/; Secure".into()),
                ..ExtractedMedia::default()
            })
        }));
        let descriptor = resolver
            .resolve(&request(MediaKind::Video, Quality::P720))
            .unwrap();
        assert!(!descriptor.upstream_headers.contains_key("Cookie"));
    }

    #[test]
    fn resolve_video_uses_container_extension() {
        let resolver = PrimaryResolver::new(FakeExtractor::new(|| {
            Ok(ExtractedMedia {
                title: Some("Clip".into()),
                url: Some("https://cdn.example/video".into()),
                ext: Some("webm".into()),
                ..ExtractedMedia::default()
            })
        }));
        let descriptor = resolver
            .resolve(&request(MediaKind::Video, Quality::P480))
            .unwrap();
        assert_eq!(descriptor.filename, "Clip.webm");
        assert!(descriptor.content_type.starts_with("video/"));
    }

    #[test]
    fn resolve_rejects_empty_url() {
        let resolver = PrimaryResolver::new(FakeExtractor::new(|| {
            Ok(ExtractedMedia {
                title: Some("Clip".into()),
                url: Some(String::new()),
                ..ExtractedMedia::default()
            })
        }));
        let err = resolver
            .resolve(&request(MediaKind::Video, Quality::P1080))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Extraction(_)));
    }

    #[test]
    fn resolve_passes_extractor_errors_through() {
        let resolver = PrimaryResolver::new(FakeExtractor::new(|| {
            Err(ResolveError::BotDetected("Sign in".into()))
        }));
        let err = resolver
            .resolve(&request(MediaKind::Video, Quality::P1080))
            .unwrap_err();
        assert!(err.is_bot_detected());
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::time::Instant;
        use tempfile::tempdir;

        fn write_stub(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("yt-dlp");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn extract(ytdlp: YtDlp) -> Result<ExtractedMedia, ResolveError> {
            tokio::task::spawn_blocking(move || ytdlp.extract("https://example.com/v/abc", "best"))
                .await
                .unwrap()
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn ytdlp_parses_dump_json() {
            let dir = tempdir().unwrap();
            let stub = write_stub(
                dir.path(),
                r#"echo '{"title":"Stub","url":"https://cdn.example/v.mp4","ext":"mp4","http_headers":{"User-Agent":"stub"}}'"#,
            );
            let media = extract(YtDlp::new(stub, None, Duration::from_secs(10)))
                .await
                .unwrap();
            assert_eq!(media.title.as_deref(), Some("Stub"));
            assert_eq!(media.url.as_deref(), Some("https://cdn.example/v.mp4"));
            assert_eq!(media.http_headers["User-Agent"], "stub");
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn ytdlp_failure_is_classified() {
            let dir = tempdir().unwrap();
            let stub = write_stub(
                dir.path(),
                "echo \"ERROR: Sign in to confirm you're not a bot\" >&2\nexit 1",
            );
            let err = extract(YtDlp::new(stub, None, Duration::from_secs(10)))
                .await
                .unwrap_err();
            assert!(err.is_bot_detected());
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn ytdlp_is_killed_after_timeout() {
            let dir = tempdir().unwrap();
            let stub = write_stub(dir.path(), "exec sleep 5");
            let started = Instant::now();
            let err = extract(YtDlp::new(stub, None, Duration::from_millis(200)))
                .await
                .unwrap_err();
            assert!(matches!(err, ResolveError::Extraction(ref msg) if msg.contains("timed out")));
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[test]
        fn ytdlp_outside_a_runtime_is_an_extraction_error() {
            let ytdlp = YtDlp::new(PathBuf::from("/bin/true"), None, Duration::from_secs(1));
            let err = ytdlp.extract("https://example.com/v/abc", "best").unwrap_err();
            assert!(matches!(err, ResolveError::Extraction(ref msg) if msg.contains("no runtime")));
        }
    }
}
