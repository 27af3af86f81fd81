#![forbid(unsafe_code)]

//! Axum surface: input validation, the resolution chain on the blocking pool,
//! probe responses, and the streamed attachment itself.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::Serialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::media::{MediaDescriptor, MediaKind, Quality, ResolveRequest, Strategy};
use crate::proxy::StreamProxy;
use crate::resolve::{ResolutionCoordinator, Resolver};

pub const SERVICE_NAME: &str = "media-relay";

const BOT_DETECTED_GUIDANCE: &str = "The video platform blocked this server with a bot check. \
    Use /fallback-download to fetch the file directly from your browser.";

/// Shared, read-only state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    chain: Arc<ResolutionCoordinator>,
    mirrors: Arc<dyn Resolver>,
    proxy: Arc<StreamProxy>,
    www_root: Option<Arc<PathBuf>>,
}

impl AppState {
    pub fn new(
        chain: ResolutionCoordinator,
        mirrors: Arc<dyn Resolver>,
        proxy: StreamProxy,
        www_root: Option<PathBuf>,
    ) -> Self {
        Self {
            chain: Arc::new(chain),
            mirrors,
            proxy: Arc::new(proxy),
            www_root: www_root.map(Arc::new),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let (chain, mirrors) = ResolutionCoordinator::from_config(config);
        Self::new(
            chain,
            mirrors,
            StreamProxy::from_config(config),
            config.www_root.clone(),
        )
    }

    async fn resolve(&self, request: ResolveRequest) -> ApiResult<MediaDescriptor> {
        let chain = self.chain.clone();
        tokio::task::spawn_blocking(move || chain.resolve(&request))
            .await
            .map_err(|err| ApiError::internal(format!("resolver task failed: {err}")))?
            .map_err(ApiError::from)
    }

    async fn resolve_mirrors_only(
        &self,
        request: ResolveRequest,
    ) -> Result<MediaDescriptor, MirrorFailure> {
        let mirrors = self.mirrors.clone();
        match tokio::task::spawn_blocking(move || mirrors.resolve(&request)).await {
            Ok(result) => result.map_err(MirrorFailure::Unavailable),
            Err(err) => {
                error!(error = %err, "mirror task failed");
                Err(MirrorFailure::Internal)
            }
        }
    }
}

/// Why `/fallback-download` could not hand out a link.
#[derive(Debug)]
enum MirrorFailure {
    Unavailable(ResolveError),
    Internal,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/download", get(download))
        .route("/fallback-download", get(fallback_download))
        .fallback(static_fallback)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidRequest(message) => Self::new(StatusCode::BAD_REQUEST, message),
            ResolveError::BotDetected(_) => Self::new(StatusCode::FORBIDDEN, BOT_DETECTED_GUIDANCE),
            ResolveError::Unavailable
            | ResolveError::MirrorsExhausted { .. }
            | ResolveError::UpstreamStatus(_)
            | ResolveError::UpstreamConnect(_) => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            ResolveError::Extraction(_) | ResolveError::UpstreamStream(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `url`, `type`, `quality` and `probe` from the query string. Parsing never
/// fails: the first occurrence of a key wins and unknown keys are ignored.
#[derive(Debug, Default)]
struct DownloadQuery {
    url: Option<String>,
    kind: Option<String>,
    quality: Option<String>,
    probe: Option<String>,
}

impl DownloadQuery {
    fn parse(raw: Option<&str>) -> Self {
        let mut query = Self::default();
        for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                "url" => &mut query.url,
                "type" => &mut query.kind,
                "quality" => &mut query.quality,
                "probe" => &mut query.probe,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        query
    }

    fn into_request(self) -> Result<ResolveRequest, ResolveError> {
        let probe_only = matches!(
            self.probe.as_deref().map(str::trim),
            Some("1" | "true" | "yes")
        );
        ResolveRequest::new(
            self.url.as_deref().unwrap_or_default(),
            MediaKind::parse(self.kind.as_deref()),
            Quality::parse(self.quality.as_deref()),
            probe_only,
        )
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct ProbeResponse {
    ok: bool,
    filename: String,
    ext: String,
    source: Strategy,
}

#[derive(Debug, Serialize)]
struct FallbackResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
    })
}

async fn download(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    let request = DownloadQuery::parse(raw.as_deref()).into_request()?;
    let probe_only = request.probe_only;
    let descriptor = state.resolve(request).await?;

    if probe_only {
        return Ok(Json(ProbeResponse {
            ok: true,
            filename: descriptor.filename,
            ext: descriptor.file_extension,
            source: descriptor.source,
        })
        .into_response());
    }

    let proxy = state.proxy.clone();
    let headers = attachment_headers(&descriptor);
    let upstream = tokio::task::spawn_blocking(move || proxy.open(&descriptor))
        .await
        .map_err(|err| ApiError::internal(format!("upstream task failed: {err}")))??;

    info!("relaying media to client");
    let mut response = Body::from_stream(upstream.into_stream()).into_response();
    response.headers_mut().extend(headers);
    Ok(response)
}

async fn fallback_download(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Response {
    let request = match DownloadQuery::parse(raw.as_deref()).into_request() {
        Ok(request) => request,
        Err(err) => {
            let body = FallbackResponse {
                ok: false,
                url: None,
                error: Some(err.to_string()),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    match state.resolve_mirrors_only(request).await {
        Ok(descriptor) => Json(FallbackResponse {
            ok: true,
            url: Some(descriptor.direct_url),
            error: None,
        })
        .into_response(),
        Err(failure) => {
            let (status, error) = match failure {
                MirrorFailure::Unavailable(err) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("All download servers are currently busy ({err})"),
                ),
                MirrorFailure::Internal => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "mirror lookup failed unexpectedly".to_string(),
                ),
            };
            let body = FallbackResponse {
                ok: false,
                url: None,
                error: Some(error),
            };
            (status, Json(body)).into_response()
        }
    }
}

fn attachment_headers(descriptor: &MediaDescriptor) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&descriptor.filename),
    );
    let content_type = HeaderValue::from_str(&descriptor.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers
}

/// `attachment; filename="…"`, plus an RFC 5987 `filename*` when the name is
/// not plain ASCII.
fn content_disposition(filename: &str) -> HeaderValue {
    let value = if filename.is_ascii() {
        format!("attachment; filename=\"{filename}\"")
    } else {
        let fallback: String = filename
            .chars()
            .map(|c| if c.is_ascii() { c } else { '_' })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if is_reserved_path(path) {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("endpoint not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn is_reserved_path(path: &str) -> bool {
    let trimmed = path.trim_start_matches('/');
    trimmed == "api"
        || trimmed.starts_with("api/")
        || matches!(trimmed, "health" | "download" | "fallback-download")
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; missing assets do.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
