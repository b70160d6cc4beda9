use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Semaphore,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn VideoProvider>,
    scratch: Arc<ScratchSpace>,
    download_semaphore: Arc<Semaphore>,
}

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const RESOLVE_TIMEOUT_SECONDS: u64 = 60;
const MATERIALIZE_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FormAction {
    Fetch,
    Download,
}

#[derive(Debug, Deserialize)]
struct VideoActionForm {
    #[serde(default)]
    url: Option<String>,
    action: FormAction,
    #[serde(default)]
    itag: Option<String>,
}

#[derive(Debug, Serialize)]
struct PageBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    choices: Option<Vec<QualityChoice>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl PageBody {
    fn listing(title: String, choices: Vec<QualityChoice>) -> Self {
        Self {
            title: Some(title),
            choices: Some(choices),
            error: None,
            code: None,
        }
    }
}

impl From<UserError> for PageBody {
    fn from(error: UserError) -> Self {
        Self {
            title: None,
            choices: None,
            error: Some(error.to_string()),
            code: Some(error.code()),
        }
    }
}

impl IntoResponse for PageBody {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Error)]
enum UserError {
    #[error("{0}")]
    Validation(String),
    #[error("An error occurred: Invalid URL or video not available. ({0})")]
    Provider(String),
    #[error("No progressive MP4 streams found for this video.")]
    NoStreams,
    #[error("Stream with itag {0} not found. Fetch the quality list again and retry.")]
    NotFound(String),
}

impl UserError {
    fn missing_url() -> Self {
        Self::Validation("Please enter a video URL.".to_string())
    }

    fn missing_selection() -> Self {
        Self::Validation("Please select a quality before downloading.".to_string())
    }

    fn provider(failure: ProviderFailure) -> Self {
        warn!("provider failure: {failure}");
        let detail = failure.to_string();
        let short = detail
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("provider failure")
            .to_string();
        Self::Provider(short)
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Provider(_) => "provider",
            Self::NoStreams => "no_streams",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        PageBody::from(self).into_response()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EncodingDescriptor {
    format_id: String,
    resolution_label: Option<String>,
    progressive: bool,
    container: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct QualityChoice {
    #[serde(rename = "resolution")]
    resolution_label: String,
    #[serde(rename = "itag")]
    format_id: String,
}

#[derive(Debug, Clone)]
struct VideoHandle {
    source_url: String,
    title: String,
    encodings: Vec<EncodingDescriptor>,
}

#[derive(Debug, Error)]
enum ProviderFailure {
    #[error("invalid video URL: {0}")]
    InvalidUrl(String),
    #[error("yt-dlp is not installed or not on PATH")]
    ToolMissing,
    #[error("could not run yt-dlp: {0}")]
    Spawn(std::io::Error),
    #[error("{0}")]
    Tool(String),
    #[error("the operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("unreadable video metadata: {0}")]
    Metadata(String),
    #[error("no file was produced at {0:?}")]
    MissingOutput(PathBuf),
}

#[async_trait]
trait VideoProvider: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<VideoHandle, ProviderFailure>;

    fn list_encodings(&self, video: &VideoHandle) -> Vec<EncodingDescriptor> {
        video.encodings.clone()
    }

    async fn materialize(
        &self,
        video: &VideoHandle,
        format_id: &str,
        destination: &Path,
    ) -> Result<(), ProviderFailure>;
}

struct YtDlpProvider {
    program: PathBuf,
    resolve_timeout: Duration,
    materialize_timeout: Duration,
}

impl YtDlpProvider {
    fn new() -> Self {
        let program = std::env::var("YT_DLP_PATH")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        Self {
            program,
            resolve_timeout: Duration::from_secs(RESOLVE_TIMEOUT_SECONDS),
            materialize_timeout: Duration::from_secs(MATERIALIZE_TIMEOUT_SECONDS),
        }
    }

    async fn run_yt_dlp(
        &self,
        args: Vec<String>,
        limit: Duration,
    ) -> Result<std::process::Output, ProviderFailure> {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);

        let output = timeout(limit, command.output())
            .await
            .map_err(|_| ProviderFailure::Timeout(limit))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ProviderFailure::ToolMissing
                } else {
                    ProviderFailure::Spawn(error)
                }
            })?;

        if !output.status.success() {
            warn!(
                "yt-dlp exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ProviderFailure::Tool(tool_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl VideoProvider for YtDlpProvider {
    async fn resolve(&self, url: &str) -> Result<VideoHandle, ProviderFailure> {
        let parsed =
            Url::parse(url).map_err(|error| ProviderFailure::InvalidUrl(error.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderFailure::InvalidUrl(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        let output = self
            .run_yt_dlp(
                vec![
                    "-J".to_string(),
                    "--no-playlist".to_string(),
                    "--no-warnings".to_string(),
                    url.to_string(),
                ],
                self.resolve_timeout,
            )
            .await?;

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| ProviderFailure::Metadata(error.to_string()))?;

        Ok(VideoHandle {
            source_url: url.to_string(),
            title: info
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Untitled video".to_string()),
            encodings: info.formats.iter().map(YtDlpFormat::descriptor).collect(),
        })
    }

    async fn materialize(
        &self,
        video: &VideoHandle,
        format_id: &str,
        destination: &Path,
    ) -> Result<(), ProviderFailure> {
        let template = destination.to_string_lossy().replace('%', "%%");
        self.run_yt_dlp(
            vec![
                "-f".to_string(),
                format_id.to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                "--no-progress".to_string(),
                "-o".to_string(),
                template,
                video.source_url.clone(),
            ],
            self.materialize_timeout,
        )
        .await?;

        match tokio::fs::metadata(destination).await {
            Ok(metadata) if metadata.is_file() => Ok(()),
            _ => Err(ProviderFailure::MissingOutput(destination.to_path_buf())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
}

impl YtDlpFormat {
    fn descriptor(&self) -> EncodingDescriptor {
        EncodingDescriptor {
            format_id: self.format_id.clone(),
            resolution_label: self.height.map(|height| format!("{height}p")),
            progressive: self.has_video() && self.has_audio(),
            container: self.ext.clone().unwrap_or_default(),
        }
    }

    fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none")
    }

    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(value) if value != "none")
    }
}

#[derive(Debug, Error)]
enum ScratchError {
    #[error("scratch name {0:?} is not usable")]
    InvalidName(String),
    #[error("scratch path for {0:?} would escape the scratch root")]
    OutsideRoot(String),
    #[error("could not prepare scratch slot {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

struct ScratchSpace {
    root: TempDir,
}

impl ScratchSpace {
    fn initialize() -> std::io::Result<Self> {
        Self::initialize_in(std::env::temp_dir())
    }

    fn initialize_in(base: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("vidgrab-")
            .tempdir_in(base)?;
        Ok(Self { root })
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    async fn allocate(&self, name: &str) -> Result<ScratchFile, ScratchError> {
        let file_name = sanitize_file_name(name)?;
        let request_dir = self.root.path().join(Uuid::new_v4().to_string());
        let path = request_dir.join(&file_name);
        if !path.starts_with(self.root.path()) {
            return Err(ScratchError::OutsideRoot(name.to_string()));
        }

        tokio::fs::create_dir_all(&request_dir)
            .await
            .map_err(|source| ScratchError::Io {
                source,
                path: request_dir.clone(),
            })?;

        Ok(ScratchFile {
            path,
            request_dir,
            created_at: Utc::now(),
        })
    }

    fn teardown(&self) {
        if let Err(error) = std::fs::remove_dir_all(self.root.path())
            && error.kind() != ErrorKind::NotFound
        {
            warn!(
                "could not remove scratch root {}: {error}",
                self.root.path().display()
            );
        }
    }
}

#[derive(Debug)]
struct ScratchFile {
    path: PathBuf,
    request_dir: PathBuf,
    created_at: DateTime<Utc>,
}

impl ScratchFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn release(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.request_dir) {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) => debug!(
                "released scratch file {} after {}s",
                self.path.display(),
                (Utc::now() - self.created_at).num_seconds()
            ),
            Err(error) => warn!(
                "could not release scratch file {}: {error}",
                self.path.display()
            ),
        }
    }
}

struct DeliveryHandle {
    file: ScratchFile,
    mime_type: &'static str,
    download_name: String,
}

impl DeliveryHandle {
    async fn into_attachment(self) -> Result<Response, UserError> {
        let metadata = tokio::fs::metadata(self.file.path()).await.map_err(|error| {
            warn!("could not stat {}: {error}", self.file.path().display());
            UserError::Provider("the downloaded file could not be read back".to_string())
        })?;
        let file = tokio::fs::File::open(self.file.path()).await.map_err(|error| {
            warn!("could not open {}: {error}", self.file.path().display());
            UserError::Provider("the downloaded file could not be read back".to_string())
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.mime_type));
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&metadata.len().to_string()).map_err(|_| {
                UserError::Provider("could not build the download size header".to_string())
            })?,
        );
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_str(&build_content_disposition(&self.download_name)).map_err(
                |_| UserError::Provider("could not build the download header".to_string()),
            )?,
        );
        headers.insert(
            HeaderName::from_static("x-download-filename"),
            HeaderValue::from_str(&sanitize_ascii_filename(&self.download_name)).map_err(|_| {
                UserError::Provider("could not build the download name header".to_string())
            })?,
        );

        let body = Body::from_stream(DeliveryStream {
            inner: ReaderStream::new(file),
            _file: self.file,
        });

        Ok((headers, body).into_response())
    }
}

struct DeliveryStream {
    inner: ReaderStream<tokio::fs::File>,
    _file: ScratchFile,
}

impl Stream for DeliveryStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

#[derive(Debug, Error)]
enum SetupError {
    #[error("could not create the scratch root: {0}")]
    Scratch(std::io::Error),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
}

async fn run() -> Result<(), SetupError> {
    let scratch = Arc::new(ScratchSpace::initialize().map_err(SetupError::Scratch)?);
    info!("scratch root at {}", scratch.root().display());

    let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

    let state = AppState {
        provider: Arc::new(YtDlpProvider::new()),
        scratch: scratch.clone(),
        download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/video", post(video_action))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| SetupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("listening on http://{addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scratch.teardown();

    served.map_err(SetupError::Serve)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        eprintln!("failed to install Ctrl+C handler: {error}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn video_action(
    State(state): State<AppState>,
    Form(form): Form<VideoActionForm>,
) -> Response {
    let Some(url) = form.url.as_deref().and_then(non_empty) else {
        return UserError::missing_url().into_response();
    };

    match form.action {
        FormAction::Fetch => match list_qualities(&state, url).await {
            Ok(page) => page.into_response(),
            Err(error) => error.into_response(),
        },
        FormAction::Download => match prepare_download(&state, url, form.itag.as_deref()).await {
            Ok(delivery) => delivery
                .into_attachment()
                .await
                .unwrap_or_else(|error| error.into_response()),
            Err(error) => error.into_response(),
        },
    }
}

async fn list_qualities(state: &AppState, url: &str) -> Result<PageBody, UserError> {
    let video = state
        .provider
        .resolve(url)
        .await
        .map_err(UserError::provider)?;

    let choices = select_choices(&state.provider.list_encodings(&video));
    if choices.is_empty() {
        return Err(UserError::NoStreams);
    }

    info!("listed {} quality choices for {url}", choices.len());
    Ok(PageBody::listing(sanitize_title(&video.title), choices))
}

async fn prepare_download(
    state: &AppState,
    url: &str,
    itag: Option<&str>,
) -> Result<DeliveryHandle, UserError> {
    let Some(itag) = itag.and_then(non_empty) else {
        return Err(UserError::missing_selection());
    };

    let _permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| UserError::Provider("download capacity is unavailable".to_string()))?;

    let video = state
        .provider
        .resolve(url)
        .await
        .map_err(UserError::provider)?;

    let encodings = state.provider.list_encodings(&video);
    let Some(chosen) = encodings.iter().find(|item| item.format_id == itag) else {
        return Err(UserError::NotFound(itag.to_string()));
    };

    let title = sanitize_title(&video.title);
    let label = chosen.resolution_label.as_deref().unwrap_or("video");
    let download_name = format!("{title}_{label}.mp4");

    let file = state
        .scratch
        .allocate(&download_name)
        .await
        .map_err(|error| {
            warn!("scratch allocation failed: {error}");
            UserError::Provider("could not prepare temporary space for the download".to_string())
        })?;

    state
        .provider
        .materialize(&video, itag, file.path())
        .await
        .map_err(UserError::provider)?;

    info!("materialized {download_name} at {}", file.path().display());

    Ok(DeliveryHandle {
        file,
        mime_type: "video/mp4",
        download_name,
    })
}

fn select_choices(descriptors: &[EncodingDescriptor]) -> Vec<QualityChoice> {
    let mut ranked: Vec<(u32, QualityChoice)> = descriptors
        .iter()
        .filter(|item| item.progressive && item.container == "mp4")
        .filter_map(|item| {
            let label = item.resolution_label.as_deref().and_then(non_empty)?;
            let pixels = vertical_pixels(label)?;
            Some((
                pixels,
                QualityChoice {
                    resolution_label: label.to_string(),
                    format_id: item.format_id.clone(),
                },
            ))
        })
        .collect();

    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut choices = Vec::new();
    let mut seen_labels = HashSet::new();

    for (_, choice) in ranked {
        if seen_labels.insert(choice.resolution_label.clone()) {
            choices.push(choice);
        }
    }

    choices
}

fn vertical_pixels(label: &str) -> Option<u32> {
    let digits: String = label.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn sanitize_title(raw: &str) -> String {
    raw.replace(['/', '\\'], "_")
}

fn sanitize_file_name(raw: &str) -> Result<String, ScratchError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|character| match character {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(ScratchError::InvalidName(raw.to_string()));
    }

    Ok(cleaned)
}

fn tool_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "video.mp4".to_string()
    } else {
        compact.to_string()
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8080".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
