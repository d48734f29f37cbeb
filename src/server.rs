//! HTTP facade: routes, shared state and error mapping.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::task;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    cleanup::{self, CleanupHours, CleanupSummary},
    config::Settings,
    downloader::{DownloadResult, Downloader, DownloaderConfig, FormatSelector},
    platform::{self, Platform},
    store::{FileStore, StoreError},
};

pub const WELCOME_MESSAGE: &str = "Welcome to Zero Downloader API";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
pub struct AppState {
    downloader: Arc<Downloader>,
}

impl AppState {
    /// Creates the download directory and wires the downloader to it.
    pub fn new(settings: &Settings, shutdown: CancellationToken) -> Result<Self> {
        let store = FileStore::new(&settings.download_dir);
        store.ensure_root()?;
        let downloader = Downloader::new(store, DownloaderConfig::from(settings), shutdown);
        Ok(Self::from_downloader(downloader))
    }

    pub fn from_downloader(downloader: Downloader) -> Self {
        Self {
            downloader: Arc::new(downloader),
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    fn store(&self) -> &FileStore {
        self.downloader.store()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(_) => Self::bad_request(err.to_string()),
            StoreError::NotFound(_) => Self::not_found("File not found"),
            StoreError::Io { .. } => {
                warn!("serving file failed: {err}");
                Self::internal("could not read file")
            }
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
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

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: String,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    #[serde(default)]
    hours: Option<u32>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/download", get(download_query).post(download_json))
        .route("/download/{*path}", get(serve_file))
        .route("/youtube", get(download_youtube))
        .route("/tiktok", get(download_tiktok))
        .route("/instagram", get(download_instagram))
        .route("/cleanup", get(cleanup_files))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": WELCOME_MESSAGE }))
}

async fn download_query(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    Ok(run_download(&state, params, None).await)
}

async fn download_json(
    State(state): State<AppState>,
    params: Result<Json<DownloadParams>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(params) = params?;
    Ok(run_download(&state, params, None).await)
}

async fn download_youtube(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    Ok(run_download(&state, params, Some(Platform::Youtube)).await)
}

async fn download_tiktok(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    Ok(run_download(&state, params, Some(Platform::Tiktok)).await)
}

async fn download_instagram(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    Ok(run_download(&state, params, Some(Platform::Instagram)).await)
}

/// Shared body of every download route. `expected` pins the platform for the
/// platform-specific aliases.
async fn run_download(
    state: &AppState,
    params: DownloadParams,
    expected: Option<Platform>,
) -> Response {
    let matched = platform::identify(&params.url);
    let format = FormatSelector::parse(params.format.as_deref());

    let result = match expected {
        Some(expected) if matched.platform != expected => DownloadResult::failure(
            matched,
            format!("URL is not a {} link", expected.as_str()),
        ),
        _ => {
            state
                .downloader
                .download_as(&params.url, matched, &format)
                .await
        }
    };

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let stored = state.store().open(&path).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stored.size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&stored.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = Body::from_stream(ReaderStream::new(stored.file));
    Ok((headers, body).into_response())
}

async fn cleanup_files(
    State(state): State<AppState>,
    params: Result<Query<CleanupParams>, QueryRejection>,
) -> ApiResult<Json<CleanupSummary>> {
    let Query(params) = params?;
    let hours = match params.hours {
        Some(hours) => {
            CleanupHours::new(hours).map_err(|err| ApiError::bad_request(err.to_string()))?
        }
        None => CleanupHours::default(),
    };

    let root = state.store().root().to_path_buf();
    let summary = task::spawn_blocking(move || cleanup::sweep(&root, hours, Utc::now()))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
        .map_err(|err| ApiError::internal(err.to_string()))?;

    info!(
        hours = hours.get(),
        cleaned_files = summary.cleaned_files,
        freed_bytes = summary.freed_bytes,
        "cleanup requested"
    );
    Ok(Json(summary))
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// in RFC 5987 form.
fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_file_name(file_name),
        urlencoding::encode(file_name)
    )
}

fn ascii_file_name(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "download.bin".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_escapes_non_ascii() {
        assert_eq!(
            content_disposition("clip.mp4"),
            "attachment; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
        assert_eq!(
            content_disposition("café \"live\".mp3"),
            "attachment; filename=\"caf_ _live_.mp3\"; filename*=UTF-8''caf%C3%A9%20%22live%22.mp3"
        );
        assert_eq!(ascii_file_name("///"), "___");
        assert_eq!(ascii_file_name("   "), "download.bin");
    }

    #[test]
    fn store_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(StoreError::InvalidPath("../x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
    }
}
