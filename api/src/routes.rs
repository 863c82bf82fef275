use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use roadwatch_common::position::Position;
use roadwatch_pipeline::analysis::{analyze_image, AnalysisReport, AnalysisSettings};
use roadwatch_pipeline::engine::{SourceOpener, StreamEngine, StreamSettings, StreamState};
use roadwatch_pipeline::hub::{InferenceSummary, SystemMetrics};
use roadwatch_pipeline::source::SourceSpec;
use roadwatch_pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::ScanRecord;
use crate::error::ApiError;
use crate::multipart;
use crate::state::AppState;
use crate::ws;

const DEFAULT_SCAN_LIMIT: usize = 50;
const MAX_SCAN_LIMIT: usize = 500;

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_upload_mb.saturating_mul(1024 * 1024);
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/predict", post(predict))
        .route("/streams", post(create_stream))
        .route("/streams/upload", post(upload_stream))
        .route("/streams/:id", delete(delete_stream))
        .route("/streams/:id/feed", get(stream_feed))
        .route("/streams/:id/status", get(stream_status))
        .route("/snapshots/:name", get(get_snapshot))
        .route("/scans", get(list_scans))
        .route("/ws/metrics", get(ws::metrics_socket))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Service status
// ---------------------------------------------------------------------------

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let metrics = state.hub.snapshot();
    let status = if metrics.model_loaded { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "model_loaded": metrics.model_loaded,
        "uptime_seconds": metrics.uptime_seconds,
        "timestamp": Utc::now(),
    }))
}

/// GET /metrics
async fn metrics(State(state): State<Arc<AppState>>) -> Json<SystemMetrics> {
    Json(state.hub.snapshot())
}

// ---------------------------------------------------------------------------
// Still-image analysis
// ---------------------------------------------------------------------------

fn parse_coordinate(raw: &str, field: &str, bound: f64) -> Result<Option<f64>, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v.abs() <= bound => Ok(Some(v)),
        _ => Err(ApiError::BadRequest(format!("{field} must be a number within ±{bound}"))),
    }
}

/// POST /predict  (multipart: file, browser_lat?, browser_lon?)
async fn predict(
    State(state): State<Arc<AppState>>,
    mut form: Multipart,
) -> Result<Json<AnalysisReport>, ApiError> {
    let mut upload: Option<Bytes> = None;
    let (mut lat, mut lon) = (None, None);
    while let Some(field) = form.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => upload = Some(field.bytes().await?),
            Some("browser_lat") => lat = parse_coordinate(&field.text().await?, "browser_lat", 90.0)?,
            Some("browser_lon") => lon = parse_coordinate(&field.text().await?, "browser_lon", 180.0)?,
            _ => {}
        }
    }
    let bytes = upload.ok_or_else(|| ApiError::BadRequest("missing multipart field `file`".into()))?;
    let hint = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Position::new(lat, lon)),
        _ => None,
    };

    let worker = state.clone();
    let report = tokio::task::spawn_blocking(move || {
        let settings = AnalysisSettings::from(&worker.config.detector);
        analyze_image(&bytes, hint, &worker.detector, &worker.resolver, settings)
    })
    .await??;

    state.hub.record_inference(report.inference_time);
    state
        .hub
        .publish(InferenceSummary::new(&report.severity, report.inference_time));

    let record = ScanRecord::from_report(&report);
    let scans = state.scans.clone();
    match tokio::task::spawn_blocking(move || scans.append(&record)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "scan not logged"),
        Err(e) => warn!(error = %e, "scan log worker failed"),
    }

    info!(
        detections = report.detections.len(),
        severity = report.severity.score,
        inference_ms = report.inference_time_ms,
        "image analysed"
    );
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateStream {
    path: Option<PathBuf>,
    device: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StreamStatus {
    stream_id: String,
    source: String,
    live: bool,
    #[serde(flatten)]
    state: StreamState,
}

fn missing_file(path: &Path) -> ApiError {
    ApiError::Pipeline(PipelineError::SourceUnopenable {
        source_ref: path.display().to_string(),
        reason: "no such file".into(),
        missing: true,
    })
}

/// POST /streams  {"path": "..."} | {"device": N}
async fn create_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStream>,
) -> Result<Json<Value>, ApiError> {
    let spec = match (req.path, req.device) {
        (Some(path), None) => {
            if !tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                return Err(missing_file(&path));
            }
            SourceSpec::File(path)
        }
        (None, Some(index)) => SourceSpec::Device(index),
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of `path` or `device` is required".into(),
            ))
        }
    };
    let stream_id = state.registry.register(spec);
    Ok(Json(json!({ "stream_id": stream_id })))
}

/// Reduce an uploaded file name to a safe single path component.
fn sanitize_file_name(name: Option<&str>) -> String {
    let base = name
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.mp4".into()
    } else {
        cleaned.to_owned()
    }
}

/// POST /streams/upload  (multipart: file)
async fn upload_stream(
    State(state): State<Arc<AppState>>,
    mut form: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut saved: Option<PathBuf> = None;
    while let Some(field) = form.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let name = format!("{}_{}", Uuid::new_v4().simple(), sanitize_file_name(field.file_name()));
        let data = field.bytes().await?;
        let dir = &state.config.server.upload_dir;
        let path = dir.join(name);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ApiError::Internal(format!("cannot create {}: {e}", dir.display())))?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| ApiError::Internal(format!("cannot write {}: {e}", path.display())))?;
        info!(path = %path.display(), bytes = data.len(), "video uploaded");
        saved = Some(path);
        break;
    }
    let path = saved.ok_or_else(|| ApiError::BadRequest("missing multipart field `file`".into()))?;
    let stream_id = state.registry.register(SourceSpec::File(path.clone()));
    Ok(Json(json!({ "stream_id": stream_id, "path": path })))
}

/// GET /streams/:id/feed
///
/// The source is opened before any response bytes go out, so an unusable
/// source still gets a proper error status.
async fn stream_feed(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    state.detector.ensure_ready()?;
    let (spec, playback) = state
        .registry
        .begin_playback(&id)
        .ok_or_else(|| ApiError::UnknownStream(id.clone()))?;

    let settings =
        StreamSettings::for_source(&state.config.stream, &state.config.detector, spec.is_live());
    let stream_config = state.config.stream.clone();
    let opener: SourceOpener = Box::new(move || spec.open(&stream_config));
    let mut engine = StreamEngine::new(id, opener, state.detector.clone(), settings)
        .with_hub(state.hub.clone())
        .with_snapshots(state.snapshots.clone())
        .with_drift(state.resolver.stream_drift())
        .with_cancel(playback.cancel)
        .with_state(playback.state);

    let engine = tokio::task::spawn_blocking(move || engine.start().map(|()| engine)).await??;

    Ok((
        [
            (header::CONTENT_TYPE, multipart::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(multipart::frame_stream(engine)),
    )
        .into_response())
}

/// GET /streams/:id/status
async fn stream_status(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<StreamStatus>, ApiError> {
    let (spec, stream_state) = state
        .registry
        .status(&id)
        .ok_or_else(|| ApiError::UnknownStream(id.clone()))?;
    Ok(Json(StreamStatus {
        stream_id: id,
        source: spec.describe(),
        live: spec.is_live(),
        state: stream_state,
    }))
}

/// DELETE /streams/:id
async fn delete_stream(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::UnknownStream(id))
    }
}

// ---------------------------------------------------------------------------
// Snapshots and scan log
// ---------------------------------------------------------------------------

/// GET /snapshots/:name
async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    let path = state
        .snapshots
        .resolve(&name)
        .ok_or_else(|| ApiError::UnknownSnapshot(name.clone()))?;
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], data).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::UnknownSnapshot(name)),
        Err(e) => Err(ApiError::Internal(format!("cannot read {}: {e}", path.display()))),
    }
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    limit: Option<usize>,
}

/// GET /scans?limit=
async fn list_scans(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScanQuery>,
) -> Result<Json<Vec<ScanRecord>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_SCAN_LIMIT).clamp(1, MAX_SCAN_LIMIT);
    let scans = state.scans.clone();
    let rows = tokio::task::spawn_blocking(move || scans.recent(limit)).await??;
    Ok(Json(rows))
}
