use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::capture::error::ErrorKind;
use crate::capture::{still, Frame, FrameFormat};
use crate::pipeline::{WorkerState, WorkerStatus};
use crate::server::AppState;

const X_FRAME_NUMBER: HeaderName = HeaderName::from_static("x-frame-number");
const X_WIDTH: HeaderName = HeaderName::from_static("x-width");
const X_HEIGHT: HeaderName = HeaderName::from_static("x-height");
const X_ERROR_KIND: HeaderName = HeaderName::from_static("x-error-kind");

fn bad_request(message: impl Into<String>, kind: Option<ErrorKind>) -> Response {
    let message = message.into();
    warn!("Camera request failed: {}", message);
    let mut headers = HeaderMap::new();
    if let Some(kind) = kind {
        headers.insert(X_ERROR_KIND, HeaderValue::from_static(kind.as_str()));
    }
    (StatusCode::BAD_REQUEST, headers, message).into_response()
}

fn frame_response(frame: &Frame) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(frame.meta.format.content_type()),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, private"),
    );
    headers.insert(X_FRAME_NUMBER, HeaderValue::from(frame.frame_no()));
    if let FrameFormat::RawLuma { width, height } = frame.meta.format {
        headers.insert(X_WIDTH, HeaderValue::from(width));
        headers.insert(X_HEIGHT, HeaderValue::from(height));
    }
    (headers, frame.data.clone()).into_response()
}

/// Latest liveview frame, starting the camera on first use
pub(super) async fn liveview(State(state): State<AppState>) -> Response {
    let liveview = &state.config.liveview;
    let status = match state
        .worker
        .ensure_started(liveview.start_wait(), liveview.start_poll())
        .await
    {
        Ok(status) => status,
        // Still STARTING: reported apart from a failed start
        Err(e) => return bad_request(e.to_string(), Some(e.kind())),
    };

    match status.state {
        WorkerState::Streaming => match state.worker.get_latest_frame() {
            Ok(frame) => frame_response(&frame),
            Err(e) => bad_request(e.to_string(), None),
        },
        _ => bad_request(
            status
                .message
                .unwrap_or_else(|| "liveview is not streaming".into()),
            status.error_kind,
        ),
    }
}

pub(super) async fn liveview_stop(State(state): State<AppState>) -> &'static str {
    state.worker.stop();
    "OK"
}

/// Worker state for the status bar of the app
#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub frame_no: Option<u64>,
    pub fps: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub(super) async fn liveview_status(State(state): State<AppState>) -> Json<StatusReport> {
    let frame = state.worker.peek_frame();
    let dimensions = frame.as_deref().and_then(Frame::dimensions);
    Json(StatusReport {
        status: state.worker.status(),
        frame_no: frame.map(|f| f.frame_no()),
        fps: state.worker.fps(),
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    })
}

pub(super) async fn picture(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match still::fetch_picture(&state.config.still, &filename).await {
        Ok(data) => ([(header::CONTENT_TYPE, "image/jpeg")], data).into_response(),
        Err(e) => bad_request(e.detail(), Some(e.kind())),
    }
}

pub(super) async fn unlock(State(state): State<AppState>) -> Response {
    match still::unlock_camera(&state.config.source.unlock_command).await {
        Ok(()) => "OK".into_response(),
        Err(e) => bad_request(e.detail(), Some(e.kind())),
    }
}
