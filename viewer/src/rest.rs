use crate::errors::Error;
use crate::event_loop::{request, Command};
use crate::model::{DeviceId, DevicePanel, Summary};
use crate::mqtt::ConnectionStatus;
use crate::retrieval::{Issued, RequestId};
use crate::session::{HistoryStatus, RawMessage, SeriesView, Snapshot};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    snapshots: watch::Receiver<Snapshot>,
    commands: mpsc::Sender<Command>,
}

impl AppState {
    pub fn new(snapshots: watch::Receiver<Snapshot>, commands: mpsc::Sender<Command>) -> Self {
        Self {
            snapshots,
            commands,
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FetchBody {
    device: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatesBody {
    device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectBody {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub connection: ConnectionStatus,
    pub generated_at: i64,
    pub offline_ms: i64,
    #[serde(flatten)]
    pub summary: Summary,
}

#[derive(Debug, Serialize)]
pub struct IssuedResponse {
    pub request_id: RequestId,
    pub device: DeviceId,
    pub date: Option<String>,
    pub reply_topic: String,
    pub superseded: Option<RequestId>,
}

impl From<Issued> for IssuedResponse {
    fn from(issued: Issued) -> Self {
        Self {
            request_id: issued.request.request_id,
            device: issued.request.device,
            date: issued.request.date,
            reply_topic: issued.request.reply_topic,
            superseded: issued.superseded,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/snapshot", get(get_snapshot))
        .route("/api/v1/summary", get(get_summary))
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/devices/:device", get(get_device))
        .route("/api/v1/series/:device", get(get_series))
        .route("/api/v1/message", get(get_last_message))
        .route("/api/v1/history", get(get_history))
        .route("/api/v1/history/fetch", post(post_fetch))
        .route("/api/v1/history/dates", post(post_list_dates))
        .route("/api/v1/history/download", get(get_download))
        .route("/api/v1/clear", post(post_clear))
        .route("/api/v1/connect", post(post_connect))
        .route("/api/v1/disconnect", post(post_disconnect))
        .with_state(state)
}

async fn get_snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.snapshot())
}

async fn get_summary(State(state): State<AppState>) -> Json<SummaryResponse> {
    let snap = state.snapshot();
    Json(SummaryResponse {
        connection: snap.connection,
        generated_at: snap.generated_at,
        offline_ms: snap.offline_ms,
        summary: snap.summary,
    })
}

async fn get_devices(State(state): State<AppState>) -> Json<Vec<DevicePanel>> {
    Json(state.snapshot().devices)
}

async fn get_device(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<DevicePanel>, ApiError> {
    let device = DeviceId::new(device);
    state
        .snapshot()
        .panel(&device)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown device {}", device)))
}

async fn get_series(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<SeriesView>, ApiError> {
    let device = DeviceId::new(device);
    state
        .snapshot()
        .series
        .remove(&device)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown device {}", device)))
}

async fn get_last_message(State(state): State<AppState>) -> Json<Option<RawMessage>> {
    Json(state.snapshot().last_message)
}

async fn get_history(State(state): State<AppState>) -> Json<HistoryStatus> {
    Json(state.snapshot().history)
}

async fn post_fetch(
    State(state): State<AppState>,
    body: Option<Json<FetchBody>>,
) -> Result<(StatusCode, Json<IssuedResponse>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let device = body.device.filter(|d| !d.is_empty()).map(DeviceId::new);
    let date = body.date;
    let issued = request(&state.commands, |reply| Command::Fetch {
        device,
        date,
        reply,
    })
    .await??;
    Ok((StatusCode::ACCEPTED, Json(issued.into())))
}

async fn post_list_dates(
    State(state): State<AppState>,
    body: Option<Json<DatesBody>>,
) -> Result<(StatusCode, Json<IssuedResponse>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let device = body.device.filter(|d| !d.is_empty()).map(DeviceId::new);
    let issued = request(&state.commands, |reply| Command::ListDates { device, reply }).await??;
    Ok((StatusCode::ACCEPTED, Json(issued.into())))
}

async fn get_download(State(state): State<AppState>) -> Result<Response, ApiError> {
    let download = state
        .snapshot()
        .history
        .download
        .ok_or_else(|| ApiError::NotFound("no completed download".to_string()))?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.filename.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes.clone(),
    )
        .into_response())
}

async fn post_clear(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    request(&state.commands, |reply| Command::Clear { reply }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_connect(
    State(state): State<AppState>,
    body: Option<Json<ConnectBody>>,
) -> Result<StatusCode, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    request(&state.commands, |reply| Command::Connect {
        username: body.username,
        password: body.password,
        reply,
    })
    .await??;
    Ok(StatusCode::ACCEPTED)
}

async fn post_disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    request(&state.commands, |reply| Command::Disconnect { reply }).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Viewer(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Viewer(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Viewer(e @ Error::TransportUnavailable) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::Viewer(e @ (Error::NoDeviceSelected | Error::NoDateSelected)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Viewer(e) => {
                error!("API error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Internal server error: {}", e))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
