//! Web server implementation using Axum.

use axum::{
    Router,
    extract::{Json as ExtractJson, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::camera::CameraHandle;
use crate::config::{Settings, parse_clock_time};
use crate::cycle::{CycleReport, ModuleStatus, Orchestrator};
use crate::positions::{HOME_POSITION, Position};
use crate::scheduler::Scheduler;
use crate::{OurError, OurResult};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub camera: CameraHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Scheduler,
}

/// Generic API response
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }
    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
        }
    }
}

/// One position's frame availability as reported by the status endpoint.
#[derive(Serialize, Deserialize)]
pub struct PositionFrameInfo {
    pub id: u8,
    pub name: String,
    pub has_latest: bool,
    pub latest_url: String,
}

/// Full daemon status snapshot.
#[derive(Serialize, Deserialize)]
pub struct StatusData {
    pub status: ModuleStatus,
    pub scheduler_running: bool,
    pub current_position: u8,
    pub last_move_time: Option<DateTime<Utc>>,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub last_complete_cycle_time: Option<DateTime<Utc>>,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub interval_secs: u64,
    pub active_start: String,
    pub active_end: String,
    pub patrol_positions: Vec<u8>,
    pub positions: Vec<PositionFrameInfo>,
}

/// Schedule fields the config endpoint accepts. Absent fields keep their
/// current values.
#[derive(Serialize, Deserialize, Default)]
pub struct ConfigUpdate {
    pub interval_secs: Option<u64>,
    pub position_wait_secs: Option<u64>,
    pub transition_wait_secs: Option<u64>,
    pub active_start: Option<String>,
    pub active_end: Option<String>,
    pub timezone_offset: Option<i32>,
    pub dst_enabled: Option<bool>,
    pub patrol_positions: Option<Vec<u8>>,
}

/// Build the application router. Split out from [`start_server`] so tests
/// can drive it on an ephemeral port.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(daemon_status))
        .route("/api/positions", get(list_positions))
        .route("/api/positions/{id}/latest.jpg", get(latest_frame))
        .route("/api/cycle/run", post(run_cycle))
        .route("/api/camera/stop", post(stop_camera))
        .route("/api/scheduler/start", post(start_scheduler))
        .route("/api/scheduler/stop", post(stop_scheduler))
        .route("/api/config", get(get_config))
        .route("/api/config", post(save_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server
pub async fn start_server(host: String, port: u16, state: Arc<AppState>) -> OurResult<()> {
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OurError::App(format!("Failed to bind to {addr}: {e}")))?;

    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| OurError::App(format!("Server error: {e}")))?;

    Ok(())
}

async fn daemon_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusData>> {
    let positions = state.camera.positions().await;
    let store = state.orchestrator.store();

    let position_infos: Vec<PositionFrameInfo> = positions
        .iter()
        .map(|p| PositionFrameInfo {
            id: p.id,
            name: p.name.clone(),
            has_latest: store.latest_exists(p.id),
            latest_url: format!("/api/positions/{}/latest.jpg", p.id),
        })
        .collect();

    let cycle = state.orchestrator.state().read().await;
    let status = StatusData {
        status: cycle.status,
        scheduler_running: cycle.running,
        current_position: cycle.current_position,
        last_move_time: cycle.last_move_time,
        last_cycle_start: cycle.last_cycle_start,
        last_complete_cycle_time: cycle.last_complete_cycle_time,
        last_frame_time: cycle.last_frame_time,
        interval_secs: cycle.interval_secs,
        active_start: cycle.active_start.format("%H:%M").to_string(),
        active_end: cycle.active_end.format("%H:%M").to_string(),
        patrol_positions: cycle.patrol_positions.clone(),
        positions: position_infos,
    };
    Json(ApiResponse::success(status))
}

async fn list_positions(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Position>>> {
    Json(ApiResponse::success(state.camera.positions().await))
}

async fn latest_frame(
    Path(position_id): Path<u8>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let store = state.orchestrator.store();
    let path = store.latest_path(position_id);

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(_) => {
            // No frame captured yet for this position, serve a placeholder
            // so dashboards always get a valid image.
            let status = { state.orchestrator.state().read().await.status };
            match store.placeholder(status) {
                Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
                Err(e) => {
                    error!("Failed to render placeholder for position {position_id}: {e}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

async fn run_cycle(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<CycleReport>>) {
    match state.scheduler.force_run_now().await {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::success(report))),
        Err(e) => {
            error!("Manual cycle request rejected: {e}");
            (
                StatusCode::CONFLICT,
                Json(ApiResponse::<CycleReport>::error(e.to_string())),
            )
        }
    }
}

async fn stop_camera(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    if state.camera.stop().await {
        Json(ApiResponse::success(()))
    } else {
        Json(ApiResponse::<()>::error(
            "Failed to stop camera movement".to_string(),
        ))
    }
}

async fn start_scheduler(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.scheduler.start().await;
    Json(ApiResponse::success(()))
}

async fn stop_scheduler(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.scheduler.stop().await;
    Json(ApiResponse::success(()))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ConfigUpdate>> {
    let cycle = state.orchestrator.state().read().await;
    let config = ConfigUpdate {
        interval_secs: Some(cycle.interval_secs),
        position_wait_secs: Some(cycle.position_wait_secs),
        transition_wait_secs: Some(cycle.transition_wait_secs),
        active_start: Some(cycle.active_start.format("%H:%M").to_string()),
        active_end: Some(cycle.active_end.format("%H:%M").to_string()),
        timezone_offset: Some(cycle.timezone_offset),
        dst_enabled: Some(cycle.dst_enabled),
        patrol_positions: Some(cycle.patrol_positions.clone()),
    };
    Json(ApiResponse::success(config))
}

async fn save_config(
    State(state): State<Arc<AppState>>,
    ExtractJson(update): ExtractJson<ConfigUpdate>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match apply_config_update(&state, &update).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => {
            error!("Config update rejected: {e}");
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::error(e.to_string())),
            )
        }
    }
}

/// Validate the update in full, then apply it to the live state under a
/// single write guard and persist it. A rejected update changes nothing.
async fn apply_config_update(state: &AppState, update: &ConfigUpdate) -> OurResult<()> {
    let active_start = update
        .active_start
        .as_deref()
        .map(parse_clock_time)
        .transpose()?;
    let active_end = update
        .active_end
        .as_deref()
        .map(parse_clock_time)
        .transpose()?;

    if let Some(positions) = &update.patrol_positions {
        if positions.is_empty() {
            return Err(OurError::Config(
                "Patrol position list must not be empty".to_string(),
            ));
        }
        if positions.contains(&HOME_POSITION) {
            return Err(OurError::Config(
                "The home position cannot be part of the patrol".to_string(),
            ));
        }
        let known: Vec<u8> = state.camera.positions().await.iter().map(|p| p.id).collect();
        for id in positions {
            if !known.contains(id) {
                return Err(OurError::Config(format!("Unknown position ID {id}")));
            }
        }
    }

    {
        let mut cycle = state.orchestrator.state().write().await;
        let start = active_start.unwrap_or(cycle.active_start);
        let end = active_end.unwrap_or(cycle.active_end);
        if start >= end {
            return Err(OurError::Config(format!(
                "Active window start {start} must be before end {end}"
            )));
        }

        if let Some(v) = update.interval_secs {
            cycle.interval_secs = v;
        }
        if let Some(v) = update.position_wait_secs {
            cycle.position_wait_secs = v;
        }
        if let Some(v) = update.transition_wait_secs {
            cycle.transition_wait_secs = v;
        }
        cycle.active_start = start;
        cycle.active_end = end;
        if let Some(v) = update.timezone_offset {
            cycle.timezone_offset = v;
        }
        if let Some(v) = update.dst_enabled {
            cycle.dst_enabled = v;
        }
        if let Some(v) = &update.patrol_positions {
            cycle.patrol_positions = v.clone();
        }
    }

    let mut overrides = crate::config::ScheduleOverrides::load();
    if let Some(v) = update.interval_secs {
        overrides.cycle_interval_secs = Some(v);
    }
    if let Some(v) = update.position_wait_secs {
        overrides.position_wait_secs = Some(v);
    }
    if let Some(v) = update.transition_wait_secs {
        overrides.transition_wait_secs = Some(v);
    }
    if let Some(v) = active_start {
        overrides.active_start = Some(v);
    }
    if let Some(v) = active_end {
        overrides.active_end = Some(v);
    }
    if let Some(v) = update.timezone_offset {
        overrides.timezone_offset = Some(v);
    }
    if let Some(v) = update.dst_enabled {
        overrides.dst_enabled = Some(v);
    }
    if let Some(v) = &update.patrol_positions {
        overrides.patrol_positions = Some(v.clone());
    }
    overrides.save()?;

    Ok(())
}
