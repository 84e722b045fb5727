//! The PTZ acquisition cycle.
//!
//! One cycle walks the configured patrol positions: move, wait for the
//! motors to settle, pull a frame, persist it, pause, next position. The
//! camera is always sent back to the home position once a patrol has
//! started, no matter how the patrol went.
//!
//! State machine:
//! `IDLE -> GATE_CHECK -> VISITING(i) -> RETURNING_HOME -> {COMPLETE | PARTIAL | SKIPPED}`

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::camera::CameraHandle;
use crate::capture::{FrameSource, FrameStore};
use crate::config::Settings;
use crate::error::{OurError, OurResult};
use crate::positions::HOME_POSITION;

/// Coarse health of the acquisition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Initializing,
    Ok,
    Warning,
    Error,
}

/// Terminal classification of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    /// Every visited position captured successfully.
    Complete,
    /// At least one position failed.
    Partial,
    /// The active-hours gate rejected the cycle; nothing moved.
    Skipped,
}

/// Result of one position's capture attempt. Immutable once the attempt
/// completes; retained only for the duration of the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub position_id: u8,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl CaptureResult {
    fn success(position_id: u8, attempted_at: DateTime<Utc>, file_path: PathBuf) -> Self {
        Self {
            position_id,
            attempted_at,
            success: true,
            file_path: Some(file_path),
            error: None,
        }
    }

    fn failure(position_id: u8, attempted_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            position_id,
            attempted_at,
            success: false,
            file_path: None,
            error: Some(reason),
        }
    }
}

/// Report for one finished cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<CaptureResult>,
}

/// Process-wide acquisition state. The single source of truth: every reader
/// takes a fresh guard, no component keeps a divergent copy.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub running: bool,
    pub interval_secs: u64,
    pub position_wait_secs: u64,
    pub transition_wait_secs: u64,
    pub patrol_positions: Vec<u8>,
    pub active_start: NaiveTime,
    pub active_end: NaiveTime,
    pub timezone_offset: i32,
    pub dst_enabled: bool,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub last_complete_cycle_time: Option<DateTime<Utc>>,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub status: ModuleStatus,
    /// Written together with `last_move_time`, under the same guard.
    pub current_position: u8,
    pub last_move_time: Option<DateTime<Utc>>,
}

/// Shared handle to the cycle state.
pub type SharedCycleState = Arc<RwLock<CycleState>>;

impl CycleState {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            running: false,
            interval_secs: settings.cycle_interval_secs,
            position_wait_secs: settings.position_wait_secs,
            transition_wait_secs: settings.transition_wait_secs,
            patrol_positions: settings.patrol_positions.clone(),
            active_start: settings.active_start,
            active_end: settings.active_end,
            timezone_offset: settings.timezone_offset,
            dst_enabled: settings.dst_enabled,
            last_cycle_start: None,
            last_complete_cycle_time: None,
            last_frame_time: None,
            status: ModuleStatus::Initializing,
            current_position: HOME_POSITION,
            last_move_time: None,
        }
    }

    pub fn shared(self) -> SharedCycleState {
        Arc::new(RwLock::new(self))
    }

    /// Local time of day derived from the static UTC offset and DST flag.
    pub fn local_time_of_day(&self) -> NaiveTime {
        local_time_of_day(self.timezone_offset, self.dst_enabled)
    }

    /// Whether the given time of day falls inside the active window
    /// (inclusive at both ends; the window never wraps midnight).
    pub fn within_active_window(&self, now: NaiveTime) -> bool {
        self.active_start <= now && now <= self.active_end
    }
}

/// Time of day at the configured static offset. Falls back to UTC when the
/// offset is out of range.
pub fn local_time_of_day(timezone_offset: i32, dst_enabled: bool) -> NaiveTime {
    let hours = timezone_offset + i32::from(dst_enabled);
    match FixedOffset::east_opt(hours.clamp(-23, 23) * 3600) {
        Some(offset) => Utc::now().with_timezone(&offset).time(),
        None => Utc::now().time(),
    }
}

/// Classify a finished patrol from its per-position results.
pub fn classify(results: &[CaptureResult]) -> CycleOutcome {
    if results.iter().all(|r| r.success) {
        CycleOutcome::Complete
    } else {
        CycleOutcome::Partial
    }
}

/// Drives acquisition cycles against the camera and the frame store.
pub struct Orchestrator {
    state: SharedCycleState,
    camera: CameraHandle,
    source: Arc<dyn FrameSource>,
    store: Arc<FrameStore>,
    /// Single-flight guard: one cycle in flight at a time, ever.
    in_flight: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        state: SharedCycleState,
        camera: CameraHandle,
        source: Arc<dyn FrameSource>,
        store: Arc<FrameStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            camera,
            source,
            store,
            in_flight: Mutex::new(()),
        })
    }

    pub fn state(&self) -> &SharedCycleState {
        &self.state
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn camera(&self) -> &CameraHandle {
        &self.camera
    }

    /// Run one acquisition cycle.
    ///
    /// Rejects with `OurError::App` when another cycle is already in
    /// flight — a single physical camera cannot patrol twice at once.
    pub async fn run_cycle(&self) -> OurResult<CycleReport> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| OurError::App("A capture cycle is already in flight".to_string()))?;

        let started_at = Utc::now();
        let (positions, position_wait, transition_wait, gate_open) = {
            let mut state = self.state.write().await;
            state.last_cycle_start = Some(started_at);
            let now = state.local_time_of_day();
            (
                state.patrol_positions.clone(),
                Duration::from_secs(state.position_wait_secs),
                Duration::from_secs(state.transition_wait_secs),
                state.within_active_window(now),
            )
        };

        if !gate_open {
            info!("Outside the active window, skipping this cycle");
            return Ok(CycleReport {
                outcome: CycleOutcome::Skipped,
                started_at,
                finished_at: Utc::now(),
                results: Vec::new(),
            });
        }

        info!("Starting capture cycle over positions {positions:?}");
        let results = self
            .visit_positions(&positions, position_wait, transition_wait)
            .await;

        // RETURNING_HOME: always after an actual patrol, best effort. Its
        // failure is logged and does not change the classification.
        if !positions.is_empty() {
            info!("Returning camera to the home position");
            if !self.camera.move_to(HOME_POSITION).await {
                warn!("Failed to return the camera to the home position");
            }
        }

        let outcome = classify(&results);
        let finished_at = Utc::now();
        {
            let mut state = self.state.write().await;
            match outcome {
                CycleOutcome::Complete => {
                    state.last_complete_cycle_time = Some(finished_at);
                    state.status = ModuleStatus::Ok;
                }
                CycleOutcome::Partial => {
                    state.status = if results.iter().any(|r| r.success) {
                        ModuleStatus::Warning
                    } else {
                        ModuleStatus::Error
                    };
                }
                CycleOutcome::Skipped => {}
            }
        }

        info!("Capture cycle finished: {outcome:?}");
        Ok(CycleReport {
            outcome,
            started_at,
            finished_at,
            results,
        })
    }

    /// VISITING phase: one independent attempt per position. A failed move
    /// or capture is recorded and the patrol continues with the next
    /// position; nothing here aborts the cycle.
    async fn visit_positions(
        &self,
        positions: &[u8],
        position_wait: Duration,
        transition_wait: Duration,
    ) -> Vec<CaptureResult> {
        let mut results = Vec::with_capacity(positions.len());

        for (index, position_id) in positions.iter().copied().enumerate() {
            let attempted_at = Utc::now();
            let result = self
                .capture_position(position_id, attempted_at, position_wait)
                .await;
            if let Some(reason) = &result.error {
                warn!("Position {position_id} attempt failed: {reason}");
            }
            results.push(result);

            // Transition pause, skipped after the last position.
            if index + 1 < positions.len() {
                sleep(transition_wait).await;
            }
        }

        results
    }

    async fn capture_position(
        &self,
        position_id: u8,
        attempted_at: DateTime<Utc>,
        position_wait: Duration,
    ) -> CaptureResult {
        if !self.camera.move_to(position_id).await {
            return CaptureResult::failure(
                position_id,
                attempted_at,
                "move command failed".to_string(),
            );
        }

        // The move command only means "accepted"; the motors are still
        // travelling. Settle before touching the stream.
        sleep(position_wait).await;

        let frame = match self.source.pull_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                return CaptureResult::failure(position_id, attempted_at, e.to_string());
            }
        };

        match self.store.save_frame(position_id, &frame) {
            Ok(path) => {
                let mut state = self.state.write().await;
                state.last_frame_time = Some(Utc::now());
                CaptureResult::success(position_id, attempted_at, path)
            }
            Err(e) => {
                error!("Failed to persist frame for position {position_id}: {e}");
                CaptureResult::failure(position_id, attempted_at, e.to_string())
            }
        }
    }
}
