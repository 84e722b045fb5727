//! Integration tests for the acquisition cycle and the web API.

use async_trait::async_trait;
use chrono::{NaiveTime, Timelike, Utc};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{Value, json};
use skywatch::OurResult;
use skywatch::camera::spawn_camera;
use skywatch::capture::{FrameSource, FrameStore};
use skywatch::config::Settings;
use skywatch::cycle::{CycleOutcome, CycleState, Orchestrator, SharedCycleState};
use skywatch::positions::PositionRegistry;
use skywatch::scheduler::Scheduler;
use skywatch::server::{AppState, build_router};
use skywatch::transport::PtzTransport;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

/// PTZ transport that records every goto call instead of talking to
/// hardware.
struct ScriptedTransport {
    presets: BTreeMap<String, String>,
    moves: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PtzTransport for ScriptedTransport {
    fn describe(&self) -> &str {
        "scripted"
    }

    async fn list_presets(&self) -> OurResult<BTreeMap<String, String>> {
        Ok(self.presets.clone())
    }

    async fn goto_preset(&self, token: &str, _speed: f32) -> OurResult<()> {
        self.moves
            .lock()
            .expect("moves lock poisoned")
            .push(token.to_string());
        Ok(())
    }

    async fn stop(&self) -> OurResult<()> {
        Ok(())
    }
}

/// Frame source driven by a per-call success plan. Calls beyond the plan
/// succeed; an optional delay simulates a slow stream.
struct ScriptedSource {
    plan: Vec<bool>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    fn always_ok() -> Self {
        Self {
            plan: Vec::new(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_plan(plan: Vec<bool>) -> Self {
        Self {
            plan,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            plan: Vec::new(),
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn pull_frame(&self) -> OurResult<DynamicImage> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let ok = self.plan.get(call).copied().unwrap_or(true);
        if ok {
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                8,
                8,
                Rgb([40, 80, 120]),
            )))
        } else {
            Err(skywatch::OurError::Capture(
                "no decodable frame before the deadline".to_string(),
            ))
        }
    }
}

fn preset_fixture() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("p0".to_string(), "home".to_string()),
        ("p1".to_string(), "east".to_string()),
        ("p2".to_string(), "west".to_string()),
        ("p3".to_string(), "north".to_string()),
        ("p4".to_string(), "south".to_string()),
    ])
}

fn test_settings(frames_root: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.frames_dir = frames_root.path().join("frames");
    settings.frame_fallback_dirs = Vec::new();
    settings.position_wait_secs = 0;
    settings.transition_wait_secs = 0;
    settings.frame_width = 8;
    settings.frame_height = 8;
    settings
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    state: SharedCycleState,
    moves: Arc<Mutex<Vec<String>>>,
    _frames_root: TempDir,
}

async fn build_harness(patrol: Vec<u8>, source: ScriptedSource) -> Harness {
    let frames_root = TempDir::new().expect("temp dir");
    let mut settings = test_settings(&frames_root);
    settings.patrol_positions = patrol;

    let moves = Arc::new(Mutex::new(Vec::new()));
    let transport = Box::new(ScriptedTransport {
        presets: preset_fixture(),
        moves: moves.clone(),
    });

    let mut position_ids = vec![0u8];
    position_ids.extend(&settings.patrol_positions);
    let store = Arc::new(
        FrameStore::open(
            &[settings.frames_dir.clone()],
            &position_ids,
            settings.frame_width,
            settings.frame_height,
            settings.jpeg_quality,
        )
        .expect("frame store"),
    );

    let state = CycleState::from_settings(&settings).shared();
    // Hold the gate open regardless of when the test runs.
    {
        let mut guard = state.write().await;
        guard.timezone_offset = 0;
        guard.dst_enabled = false;
        guard.active_start = NaiveTime::from_hms_opt(0, 0, 0).expect("valid time");
        guard.active_end = NaiveTime::from_hms_opt(23, 59, 59).expect("valid time");
    }

    let camera = spawn_camera(transport, PositionRegistry::default(), 0.5, state.clone());
    let orchestrator = Orchestrator::new(state.clone(), camera, Arc::new(source), store);

    Harness {
        orchestrator,
        state,
        moves,
        _frames_root: frames_root,
    }
}

fn recorded_moves(harness: &Harness) -> Vec<String> {
    harness.moves.lock().expect("moves lock poisoned").clone()
}

#[tokio::test]
async fn test_cycle_visits_all_positions_then_returns_home() {
    let harness = build_harness(vec![1, 2], ScriptedSource::always_ok()).await;

    let report = harness.orchestrator.run_cycle().await.expect("cycle runs");

    assert_eq!(report.outcome, CycleOutcome::Complete);
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.success));

    // Patrol moves in order, then exactly one move back to home.
    let moves = recorded_moves(&harness);
    assert_eq!(moves, vec!["p1", "p2", "p0"]);

    let state = harness.state.read().await;
    assert!(state.last_complete_cycle_time.is_some());
    assert!(state.last_frame_time.is_some());
}

#[tokio::test]
async fn test_cycle_skipped_outside_active_window_touches_nothing() {
    let harness = build_harness(vec![1, 2], ScriptedSource::always_ok()).await;

    // Shrink the window to a slot far from the current UTC hour.
    {
        let mut state = harness.state.write().await;
        let (start, end) = if Utc::now().hour() < 12 {
            (22, 23)
        } else {
            (1, 2)
        };
        state.active_start = NaiveTime::from_hms_opt(start, 0, 0).expect("valid time");
        state.active_end = NaiveTime::from_hms_opt(end, 0, 0).expect("valid time");
    }

    let report = harness.orchestrator.run_cycle().await.expect("cycle runs");

    assert_eq!(report.outcome, CycleOutcome::Skipped);
    assert!(report.results.is_empty());
    assert!(recorded_moves(&harness).is_empty());

    let state = harness.state.read().await;
    // A skipped cycle still counts for scheduling.
    assert!(state.last_cycle_start.is_some());
    assert!(state.last_complete_cycle_time.is_none());
}

#[tokio::test]
async fn test_failed_capture_yields_partial_and_continues() {
    // First pull fails, second succeeds.
    let harness = build_harness(vec![1, 2], ScriptedSource::with_plan(vec![false, true])).await;

    let report = harness.orchestrator.run_cycle().await.expect("cycle runs");

    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.results.len(), 2);
    assert!(!report.results[0].success);
    assert!(report.results[1].success);

    // The failure did not stop the patrol or the return home.
    assert_eq!(recorded_moves(&harness), vec!["p1", "p2", "p0"]);

    let state = harness.state.read().await;
    assert!(state.last_complete_cycle_time.is_none());
}

#[tokio::test]
async fn test_failed_position_keeps_previous_latest_frame() {
    let harness = build_harness(vec![1], ScriptedSource::with_plan(vec![true, false])).await;

    let report = harness.orchestrator.run_cycle().await.expect("first cycle");
    assert_eq!(report.outcome, CycleOutcome::Complete);

    let latest = harness.orchestrator.store().latest_path(1);
    let before = std::fs::read(&latest).expect("latest exists after success");

    let report = harness
        .orchestrator
        .run_cycle()
        .await
        .expect("second cycle");
    assert_eq!(report.outcome, CycleOutcome::Partial);

    let after = std::fs::read(&latest).expect("latest still exists");
    assert_eq!(before, after, "a failed capture must not touch latest.jpg");
}

#[tokio::test]
async fn test_concurrent_cycle_is_rejected() {
    let harness = build_harness(vec![1], ScriptedSource::slow(Duration::from_millis(500))).await;

    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.run_cycle().await });

    // Give the first cycle time to take the single-flight guard.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = harness.orchestrator.run_cycle().await;
    assert!(second.is_err(), "second concurrent cycle must be rejected");

    let report = first
        .await
        .expect("first cycle task")
        .expect("first cycle runs");
    assert_eq!(report.outcome, CycleOutcome::Complete);
}

async fn start_test_server() -> (String, Harness) {
    let harness = build_harness(vec![1, 2], ScriptedSource::always_ok()).await;

    let frames_root = TempDir::new().expect("temp dir");
    let settings = test_settings(&frames_root);
    let camera = harness.orchestrator.camera().clone();
    let state = Arc::new(AppState {
        settings,
        camera,
        orchestrator: harness.orchestrator.clone(),
        scheduler: Scheduler::new(harness.orchestrator.clone()),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = build_router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("Server error: {e}");
        }
    });

    (format!("http://{addr}"), harness)
}

#[tokio::test]
async fn test_status_endpoint_structure() {
    let (base_url, _harness) = start_test_server().await;
    let client = reqwest::Client::new();

    let response = timeout(
        Duration::from_secs(10),
        client.get(format!("{base_url}/api/status")).send(),
    )
    .await
    .expect("Status request timed out")
    .expect("Failed to send status request");

    assert!(response.status().is_success());

    let json: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["success"], json!(true));

    let data = &json["data"];
    assert!(data.get("status").is_some(), "missing 'status' field");
    assert!(
        data.get("scheduler_running").is_some(),
        "missing 'scheduler_running' field"
    );
    assert!(
        data.get("current_position").is_some(),
        "missing 'current_position' field"
    );

    let positions = data["positions"].as_array().expect("positions array");
    assert!(!positions.is_empty());
    for position in positions {
        assert!(position.get("id").is_some());
        assert!(position.get("has_latest").is_some());
        let url = position["latest_url"].as_str().expect("latest_url string");
        assert!(url.ends_with("/latest.jpg"));
    }
}

#[tokio::test]
async fn test_latest_frame_endpoint_serves_jpeg() {
    let (base_url, _harness) = start_test_server().await;
    let client = reqwest::Client::new();

    // No cycle has run yet, so the handler serves a transient placeholder.
    let response = timeout(
        Duration::from_secs(10),
        client
            .get(format!("{base_url}/api/positions/1/latest.jpg"))
            .send(),
    )
    .await
    .expect("Frame request timed out")
    .expect("Failed to send frame request");

    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/jpeg")
    );

    let bytes = response.bytes().await.expect("Failed to read body");
    assert!(bytes.len() > 2);
    assert_eq!(&bytes[0..2], &[0xFF, 0xD8], "body is not a JPEG");
}

#[tokio::test]
async fn test_config_endpoint_rejects_invalid_updates() {
    let (base_url, harness) = start_test_server().await;
    let client = reqwest::Client::new();

    let cases = vec![
        json!({ "patrol_positions": [0, 1] }),
        json!({ "patrol_positions": [] }),
        json!({ "patrol_positions": [99] }),
        json!({ "active_start": "25:00" }),
        json!({ "active_start": "22:00", "active_end": "06:00" }),
    ];

    for body in cases {
        let response = timeout(
            Duration::from_secs(10),
            client
                .post(format!("{base_url}/api/config"))
                .json(&body)
                .send(),
        )
        .await
        .expect("Config request timed out")
        .expect("Failed to send config request");

        assert_eq!(
            response.status(),
            reqwest::StatusCode::BAD_REQUEST,
            "update {body} should have been rejected"
        );
    }

    // Rejected updates leave the live schedule untouched.
    let state = harness.state.read().await;
    assert_eq!(state.patrol_positions, vec![1, 2]);
}

#[tokio::test]
async fn test_camera_stop_endpoint_reports_success() {
    let (base_url, _harness) = start_test_server().await;
    let client = reqwest::Client::new();

    let response = timeout(
        Duration::from_secs(10),
        client.post(format!("{base_url}/api/camera/stop")).send(),
    )
    .await
    .expect("Stop request timed out")
    .expect("Failed to send stop request");

    assert!(response.status().is_success());

    let json: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["success"], json!(true));
}

#[tokio::test]
async fn test_cycle_run_endpoint_reports_results() {
    let (base_url, _harness) = start_test_server().await;
    let client = reqwest::Client::new();

    let response = timeout(
        Duration::from_secs(30),
        client.post(format!("{base_url}/api/cycle/run")).send(),
    )
    .await
    .expect("Cycle request timed out")
    .expect("Failed to send cycle request");

    assert!(response.status().is_success());

    let json: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["success"], json!(true));
    assert_eq!(json["data"]["outcome"], json!("complete"));
    let results = json["data"]["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
}
