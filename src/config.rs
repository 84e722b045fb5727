//! Configuration management for the Skywatch daemon.
//!
//! This module provides the process settings (camera address, frame storage,
//! patrol schedule) with environment variable overrides, plus the persisted
//! user configuration that survives restarts.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_with::DisplayFromStr;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::error::{OurError, OurResult};
use crate::positions::{HOME_POSITION, PositionRegistry};

fn default_active_start() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_active_end() -> NaiveTime {
    NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Which vendor transport drives the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraVendor {
    /// Local ONVIF/SOAP endpoint on the camera itself.
    Onvif,
    /// Vendor cloud open-platform API.
    Cloud,
}

impl FromStr for CameraVendor {
    type Err = OurError;

    fn from_str(s: &str) -> OurResult<Self> {
        match s.to_lowercase().as_str() {
            "onvif" => Ok(CameraVendor::Onvif),
            "cloud" => Ok(CameraVendor::Cloud),
            other => Err(OurError::Config(format!("Unknown camera vendor: {other}"))),
        }
    }
}

/// Process settings for the Skywatch daemon.
#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable debug mode
    pub debug: bool,
    /// Preferred frames root directory
    pub frames_dir: PathBuf,
    /// Fallback frame directories, probed in order when `frames_dir` is not
    /// writable
    pub frame_fallback_dirs: Vec<PathBuf>,
    /// Seconds between capture cycles
    pub cycle_interval_secs: u64,
    /// Settling wait after each accepted move, in seconds
    pub position_wait_secs: u64,
    /// Pause between patrol positions, in seconds
    pub transition_wait_secs: u64,
    /// Start of the daily active window (local time of day)
    pub active_start: NaiveTime,
    /// End of the daily active window (local time of day)
    pub active_end: NaiveTime,
    /// Static UTC offset in hours
    pub timezone_offset: i32,
    /// Daylight saving flag (+1 hour when set)
    pub dst_enabled: bool,
    /// Patrol position IDs, home (0) excluded
    pub patrol_positions: Vec<u8>,
    /// PTZ move speed, 0.0 - 1.0
    pub move_speed: f32,
    /// Vendor transport selection
    pub vendor: CameraVendor,
    /// Camera hostname or IP (ONVIF transport)
    pub camera_host: String,
    /// ONVIF service port
    pub camera_port: u16,
    /// Camera username
    pub camera_username: String,
    /// Camera password
    pub camera_password: String,
    /// Cloud API application ID
    pub cloud_app_id: Option<String>,
    /// Cloud API application secret
    pub cloud_app_secret: Option<String>,
    /// Cloud device serial number
    pub cloud_device_sn: Option<String>,
    /// Pull URL of the live video source (snapshot endpoint)
    #[serde_as(as = "DisplayFromStr")]
    pub stream_url: Url,
    /// Captured frame width (0 keeps the source size)
    pub frame_width: u32,
    /// Captured frame height (0 keeps the source size)
    pub frame_height: u32,
    /// JPEG encode quality
    pub jpeg_quality: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            debug: false,
            frames_dir: PathBuf::from("ptz_frames"),
            frame_fallback_dirs: vec![
                PathBuf::from("./ptz_frames"),
                PathBuf::from("/app/ptz_frames"),
            ],
            cycle_interval_secs: 1800,
            position_wait_secs: 10,
            transition_wait_secs: 5,
            active_start: default_active_start(),
            active_end: default_active_end(),
            timezone_offset: 2,
            dst_enabled: true,
            patrol_positions: vec![1, 2, 3, 4],
            move_speed: 0.5,
            vendor: CameraVendor::Onvif,
            camera_host: "192.168.1.100".to_string(),
            camera_port: 8899,
            camera_username: "admin".to_string(),
            camera_password: "admin".to_string(),
            cloud_app_id: None,
            cloud_app_secret: None,
            cloud_device_sn: None,
            stream_url: Url::parse("http://192.168.1.100/snapshot.jpg")
                .unwrap_or_else(|_| {
                    // The literal above always parses; Url has no cheap
                    // fallible-free constructor.
                    unreachable!("default stream URL is valid")
                }),
            frame_width: 1280,
            frame_height: 720,
            jpeg_quality: 85,
        }
    }
}

/// Parse an `HH:MM` clock time.
pub fn parse_clock_time(value: &str) -> OurResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| OurError::Config(format!("Invalid clock time '{value}': {e}")))
}

/// Parse a comma separated position list, e.g. "1,2,3,4".
pub fn parse_position_list(value: &str) -> OurResult<Vec<u8>> {
    let mut positions = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: u8 = part
            .parse()
            .map_err(|_| OurError::Config(format!("Invalid position ID: {part}")))?;
        positions.push(id);
    }
    Ok(positions)
}

impl Settings {
    /// Create a new instance of Settings with environment variable overrides.
    pub fn new() -> OurResult<Self> {
        let mut settings = Settings::default();

        if let Ok(host) = env::var("SKYWATCH_HOST") {
            settings.host = host;
        }
        if let Ok(port) = env::var("SKYWATCH_PORT") {
            settings.port = port
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_PORT: {e}")))?;
        }
        if let Ok(debug) = env::var("SKYWATCH_DEBUG") {
            settings.debug = debug
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_DEBUG: {e}")))?;
        }
        if let Ok(dir) = env::var("SKYWATCH_FRAMES_DIR") {
            settings.frames_dir = PathBuf::from(dir);
        }
        if let Ok(interval) = env::var("SKYWATCH_INTERVAL") {
            settings.cycle_interval_secs = interval
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_INTERVAL: {e}")))?;
        }
        if let Ok(wait) = env::var("SKYWATCH_POSITION_WAIT") {
            settings.position_wait_secs = wait
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_POSITION_WAIT: {e}")))?;
        }
        if let Ok(wait) = env::var("SKYWATCH_TRANSITION_WAIT") {
            settings.transition_wait_secs = wait
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_TRANSITION_WAIT: {e}")))?;
        }
        if let Ok(start) = env::var("SKYWATCH_ACTIVE_START") {
            settings.active_start = parse_clock_time(&start)?;
        }
        if let Ok(end) = env::var("SKYWATCH_ACTIVE_END") {
            settings.active_end = parse_clock_time(&end)?;
        }
        if let Ok(offset) = env::var("SKYWATCH_TZ_OFFSET") {
            settings.timezone_offset = offset
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_TZ_OFFSET: {e}")))?;
        }
        if let Ok(dst) = env::var("SKYWATCH_DST_ENABLED") {
            settings.dst_enabled = matches!(dst.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Ok(positions) = env::var("SKYWATCH_POSITIONS") {
            settings.patrol_positions = parse_position_list(&positions)?;
        }
        if let Ok(vendor) = env::var("SKYWATCH_VENDOR") {
            settings.vendor = vendor.parse()?;
        }
        if let Ok(host) = env::var("SKYWATCH_CAMERA_HOST") {
            settings.camera_host = host;
        }
        if let Ok(port) = env::var("SKYWATCH_CAMERA_PORT") {
            settings.camera_port = port
                .parse()
                .map_err(|e| OurError::Config(format!("SKYWATCH_CAMERA_PORT: {e}")))?;
        }
        if let Ok(username) = env::var("SKYWATCH_CAMERA_USERNAME") {
            settings.camera_username = username;
        }
        if let Ok(password) = env::var("SKYWATCH_CAMERA_PASSWORD") {
            settings.camera_password = password;
        }
        if let Ok(app_id) = env::var("SKYWATCH_CLOUD_APP_ID") {
            settings.cloud_app_id = Some(app_id);
        }
        if let Ok(secret) = env::var("SKYWATCH_CLOUD_APP_SECRET") {
            settings.cloud_app_secret = Some(secret);
        }
        if let Ok(sn) = env::var("SKYWATCH_CLOUD_DEVICE_SN") {
            settings.cloud_device_sn = Some(sn);
        }
        if let Ok(url) = env::var("SKYWATCH_STREAM_URL") {
            settings.stream_url = Url::parse(&url)
                .map_err(|e| OurError::Config(format!("SKYWATCH_STREAM_URL: {e}")))?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate schedule invariants.
    pub fn validate(&self) -> OurResult<()> {
        if self.active_start >= self.active_end {
            return Err(OurError::Config(format!(
                "Active window must not wrap midnight: start {} >= end {}",
                self.active_start, self.active_end
            )));
        }
        if self.patrol_positions.is_empty() {
            return Err(OurError::Config(
                "Patrol position list must not be empty".to_string(),
            ));
        }
        let registry = PositionRegistry::default();
        for id in &self.patrol_positions {
            if *id == HOME_POSITION {
                return Err(OurError::Config(
                    "Home position 0 cannot be part of the patrol".to_string(),
                ));
            }
            if !registry.contains(*id) {
                return Err(OurError::Config(format!("Unknown patrol position: {id}")));
            }
        }
        Ok(())
    }

    /// Get the path to the user config file.
    pub fn get_config_path() -> PathBuf {
        // Allow override via environment variable for testing
        if let Ok(config_path_override) = env::var("SKYWATCH_CONFIG_PATH") {
            let config_path = PathBuf::from(config_path_override);
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent).ok();
            }
            return config_path;
        }

        let config_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config");
        fs::create_dir_all(&config_dir).ok();
        config_dir.join("skywatch.json")
    }

    /// Load persisted schedule overrides and apply them on top of self.
    pub fn apply_user_config(&mut self) {
        let overrides = ScheduleOverrides::load();
        overrides.apply(self);
    }
}

/// Schedule overrides that persist across restarts.
///
/// Only the fields the configuration endpoint can change are stored; camera
/// credentials and directories stay environment-driven.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleOverrides {
    pub cycle_interval_secs: Option<u64>,
    pub position_wait_secs: Option<u64>,
    pub transition_wait_secs: Option<u64>,
    pub active_start: Option<NaiveTime>,
    pub active_end: Option<NaiveTime>,
    pub timezone_offset: Option<i32>,
    pub dst_enabled: Option<bool>,
    pub patrol_positions: Option<Vec<u8>>,
}

impl ScheduleOverrides {
    /// Load overrides from disk; missing or unreadable files yield defaults.
    pub fn load() -> Self {
        let config_path = Settings::get_config_path();
        if !config_path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&config_path) {
            Ok(contents) => match serde_json::from_str::<ScheduleOverrides>(&contents) {
                Ok(overrides) => overrides,
                Err(e) => {
                    tracing::warn!("Failed to parse user config from {config_path:?}: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read user config from {config_path:?}: {e}");
                Self::default()
            }
        }
    }

    /// Save overrides to disk.
    pub fn save(&self) -> OurResult<()> {
        let config_path = Settings::get_config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, contents)?;
        tracing::info!("Saved user config to {config_path:?}");
        Ok(())
    }

    /// Apply the present fields on top of settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(v) = self.cycle_interval_secs {
            settings.cycle_interval_secs = v;
        }
        if let Some(v) = self.position_wait_secs {
            settings.position_wait_secs = v;
        }
        if let Some(v) = self.transition_wait_secs {
            settings.transition_wait_secs = v;
        }
        if let Some(v) = self.active_start {
            settings.active_start = v;
        }
        if let Some(v) = self.active_end {
            settings.active_end = v;
        }
        if let Some(v) = self.timezone_offset {
            settings.timezone_offset = v;
        }
        if let Some(v) = self.dst_enabled {
            settings.dst_enabled = v;
        }
        if let Some(v) = &self.patrol_positions {
            settings.patrol_positions = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 8000);
        assert!(!settings.debug);
        assert_eq!(settings.cycle_interval_secs, 1800);
        assert_eq!(settings.position_wait_secs, 10);
        assert_eq!(settings.transition_wait_secs, 5);
        assert_eq!(settings.patrol_positions, vec![1, 2, 3, 4]);
        assert_eq!(settings.timezone_offset, 2);
        assert!(settings.dst_enabled);
        assert_eq!(settings.vendor, CameraVendor::Onvif);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wrapping_window() {
        let mut settings = Settings::default();
        settings.active_start = parse_clock_time("22:00").expect("valid time");
        settings.active_end = parse_clock_time("06:00").expect("valid time");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_home_in_patrol() {
        let mut settings = Settings::default();
        settings.patrol_positions = vec![0, 1];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_patrol() {
        // An empty patrol would let a cycle classify complete with zero
        // captures and stamp the freshness timestamp.
        let mut settings = Settings::default();
        settings.patrol_positions = Vec::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_position() {
        let mut settings = Settings::default();
        settings.patrol_positions = vec![1, 9];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_clock_time() {
        let t = parse_clock_time("06:30").expect("valid time");
        assert_eq!(t, NaiveTime::from_hms_opt(6, 30, 0).expect("valid"));
        assert!(parse_clock_time("25:00").is_err());
        assert!(parse_clock_time("six").is_err());
    }

    #[test]
    fn test_parse_position_list() {
        assert_eq!(
            parse_position_list("1, 2,3 ,4").expect("valid list"),
            vec![1, 2, 3, 4]
        );
        assert!(parse_position_list("1,x").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let mut settings = Settings::default();
        let overrides = ScheduleOverrides {
            cycle_interval_secs: Some(600),
            patrol_positions: Some(vec![2, 3]),
            ..Default::default()
        };
        overrides.apply(&mut settings);
        assert_eq!(settings.cycle_interval_secs, 600);
        assert_eq!(settings.patrol_positions, vec![2, 3]);
        // Untouched fields keep their defaults
        assert_eq!(settings.position_wait_secs, 10);
    }

    #[test]
    fn test_serialization_round_trip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).expect("serialize");
        let deserialized: Settings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(settings.host, deserialized.host);
        assert_eq!(settings.stream_url, deserialized.stream_url);
        assert_eq!(settings.active_start, deserialized.active_start);
    }
}
