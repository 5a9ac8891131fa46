use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration: defaults, then `$ROLLCALL_CONFIG` (TOML), then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the attendance backend.
    pub api_base: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Inference sidecar endpoint that turns frames into face descriptors.
    pub descriptor_url: String,
    /// Largest Euclidean descriptor distance accepted as a match.
    pub match_threshold: f32,
    /// Interval between recognition polls.
    pub poll_interval: Duration,
    /// How often an active scan re-checks whether its session ended remotely.
    pub session_check_interval: Duration,
    /// Timeout applied to every backend and sidecar request.
    pub request_timeout: Duration,
    /// Frames discarded after opening the camera (exposure stabilisation).
    pub warmup_frames: usize,
    /// Skip inference on frames that are almost entirely dark.
    pub skip_dark_frames: bool,
    /// SQLite file holding attendance writes awaiting resubmission.
    pub outbox_path: PathBuf,
    /// Interval between automatic outbox retries.
    pub retry_interval: Duration,
    /// Automatic attempts per queued write before it stalls.
    pub max_write_attempts: u32,
    /// Scanning device id reported with each attendance write.
    pub device_id: Option<i64>,
}

/// Keys accepted in the TOML config file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_base: Option<String>,
    camera_device: Option<String>,
    descriptor_url: Option<String>,
    match_threshold: Option<f32>,
    poll_interval_ms: Option<u64>,
    session_check_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    warmup_frames: Option<usize>,
    skip_dark_frames: Option<bool>,
    outbox_path: Option<PathBuf>,
    retry_interval_secs: Option<u64>,
    max_write_attempts: Option<u32>,
    device_id: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            api_base: "http://localhost:8079/smart_attendance_api".to_string(),
            camera_device: "/dev/video0".to_string(),
            descriptor_url: "http://127.0.0.1:8500/descriptors".to_string(),
            match_threshold: rollcall_core::DEFAULT_MATCH_THRESHOLD,
            poll_interval: Duration::from_millis(900),
            session_check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            warmup_frames: 4,
            skip_dark_frames: true,
            outbox_path: data_dir.join("outbox.db"),
            retry_interval: Duration::from_secs(15),
            max_write_attempts: 5,
            device_id: None,
        }
    }
}

impl Config {
    /// Load configuration from the optional config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scanner and reconciler cannot run with.
    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("poll_interval", self.poll_interval),
            ("session_check_interval", self.session_check_interval),
            ("request_timeout", self.request_timeout),
            ("retry_interval", self.retry_interval),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{} is not a finite non-negative distance", self.match_threshold),
            });
        }
        if self.max_write_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "max_write_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.descriptor_url {
            self.descriptor_url = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.session_check_secs {
            self.session_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.skip_dark_frames {
            self.skip_dark_frames = v;
        }
        if let Some(v) = file.outbox_path {
            self.outbox_path = v;
        }
        if let Some(v) = file.retry_interval_secs {
            self.retry_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.max_write_attempts {
            self.max_write_attempts = v;
        }
        if file.device_id.is_some() {
            self.device_id = file.device_id;
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_DESCRIPTOR_URL") {
            self.descriptor_url = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_SESSION_CHECK_SECS") {
            self.session_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_WARMUP_FRAMES") {
            self.warmup_frames = v;
        }
        if let Some(v) = var("ROLLCALL_SKIP_DARK_FRAMES") {
            self.skip_dark_frames = v != "0";
        }
        if let Some(v) = var("ROLLCALL_OUTBOX_PATH") {
            self.outbox_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_RETRY_INTERVAL_SECS") {
            self.retry_interval = Duration::from_secs(v);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_MAX_WRITE_ATTEMPTS") {
            self.max_write_attempts = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_DEVICE_ID") {
            self.device_id = Some(v);
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
