use facegate_core::liveness::DEFAULT_EAR_THRESHOLD;
use facegate_core::matcher::DEFAULT_MATCH_THRESHOLD;
use facegate_core::scan::{
    DEFAULT_BLINK_DECAY, DEFAULT_FACE_LOSS_TOLERANCE, DEFAULT_HOLD_FRAMES, DEFAULT_STABLE_FRAMES,
};
use facegate_core::ScanConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory holding the ONNX models.
    pub model_dir: PathBuf,
    /// SQLite enrollment database.
    pub db_path: PathBuf,
    /// Eye aspect ratio above which eyes count as open.
    pub ear_threshold: f32,
    /// Open-eye frames needed to leave detecting.
    pub stable_frames: u32,
    /// Open-eye frames the hold must exceed before capture.
    pub hold_frames: u32,
    pub blink_decay: u32,
    pub face_loss_tolerance: u32,
    /// Failed capture cycles before a session gives up.
    pub max_attempts: u32,
    /// Euclidean distance below which a descriptor matches an enrollment.
    pub match_threshold: f32,
    /// Scan loop tick rate.
    pub frame_rate: u32,
    /// Pause between success and handing back the descriptor.
    pub success_delay_ms: u64,
    /// Check model SHA-256 digests before loading.
    pub verify_model_checksums: bool,
    /// Serve on the session bus instead of the system bus (development).
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_home().join("facegate");
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: facegate_core::models::default_model_dir(),
            db_path: data_dir.join("enrollments.db"),
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            stable_frames: DEFAULT_STABLE_FRAMES,
            hold_frames: DEFAULT_HOLD_FRAMES,
            blink_decay: DEFAULT_BLINK_DECAY,
            face_loss_tolerance: DEFAULT_FACE_LOSS_TOLERANCE,
            max_attempts: facegate_core::attempts::DEFAULT_MAX_ATTEMPTS,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            frame_rate: 30,
            success_delay_ms: 800,
            verify_model_checksums: true,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay `FACEGATE_*` values. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env.parse("FACEGATE_EAR_THRESHOLD", &mut self.ear_threshold);
        env.parse("FACEGATE_STABLE_FRAMES", &mut self.stable_frames);
        env.parse("FACEGATE_HOLD_FRAMES", &mut self.hold_frames);
        env.parse("FACEGATE_BLINK_DECAY", &mut self.blink_decay);
        env.parse("FACEGATE_FACE_LOSS_TOLERANCE", &mut self.face_loss_tolerance);
        env.parse("FACEGATE_MAX_ATTEMPTS", &mut self.max_attempts);
        env.parse("FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        env.parse("FACEGATE_FRAME_RATE", &mut self.frame_rate);
        env.parse("FACEGATE_SUCCESS_DELAY_MS", &mut self.success_delay_ms);
        env.flag("FACEGATE_VERIFY_MODEL_CHECKSUMS", &mut self.verify_model_checksums);
        env.flag("FACEGATE_SESSION_BUS", &mut self.session_bus);
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            stable_frames: self.stable_frames,
            hold_frames: self.hold_frames,
            blink_decay: self.blink_decay,
            face_loss_tolerance: self.face_loss_tolerance,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.clamp(1, 120)
    }

    pub fn success_delay(&self) -> Duration {
        Duration::from_millis(self.success_delay_ms)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else { return };
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }

    /// "0", "false", "no" and "off" are false; anything else is true.
    fn flag(&self, key: &str, slot: &mut bool) {
        if let Some(raw) = (self.0)(key) {
            *slot = !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
    }
}

fn data_home() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        })
}
