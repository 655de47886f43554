use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use zeroize::Zeroize;

use crate::detect::Strictness;
use crate::error::{PalmError, PalmResult};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SDK_MAJOR_VERSION: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const SDK_MINOR_VERSION: &str = env!("CARGO_PKG_VERSION_MINOR");

const DEFAULT_MIN_CONSECUTIVE_FRAMES: u32 = 1;
const DEFAULT_MAX_CAPTURE_FRAMES: u32 = 150;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LIVENESS_MAX_FRAMES: u32 = 90;
const DEFAULT_FIST_AREA_RATIO: f32 = 0.6;
const DEFAULT_HIRES_MIN_QUALITY: f32 = 0.7;
const DEFAULT_BACKGROUND_BRIGHTNESS_MAX: f32 = 0.85;
const DEFAULT_UPDATE_MARGIN: f32 = 0.1;
const DEFAULT_SMOOTHING_WINDOW: usize = 5;

// -------------------- Rotation --------------------

/// Orientation of the palm in the image. Fingers pointing up is 0 degrees,
/// increasing clockwise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RotationAngle {
    Degrees(f32),
    Auto,
}

impl Default for RotationAngle {
    fn default() -> Self {
        RotationAngle::Degrees(0.0)
    }
}

impl std::str::FromStr for RotationAngle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(RotationAngle::Auto);
        }
        let degrees: f32 = trimmed
            .parse()
            .map_err(|_| anyhow!("rotation_angle must be a number of degrees or \"auto\""))?;
        if !degrees.is_finite() {
            return Err(anyhow!("rotation_angle must be finite"));
        }
        Ok(RotationAngle::Degrees(degrees.rem_euclid(360.0)))
    }
}

impl std::fmt::Display for RotationAngle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationAngle::Degrees(d) => write!(f, "{}", d),
            RotationAngle::Auto => write!(f, "auto"),
        }
    }
}

// -------------------- Readiness thresholds --------------------

/// Criteria a single detected palm must meet to be capturable at one strictness level.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct LevelThreshold {
    pub min_quality: f32,
    pub min_centerness: f32,
    pub min_brightness: f32,
    pub max_brightness: f32,
}

impl LevelThreshold {
    pub fn admits(&self, quality: f32, brightness: f32, centerness: f32) -> bool {
        quality >= self.min_quality
            && centerness >= self.min_centerness
            && brightness >= self.min_brightness
            && brightness <= self.max_brightness
    }

    /// True when every palm admitted by `self` is also admitted by `looser`.
    fn is_tighter_than(&self, looser: &LevelThreshold) -> bool {
        self.min_quality >= looser.min_quality
            && self.min_centerness >= looser.min_centerness
            && self.min_brightness >= looser.min_brightness
            && self.max_brightness <= looser.max_brightness
    }
}

/// One threshold per strictness level, ordered Minimum..Maximum.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ReadinessThresholds {
    pub levels: [LevelThreshold; 5],
}

impl Default for ReadinessThresholds {
    fn default() -> Self {
        let level = |q: f32, c: f32, lo: f32, hi: f32| LevelThreshold {
            min_quality: q,
            min_centerness: c,
            min_brightness: lo,
            max_brightness: hi,
        };
        Self {
            levels: [
                level(0.20, 0.20, 0.10, 0.97),
                level(0.35, 0.35, 0.15, 0.95),
                level(0.50, 0.50, 0.20, 0.92),
                level(0.65, 0.60, 0.25, 0.90),
                level(0.80, 0.75, 0.30, 0.88),
            ],
        }
    }
}

impl ReadinessThresholds {
    /// Highest strictness the palm satisfies. Levels are walked upward and the
    /// walk stops at the first failure, so readiness is monotonic.
    pub fn readiness(&self, quality: f32, brightness: f32, centerness: f32) -> Strictness {
        let mut readiness = Strictness::None;
        for (level, threshold) in Strictness::LEVELS.iter().zip(self.levels.iter()) {
            if !threshold.admits(quality, brightness, centerness) {
                break;
            }
            readiness = *level;
        }
        readiness
    }

    fn validate(&self) -> Result<()> {
        for (i, level) in self.levels.iter().enumerate() {
            for v in [
                level.min_quality,
                level.min_centerness,
                level.min_brightness,
                level.max_brightness,
            ] {
                if !(0.0..=1.0).contains(&v) {
                    return Err(anyhow!("readiness threshold {} out of [0,1]", i));
                }
            }
            if level.min_brightness > level.max_brightness {
                return Err(anyhow!("readiness level {} has an empty brightness band", i));
            }
        }
        for pair in self.levels.windows(2) {
            if !pair[1].is_tighter_than(&pair[0]) {
                return Err(anyhow!("readiness thresholds must tighten with strictness"));
            }
        }
        Ok(())
    }
}

// -------------------- Capture policy --------------------

/// Tunable constants of the capture, liveness and update decisions.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturePolicy {
    /// Consecutive qualifying frames needed before a template is extracted.
    pub min_consecutive_frames: u32,
    /// Frames an armed capture may consume before it times out.
    pub max_capture_frames: u32,
    /// Wall-clock budget of an armed capture.
    pub capture_timeout: Duration,
    /// Frames the liveness phase may consume before it fails.
    pub liveness_max_frames: u32,
    /// A fist is a palm whose area shrank to at most this share of the captured palm.
    pub fist_area_ratio: f32,
    /// Minimum palm quality of the actively-lit high-resolution liveness frame.
    pub hires_min_quality: f32,
    /// Ambient brightness above this fails liveness as a background failure.
    pub background_brightness_max: f32,
    /// A match must exceed the requested threshold by this margin to update a model.
    pub update_margin: f32,
    /// Frames averaged when smoothing brightness and centerness.
    pub smoothing_window: usize,
    pub readiness: ReadinessThresholds,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            min_consecutive_frames: DEFAULT_MIN_CONSECUTIVE_FRAMES,
            max_capture_frames: DEFAULT_MAX_CAPTURE_FRAMES,
            capture_timeout: Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS),
            liveness_max_frames: DEFAULT_LIVENESS_MAX_FRAMES,
            fist_area_ratio: DEFAULT_FIST_AREA_RATIO,
            hires_min_quality: DEFAULT_HIRES_MIN_QUALITY,
            background_brightness_max: DEFAULT_BACKGROUND_BRIGHTNESS_MAX,
            update_margin: DEFAULT_UPDATE_MARGIN,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            readiness: ReadinessThresholds::default(),
        }
    }
}

impl CapturePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.min_consecutive_frames == 0 {
            return Err(anyhow!("min_consecutive_frames must be at least 1"));
        }
        if self.max_capture_frames < self.min_consecutive_frames {
            return Err(anyhow!(
                "max_capture_frames must be >= min_consecutive_frames"
            ));
        }
        if self.capture_timeout.is_zero() {
            return Err(anyhow!("capture_timeout must be greater than zero"));
        }
        if self.liveness_max_frames == 0 {
            return Err(anyhow!("liveness_max_frames must be at least 1"));
        }
        if self.smoothing_window == 0 {
            return Err(anyhow!("smoothing_window must be at least 1"));
        }
        for (name, v) in [
            ("fist_area_ratio", self.fist_area_ratio),
            ("hires_min_quality", self.hires_min_quality),
            ("background_brightness_max", self.background_brightness_max),
            ("update_margin", self.update_margin),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("{} must be within [0,1]", name));
            }
        }
        self.readiness.validate()
    }
}

// -------------------- Session configuration --------------------

#[derive(Debug, Deserialize, Default)]
struct PalmConfigFile {
    license_id: Option<String>,
    encryption_key: Option<String>,
    rotation_angle: Option<String>,
    model_db_path: Option<String>,
    emit_palms_detected: Option<bool>,
    policy: Option<PolicyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    min_consecutive_frames: Option<u32>,
    max_capture_frames: Option<u32>,
    capture_timeout_ms: Option<u64>,
    liveness_max_frames: Option<u32>,
    fist_area_ratio: Option<f32>,
    hires_min_quality: Option<f32>,
    background_brightness_max: Option<f32>,
    update_margin: Option<f32>,
    smoothing_window: Option<usize>,
    readiness: Option<ReadinessThresholds>,
}

/// Secret used to seal serialized models. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(anyhow!("encryption_key must not be empty"));
        }
        Ok(Self(secret))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Configuration a session is created from.
#[derive(Clone, Debug, Default)]
pub struct PalmConfig {
    pub license_id: Option<String>,
    pub encryption_key: Option<EncryptionKey>,
    pub rotation_angle: RotationAngle,
    pub policy: CapturePolicy,
    /// Emit a PalmsDetected message for every processed frame.
    pub emit_palms_detected: bool,
    /// Persist enrolled models in this SQLite database instead of memory.
    pub model_db_path: Option<String>,
}

impl PalmConfig {
    /// Load from the file named by `PALM_CONFIG` (TOML or JSON), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PALM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => PalmConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PalmConfigFile) -> Result<Self> {
        let rotation_angle = match file.rotation_angle.as_deref() {
            Some(raw) => raw.parse()?,
            None => RotationAngle::default(),
        };
        let defaults = CapturePolicy::default();
        let policy = match file.policy {
            Some(p) => CapturePolicy {
                min_consecutive_frames: p
                    .min_consecutive_frames
                    .unwrap_or(defaults.min_consecutive_frames),
                max_capture_frames: p.max_capture_frames.unwrap_or(defaults.max_capture_frames),
                capture_timeout: p
                    .capture_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.capture_timeout),
                liveness_max_frames: p
                    .liveness_max_frames
                    .unwrap_or(defaults.liveness_max_frames),
                fist_area_ratio: p.fist_area_ratio.unwrap_or(defaults.fist_area_ratio),
                hires_min_quality: p.hires_min_quality.unwrap_or(defaults.hires_min_quality),
                background_brightness_max: p
                    .background_brightness_max
                    .unwrap_or(defaults.background_brightness_max),
                update_margin: p.update_margin.unwrap_or(defaults.update_margin),
                smoothing_window: p.smoothing_window.unwrap_or(defaults.smoothing_window),
                readiness: p.readiness.unwrap_or(defaults.readiness.clone()),
            },
            None => defaults,
        };
        Ok(Self {
            license_id: file.license_id,
            encryption_key: file.encryption_key.map(EncryptionKey::new).transpose()?,
            rotation_angle,
            policy,
            emit_palms_detected: file.emit_palms_detected.unwrap_or(false),
            model_db_path: file.model_db_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(license) = std::env::var("PALM_LICENSE_ID") {
            if !license.trim().is_empty() {
                self.license_id = Some(license.trim().to_string());
            }
        }
        if let Ok(key) = std::env::var("PALM_ENCRYPTION_KEY") {
            if !key.is_empty() {
                self.encryption_key = Some(EncryptionKey::new(key)?);
            }
        }
        if let Ok(angle) = std::env::var("PALM_ROTATION_ANGLE") {
            if !angle.trim().is_empty() {
                self.rotation_angle = angle
                    .parse()
                    .context("PALM_ROTATION_ANGLE is not a valid rotation")?;
            }
        }
        if let Ok(path) = std::env::var("PALM_MODEL_DB") {
            if !path.trim().is_empty() {
                self.model_db_path = Some(path);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(license) = &self.license_id {
            validate_license_id(license)?;
        }
        self.policy.validate()
    }
}

/// License ids are 8..=64 characters of `[A-Za-z0-9-]`.
pub fn validate_license_id(license_id: &str) -> Result<()> {
    static LICENSE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = LICENSE_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{7,63}$").expect("static license pattern")
    });
    if !re.is_match(license_id) {
        return Err(anyhow!("license_id must match ^[A-Za-z0-9][A-Za-z0-9-]{{7,63}}$"));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PalmConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

// -------------------- Process-wide key/value surface --------------------

/// Recognised configuration keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    Version,
    MajorVersion,
    MinorVersion,
    LicenseId,
    EncryptionKey,
    RotationAngle,
}

impl ConfigKey {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::Version => "version",
            ConfigKey::MajorVersion => "major_version",
            ConfigKey::MinorVersion => "minor_version",
            ConfigKey::LicenseId => "license_id",
            ConfigKey::EncryptionKey => "encryption_key",
            ConfigKey::RotationAngle => "rotation_angle",
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            ConfigKey::Version | ConfigKey::MajorVersion | ConfigKey::MinorVersion
        )
    }
}

impl std::str::FromStr for ConfigKey {
    type Err = PalmError;

    fn from_str(s: &str) -> PalmResult<Self> {
        match s.trim() {
            "version" => Ok(ConfigKey::Version),
            "major_version" => Ok(ConfigKey::MajorVersion),
            "minor_version" => Ok(ConfigKey::MinorVersion),
            "license_id" => Ok(ConfigKey::LicenseId),
            "encryption_key" => Ok(ConfigKey::EncryptionKey),
            "rotation_angle" => Ok(ConfigKey::RotationAngle),
            other => Err(PalmError::invalid_argument(format!(
                "unknown config key: {}",
                other
            ))),
        }
    }
}

static GLOBAL_CONFIG: OnceLock<RwLock<PalmConfig>> = OnceLock::new();
static CONFIG_FROZEN: AtomicBool = AtomicBool::new(false);

fn global() -> &'static RwLock<PalmConfig> {
    GLOBAL_CONFIG.get_or_init(|| RwLock::new(PalmConfig::default()))
}

/// Set a process-wide configuration value. Only allowed before the first
/// session is created.
pub fn set_config(key: &str, value: &str) -> PalmResult<()> {
    let key: ConfigKey = key.parse()?;
    if key.is_read_only() {
        return Err(PalmError::invalid_argument(format!(
            "{} is read-only",
            key.name()
        )));
    }
    let mut cfg = global().write().map_err(|_| PalmError::poisoned("config"))?;
    // Checked under the write lock so no set lands after a session snapshot.
    if CONFIG_FROZEN.load(Ordering::SeqCst) {
        return Err(PalmError::UnexpectedRequest(
            "configuration is read-only once a session exists".to_string(),
        ));
    }
    match key {
        ConfigKey::LicenseId => {
            validate_license_id(value).map_err(|e| PalmError::InvalidLicense(e.to_string()))?;
            cfg.license_id = Some(value.to_string());
        }
        ConfigKey::EncryptionKey => {
            let secret = EncryptionKey::new(value)
                .map_err(|e| PalmError::invalid_argument(e.to_string()))?;
            cfg.encryption_key = Some(secret);
        }
        ConfigKey::RotationAngle => {
            cfg.rotation_angle = value
                .parse()
                .map_err(|e: anyhow::Error| PalmError::invalid_argument(e.to_string()))?;
        }
        ConfigKey::Version | ConfigKey::MajorVersion | ConfigKey::MinorVersion => {
            return Err(PalmError::invalid_argument(format!(
                "{} is read-only",
                key.name()
            )));
        }
    }
    log::info!("config {} updated", key.name());
    Ok(())
}

/// Read a process-wide configuration value into a buffer of `capacity` bytes.
///
/// Fails with [`PalmError::BufferTooSmall`] carrying the required size when the
/// value (plus a terminator when `null_terminate` is set) does not fit.
pub fn get_config(key: &str, capacity: usize, null_terminate: bool) -> PalmResult<String> {
    let key: ConfigKey = key.parse()?;
    let value = {
        let cfg = global().read().map_err(|_| PalmError::poisoned("config"))?;
        match key {
            ConfigKey::Version => SDK_VERSION.to_string(),
            ConfigKey::MajorVersion => SDK_MAJOR_VERSION.to_string(),
            ConfigKey::MinorVersion => SDK_MINOR_VERSION.to_string(),
            ConfigKey::LicenseId => cfg.license_id.clone().unwrap_or_default(),
            ConfigKey::EncryptionKey => cfg
                .encryption_key
                .as_ref()
                .map(|key| key.expose().to_string())
                .unwrap_or_default(),
            ConfigKey::RotationAngle => cfg.rotation_angle.to_string(),
        }
    };
    let required = value.len() + usize::from(null_terminate);
    if required > capacity {
        return Err(PalmError::BufferTooSmall { required });
    }
    Ok(value)
}

/// Snapshot of the process-wide configuration for a new session. Freezes the
/// configuration for the rest of the process lifetime.
pub(crate) fn freeze_global() -> PalmResult<PalmConfig> {
    let cfg = global().read().map_err(|_| PalmError::poisoned("config"))?;
    CONFIG_FROZEN.store(true, Ordering::SeqCst);
    Ok(cfg.clone())
}

pub fn is_frozen() -> bool {
    CONFIG_FROZEN.load(Ordering::SeqCst)
}
