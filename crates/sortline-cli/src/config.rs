//! Line configuration – reads/writes `~/.sortline/config.toml`.
//!
//! The file describes the physical line (sensors and actuators) plus the
//! engine tunables.  It is validated in full before anything is spawned; an
//! invalid file is fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sortline_kernel::SensorConfig;
use sortline_runtime::EngineConfig;
use sortline_types::{
    ActuatorProfile, ActuatorTable, ConfigError, DriveMode, DriverSettings, PositionRange,
    ServoSettings, StepperSettings,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub sensors: Vec<SensorSection>,
    /// Keyed by actuator id.
    #[serde(default)]
    pub actuators: BTreeMap<String, ActuatorSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_trigger_queue_capacity")]
    pub trigger_queue_capacity: usize,
    #[serde(default = "default_actuator_queue_capacity")]
    pub actuator_queue_capacity: usize,
    /// Receives sensor pulses, which carry no category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_actuator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySection {
    #[serde(default = "default_interval_ms")]
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Bus,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Log => write!(f, "log"),
            SinkKind::Bus => write!(f, "bus"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub sink: SinkKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSection {
    pub channel: u8,
    #[serde(default = "default_active_level")]
    pub active_level: bool,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSection {
    pub channel: u8,
    pub rest_position: f32,
    /// Absolute target, or the offset for `drive_mode = "relative"`.
    pub activation_position: f32,
    pub activation_duration_ms: u64,
    pub min_interval_ms: u64,
    /// `[min, max]`
    pub safe_range: [f32; 2],
    #[serde(default)]
    pub drive_mode: DriveMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_max_temperature_c")]
    pub max_temperature_c: f32,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_confirm_tolerance")]
    pub confirm_tolerance: f32,
    pub driver: DriverSettings,
}

fn default_trigger_queue_capacity() -> usize {
    64
}
fn default_actuator_queue_capacity() -> usize {
    4
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_active_level() -> bool {
    true
}
fn default_cooldown_ms() -> u64 {
    100
}
fn default_watchdog_ms() -> u64 {
    5000
}
fn default_max_temperature_c() -> f32 {
    65.0
}
fn default_confirm_timeout_ms() -> u64 {
    50
}
fn default_confirm_tolerance() -> f32 {
    2.0
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            trigger_queue_capacity: default_trigger_queue_capacity(),
            actuator_queue_capacity: default_actuator_queue_capacity(),
            default_actuator: None,
        }
    }
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            check_interval_ms: default_interval_ms(),
        }
    }
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            sink: SinkKind::default(),
        }
    }
}

fn diverter(channel: u8, category: &str) -> ActuatorSection {
    ActuatorSection {
        channel,
        rest_position: 0.0,
        activation_position: 90.0,
        activation_duration_ms: 400,
        min_interval_ms: 150,
        safe_range: [0.0, 120.0],
        drive_mode: DriveMode::Absolute,
        category: Some(category.to_string()),
        max_temperature_c: default_max_temperature_c(),
        confirm_timeout_ms: default_confirm_timeout_ms(),
        confirm_tolerance: default_confirm_tolerance(),
        driver: DriverSettings::Servo(ServoSettings::default()),
    }
}

impl Default for Config {
    /// The prototype line: a stepper labeling head fed by the entry sensor
    /// and three diverter servos.
    fn default() -> Self {
        let mut actuators = BTreeMap::new();
        actuators.insert(
            "stepper1".to_string(),
            ActuatorSection {
                channel: 20,
                rest_position: 0.0,
                activation_position: 25.0,
                activation_duration_ms: 300,
                min_interval_ms: 500,
                safe_range: [0.0, 50.0],
                drive_mode: DriveMode::Relative,
                category: None,
                max_temperature_c: default_max_temperature_c(),
                confirm_timeout_ms: default_confirm_timeout_ms(),
                confirm_tolerance: 0.5,
                driver: DriverSettings::Stepper(StepperSettings::default()),
            },
        );
        actuators.insert("apple".to_string(), diverter(12, "apple"));
        actuators.insert("pear".to_string(), diverter(13, "pear"));
        actuators.insert("lemon".to_string(), diverter(14, "lemon"));

        Self {
            scheduler: SchedulerSection {
                default_actuator: Some("stepper1".to_string()),
                ..SchedulerSection::default()
            },
            safety: SafetySection::default(),
            telemetry: TelemetrySection::default(),
            sensors: vec![SensorSection {
                channel: 17,
                active_level: default_active_level(),
                cooldown_ms: default_cooldown_ms(),
                watchdog_ms: default_watchdog_ms(),
            }],
            actuators,
        }
    }
}

impl ActuatorSection {
    fn to_profile(&self, id: &str) -> ActuatorProfile {
        ActuatorProfile {
            id: id.to_string(),
            channel: self.channel,
            rest_position: self.rest_position,
            activation_position: self.activation_position,
            activation_duration: Duration::from_millis(self.activation_duration_ms),
            min_interval: Duration::from_millis(self.min_interval_ms),
            safe_range: PositionRange::new(self.safe_range[0], self.safe_range[1]),
            drive_mode: self.drive_mode,
            category: self.category.clone(),
            max_temperature_c: self.max_temperature_c,
            confirm_timeout: Duration::from_millis(self.confirm_timeout_ms),
            confirm_tolerance: self.confirm_tolerance,
            driver: self.driver.clone(),
        }
    }
}

impl Config {
    /// Validate the file and build the engine inputs.
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] found; the line must not start.
    pub fn to_engine(&self) -> Result<(EngineConfig, ActuatorTable), ConfigError> {
        let profiles = self
            .actuators
            .iter()
            .map(|(id, section)| section.to_profile(id))
            .collect();
        let table = ActuatorTable::new(profiles, self.scheduler.default_actuator.as_deref())?;

        let mut sensors: Vec<SensorConfig> = Vec::with_capacity(self.sensors.len());
        for s in &self.sensors {
            if sensors.iter().any(|existing| existing.channel == s.channel) {
                return Err(ConfigError::DuplicateSensor(s.channel));
            }
            sensors.push(SensorConfig {
                channel: s.channel,
                active_level: s.active_level,
                cooldown: Duration::from_millis(s.cooldown_ms),
                watchdog: Duration::from_millis(s.watchdog_ms),
            });
        }

        let engine = EngineConfig {
            trigger_queue_capacity: self.scheduler.trigger_queue_capacity,
            actuator_queue_capacity: self.scheduler.actuator_queue_capacity,
            safety_interval: Duration::from_millis(self.safety.check_interval_ms.max(1)),
            telemetry_interval: Duration::from_millis(self.telemetry.interval_ms.max(1)),
            sensors,
            ..EngineConfig::default()
        };
        Ok((engine, table))
    }
}

/// Return the path to `~/.sortline/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sortline").join("config.toml")
}

/// Load the config at `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config at `path`, writing the default one there first if the
/// file is missing.
pub fn load_or_create(path: &Path) -> Result<(Config, bool), ConfigError> {
    if let Some(cfg) = load_from(path)? {
        return Ok((cfg, false));
    }
    let mut cfg = Config::default();
    save_to(&cfg, path)?;
    apply_env_overrides(&mut cfg);
    Ok((cfg, true))
}

/// Apply `SORTLINE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SORTLINE_SAFETY_INTERVAL_MS` | `safety.check_interval_ms` |
/// | `SORTLINE_TELEMETRY_INTERVAL_MS` | `telemetry.interval_ms` |
/// | `SORTLINE_DEFAULT_ACTUATOR` | `scheduler.default_actuator` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SORTLINE_SAFETY_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.safety.check_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("SORTLINE_TELEMETRY_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.telemetry.interval_ms = ms;
    }
    if let Ok(v) = std::env::var("SORTLINE_DEFAULT_ACTUATOR") {
        cfg.scheduler.default_actuator = (!v.is_empty()).then_some(v);
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| ConfigError::Io(format!("{}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| ConfigError::Parse(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(io_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(io_err)?;
    Ok(())
}
