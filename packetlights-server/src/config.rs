use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn, LevelFilter};
use packetlights_core::pattern::MIN_CHASE_HZ;
use packetlights_core::{AnimationTiming, LedRoles, MonitorConfig, Pin, MAX_INLINE_PINS};
use packetlights_pigpio_lib::{DEFAULT_PORT, MAX_USER_GPIO};
use serde::{Deserialize, Serialize};

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_http_port() -> u16 {
    5050
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Where the pigpio daemon listens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PigpioConfig {
    #[serde(default = "default_pigpio_host")]
    pub host: String,
    #[serde(default = "default_pigpio_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_pigpio_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_pigpio_port() -> u16 {
    DEFAULT_PORT
}

const fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for PigpioConfig {
    fn default() -> Self {
        Self {
            host: default_pigpio_host(),
            port: default_pigpio_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PigpioConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timeouts for external commands, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTimeouts {
    #[serde(default = "default_command_secs")]
    pub default_secs: u64,
    #[serde(default = "default_ping_secs")]
    pub ping_secs: u64,
    #[serde(default = "default_snmp_secs")]
    pub snmp_secs: u64,
}

const fn default_command_secs() -> u64 {
    6
}

const fn default_ping_secs() -> u64 {
    3
}

const fn default_snmp_secs() -> u64 {
    8
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            default_secs: default_command_secs(),
            ping_secs: default_ping_secs(),
            snmp_secs: default_snmp_secs(),
        }
    }
}

/// BCM lines of the demo board, in bank order
const DEFAULT_PIN_LINES: [u8; 15] = [17, 27, 22, 10, 9, 5, 6, 26, 16, 14, 18, 23, 24, 25, 20];

fn default_pins() -> Vec<Pin> {
    DEFAULT_PIN_LINES.iter().map(|&line| Pin::active_high(line)).collect()
}

/// Port for the SSE status stream (separate from the main HTTP server)
const fn default_sse_port() -> u16 {
    8081
}

/// Maximum chase rate; faster than this the LEDs just look dimly lit
pub const MAX_CHASE_HZ: f32 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default = "default_sse_port")]
    pub sse_port: u16,
    #[serde(default)]
    pub pigpio: PigpioConfig,
    #[serde(default = "default_pins")]
    pub pins: Vec<Pin>,
    #[serde(default)]
    pub animation: AnimationTiming,
    #[serde(default)]
    pub leds: LedRoles,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub commands: CommandTimeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            http: HttpConfig::default(),
            sse_port: default_sse_port(),
            pigpio: PigpioConfig::default(),
            pins: default_pins(),
            animation: AnimationTiming::default(),
            leds: LedRoles::default(),
            monitor: MonitorConfig::default(),
            commands: CommandTimeouts::default(),
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        let mut seen = Vec::with_capacity(self.pins.len());
        self.pins.retain(|pin| {
            if u32::from(pin.line) > MAX_USER_GPIO {
                warn!("Dropping pin {}: not a user GPIO", pin.line);
                return false;
            }
            if seen.contains(&pin.line) {
                warn!("Dropping duplicate pin {}", pin.line);
                return false;
            }
            seen.push(pin.line);
            true
        });
        if self.pins.is_empty() {
            warn!("No usable pins configured, using the default layout");
            self.pins = default_pins();
        }
        if self.pins.len() > MAX_INLINE_PINS {
            debug!("{} pins configured, frames will be heap allocated", self.pins.len());
        }

        let hz = self.animation.chase_hz;
        if !hz.is_finite() || hz < MIN_CHASE_HZ || hz > MAX_CHASE_HZ {
            let clamped = if hz.is_finite() {
                hz.clamp(MIN_CHASE_HZ, MAX_CHASE_HZ)
            } else {
                1.0
            };
            warn!("Clamping animation.chase_hz from {hz} to {clamped}");
            self.animation.chase_hz = clamped;
        }

        let bank = self.pins.len();
        for (role, index) in [
            ("error", self.leds.error),
            ("success", self.leds.success),
            ("interfaces", self.leds.interfaces),
        ] {
            if index >= bank {
                warn!("leds.{role} = {index} is outside the {bank}-LED bank and will never light");
            }
        }

        self.monitor.validate();

        if self.commands.default_secs == 0 {
            warn!("commands.default_secs is 0, resetting to default");
            self.commands.default_secs = default_command_secs();
        }
        if self.commands.ping_secs == 0 {
            warn!("commands.ping_secs is 0, resetting to default");
            self.commands.ping_secs = default_ping_secs();
        }
        if self.commands.snmp_secs == 0 {
            warn!("commands.snmp_secs is 0, resetting to default");
            self.commands.snmp_secs = default_snmp_secs();
        }
        if self.http.host.is_empty() {
            warn!("http.host is empty, resetting to default");
            self.http.host = default_http_host();
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config: {e:#}, using defaults");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        debug!(
            "Config parsed: {} pins, log_level={:?}, http port {}",
            config.pins.len(),
            config.log_level,
            config.http.port
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packetlights_core::Polarity;

    #[test]
    fn empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pins.len(), 15);
        assert_eq!(config.pins[0], Pin::active_high(17));
        assert_eq!(config.http.port, 5050);
        assert_eq!(config.sse_port, 8081);
        assert_eq!(config.pigpio.address(), "127.0.0.1:8888");
        assert_eq!(config.monitor.threshold, 3);
    }

    #[test]
    fn default_config_validates_unchanged() {
        let mut config = Config::default();
        config.validate();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "log_level": "debug",
                "pins": [{"line": 4, "polarity": "active_low"}, {"line": 5}],
                "monitor": {"threshold": 5},
                "animation": {"chase_hz": 2.5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.pins[0].polarity, Polarity::ActiveLow);
        assert_eq!(config.pins[1].polarity, Polarity::ActiveHigh);
        assert_eq!(config.monitor.threshold, 5);
        assert_eq!(config.monitor.window_secs, 10);
        assert!((config.animation.chase_hz - 2.5).abs() < f32::EPSILON);
        assert_eq!(config.animation.wave_step_ms, 160);
    }

    #[test]
    fn validate_clamps_and_dedupes() {
        let mut config = Config {
            pins: vec![Pin::active_high(17), Pin::active_high(17), Pin::active_high(40)],
            ..Config::default()
        };
        config.animation.chase_hz = 0.0;
        config.commands.ping_secs = 0;
        config.monitor.threshold = 0;
        config.validate();

        assert_eq!(config.pins, vec![Pin::active_high(17)]);
        assert!((config.animation.chase_hz - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.commands.ping_secs, 3);
        assert_eq!(config.monitor.threshold, 1);
    }

    #[test]
    fn validate_restores_empty_pin_list() {
        let mut config = Config {
            pins: Vec::new(),
            ..Config::default()
        };
        config.validate();
        assert_eq!(config.pins.len(), 15);
    }

    #[test]
    fn load_or_default_survives_garbage() {
        let path = std::env::temp_dir().join(format!("packetlights-bad-{}.json", std::process::id()));
        std::fs::write(&path, b"{ not json").unwrap();
        let config = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn log_level_maps_to_filter() {
        assert_eq!(LogLevel::Off.as_level_filter(), LevelFilter::Off);
        assert_eq!(LogLevel::Debug.as_level_filter(), LevelFilter::Debug);
        let level: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
    }
}
