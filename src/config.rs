//! # Bridge Settings
//!
//! Typed settings for the device identity, the BACnet/IP network, the supervised
//! protocol stack and the GPIO layer. Every recognised key has a typed default and
//! unknown keys are rejected when the file is parsed.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [device]
//! id = 25411
//! name = "RPi GPIO Controller"
//! vendor_id = 999
//!
//! [network]
//! port = 47808
//! interface = "wlan0"
//!
//! [stack.options]
//! ethernet_enable = false
//! apdu_timeout = 10
//! debug_level = 2
//!
//! [gpio]
//! default_enabled = [18, 19]
//! reference_voltage = 3.3
//! ```

// src/config.rs - Single settings file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::objects::InstanceNumbering;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level settings for the bridge.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub stack: StackSettings,
    #[serde(default)]
    pub gpio: GpioSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// BACnet device identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    #[serde(default = "default_device_id")]
    pub id: u32,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            name: default_device_name(),
            vendor_id: default_vendor_id(),
        }
    }
}

/// BACnet/IP network parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    /// Advertised address, informational only. `None` means auto-detect.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    /// Fallback when the default-route interface cannot be detected.
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ip: None,
            port: default_bacnet_port(),
            interface: default_interface(),
        }
    }
}

/// Build, launch and supervision settings for the protocol stack binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StackSettings {
    #[serde(default = "default_stack_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_stack_binary")]
    pub binary: String,
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    #[serde(default = "default_clean_command")]
    pub clean_command: Vec<String>,
    #[serde(default = "default_cc")]
    pub cc: String,
    #[serde(default = "default_cflags")]
    pub cflags: String,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub build_on_demand: bool,
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_success_markers")]
    pub success_markers: Vec<String>,
    #[serde(default = "default_error_markers")]
    pub error_markers: Vec<String>,
    #[serde(default = "default_diagnostic_capacity")]
    pub diagnostic_capacity: usize,
    #[serde(default)]
    pub restart_on_update: bool,
    #[serde(default)]
    pub options: StackOptions,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            dir: default_stack_dir(),
            binary: default_stack_binary(),
            build_command: default_build_command(),
            clean_command: default_clean_command(),
            cc: default_cc(),
            cflags: default_cflags(),
            build_timeout_secs: default_build_timeout_secs(),
            build_on_demand: true,
            startup_grace_secs: default_startup_grace_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            success_markers: default_success_markers(),
            error_markers: default_error_markers(),
            diagnostic_capacity: default_diagnostic_capacity(),
            restart_on_update: false,
            options: StackOptions::default(),
        }
    }
}

impl StackSettings {
    /// Path of the executable produced by the build.
    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(&self.binary)
    }
}

/// Per-run options passed to the stack as single-character flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StackOptions {
    /// Ethernet 802.2 link layer; BACnet/IP needs it off.
    #[serde(default)]
    pub ethernet_enable: bool,
    #[serde(default = "default_apdu_timeout")]
    pub apdu_timeout: u32,
    #[serde(default = "default_debug_level")]
    pub debug_level: u8,
    /// Broadcast I-Am on startup.
    #[serde(default = "default_true")]
    pub initial_query: bool,
    #[serde(default)]
    pub http_server: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            ethernet_enable: false,
            apdu_timeout: default_apdu_timeout(),
            debug_level: default_debug_level(),
            initial_query: true,
            http_server: false,
        }
    }
}

/// GPIO, ADC and document file settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GpioSettings {
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    #[serde(default = "default_objects_file")]
    pub objects_file: PathBuf,
    #[serde(default = "default_pin_count")]
    pub pin_count: u8,
    #[serde(default = "default_enabled_pins")]
    pub default_enabled: Vec<u8>,
    #[serde(default = "default_reference_voltage")]
    pub reference_voltage: f64,
    #[serde(default = "default_adc_channels")]
    pub adc_channels: u8,
    /// Skip hardware entirely, e.g. when the stack itself claims the lines.
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub instance_numbering: InstanceNumbering,
    #[serde(default = "default_spi_device")]
    pub spi_device: String,
    #[serde(default = "default_spi_speed_hz")]
    pub spi_speed_hz: u32,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
            objects_file: default_objects_file(),
            pin_count: default_pin_count(),
            default_enabled: default_enabled_pins(),
            reference_voltage: default_reference_voltage(),
            adc_channels: default_adc_channels(),
            simulate: false,
            instance_numbering: InstanceNumbering::default(),
            spi_device: default_spi_device(),
            spi_speed_hz: default_spi_speed_hz(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.device.id > 4_194_303 {
            errors.push("device.id must be between 0 and 4194303".to_string());
        }
        if self.device.vendor_id > 65_535 {
            errors.push("device.vendor_id must be between 0 and 65535".to_string());
        }
        if self.network.port < 1024 {
            errors.push("network.port must be between 1024 and 65535".to_string());
        }
        if self.network.interface.trim().is_empty() {
            errors.push("network.interface cannot be empty".to_string());
        }
        if self.stack.binary.trim().is_empty() {
            errors.push("stack.binary cannot be empty".to_string());
        }
        if self.stack.build_command.is_empty() {
            errors.push("stack.build_command cannot be empty".to_string());
        }
        if self.stack.startup_grace_secs == 0 || self.stack.stop_grace_secs == 0 {
            errors.push("stack grace periods must be > 0".to_string());
        }
        if self.stack.diagnostic_capacity == 0 {
            errors.push("stack.diagnostic_capacity must be > 0".to_string());
        }
        if !(self.gpio.reference_voltage > 0.0) {
            errors.push("gpio.reference_voltage must be > 0".to_string());
        }
        if self.gpio.adc_channels == 0 || self.gpio.adc_channels > 8 {
            errors.push("gpio.adc_channels must be between 1 and 8".to_string());
        }
        if self.gpio.pin_count == 0 {
            errors.push("gpio.pin_count must be > 0".to_string());
        }
        for pin in &self.gpio.default_enabled {
            if *pin >= self.gpio.pin_count {
                errors.push(format!(
                    "gpio.default_enabled pin {} is outside 0..{}",
                    pin, self.gpio.pin_count
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_device_id() -> u32 {
    25411
}

fn default_device_name() -> String {
    "RPi GPIO Controller".to_string()
}

fn default_vendor_id() -> u32 {
    999
}

fn default_bacnet_port() -> u16 {
    47808
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_stack_dir() -> PathBuf {
    PathBuf::from("./bacnet4linux")
}

fn default_stack_binary() -> String {
    "bacnet4linux".to_string()
}

fn default_build_command() -> Vec<String> {
    vec!["make".to_string(), "all".to_string()]
}

fn default_clean_command() -> Vec<String> {
    vec!["make".to_string(), "clean".to_string()]
}

fn default_cc() -> String {
    "gcc".to_string()
}

fn default_cflags() -> String {
    "-march=native -O2".to_string()
}

fn default_build_timeout_secs() -> u64 {
    300
}

fn default_startup_grace_secs() -> u64 {
    10
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_success_markers() -> Vec<String> {
    vec!["LocalIP=".to_string(), "Ready to go".to_string()]
}

fn default_error_markers() -> Vec<String> {
    ["error", "failed", "cannot", "unable"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_diagnostic_capacity() -> usize {
    64
}

fn default_apdu_timeout() -> u32 {
    10
}

fn default_debug_level() -> u8 {
    2
}

fn default_config_file() -> PathBuf {
    PathBuf::from("gpio_pin_config.json")
}

fn default_objects_file() -> PathBuf {
    PathBuf::from("gpio_bacnet_config.json")
}

fn default_pin_count() -> u8 {
    24
}

fn default_enabled_pins() -> Vec<u8> {
    vec![18, 19]
}

fn default_reference_voltage() -> f64 {
    3.3
}

fn default_adc_channels() -> u8 {
    8
}

fn default_spi_device() -> String {
    "/dev/spidev0.0".to_string()
}

fn default_spi_speed_hz() -> u32 {
    1_000_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load settings from a TOML file at the given path.
pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
    let settings: Settings = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Failed to parse settings TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read settings file '{}': {}", path.display(), e);
            return Err(ConfigError::Io(e));
        }
    };
    settings.validate()?;
    tracing::info!("Settings loaded from '{}'", path.display());
    Ok(settings)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        tracing::warn!("Settings file '{}' not found, using defaults", path.display());
        return Ok(Settings::default());
    }
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.device.id, 25411);
        assert_eq!(settings.device.vendor_id, 999);
        assert_eq!(settings.network.port, 47808);
        assert_eq!(settings.stack.startup_grace_secs, 10);
        assert_eq!(settings.stack.options.apdu_timeout, 10);
        assert!(!settings.stack.options.ethernet_enable);
        assert!(settings.stack.options.initial_query);
        assert!(!settings.stack.options.http_server);
        assert_eq!(settings.gpio.default_enabled, vec![18, 19]);
        assert_eq!(settings.gpio.reference_voltage, 3.3);
        assert_eq!(settings.gpio.instance_numbering, InstanceNumbering::Direct);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bridge.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[device]\nid = 1234\n\n[stack.options]\ndebug_level = 0\nhttp_server = true"
        )
        .unwrap();
        file.flush().unwrap();

        let settings = load_config(&file_path).unwrap();
        assert_eq!(settings.device.id, 1234);
        assert_eq!(settings.stack.options.debug_level, 0);
        assert!(settings.stack.options.http_server);
        // Defaults for missing fields
        assert_eq!(settings.device.name, "RPi GPIO Controller");
        assert_eq!(settings.stack.options.apdu_timeout, 10);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("nonexistent_bridge.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));

        let settings = load_config_or_default(Path::new("nonexistent_bridge.toml")).unwrap();
        assert_eq!(settings.network.interface, "wlan0");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result: Result<Settings, _> = toml::from_str("[device]\nid = 1\nserial = 'x'\n");
        assert!(result.is_err());

        let result: Result<Settings, _> = toml::from_str("[printer]\nname = 'x'\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_ranges() {
        let mut settings = Settings::default();
        settings.device.id = 4_194_304;
        settings.network.port = 80;
        settings.gpio.adc_channels = 9;

        match settings.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_instance_numbering_parsing() {
        let toml = "[gpio]\ninstance_numbering = 'type_offset'\n";
        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.gpio.instance_numbering, InstanceNumbering::TypeOffset);
    }
}
