// src/pins.rs - Pin configuration document
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::config::GpioSettings;
use crate::objects::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    #[default]
    Digital,
    Analog,
}

/// Pull resistor mode, only meaningful for inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullMode {
    #[default]
    None,
    Up,
    Down,
}

/// Configuration of a single pin as stored in the pin document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PinConfig {
    #[serde(default)]
    pub direction: Direction,
    #[serde(rename = "type", default)]
    pub signal_type: SignalType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "pull_up_down", default)]
    pub pull_mode: PullMode,
    #[serde(default)]
    pub initial_value: f64,
    #[serde(rename = "pwm_frequency", default = "default_pwm_frequency")]
    pub pwm_frequency_hz: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_active_text", alias = "high_unit")]
    pub active_text: String,
    #[serde(default = "default_inactive_text", alias = "low_unit")]
    pub inactive_text: String,
    /// Engineering units for analog objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<u32>,
}

fn default_pwm_frequency() -> u32 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_active_text() -> String {
    "High".to_string()
}

fn default_inactive_text() -> String {
    "Low".to_string()
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            signal_type: SignalType::Digital,
            name: String::new(),
            description: String::new(),
            pull_mode: PullMode::None,
            initial_value: 0.0,
            pwm_frequency_hz: default_pwm_frequency(),
            enabled: true,
            active_text: default_active_text(),
            inactive_text: default_inactive_text(),
            units: None,
            instance: None,
        }
    }
}

impl PinConfig {
    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    pub fn is_analog(&self) -> bool {
        self.signal_type == SignalType::Analog
    }

    /// Configured instance, or the direct-mapping default for `pin` on a
    /// header with `pin_count` pins.
    pub fn instance_or_default(&self, pin: u8, pin_count: u8) -> u32 {
        self.instance.unwrap_or_else(|| default_instance(pin, pin_count))
    }
}

/// Direct instance mapping: every pin is its own instance except pin 0,
/// which would collide with the protocol's wildcard instance.
pub fn default_instance(pin: u8, pin_count: u8) -> u32 {
    if pin == 0 {
        u32::from(pin_count)
    } else {
        u32::from(pin)
    }
}

/// The complete pin configuration, keyed by pin number.
///
/// Serialized as a JSON object whose keys are pin-number strings; the map is
/// ordered so the persisted form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PinDocument {
    pub pins: BTreeMap<u8, PinConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentRepr {
    // Older front ends wrapped the pin map in a `gpio_pins` object.
    Wrapped { gpio_pins: BTreeMap<u8, PinConfig> },
    Flat(BTreeMap<u8, PinConfig>),
}

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("Pin {pin}: analog output needs a PWM frequency > 0")]
    InvalidPwmFrequency { pin: u8 },
    #[error("Pins {first} and {second} both claim {object_type} instance {instance}")]
    DuplicateInstance {
        object_type: ObjectType,
        instance: u32,
        first: u8,
        second: u8,
    },
}

impl PinDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document in either the flat or the wrapped layout.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let repr: DocumentRepr = serde_json::from_str(contents)?;
        let pins = match repr {
            DocumentRepr::Wrapped { gpio_pins } => gpio_pins,
            DocumentRepr::Flat(pins) => pins,
        };
        Ok(Self { pins })
    }

    pub fn get(&self, pin: u8) -> Option<&PinConfig> {
        self.pins.get(&pin)
    }

    pub fn insert(&mut self, pin: u8, config: PinConfig) -> Option<PinConfig> {
        self.pins.insert(pin, config)
    }

    pub fn enabled(&self) -> impl Iterator<Item = (u8, &PinConfig)> {
        self.pins
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(pin, config)| (*pin, config))
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Fill in display names and instance numbers the caller left out.
    pub fn normalize(&mut self, pin_count: u8) {
        for (pin, config) in self.pins.iter_mut() {
            if config.name.trim().is_empty() {
                config.name = format!("GPIO{}", pin);
            }
            if config.instance.is_none() {
                config.instance = Some(default_instance(*pin, pin_count));
            }
        }
    }

    /// Reject documents the hardware layer or the protocol stack cannot honour.
    ///
    /// Pins without an explicit instance are numbered as on a header with
    /// `pin_count` pins.
    pub fn validate(&self, pin_count: u8) -> Result<(), Vec<DocumentError>> {
        let mut errors = Vec::new();
        let mut claimed: BTreeMap<(ObjectType, u32), u8> = BTreeMap::new();

        for (pin, config) in self.enabled() {
            if config.is_output() && config.is_analog() && config.pwm_frequency_hz == 0 {
                errors.push(DocumentError::InvalidPwmFrequency { pin });
            }

            let object_type = ObjectType::for_pin(config.direction, config.signal_type);
            let instance = config.instance_or_default(pin, pin_count);
            if let Some(first) = claimed.insert((object_type, instance), pin) {
                errors.push(DocumentError::DuplicateInstance {
                    object_type,
                    instance,
                    first,
                    second: pin,
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Built-in layout used when no document has been stored yet.
    ///
    /// Every pin in `0..pin_count` is present; only `default_enabled` pins are
    /// switched on. Pins 18 and 19 carry the stock test LED and motion sensor.
    pub fn default_for(settings: &GpioSettings) -> Self {
        let enabled: HashSet<u8> = settings.default_enabled.iter().copied().collect();
        let mut document = Self::new();

        for pin in 0..settings.pin_count {
            let mut config = match pin {
                18 => PinConfig {
                    direction: Direction::Output,
                    name: "Test LED".to_string(),
                    active_text: "ON".to_string(),
                    inactive_text: "OFF".to_string(),
                    ..PinConfig::default()
                },
                19 => PinConfig {
                    name: "Motion Sensor".to_string(),
                    pull_mode: PullMode::Up,
                    active_text: "Motion".to_string(),
                    inactive_text: "No Motion".to_string(),
                    ..PinConfig::default()
                },
                _ => PinConfig {
                    name: format!("GPIO {}", pin),
                    ..PinConfig::default()
                },
            };
            config.enabled = enabled.contains(&pin);
            config.instance = Some(default_instance(pin, settings.pin_count));
            document.insert(pin, config);
        }

        document
    }
}

impl FromIterator<(u8, PinConfig)> for PinDocument {
    fn from_iter<I: IntoIterator<Item = (u8, PinConfig)>>(iter: I) -> Self {
        Self {
            pins: iter.into_iter().collect(),
        }
    }
}
