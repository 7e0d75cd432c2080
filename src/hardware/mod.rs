// src/hardware/mod.rs - GPIO hardware abstraction and capability detection
pub mod adc;
pub mod mock;
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub mod rpi;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::GpioSettings;
use crate::pins::PullMode;
pub use adc::{AdcBridge, SpiBus};
pub use mock::{GpioEvent, MockGpioBackend};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("GPIO error on pin {pin}: {message}")]
    Gpio { pin: u8, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hardware unavailable: {0}")]
    Unavailable(String),
}

impl HardwareError {
    pub fn gpio(pin: u8, message: impl Into<String>) -> Self {
        HardwareError::Gpio {
            pin,
            message: message.into(),
        }
    }
}

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

/// A claimed GPIO line. Dropping it releases the line.
pub trait GpioLine: Send {
    fn pin(&self) -> u8;
    fn read(&mut self) -> Result<Level, HardwareError>;
    fn write(&mut self, level: Level) -> Result<(), HardwareError>;
    /// Start or retune software PWM. `duty_percent` is 0..=100.
    fn set_pwm(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<(), HardwareError>;
    fn clear_pwm(&mut self) -> Result<(), HardwareError>;
}

/// Access to the board's GPIO controller.
pub trait GpioBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn claim_input(&self, pin: u8, pull: PullMode) -> Result<Box<dyn GpioLine>, HardwareError>;
    fn claim_output(&self, pin: u8, initial: Level) -> Result<Box<dyn GpioLine>, HardwareError>;
    /// Return an unclaimed pin to input without pull resistors.
    fn reset(&self, pin: u8) -> Result<(), HardwareError>;
}

/// Why the controller runs without touching hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationReason {
    /// Requested in the settings, e.g. because the protocol stack owns the lines.
    Forced,
    /// Built without the `gpio` feature or on a non-Linux host.
    NotCompiled,
    /// GPIO support present but the controller could not be opened.
    Unavailable(String),
}

impl fmt::Display for SimulationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationReason::Forced => write!(f, "simulation forced by settings"),
            SimulationReason::NotCompiled => write!(f, "GPIO support not compiled in"),
            SimulationReason::Unavailable(e) => write!(f, "GPIO unavailable: {}", e),
        }
    }
}

/// Result of the one-time hardware probe, injected into the pin controller.
pub enum HardwareCapability {
    Real {
        gpio: Arc<dyn GpioBackend>,
        adc: Option<AdcBridge>,
    },
    Simulated(SimulationReason),
}

impl fmt::Debug for HardwareCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareCapability::Real { gpio, adc } => f
                .debug_struct("Real")
                .field("gpio", &gpio.name())
                .field("adc", &adc.is_some())
                .finish(),
            HardwareCapability::Simulated(reason) => {
                f.debug_tuple("Simulated").field(reason).finish()
            }
        }
    }
}

impl HardwareCapability {
    /// Probe the host once at startup.
    pub fn detect(settings: &GpioSettings) -> Self {
        if settings.simulate {
            tracing::info!("GPIO simulation mode forced by settings");
            return HardwareCapability::Simulated(SimulationReason::Forced);
        }
        let capability = probe_gpio(settings);
        match &capability {
            HardwareCapability::Real { gpio, adc } => tracing::info!(
                "GPIO initialized using {} (ADC {})",
                gpio.name(),
                if adc.is_some() { "available" } else { "not available" }
            ),
            HardwareCapability::Simulated(reason) => {
                tracing::warn!("Running in simulation mode: {}", reason)
            }
        }
        capability
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, HardwareCapability::Simulated(_))
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
fn probe_gpio(settings: &GpioSettings) -> HardwareCapability {
    match rpi::RppalBackend::open() {
        Ok(backend) => {
            let adc = match AdcBridge::open(&settings.spi_device, settings.spi_speed_hz) {
                Ok(adc) => Some(adc),
                Err(e) => {
                    tracing::info!(
                        "SPI ADC not available ({}); analog inputs will be disabled",
                        e
                    );
                    None
                }
            };
            HardwareCapability::Real {
                gpio: Arc::new(backend),
                adc,
            }
        }
        Err(e) => HardwareCapability::Simulated(SimulationReason::Unavailable(e.to_string())),
    }
}

#[cfg(not(all(feature = "gpio", target_os = "linux")))]
fn probe_gpio(_settings: &GpioSettings) -> HardwareCapability {
    HardwareCapability::Simulated(SimulationReason::NotCompiled)
}

/// Fixed peripheral role of a BCM pin, if any. Advisory only.
pub fn special_function(pin: u8) -> Option<&'static str> {
    match pin {
        2 => Some("I2C SDA"),
        3 => Some("I2C SCL"),
        7 => Some("SPI CE1"),
        8 => Some("SPI CE0"),
        9 => Some("SPI MISO"),
        10 => Some("SPI MOSI"),
        11 => Some("SPI SCLK"),
        12 | 18 => Some("PWM0"),
        13 | 19 => Some("PWM1"),
        14 => Some("UART TXD"),
        15 => Some("UART RXD"),
        _ => None,
    }
}

/// Pins exposed on the 40-pin header for general use.
pub fn is_header_pin(pin: u8) -> bool {
    (2..=27).contains(&pin)
}
