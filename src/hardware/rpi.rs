// src/hardware/rpi.rs - Raspberry Pi GPIO backend on rppal
use rppal::gpio::{Gpio, InputPin, OutputPin};

use super::{GpioBackend, GpioLine, HardwareError, Level};
use crate::pins::PullMode;

pub struct RppalBackend {
    gpio: Gpio,
}

impl RppalBackend {
    pub fn open() -> Result<Self, HardwareError> {
        let gpio = Gpio::new().map_err(|e| HardwareError::Unavailable(e.to_string()))?;
        Ok(Self { gpio })
    }
}

fn to_rppal(level: Level) -> rppal::gpio::Level {
    match level {
        Level::Low => rppal::gpio::Level::Low,
        Level::High => rppal::gpio::Level::High,
    }
}

fn from_rppal(level: rppal::gpio::Level) -> Level {
    match level {
        rppal::gpio::Level::Low => Level::Low,
        rppal::gpio::Level::High => Level::High,
    }
}

impl GpioBackend for RppalBackend {
    fn name(&self) -> &'static str {
        "rppal"
    }

    fn claim_input(&self, pin: u8, pull: PullMode) -> Result<Box<dyn GpioLine>, HardwareError> {
        let handle = self
            .gpio
            .get(pin)
            .map_err(|e| HardwareError::gpio(pin, e.to_string()))?;
        let line = match pull {
            PullMode::None => handle.into_input(),
            PullMode::Up => handle.into_input_pullup(),
            PullMode::Down => handle.into_input_pulldown(),
        };
        Ok(Box::new(RppalLine::Input { pin, line }))
    }

    fn claim_output(&self, pin: u8, initial: Level) -> Result<Box<dyn GpioLine>, HardwareError> {
        let handle = self
            .gpio
            .get(pin)
            .map_err(|e| HardwareError::gpio(pin, e.to_string()))?;
        let line = match initial {
            Level::Low => handle.into_output_low(),
            Level::High => handle.into_output_high(),
        };
        Ok(Box::new(RppalLine::Output { pin, line }))
    }

    fn reset(&self, pin: u8) -> Result<(), HardwareError> {
        let mut line = self
            .gpio
            .get(pin)
            .map_err(|e| HardwareError::gpio(pin, e.to_string()))?
            .into_input();
        // Leave the pin as a plain input once the handle goes away.
        line.set_reset_on_drop(false);
        Ok(())
    }
}

enum RppalLine {
    Input { pin: u8, line: InputPin },
    Output { pin: u8, line: OutputPin },
}

impl GpioLine for RppalLine {
    fn pin(&self) -> u8 {
        match self {
            RppalLine::Input { pin, .. } | RppalLine::Output { pin, .. } => *pin,
        }
    }

    fn read(&mut self) -> Result<Level, HardwareError> {
        Ok(match self {
            RppalLine::Input { line, .. } => from_rppal(line.read()),
            RppalLine::Output { line, .. } => Level::from(line.is_set_high()),
        })
    }

    fn write(&mut self, level: Level) -> Result<(), HardwareError> {
        match self {
            RppalLine::Output { line, .. } => {
                line.write(to_rppal(level));
                Ok(())
            }
            RppalLine::Input { pin, .. } => {
                Err(HardwareError::gpio(*pin, "line is configured as input"))
            }
        }
    }

    fn set_pwm(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<(), HardwareError> {
        match self {
            RppalLine::Output { pin, line } => line
                .set_pwm_frequency(frequency_hz, (duty_percent / 100.0).clamp(0.0, 1.0))
                .map_err(|e| HardwareError::gpio(*pin, e.to_string())),
            RppalLine::Input { pin, .. } => {
                Err(HardwareError::gpio(*pin, "line is configured as input"))
            }
        }
    }

    fn clear_pwm(&mut self) -> Result<(), HardwareError> {
        match self {
            RppalLine::Output { pin, line } => line
                .clear_pwm()
                .map_err(|e| HardwareError::gpio(*pin, e.to_string())),
            RppalLine::Input { .. } => Ok(()),
        }
    }
}
