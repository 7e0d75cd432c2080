// src/hardware/mock.rs - In-memory GPIO backend for tests and bench setups
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{GpioBackend, GpioLine, HardwareError, Level};
use crate::pins::PullMode;

/// Everything the mock backend was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GpioEvent {
    ClaimInput { pin: u8, pull: PullMode },
    ClaimOutput { pin: u8, level: Level },
    Read { pin: u8 },
    Write { pin: u8, level: Level },
    SetPwm { pin: u8, frequency_hz: f64, duty_percent: f64 },
    ClearPwm { pin: u8 },
    Release { pin: u8 },
    Reset { pin: u8 },
}

#[derive(Default)]
struct MockState {
    events: Vec<GpioEvent>,
    claimed: HashSet<u8>,
    failing: HashSet<u8>,
    inputs: HashMap<u8, Level>,
    outputs: HashMap<u8, Level>,
    duty: HashMap<u8, f64>,
}

/// GPIO backend that keeps line state in memory.
///
/// Clones share state, so a test can hand one clone to the controller and
/// inspect the other.
#[derive(Clone, Default)]
pub struct MockGpioBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Level returned by reads of input `pin`. Unset inputs read low.
    pub fn set_input_level(&self, pin: u8, level: Level) {
        self.with_state(|s| {
            s.inputs.insert(pin, level);
        });
    }

    /// Make every operation on `pin` fail.
    pub fn fail_pin(&self, pin: u8) {
        self.with_state(|s| {
            s.failing.insert(pin);
        });
    }

    pub fn events(&self) -> Vec<GpioEvent> {
        self.with_state(|s| s.events.clone())
    }

    pub fn clear_events(&self) {
        self.with_state(|s| s.events.clear());
    }

    pub fn output_level(&self, pin: u8) -> Option<Level> {
        self.with_state(|s| s.outputs.get(&pin).copied())
    }

    /// Current PWM duty of `pin`, `None` when PWM is not running.
    pub fn duty_cycle(&self, pin: u8) -> Option<f64> {
        self.with_state(|s| s.duty.get(&pin).copied())
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.with_state(|s| s.claimed.contains(&pin))
    }

    pub fn claimed_pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self.with_state(|s| s.claimed.iter().copied().collect());
        pins.sort_unstable();
        pins
    }

    fn claim(&self, pin: u8, event: GpioEvent) -> Result<Box<dyn GpioLine>, HardwareError> {
        self.with_state(|s| {
            if s.failing.contains(&pin) {
                return Err(HardwareError::gpio(pin, "simulated failure"));
            }
            if !s.claimed.insert(pin) {
                return Err(HardwareError::gpio(pin, "pin already in use"));
            }
            match &event {
                GpioEvent::ClaimOutput { level, .. } => {
                    s.outputs.insert(pin, *level);
                }
                _ => {
                    s.outputs.remove(&pin);
                }
            }
            s.events.push(event);
            Ok(())
        })?;
        Ok(Box::new(MockLine {
            pin,
            state: self.state.clone(),
        }))
    }
}

impl GpioBackend for MockGpioBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn claim_input(&self, pin: u8, pull: PullMode) -> Result<Box<dyn GpioLine>, HardwareError> {
        self.claim(pin, GpioEvent::ClaimInput { pin, pull })
    }

    fn claim_output(&self, pin: u8, initial: Level) -> Result<Box<dyn GpioLine>, HardwareError> {
        self.claim(pin, GpioEvent::ClaimOutput { pin, level: initial })
    }

    fn reset(&self, pin: u8) -> Result<(), HardwareError> {
        self.with_state(|s| {
            if s.failing.contains(&pin) {
                return Err(HardwareError::gpio(pin, "simulated failure"));
            }
            s.outputs.remove(&pin);
            s.events.push(GpioEvent::Reset { pin });
            Ok(())
        })
    }
}

struct MockLine {
    pin: u8,
    state: Arc<Mutex<MockState>>,
}

impl MockLine {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<R, HardwareError>,
    ) -> Result<R, HardwareError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failing.contains(&self.pin) {
            return Err(HardwareError::gpio(self.pin, "simulated failure"));
        }
        f(&mut state)
    }
}

impl GpioLine for MockLine {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn read(&mut self) -> Result<Level, HardwareError> {
        let pin = self.pin;
        self.with_state(|s| {
            s.events.push(GpioEvent::Read { pin });
            let level = s
                .outputs
                .get(&pin)
                .or_else(|| s.inputs.get(&pin))
                .copied()
                .unwrap_or(Level::Low);
            Ok(level)
        })
    }

    fn write(&mut self, level: Level) -> Result<(), HardwareError> {
        let pin = self.pin;
        self.with_state(|s| {
            s.outputs.insert(pin, level);
            s.events.push(GpioEvent::Write { pin, level });
            Ok(())
        })
    }

    fn set_pwm(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<(), HardwareError> {
        let pin = self.pin;
        self.with_state(|s| {
            s.duty.insert(pin, duty_percent);
            s.events.push(GpioEvent::SetPwm {
                pin,
                frequency_hz,
                duty_percent,
            });
            Ok(())
        })
    }

    fn clear_pwm(&mut self) -> Result<(), HardwareError> {
        let pin = self.pin;
        self.with_state(|s| {
            s.duty.remove(&pin);
            s.events.push(GpioEvent::ClearPwm { pin });
            Ok(())
        })
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.claimed.remove(&self.pin);
        state.duty.remove(&self.pin);
        state.events.push(GpioEvent::Release { pin: self.pin });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_drop() {
        let backend = MockGpioBackend::new();
        let line = backend.claim_output(18, Level::Low).unwrap();
        assert!(backend.claim_input(18, PullMode::None).is_err());
        drop(line);
        assert!(!backend.is_claimed(18));
        assert!(backend.claim_input(18, PullMode::Up).is_ok());
    }

    #[test]
    fn test_input_levels_and_failures() {
        let backend = MockGpioBackend::new();
        backend.set_input_level(19, Level::High);
        let mut line = backend.claim_input(19, PullMode::Up).unwrap();
        assert_eq!(line.read().unwrap(), Level::High);

        backend.fail_pin(19);
        assert!(line.read().is_err());
        assert!(backend.claim_input(20, PullMode::None).is_ok());
    }

    #[test]
    fn test_pwm_tracking() {
        let backend = MockGpioBackend::new();
        let mut line = backend.claim_output(21, Level::Low).unwrap();
        line.set_pwm(1000.0, 25.0).unwrap();
        assert_eq!(backend.duty_cycle(21), Some(25.0));
        line.clear_pwm().unwrap();
        assert_eq!(backend.duty_cycle(21), None);
    }
}
