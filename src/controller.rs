// src/controller.rs - Pin controller with per-pin locking and simulation fallback
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::GpioSettings;
use crate::hardware::adc::{raw_to_voltage, ADC_MAX};
use crate::hardware::{
    is_header_pin, special_function, AdcBridge, GpioBackend, GpioLine, HardwareCapability,
    HardwareError, Level, SimulationReason,
};
use crate::pins::{PinConfig, PinDocument};

#[derive(Debug, Error)]
pub enum PinError {
    #[error("Pin {0} not configured")]
    NotConfigured(u8),
    #[error("Pin {0} is disabled")]
    Disabled(u8),
    #[error("Pin {0} is not configured as output")]
    NotOutput(u8),
    #[error("PWM not initialized for pin {0}")]
    PwmNotInitialized(u8),
    #[error("Hardware error on pin {pin}: {source}")]
    Hardware {
        pin: u8,
        #[source]
        source: HardwareError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    DigitalInput,
    AnalogInput,
    DigitalOutput,
    AnalogOutput,
}

impl ReadingKind {
    fn of(config: &PinConfig) -> Self {
        match (config.is_output(), config.is_analog()) {
            (false, false) => ReadingKind::DigitalInput,
            (false, true) => ReadingKind::AnalogInput,
            (true, false) => ReadingKind::DigitalOutput,
            (true, true) => ReadingKind::AnalogOutput,
        }
    }
}

/// Value part of a pin reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinValue {
    Digital(u8),
    Voltage(f64),
    /// Outputs are never sampled back.
    Unknown,
    /// Analog input without a converter.
    Unavailable,
}

impl Serialize for PinValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PinValue::Digital(v) => serializer.serialize_u8(*v),
            PinValue::Voltage(v) => serializer.serialize_f64(*v),
            PinValue::Unknown => serializer.serialize_str("unknown"),
            PinValue::Unavailable => serializer.serialize_str("ADC not available"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PinReading {
    pub pin: u8,
    pub kind: ReadingKind,
    pub value: PinValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_adc: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    pub simulated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Value handed to `write`. Integers are levels or raw duty cycles; floats
/// inside `[0, vref]` are voltages.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
    Int(i64),
    Float(f64),
}

impl WriteValue {
    /// Digital level for this value. Floats are truncated toward zero first.
    pub fn level(self) -> Level {
        match self {
            WriteValue::Int(v) => Level::from(v != 0),
            WriteValue::Float(v) => Level::from(!v.is_nan() && v.trunc() != 0.0),
        }
    }
}

impl From<i64> for WriteValue {
    fn from(v: i64) -> Self {
        WriteValue::Int(v)
    }
}

impl From<i32> for WriteValue {
    fn from(v: i32) -> Self {
        WriteValue::Int(i64::from(v))
    }
}

impl From<f64> for WriteValue {
    fn from(v: f64) -> Self {
        WriteValue::Float(v)
    }
}

impl From<bool> for WriteValue {
    fn from(v: bool) -> Self {
        WriteValue::Int(i64::from(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WrittenValue {
    Level(u8),
    DutyCycle(f64),
}

/// PWM duty in percent for an analog write.
pub fn duty_cycle_for(value: WriteValue, reference_voltage: f64) -> f64 {
    match value {
        WriteValue::Float(v) if v.is_nan() => 0.0,
        WriteValue::Float(v) if (0.0..=reference_voltage).contains(&v) => {
            v / reference_voltage * 100.0
        }
        WriteValue::Float(v) => v.clamp(0.0, 100.0),
        WriteValue::Int(v) => (v as f64).clamp(0.0, 100.0),
    }
}

/// Read/write counters, the GPIO counterpart of per-command statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct PinFailure {
    pub pin: u8,
    pub error: HardwareError,
}

/// Outcome of applying a document.
#[derive(Debug, Default)]
pub struct ConfigureReport {
    pub configured: Vec<u8>,
    pub released: Vec<u8>,
    pub failures: Vec<PinFailure>,
}

impl ConfigureReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Answer to a pin information query.
#[derive(Debug, Clone, Serialize)]
pub struct PinInfo {
    pub pin: u8,
    pub configured: bool,
    pub available: bool,
    pub special_function: Option<&'static str>,
    #[serde(flatten)]
    pub config: Option<PinConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<PinReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct PwmChannel {
    frequency_hz: f64,
    duty_percent: f64,
}

#[derive(Default)]
struct PinRuntime {
    line: Option<Box<dyn GpioLine>>,
    pwm: Option<PwmChannel>,
    last_written: Option<WrittenValue>,
    /// Configuration applied by the last successful configure.
    applied: Option<PinConfig>,
}

enum PinOutcome {
    Configured,
    Released,
    Untouched,
    Failed(HardwareError),
}

/// Owns all pin state and mediates every hardware access.
pub struct PinController {
    gpio: Option<Arc<dyn GpioBackend>>,
    simulation: Option<SimulationReason>,
    adc: StdMutex<Option<Arc<AdcBridge>>>,
    document: RwLock<PinDocument>,
    pins: StdMutex<HashMap<u8, Arc<Mutex<PinRuntime>>>>,
    stats: StdMutex<IoStats>,
    reference_voltage: f64,
    adc_channels: u8,
}

impl PinController {
    pub fn new(capability: HardwareCapability, settings: &GpioSettings) -> Self {
        let (gpio, adc, simulation) = match capability {
            HardwareCapability::Real { gpio, adc } => (Some(gpio), adc.map(Arc::new), None),
            HardwareCapability::Simulated(reason) => (None, None, Some(reason)),
        };
        Self {
            gpio,
            simulation,
            adc: StdMutex::new(adc),
            document: RwLock::new(PinDocument::new()),
            pins: StdMutex::new(HashMap::new()),
            stats: StdMutex::new(IoStats::default()),
            reference_voltage: settings.reference_voltage,
            adc_channels: settings.adc_channels.max(1),
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulation.is_some()
    }

    pub fn simulation_reason(&self) -> Option<&SimulationReason> {
        self.simulation.as_ref()
    }

    pub fn has_adc(&self) -> bool {
        self.adc_handle().is_some()
    }

    pub async fn document(&self) -> PinDocument {
        self.document.read().await.clone()
    }

    pub fn stats(&self) -> IoStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, f: impl FnOnce(&mut IoStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    fn adc_handle(&self) -> Option<Arc<AdcBridge>> {
        self.adc.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn runtime(&self, pin: u8) -> Option<Arc<Mutex<PinRuntime>>> {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .cloned()
    }

    fn runtime_entry(&self, pin: u8) -> Arc<Mutex<PinRuntime>> {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(pin)
            .or_default()
            .clone()
    }

    fn held_pins(&self) -> Vec<u8> {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Apply `document` to the hardware.
    ///
    /// Enabled pins are (re)claimed; pins that are absent or disabled give back
    /// whatever the controller held for them. A failing pin is reported and left
    /// unconfigured without affecting the rest of the batch.
    pub async fn configure(&self, document: PinDocument) -> ConfigureReport {
        {
            let mut current = self.document.write().await;
            *current = document.clone();
        }

        let mut targets: BTreeSet<u8> = self.held_pins().into_iter().collect();
        targets.extend(document.pins.keys().copied());

        let outcomes = join_all(targets.into_iter().map(|pin| {
            let config = document.get(pin).filter(|c| c.enabled).cloned();
            async move { (pin, self.apply_pin(pin, config).await) }
        }))
        .await;

        let mut report = ConfigureReport::default();
        for (pin, outcome) in outcomes {
            match outcome {
                PinOutcome::Configured => report.configured.push(pin),
                PinOutcome::Released => report.released.push(pin),
                PinOutcome::Untouched => {}
                PinOutcome::Failed(error) => {
                    self.record(|s| s.failures += 1);
                    report.failures.push(PinFailure { pin, error });
                }
            }
        }

        tracing::info!(
            "GPIO configuration applied: {} configured, {} released, {} failed",
            report.configured.len(),
            report.released.len(),
            report.failures.len()
        );
        report
    }

    async fn apply_pin(&self, pin: u8, config: Option<PinConfig>) -> PinOutcome {
        let Some(config) = config else {
            let Some(runtime) = self.runtime(pin) else {
                return PinOutcome::Untouched;
            };
            let mut rt = runtime.lock().await;
            return match self.release_locked(pin, &mut rt) {
                Ok(true) => PinOutcome::Released,
                Ok(false) => PinOutcome::Untouched,
                Err(e) => PinOutcome::Failed(e),
            };
        };

        let runtime = self.runtime_entry(pin);
        let mut rt = runtime.lock().await;
        if let Err(e) = self.release_locked(pin, &mut rt) {
            tracing::warn!("Error releasing pin {} before reconfiguration: {}", pin, e);
        }

        match self.apply_locked(pin, &config, &mut rt) {
            Ok(()) => {
                rt.applied = Some(config);
                PinOutcome::Configured
            }
            Err(e) => {
                tracing::error!("Error configuring pin {}: {}", pin, e);
                PinOutcome::Failed(e)
            }
        }
    }

    fn apply_locked(
        &self,
        pin: u8,
        config: &PinConfig,
        rt: &mut PinRuntime,
    ) -> Result<(), HardwareError> {
        let kind = ReadingKind::of(config);
        let Some(gpio) = &self.gpio else {
            tracing::info!("[SIM] Configured pin {} ({}) as {:?}", pin, config.name, kind);
            if kind == ReadingKind::AnalogOutput {
                rt.pwm = Some(PwmChannel {
                    frequency_hz: f64::from(config.pwm_frequency_hz),
                    duty_percent: config.initial_value.clamp(0.0, 100.0),
                });
            }
            return Ok(());
        };

        match kind {
            ReadingKind::DigitalInput => {
                rt.line = Some(gpio.claim_input(pin, config.pull_mode)?);
            }
            // Sampled through the converter; the line itself stays untouched.
            ReadingKind::AnalogInput => {}
            ReadingKind::DigitalOutput => {
                let level = WriteValue::Float(config.initial_value).level();
                rt.line = Some(gpio.claim_output(pin, level)?);
                rt.last_written = Some(WrittenValue::Level(level.as_u8()));
            }
            ReadingKind::AnalogOutput => {
                let mut line = gpio.claim_output(pin, Level::Low)?;
                let channel = PwmChannel {
                    frequency_hz: f64::from(config.pwm_frequency_hz),
                    duty_percent: config.initial_value.clamp(0.0, 100.0),
                };
                line.set_pwm(channel.frequency_hz, channel.duty_percent)?;
                rt.line = Some(line);
                rt.pwm = Some(channel);
            }
        }

        tracing::info!("Configured pin {} ({}) as {:?}", pin, config.name, kind);
        Ok(())
    }

    /// Stop PWM, drop the line and reset the pin. Returns whether anything was held.
    fn release_locked(&self, pin: u8, rt: &mut PinRuntime) -> Result<bool, HardwareError> {
        let held = rt.applied.is_some() || rt.line.is_some() || rt.pwm.is_some();
        rt.applied = None;
        rt.last_written = None;
        let mut result = Ok(());

        if rt.pwm.take().is_some() {
            match rt.line.as_mut() {
                Some(line) => {
                    if let Err(e) = line.clear_pwm() {
                        result = Err(e);
                    }
                }
                None if self.is_simulated() => {
                    tracing::info!("[SIM] Stopped PWM on pin {}", pin)
                }
                None => {}
            }
        }

        if let Some(line) = rt.line.take() {
            drop(line);
            if let Some(gpio) = &self.gpio {
                if let Err(e) = gpio.reset(pin) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        } else if held && self.is_simulated() {
            tracing::info!("[SIM] Released pin {}", pin);
        }

        result.map(|_| held)
    }

    /// Look up `pin` in the document and its runtime slot.
    async fn usable(&self, pin: u8) -> Result<Arc<Mutex<PinRuntime>>, PinError> {
        {
            let document = self.document.read().await;
            match document.get(pin) {
                None => return Err(PinError::NotConfigured(pin)),
                Some(config) if !config.enabled => return Err(PinError::Disabled(pin)),
                Some(_) => {}
            }
        }
        self.runtime(pin).ok_or(PinError::NotConfigured(pin))
    }

    pub async fn read(&self, pin: u8) -> Result<PinReading, PinError> {
        let runtime = self.usable(pin).await?;
        let mut rt = runtime.lock().await;
        let Some(config) = rt.applied.clone() else {
            return Err(PinError::NotConfigured(pin));
        };

        let kind = ReadingKind::of(&config);
        let mut reading = PinReading {
            pin,
            kind,
            value: PinValue::Unknown,
            raw_adc: None,
            channel: None,
            simulated: self.is_simulated(),
            timestamp: Utc::now(),
        };

        match kind {
            ReadingKind::DigitalOutput | ReadingKind::AnalogOutput => {}
            ReadingKind::DigitalInput => {
                if self.is_simulated() {
                    let level = rand::rng().random_range(0..=1u8);
                    tracing::debug!("[SIM] Read pin {}: {}", pin, level);
                    reading.value = PinValue::Digital(level);
                } else {
                    let line = rt.line.as_mut().ok_or(PinError::NotConfigured(pin))?;
                    match line.read() {
                        Ok(level) => reading.value = PinValue::Digital(level.as_u8()),
                        Err(source) => {
                            self.record(|s| s.failures += 1);
                            return Err(PinError::Hardware { pin, source });
                        }
                    }
                }
            }
            ReadingKind::AnalogInput => {
                let channel = pin % self.adc_channels;
                reading.channel = Some(channel);
                if self.is_simulated() {
                    let sample = rand::rng().random_range(0.0..=self.reference_voltage);
                    let voltage = round_to(sample, 2);
                    let raw =
                        (voltage / self.reference_voltage * f64::from(ADC_MAX)).round() as u16;
                    tracing::debug!("[SIM] Read analog pin {}: {} V", pin, voltage);
                    reading.raw_adc = Some(raw.min(ADC_MAX));
                    reading.value = PinValue::Voltage(voltage);
                } else if let Some(adc) = self.adc_handle() {
                    let raw = adc.read_channel(channel);
                    reading.raw_adc = Some(raw);
                    let voltage = raw_to_voltage(raw, self.reference_voltage);
                    reading.value = PinValue::Voltage(round_to(voltage, 3));
                } else {
                    reading.value = PinValue::Unavailable;
                }
            }
        }

        self.record(|s| s.reads += 1);
        Ok(reading)
    }

    pub async fn write(
        &self,
        pin: u8,
        value: impl Into<WriteValue>,
    ) -> Result<WrittenValue, PinError> {
        let value = value.into();
        let runtime = self.usable(pin).await?;
        let mut rt = runtime.lock().await;
        let Some(config) = rt.applied.clone() else {
            return Err(PinError::NotConfigured(pin));
        };
        if !config.is_output() {
            return Err(PinError::NotOutput(pin));
        }

        let simulated = self.is_simulated();
        let PinRuntime {
            line,
            pwm,
            last_written,
            ..
        } = &mut *rt;

        let written = if config.is_analog() {
            let channel = pwm.as_mut().ok_or(PinError::PwmNotInitialized(pin))?;
            let duty = duty_cycle_for(value, self.reference_voltage);
            if simulated {
                tracing::info!("[SIM] Set PWM duty on pin {} to {:.1}%", pin, duty);
            } else {
                let line = line.as_mut().ok_or(PinError::PwmNotInitialized(pin))?;
                if let Err(source) = line.set_pwm(channel.frequency_hz, duty) {
                    self.record(|s| s.failures += 1);
                    return Err(PinError::Hardware { pin, source });
                }
            }
            channel.duty_percent = duty;
            WrittenValue::DutyCycle(duty)
        } else {
            let level = value.level();
            if simulated {
                tracing::info!("[SIM] Set pin {} to {}", pin, level.as_u8());
            } else {
                let line = line.as_mut().ok_or(PinError::NotConfigured(pin))?;
                if let Err(source) = line.write(level) {
                    self.record(|s| s.failures += 1);
                    return Err(PinError::Hardware { pin, source });
                }
            }
            WrittenValue::Level(level.as_u8())
        };

        *last_written = Some(written);
        self.record(|s| s.writes += 1);
        tracing::debug!("Wrote {:?} to pin {} ({})", written, pin, config.name);
        Ok(written)
    }

    /// Last value written to an output pin, if any.
    pub async fn last_written(&self, pin: u8) -> Option<WrittenValue> {
        let runtime = self.runtime(pin)?;
        let rt = runtime.lock().await;
        rt.last_written
    }

    /// Current PWM duty of an analog output, if PWM is running.
    pub async fn duty_cycle(&self, pin: u8) -> Option<f64> {
        let runtime = self.runtime(pin)?;
        let rt = runtime.lock().await;
        rt.pwm.map(|p| p.duty_percent)
    }

    pub async fn pin_info(&self, pin: u8) -> PinInfo {
        let config = self.document.read().await.get(pin).cloned();
        let configured = match self.runtime(pin) {
            Some(runtime) => runtime.lock().await.applied.is_some(),
            None => false,
        };

        let mut info = PinInfo {
            pin,
            configured,
            available: is_header_pin(pin),
            special_function: special_function(pin),
            config,
            current_state: None,
            error: None,
        };

        if configured {
            match self.read(pin).await {
                Ok(reading) => info.current_state = Some(reading),
                Err(e) => info.error = Some(e.to_string()),
            }
        }
        info
    }

    /// Release everything the controller holds.
    ///
    /// Every pin is visited even when some fail; failures are returned. Calling
    /// this again is harmless.
    pub async fn cleanup(&self) -> Vec<PinFailure> {
        let runtimes: Vec<(u8, Arc<Mutex<PinRuntime>>)> = self
            .pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(pin, rt)| (*pin, rt.clone()))
            .collect();

        let mut failures = Vec::new();
        for (pin, runtime) in runtimes {
            let mut rt = runtime.lock().await;
            if let Err(error) = self.release_locked(pin, &mut rt) {
                tracing::warn!("Error releasing pin {} during cleanup: {}", pin, error);
                failures.push(PinFailure { pin, error });
            }
        }

        let adc = self.adc.lock().unwrap_or_else(|e| e.into_inner()).take();
        if adc.is_some() {
            tracing::info!("SPI ADC closed");
        }

        if failures.is_empty() {
            tracing::info!("GPIO cleanup completed");
        } else {
            tracing::warn!("GPIO cleanup completed with {} failures", failures.len());
        }
        failures
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
