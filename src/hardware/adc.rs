// src/hardware/adc.rs - MCP3008 analog input over SPI
use std::io;
use std::sync::Mutex;

use super::HardwareError;

/// Full-scale reading of the 10-bit converter.
pub const ADC_MAX: u16 = 1023;
/// Channels on the converter.
pub const ADC_CHANNELS: u8 = 8;

/// A full-duplex three-byte SPI exchange.
pub trait SpiBus: Send {
    fn transfer(&mut self, tx: &[u8; 3]) -> io::Result<[u8; 3]>;
}

/// Single-ended selector nibble for `channel`.
pub fn channel_selector(channel: u8) -> u8 {
    0x08 | (channel & 0x07)
}

/// Start bit, then the selector in the high nibble, then a clocking byte.
pub fn command_frame(channel: u8) -> [u8; 3] {
    [0x01, channel_selector(channel) << 4, 0x00]
}

/// The sample is the low two bits of the second reply byte followed by the third.
pub fn decode_sample(reply: &[u8; 3]) -> u16 {
    (u16::from(reply[1] & 0x03) << 8) | u16::from(reply[2])
}

pub fn raw_to_voltage(raw: u16, reference_voltage: f64) -> f64 {
    f64::from(raw) / f64::from(ADC_MAX) * reference_voltage
}

/// Shared handle on the converter. Transfers are serialized internally.
pub struct AdcBridge {
    bus: Mutex<Box<dyn SpiBus>>,
}

impl AdcBridge {
    pub fn with_bus(bus: Box<dyn SpiBus>) -> Self {
        Self { bus: Mutex::new(bus) }
    }

    /// Open the SPI device backing the converter.
    #[cfg(all(feature = "adc", target_os = "linux"))]
    pub fn open(device: &str, speed_hz: u32) -> Result<Self, HardwareError> {
        let bus = spi::SpidevBus::open(device, speed_hz)?;
        tracing::info!("SPI ADC opened on {} at {} Hz", device, speed_hz);
        Ok(Self::with_bus(Box::new(bus)))
    }

    #[cfg(not(all(feature = "adc", target_os = "linux")))]
    pub fn open(device: &str, _speed_hz: u32) -> Result<Self, HardwareError> {
        Err(HardwareError::Unavailable(format!(
            "SPI support not compiled in ({})",
            device
        )))
    }

    /// Sample `channel`, 0..=1023. Bus failures and out-of-range channels read as 0.
    pub fn read_channel(&self, channel: u8) -> u16 {
        if channel >= ADC_CHANNELS {
            tracing::warn!("ADC channel {} out of range", channel);
            return 0;
        }
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        match bus.transfer(&command_frame(channel)) {
            Ok(reply) => decode_sample(&reply),
            Err(e) => {
                tracing::warn!("Error reading ADC channel {}: {}", channel, e);
                0
            }
        }
    }
}

#[cfg(all(feature = "adc", target_os = "linux"))]
mod spi {
    use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
    use std::io;

    use super::SpiBus;

    pub struct SpidevBus {
        dev: Spidev,
    }

    impl SpidevBus {
        pub fn open(path: &str, speed_hz: u32) -> io::Result<Self> {
            let mut dev = Spidev::open(path)?;
            let options = SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(speed_hz)
                .mode(SpiModeFlags::SPI_MODE_0)
                .build();
            dev.configure(&options)?;
            Ok(Self { dev })
        }
    }

    impl SpiBus for SpidevBus {
        fn transfer(&mut self, tx: &[u8; 3]) -> io::Result<[u8; 3]> {
            let mut rx = [0u8; 3];
            {
                let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
                self.dev.transfer(&mut transfer)?;
            }
            Ok(rx)
        }
    }
}
