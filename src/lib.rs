// src/lib.rs - GPIO to BACnet bridge library
pub mod bridge;
pub mod config;
pub mod controller;
pub mod hardware;
pub mod objects;
pub mod pins;
pub mod store;
pub mod supervisor;

pub use bridge::{Bridge, BridgeError};
pub use config::{load_config, load_config_or_default, ConfigError, Settings};
pub use controller::{PinController, PinError};
pub use hardware::HardwareCapability;
pub use supervisor::{ProcessSupervisor, SupervisorError};
