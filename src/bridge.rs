// src/bridge.rs - Facade over the pin store, pin controller and stack supervisor
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::controller::{
    ConfigureReport, PinController, PinError, PinInfo, PinReading, WriteValue, WrittenValue,
};
use crate::hardware::HardwareCapability;
use crate::objects::ObjectDocument;
use crate::pins::{DocumentError, PinDocument};
use crate::store::{ConfigStore, StoreError};
use crate::supervisor::{
    DeviceIdentity, NetworkParams, ProcessStatus, ProcessSupervisor, StartOutcome, StatusHandle,
    SupervisorError,
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid pin document: {}", format_document_errors(.0))]
    InvalidDocument(Vec<DocumentError>),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Pin error: {0}")]
    Pin(#[from] PinError),
    #[error("Stack error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn format_document_errors(errors: &[DocumentError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything the front end and the bootstrap talk to.
pub struct Bridge {
    settings: Settings,
    store: Arc<ConfigStore>,
    controller: Arc<PinController>,
    supervisor: Mutex<ProcessSupervisor>,
    status: StatusHandle,
    update_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl Bridge {
    /// Load the pin document, apply it and write the object document.
    pub async fn open(
        settings: Settings,
        capability: HardwareCapability,
    ) -> Result<Self, BridgeError> {
        let store = Arc::new(ConfigStore::from_settings(&settings.gpio));
        let mut document = {
            let store = store.clone();
            blocking(move || Ok(store.load())).await?
        };
        document.normalize(settings.gpio.pin_count);
        if let Err(errors) = document.validate(settings.gpio.pin_count) {
            tracing::error!(
                "Stored GPIO configuration rejected ({}); using defaults",
                format_document_errors(&errors)
            );
            document = store.default_document();
        }

        let controller = Arc::new(PinController::new(capability, &settings.gpio));
        let report = controller.configure(document.clone()).await;
        for failure in &report.failures {
            tracing::error!("Pin {} not configured: {}", failure.pin, failure.error);
        }

        let supervisor = ProcessSupervisor::new(settings.stack.clone());
        let status = supervisor.status_handle();
        let bridge = Self {
            settings,
            store,
            controller,
            supervisor: Mutex::new(supervisor),
            status,
            update_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        };
        bridge.write_objects(&document).await?;
        Ok(bridge)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn controller(&self) -> Arc<PinController> {
        self.controller.clone()
    }

    async fn write_objects(&self, document: &PinDocument) -> Result<ObjectDocument, StoreError> {
        let objects = ObjectDocument::build(
            self.settings.device.id,
            &self.settings.device.name,
            document,
            self.settings.gpio.instance_numbering,
            self.settings.gpio.pin_count,
        );
        let path = self.settings.gpio.objects_file.clone();
        blocking(move || {
            objects.write_to(&path)?;
            Ok(objects)
        })
        .await
    }

    /// The pin document currently applied.
    pub async fn configuration(&self) -> PinDocument {
        self.controller.document().await
    }

    /// Replace the pin document: validate, persist, re-apply, regenerate objects.
    pub async fn update_configuration(
        &self,
        mut document: PinDocument,
    ) -> Result<ConfigureReport, BridgeError> {
        let _guard = self.update_lock.lock().await;

        document.normalize(self.settings.gpio.pin_count);
        document
            .validate(self.settings.gpio.pin_count)
            .map_err(BridgeError::InvalidDocument)?;

        {
            let store = self.store.clone();
            let document = document.clone();
            blocking(move || store.save(&document)).await?;
        }
        let report = self.controller.configure(document.clone()).await;
        let objects = self.write_objects(&document).await?;
        tracing::info!(
            "GPIO configuration updated: {} pins, {} objects",
            document.len(),
            objects.total_objects
        );

        if self.settings.stack.restart_on_update && self.status.snapshot().running {
            tracing::info!("Restarting stack to pick up the new object list");
            let mut supervisor = self.supervisor.lock().await;
            supervisor.stop().await;
            self.start_locked(&mut supervisor).await?;
        }

        Ok(report)
    }

    async fn start_locked(
        &self,
        supervisor: &mut ProcessSupervisor,
    ) -> Result<StartOutcome, SupervisorError> {
        let identity = DeviceIdentity::from(&self.settings.device);
        let network = NetworkParams::from(&self.settings.network);
        supervisor.start(&identity, &network, &self.settings.stack.options).await
    }

    /// Build the stack if needed and start it with the configured identity.
    pub async fn start_stack(&self) -> Result<StartOutcome, BridgeError> {
        let mut supervisor = self.supervisor.lock().await;
        Ok(self.start_locked(&mut supervisor).await?)
    }

    pub async fn stop_stack(&self) {
        self.supervisor.lock().await.stop().await;
    }

    /// Force a clean rebuild of the stack binary.
    pub async fn rebuild_stack(&self) -> Result<(), BridgeError> {
        self.supervisor.lock().await.rebuild().await?;
        Ok(())
    }

    pub fn stack_status(&self) -> ProcessStatus {
        self.status.snapshot()
    }

    pub fn stack_diagnostics(&self) -> Vec<String> {
        self.status.diagnostics()
    }

    pub async fn read_pin(&self, pin: u8) -> Result<PinReading, BridgeError> {
        Ok(self.controller.read(pin).await?)
    }

    pub async fn write_pin(&self, pin: u8, value: WriteValue) -> Result<WrittenValue, BridgeError> {
        Ok(self.controller.write(pin, value).await?)
    }

    pub async fn pin_info(&self, pin: u8) -> PinInfo {
        self.controller.pin_info(pin).await
    }

    /// Stop the stack and release the hardware. Only the first call does anything.
    pub async fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Shutting down GPIO-BACnet bridge");
        self.stop_stack().await;
        let failures = self.controller.cleanup().await;
        if !failures.is_empty() {
            tracing::warn!("{} pins could not be released", failures.len());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulationReason;
    use tempfile::tempdir;

    fn settings_in(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.gpio.config_file = dir.join("pins.json");
        settings.gpio.objects_file = dir.join("objects.json");
        settings.stack.dir = dir.join("stack");
        settings
    }

    fn simulated() -> HardwareCapability {
        HardwareCapability::Simulated(SimulationReason::Forced)
    }

    #[tokio::test]
    async fn test_open_writes_object_document() {
        let dir = tempdir().unwrap();
        let bridge = Bridge::open(settings_in(dir.path()), simulated()).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("objects.json")).unwrap();
        let objects: ObjectDocument = serde_json::from_str(&contents).unwrap();
        assert_eq!(objects.device_id, 25411);
        assert_eq!(objects.total_objects, 2);
        assert_eq!(bridge.configuration().await.len(), 24);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_document() {
        let dir = tempdir().unwrap();
        let bridge = Bridge::open(settings_in(dir.path()), simulated()).await.unwrap();

        let mut document = PinDocument::new();
        for pin in [4, 9] {
            document.insert(
                pin,
                crate::pins::PinConfig {
                    instance: Some(9),
                    ..Default::default()
                },
            );
        }

        let result = bridge.update_configuration(document).await;
        assert!(matches!(result, Err(BridgeError::InvalidDocument(_))));
        assert!(!dir.path().join("pins.json").exists());
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let dir = tempdir().unwrap();
        let bridge = Bridge::open(settings_in(dir.path()), simulated()).await.unwrap();
        assert!(bridge.shutdown().await);
        assert!(!bridge.shutdown().await);
    }
}
