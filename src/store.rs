// src/store.rs - Pin document persistence with backup-on-write
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::GpioSettings;
use crate::pins::PinDocument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// `<name>.backup` next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("document"));
    name.push(".backup");
    path.with_file_name(name)
}

/// Write `value` as pretty JSON to `path` without ever exposing a partial file.
///
/// The new content goes to a temporary file in the same directory first. The
/// current file is copied to `<name>.backup`, then the temporary file is renamed
/// over the original. If the rename fails and the original is gone, the backup
/// is moved back into place.
pub fn persist_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut contents = serde_json::to_string_pretty(value)?;
    contents.push('\n');

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut staged = NamedTempFile::new_in(&dir)?;
    staged.write_all(contents.as_bytes())?;
    staged.as_file().sync_all()?;

    let backup = backup_path(path);
    let had_original = path.exists();
    if had_original {
        fs::copy(path, &backup)?;
    }

    if let Err(e) = staged.persist(path) {
        tracing::error!("Failed to write '{}': {}", path.display(), e.error);
        if had_original && !path.exists() {
            if let Err(restore) = fs::rename(&backup, path) {
                tracing::error!("Failed to restore '{}' from backup: {}", path.display(), restore);
            } else {
                tracing::warn!("Restored '{}' from backup", path.display());
            }
        }
        return Err(StoreError::Io(e.error));
    }

    Ok(())
}

/// Loads and saves the pin document.
///
/// Saves are serialized; loads never take the writer lock.
pub struct ConfigStore {
    path: PathBuf,
    defaults: GpioSettings,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, defaults: GpioSettings) -> Self {
        Self {
            path: path.into(),
            defaults,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &GpioSettings) -> Self {
        Self::new(settings.config_file.clone(), settings.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_document(&self) -> PinDocument {
        PinDocument::default_for(&self.defaults)
    }

    /// Read the stored document; `Ok(None)` when nothing has been saved yet.
    pub fn try_load(&self) -> Result<Option<PinDocument>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(PinDocument::from_json(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Read the stored document, falling back to the built-in default.
    pub fn load(&self) -> PinDocument {
        match self.try_load() {
            Ok(Some(document)) => {
                tracing::info!(
                    "GPIO configuration loaded from {} ({} pins)",
                    self.path.display(),
                    document.len()
                );
                document
            }
            Ok(None) => {
                tracing::info!(
                    "No configuration file found at {}, using defaults",
                    self.path.display()
                );
                self.default_document()
            }
            Err(e) => {
                tracing::error!(
                    "Error loading GPIO configuration from {}: {}; using defaults",
                    self.path.display(),
                    e
                );
                self.default_document()
            }
        }
    }

    pub fn save(&self, document: &PinDocument) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        persist_json(&self.path, document)?;
        tracing::info!("GPIO configuration saved to {}", self.path.display());
        Ok(())
    }
}
