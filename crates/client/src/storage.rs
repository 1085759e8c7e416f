//! File-backed persistent storage.
//!
//! Values are stored as JSON files, one per key, in a directory that defaults
//! to the platform-appropriate config location:
//!   - Linux: `~/.config/eventsub/`
//!   - macOS: `~/Library/Application Support/eventsub/`
//!   - Windows: `%APPDATA%\eventsub\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no config directory available on this platform")]
    NoConfigDir,
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON key-value storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage in the platform config directory.
    pub fn platform_default() -> Result<Self, StorageError> {
        let dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(Self::new(dir.join("eventsub")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{safe_key}.json"))
    }

    /// Save a value, creating the directory on first use.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(value)?;
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
        }
        std::fs::write(self.file_path(key), json)?;
        Ok(())
    }

    /// Load a value.
    ///
    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = std::fs::read_to_string(self.file_path(key)).ok()?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable stored value");
                None
            }
        }
    }

    /// Remove a value. Missing keys are not an error.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.file_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a key exists in storage.
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }
}
