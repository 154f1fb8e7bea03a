//! Store configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KrknError, Result};

/// Options applied when opening a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Number of times the engine open is attempted before giving up.
    pub open_attempts: u32,
    /// Fixed delay between failed open attempts.
    pub open_retry_delay: Duration,
    /// Page cache size handed to the engine, in bytes.
    pub cache_size_bytes: usize,
    /// Database file name inside the store directory.
    pub file_name: String,
    /// Permission bits for a freshly created store directory (unix only).
    pub dir_mode: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_retry_delay: Duration::from_secs(3),
            cache_size_bytes: 256 * 1024 * 1024,
            file_name: "krkn.db".to_string(),
            dir_mode: 0o700,
        }
    }
}

impl StoreOptions {
    /// Load options from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let options: StoreOptions = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| KrknError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| KrknError::Config(e.to_string()))?
            }
            _ => {
                return Err(KrknError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations that can never open a store.
    pub fn validate(&self) -> Result<()> {
        if self.open_attempts == 0 {
            return Err(KrknError::Config("open_attempts must be at least 1".into()));
        }
        if self.file_name.is_empty() || self.file_name.contains(std::path::is_separator) {
            return Err(KrknError::Config(format!(
                "file_name must be a plain file name, got '{}'",
                self.file_name
            )));
        }
        Ok(())
    }

    /// Set the retry delay.
    pub fn with_open_retry_delay(mut self, delay: Duration) -> Self {
        self.open_retry_delay = delay;
        self
    }

    /// Set the number of open attempts.
    pub fn with_open_attempts(mut self, attempts: u32) -> Self {
        self.open_attempts = attempts;
        self
    }

    /// Set the engine cache size.
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }
}
