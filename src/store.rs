use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::warn;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::rate::display_rate;

const DEFAULT_RATE_FILE: &str = "presto-rate";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub rate_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rate_file: PathBuf::from(DEFAULT_RATE_FILE),
        }
    }
}

/// Durable home of the chosen rate: a single file holding its one-decimal
/// text form. Shared by all sessions, so every page sees the value the last
/// page chose.
#[derive(Debug)]
pub struct RateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RateStore {
    pub fn open(config: &StorageConfig) -> Self {
        Self {
            path: config.rate_file.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored entry, if one exists. Unreadable entries are treated as
    /// absent; the caller falls back to the default rate either way.
    pub fn load(&self) -> Option<String> {
        let _guard = self.lock.lock();
        match fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw.trim().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    "Failed to read stored rate from {}: {err}",
                    self.path.display()
                );
                None
            }
        }
    }

    pub fn save(&self, rate: f64) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create storage directory {}", dir.display())
                })?;
            }
        }
        fs::write(&self.path, format!("{}\n", display_rate(rate)))
            .with_context(|| format!("Failed to write rate to {}", self.path.display()))?;
        Ok(())
    }
}
