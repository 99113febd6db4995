use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Recognised persistent keys.
pub mod keys {
    pub const SOLAR_ACC_FORECAST: &str = "solarAccForecast";
    pub const SOLAR_ACC_YIELD: &str = "solarAccYield";
    pub const BUFFER_SOC: &str = "battery.bufferSoc";
    pub const BUFFER_START_SOC: &str = "battery.bufferStartSoc";
    pub const PRIORITY_SOC: &str = "battery.prioritySoc";
    pub const DISCHARGE_CONTROL: &str = "battery.dischargeControl";
    pub const GRID_CHARGE_LIMIT: &str = "battery.gridChargeLimit";
    pub const RESIDUAL_POWER: &str = "residualPower";

    pub fn session_energy(loadpoint: &str) -> String {
        format!("session.{loadpoint}.energy")
    }

    pub fn session_total(loadpoint: &str) -> String {
        format!("session.{loadpoint}.total")
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Process-wide key-value settings store with an explicit
/// `open → read/write → flush` lifecycle, backed by a single JSON file.
///
/// Writes are batched in memory and flushed at tick end; reads never touch
/// the filesystem after `open`. A corrupt value is deleted with a warning
/// rather than failing the caller.
#[derive(Debug)]
pub struct Settings {
    path: Option<PathBuf>,
    values: HashMap<String, Value>,
    dirty: bool,
}

impl Settings {
    /// Open the store at `path`. A missing file yields an empty store; an
    /// unreadable or corrupt file yields an empty store with a warning.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), %err, "settings file corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, starting empty");
                HashMap::new()
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "settings file unreadable, starting empty");
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            values,
            dirty: false,
        }
    }

    /// An unpersisted store, used by tests and by sites configured without a
    /// settings path.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: HashMap::new(),
            dirty: false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn float(&mut self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(value) => match value.as_f64() {
                Some(v) => Some(v),
                None => {
                    self.discard_corrupt(key);
                    None
                }
            },
            None => None,
        }
    }

    pub fn bool(&mut self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(value) => match value.as_bool() {
                Some(v) => Some(v),
                None => {
                    self.discard_corrupt(key);
                    None
                }
            },
            None => None,
        }
    }

    pub fn json<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        match self.values.get(key) {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(v) => Some(v),
                Err(_) => {
                    self.discard_corrupt(key);
                    None
                }
            },
            None => None,
        }
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.set_value(key, Value::Number(number));
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_value(key, Value::Bool(value));
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), SettingsError> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    /// Write batched changes out. A no-op when nothing changed or the store
    /// is in-memory.
    pub fn flush(&mut self) -> Result<(), SettingsError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let raw = serde_json::to_string_pretty(&self.values)?;
            std::fs::write(path, raw)?;
        }
        self.dirty = false;
        Ok(())
    }

    fn set_value(&mut self, key: &str, value: Value) {
        let changed = self.values.get(key) != Some(&value);
        if changed {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    fn discard_corrupt(&mut self, key: &str) {
        warn!(key, "corrupt settings value deleted");
        self.values.remove(key);
        self.dirty = true;
    }
}
