//! Persisted key-value settings holding the device identity.
//!
//! Values are opaque byte strings. The device serial number lives under
//! [`SETTINGS_KEY_SN`] as 6 bytes.

use crate::error::SettingsError;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vendor_protocol::{SerialNumber, DEVICE_SN_SIZE};

/// Key of the persisted device serial number.
pub const SETTINGS_KEY_SN: &str = "nus/sn";

/// Backing store for settings.
pub trait SettingsStore: Send + Sync {
    /// Read a value.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SettingsError>;

    /// Write a value.
    fn save(&self, key: &str, value: &[u8]) -> Result<(), SettingsError>;
}

/// Volatile in-memory store.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySettings {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SettingsError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Store backed by a JSON file mapping keys to hex strings.
///
/// ```json
/// { "nus/sn": "0102030a0b0c" }
/// ```
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileSettings {
    /// Open the file, starting empty when it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        debug!("opened settings file {}", path.display());
        Ok(JsonFileSettings {
            path,
            values: Mutex::new(values),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SettingsError> {
        let values = self.values.lock();
        values
            .get(key)
            .map(|text| {
                hex::decode(text).map_err(|e| SettingsError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        let mut values = self.values.lock();
        let mut updated = values.clone();
        updated.insert(key.to_string(), hex::encode(value));

        let text = serde_json::to_string_pretty(&updated)?;
        fs::write(&self.path, text)?;
        *values = updated;
        Ok(())
    }
}

/// Callback fired after a setting changes.
pub type ChangeListener = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Settings access with change notification.
pub struct Settings {
    store: Arc<dyn SettingsStore>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl Settings {
    /// Wrap a store.
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Settings {
            store,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Settings over a fresh [`MemorySettings`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettings::new()))
    }

    /// Register a change listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    /// Read a raw value.
    pub fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SettingsError> {
        self.store.load(key)
    }

    /// Write a raw value and notify listeners.
    pub fn save(&self, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        self.store.save(key, value)?;
        for listener in self.listeners.read().iter() {
            listener(key, value);
        }
        Ok(())
    }

    /// The persisted serial number, or [`SerialNumber::EMPTY`] when unset.
    pub fn load_serial(&self) -> Result<SerialNumber, SettingsError> {
        match self.store.load(SETTINGS_KEY_SN)? {
            None => Ok(SerialNumber::EMPTY),
            Some(bytes) => decode_serial(&bytes),
        }
    }

    /// Persist the serial number and notify listeners.
    ///
    /// Serials wider than the 6-byte device serial are rejected.
    pub fn save_serial(&self, serial: SerialNumber) -> Result<(), SettingsError> {
        let sn = serial
            .try_to_device_sn()
            .map_err(|e| SettingsError::InvalidValue {
                key: SETTINGS_KEY_SN.to_string(),
                reason: e.to_string(),
            })?;
        info!("storing serial number {}", serial);
        self.save(SETTINGS_KEY_SN, &sn)
    }
}

/// Decode a stored serial number value.
pub fn decode_serial(bytes: &[u8]) -> Result<SerialNumber, SettingsError> {
    SerialNumber::from_device_sn_slice(bytes).map_err(|_| SettingsError::InvalidValue {
        key: SETTINGS_KEY_SN.to_string(),
        reason: format!("expected {} bytes, got {}", DEVICE_SN_SIZE, bytes.len()),
    })
}
