use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CONFIG_NAMESPACE: &str = "config";
pub const BOOT_NAMESPACE: &str = "boot";

pub const KEY_OTA_URL: &str = "ota_url";
pub const KEY_MANIFEST_URL: &str = "manifest_url";
pub const KEY_TLS_VERIFY: &str = "tls_verify";
pub const KEY_CHECK_INTERVAL: &str = "ota_interval_h";
const PARTITION_VERSION_PREFIX: &str = "part_ver_";

// NVS keys are limited to 15 characters
const MAX_KEY_LEN: usize = 15;

pub const DEFAULT_UPDATE_URL: &str = match option_env!("OTA_UPDATE_URL") {
    Some(url) => url,
    None => "https://api.github.com/repos/jtn0123/Led-Matrix-Webex/releases/latest",
};

pub const DEFAULT_MANIFEST_URL: &str = match option_env!("OTA_MANIFEST_URL") {
    Some(url) => url,
    None => "",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    KeyTooLong(String),
    Unavailable,
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::KeyTooLong(key) => write!(f, "key '{}' exceeds {} chars", key, MAX_KEY_LEN),
            StoreError::Unavailable => write!(f, "storage unavailable"),
            StoreError::Backend(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Key-value persistence for one namespace (NVS on the device).
pub trait ConfigStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError>;

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

pub fn check_key(key: &str) -> Result<(), StoreError> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLong(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    Str(String),
    U32(u32),
}

/// In-memory store used on the host and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, to exercise best-effort persistence paths.
    pub fn with_failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

impl ConfigStore for MemoryStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        check_key(key)?;
        Ok(match self.values.get(key) {
            Some(StoredValue::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        check_key(key)?;
        if self.fail_writes {
            return Err(StoreError::Unavailable);
        }
        self.values
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        check_key(key)?;
        Ok(match self.values.get(key) {
            Some(StoredValue::U32(v)) => Some(*v),
            _ => None,
        })
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        check_key(key)?;
        if self.fail_writes {
            return Err(StoreError::Unavailable);
        }
        self.values.insert(key.to_string(), StoredValue::U32(value));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        self.values.remove(key);
        Ok(())
    }
}

pub fn partition_version_key(label: &str) -> String {
    format!("{}{}", PARTITION_VERSION_PREFIX, label)
}

pub fn set_partition_version(
    store: &mut dyn ConfigStore,
    label: &str,
    version: &str,
) -> Result<(), StoreError> {
    store.set_string(&partition_version_key(label), version)
}

pub fn partition_version(store: &dyn ConfigStore, label: &str) -> Option<String> {
    store
        .get_string(&partition_version_key(label))
        .ok()
        .flatten()
}

pub fn clear_partition_version(store: &mut dyn ConfigStore, label: &str) -> Result<(), StoreError> {
    store.remove(&partition_version_key(label))
}

/// OTA-related settings kept in the config namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaSettings {
    pub update_url: String,
    pub manifest_url: String,
    pub tls_verify: bool,
    pub check_interval_hours: u32,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            update_url: DEFAULT_UPDATE_URL.to_string(),
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            tls_verify: true,
            check_interval_hours: 24,
        }
    }
}

impl OtaSettings {
    /// Load from the store, falling back to defaults key by key.
    pub fn load(store: &dyn ConfigStore) -> Self {
        let defaults = Self::default();

        let read_string = |key: &str, fallback: String| match store.get_string(key) {
            Ok(Some(value)) if !value.is_empty() => value,
            Ok(_) => fallback,
            Err(e) => {
                log::warn!("Failed to read '{}': {}, using default", key, e);
                fallback
            }
        };

        let update_url = read_string(KEY_OTA_URL, defaults.update_url);
        let manifest_url = read_string(KEY_MANIFEST_URL, defaults.manifest_url);

        let tls_verify = match store.get_u32(KEY_TLS_VERIFY) {
            Ok(Some(v)) => v != 0,
            _ => defaults.tls_verify,
        };
        let check_interval_hours = match store.get_u32(KEY_CHECK_INTERVAL) {
            Ok(Some(v)) if v > 0 => v,
            _ => defaults.check_interval_hours,
        };

        Self {
            update_url,
            manifest_url,
            tls_verify,
            check_interval_hours,
        }
    }

    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        store.set_string(KEY_OTA_URL, &self.update_url)?;
        store.set_string(KEY_MANIFEST_URL, &self.manifest_url)?;
        store.set_u32(KEY_TLS_VERIFY, u32::from(self.tls_verify))?;
        store.set_u32(KEY_CHECK_INTERVAL, self.check_interval_hours)?;
        log::info!("OTA settings saved");
        Ok(())
    }

    pub fn has_manifest(&self) -> bool {
        !self.manifest_url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_defaults() {
        let store = MemoryStore::new();
        let settings = OtaSettings::load(&store);
        assert_eq!(settings, OtaSettings::default());
        assert!(settings.tls_verify);
    }

    #[test]
    fn settings_round_trip_through_store() {
        let mut store = MemoryStore::new();
        let settings = OtaSettings {
            update_url: "https://updates.local/releases/latest".to_string(),
            manifest_url: "https://updates.local/manifest.json".to_string(),
            tls_verify: false,
            check_interval_hours: 6,
        };
        settings.save(&mut store).unwrap();
        assert_eq!(OtaSettings::load(&store), settings);
        assert!(settings.has_manifest());
    }

    #[test]
    fn partition_version_keys_fit_nvs() {
        let key = partition_version_key("ota_0");
        assert_eq!(key, "part_ver_ota_0");
        assert!(check_key(&key).is_ok());
    }

    #[test]
    fn partition_version_set_and_clear() {
        let mut store = MemoryStore::new();
        set_partition_version(&mut store, "ota_1", "2.0.0").unwrap();
        assert_eq!(partition_version(&store, "ota_1").as_deref(), Some("2.0.0"));
        clear_partition_version(&mut store, "ota_1").unwrap();
        assert_eq!(partition_version(&store, "ota_1"), None);
    }

    #[test]
    fn overlong_keys_are_rejected() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.set_string("this_key_is_far_too_long", "x"),
            Err(StoreError::KeyTooLong(_))
        ));
    }

    #[test]
    fn settings_serialize_to_json() {
        let json = serde_json::to_string(&OtaSettings::default()).unwrap();
        assert!(json.contains("\"tls_verify\":true"));
    }
}
