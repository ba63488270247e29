use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::config::{check_key, ConfigStore, StoreError};

// Longest string value we read back (URLs)
const MAX_VALUE_LEN: usize = 512;

/// One NVS namespace.
pub struct EspNvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl EspNvsStore {
    pub fn new(partition: EspDefaultNvsPartition, namespace: &str) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, namespace, true)?,
        })
    }
}

fn backend(e: esp_idf_sys::EspError) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl ConfigStore for EspNvsStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        check_key(key)?;
        let mut buf = vec![0u8; MAX_VALUE_LEN];
        Ok(self
            .nvs
            .get_str(key, &mut buf)
            .map_err(backend)?
            .map(str::to_string))
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        check_key(key)?;
        self.nvs.set_str(key, value).map_err(backend)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        check_key(key)?;
        self.nvs.get_u32(key).map_err(backend)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        check_key(key)?;
        self.nvs.set_u32(key, value).map_err(backend)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        self.nvs.remove(key).map(|_| ()).map_err(backend)
    }
}
