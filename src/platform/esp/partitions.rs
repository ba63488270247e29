use std::ffi::{CStr, CString};

use esp_idf_sys::{
    esp_ota_get_boot_partition, esp_ota_get_next_update_partition, esp_ota_get_running_partition,
    esp_ota_get_state_partition, esp_ota_img_states_t,
    esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY, esp_ota_mark_app_invalid_rollback_and_reboot,
    esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_SPIFFS, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
};

use super::check;
use crate::platform::{PartitionInfo, PartitionKind, PartitionTable, PlatformError};

/// The partition table in flash. ESP-IDF hands out `'static` pointers, so
/// nothing is owned here.
#[derive(Debug, Default)]
pub struct EspPartitions;

fn info(partition: *const esp_partition_t) -> Option<PartitionInfo> {
    // SAFETY: non-null partition pointers from ESP-IDF live for the whole run
    let p = unsafe { partition.as_ref()? };
    let label = unsafe { CStr::from_ptr(p.label.as_ptr()) }
        .to_str()
        .unwrap_or("?");
    let kind = if p.type_ == esp_partition_type_t_ESP_PARTITION_TYPE_DATA {
        PartitionKind::Filesystem
    } else if p.subtype == esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY {
        PartitionKind::Factory
    } else {
        let slot = p
            .subtype
            .saturating_sub(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN);
        PartitionKind::OtaApp(slot as u8)
    };
    Some(PartitionInfo::new(label, kind, p.address, p.size as usize))
}

/// Look up an app partition by label.
pub(super) fn find_app(label: &str) -> Result<*const esp_partition_t, PlatformError> {
    let label = CString::new(label).map_err(|_| PlatformError::NotFound)?;
    let partition = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            label.as_ptr(),
        )
    };
    if partition.is_null() {
        Err(PlatformError::NotFound)
    } else {
        Ok(partition)
    }
}

/// The SPIFFS/LittleFS data partition. LittleFS images are flashed into a
/// partition declared with the spiffs subtype.
pub(super) fn find_filesystem() -> *const esp_partition_t {
    unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_SPIFFS,
            core::ptr::null(),
        )
    }
}

impl PartitionTable for EspPartitions {
    fn running(&self) -> Option<PartitionInfo> {
        info(unsafe { esp_ota_get_running_partition() })
    }

    fn next_update(&self) -> Option<PartitionInfo> {
        info(unsafe { esp_ota_get_next_update_partition(core::ptr::null()) })
    }

    fn factory(&self) -> Option<PartitionInfo> {
        info(unsafe {
            esp_partition_find_first(
                esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY,
                core::ptr::null(),
            )
        })
    }

    fn filesystem(&self) -> Option<PartitionInfo> {
        info(find_filesystem())
    }

    fn boot_partition(&self) -> Option<PartitionInfo> {
        info(unsafe { esp_ota_get_boot_partition() })
    }

    fn set_boot_partition(&mut self, partition: &PartitionInfo) -> Result<(), PlatformError> {
        let target = find_app(partition.label())?;
        check(unsafe { esp_ota_set_boot_partition(target) })
    }

    fn mark_running_valid(&mut self) -> Result<(), PlatformError> {
        let running = unsafe { esp_ota_get_running_partition() };
        let mut state: esp_ota_img_states_t = 0;
        let pending = check(unsafe { esp_ota_get_state_partition(running, &mut state) }).is_ok()
            && state == esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY;
        if !pending {
            return Err(PlatformError::InvalidState);
        }
        check(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
    }

    fn mark_running_invalid_and_reboot(&mut self) -> Result<(), PlatformError> {
        // Only returns when there is no previous image to go back to
        check(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })
    }
}
