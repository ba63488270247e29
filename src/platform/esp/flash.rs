use core::ffi::c_void;

use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_write, esp_partition_erase_range, esp_partition_t,
    esp_partition_write,
};

use super::check;
use super::partitions::{find_app, find_filesystem};
use crate::platform::{FlashWriter, ImageKind, PlatformError};

const SECTOR_SIZE: usize = 4096;

enum Target {
    /// App image through the OTA API (validated at end)
    Ota(esp_ota_handle_t),
    /// Raw data partition, erased up front
    Raw {
        partition: *const esp_partition_t,
        offset: usize,
    },
}

struct Transaction {
    target: Target,
    expected: usize,
    written: usize,
}

#[derive(Default)]
pub struct EspFlash {
    open: Option<Transaction>,
}

impl EspFlash {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_firmware(&self, size: usize, label: Option<&str>) -> Result<Target, PlatformError> {
        let partition = match label {
            Some(label) => find_app(label)?,
            None => unsafe { esp_ota_get_next_update_partition(core::ptr::null()) },
        };
        if partition.is_null() {
            return Err(PlatformError::NotFound);
        }
        let mut handle: esp_ota_handle_t = 0;
        check(unsafe { esp_ota_begin(partition, size as _, &mut handle) })?;
        Ok(Target::Ota(handle))
    }

    fn begin_filesystem(&self, size: usize) -> Result<Target, PlatformError> {
        let partition = find_filesystem();
        // SAFETY: ESP-IDF partition pointers are static
        let available = unsafe { partition.as_ref() }
            .ok_or(PlatformError::NotFound)?
            .size as usize;
        if size > available {
            return Err(PlatformError::NoSpace {
                requested: size,
                available,
            });
        }
        let erase_len = size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        check(unsafe { esp_partition_erase_range(partition, 0, erase_len) })?;
        Ok(Target::Raw {
            partition,
            offset: 0,
        })
    }
}

impl FlashWriter for EspFlash {
    fn begin(&mut self, size: usize, kind: ImageKind, label: Option<&str>) -> Result<(), PlatformError> {
        if self.open.is_some() {
            return Err(PlatformError::InvalidState);
        }
        let target = match kind {
            ImageKind::Firmware => self.begin_firmware(size, label)?,
            ImageKind::Filesystem => self.begin_filesystem(size)?,
        };
        self.open = Some(Transaction {
            target,
            expected: size,
            written: 0,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let Some(tx) = self.open.as_mut() else {
            return 0;
        };
        let result = match &mut tx.target {
            Target::Ota(handle) => unsafe {
                esp_ota_write(*handle, data.as_ptr() as *const c_void, data.len())
            },
            Target::Raw { partition, offset } => {
                let code = unsafe {
                    esp_partition_write(*partition, *offset, data.as_ptr() as *const c_void, data.len())
                };
                if code == 0 {
                    *offset += data.len();
                }
                code
            }
        };
        match check(result) {
            Ok(()) => {
                tx.written += data.len();
                data.len()
            }
            Err(e) => {
                log::error!("Flash write failed: {}", e);
                0
            }
        }
    }

    fn end(&mut self) -> Result<(), PlatformError> {
        let tx = self.open.take().ok_or(PlatformError::NotOpen)?;
        match tx.target {
            Target::Ota(handle) => check(unsafe { esp_ota_end(handle) }),
            Target::Raw { .. } if tx.written != tx.expected => Err(PlatformError::Validation(
                format!("wrote {} of {} bytes", tx.written, tx.expected),
            )),
            Target::Raw { .. } => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(tx) = self.open.take() {
            if let Target::Ota(handle) = tx.target {
                unsafe {
                    esp_ota_abort(handle);
                }
            }
        }
    }
}
