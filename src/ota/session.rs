use sha2::{Digest, Sha256};

use super::OtaError;
use crate::config::{self, ConfigStore};
use crate::platform::{FlashWriter, ImageKind, PartitionInfo, PartitionTable};

/// Result of a closed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashedImage {
    pub kind: ImageKind,
    pub bytes: usize,
    pub sha256: String,
    /// Partition made bootable, for firmware images
    pub boot_label: Option<String>,
}

/// One open flash-write transaction.
///
/// Holding the flash writer mutably for the session's lifetime makes a second
/// concurrent session a compile error. Dropping an unfinished session aborts
/// the transaction.
pub struct UpdateSession<'a> {
    flash: &'a mut dyn FlashWriter,
    kind: ImageKind,
    target: Option<PartitionInfo>,
    expected: usize,
    written: usize,
    hasher: Sha256,
    open: bool,
}

impl<'a> UpdateSession<'a> {
    pub fn begin(
        flash: &'a mut dyn FlashWriter,
        content_length: usize,
        kind: ImageKind,
        target: Option<&PartitionInfo>,
    ) -> Result<Self, OtaError> {
        if content_length == 0 {
            log::error!("Refusing to begin {} update without a size", kind.as_str());
            return Err(OtaError::MissingContentLength);
        }

        if kind == ImageKind::Firmware {
            match target {
                None => {
                    log::error!("Firmware update needs an explicit target partition");
                    return Err(OtaError::NoTargetPartition);
                }
                Some(p) if p.is_factory() => {
                    log::error!("Refusing to write firmware to factory partition");
                    return Err(OtaError::NoTargetPartition);
                }
                Some(_) => {}
            }
        }

        if let Some(p) = target {
            if content_length > p.size {
                log::error!(
                    "Not enough space: {} image is {} bytes, '{}' holds {}",
                    kind.as_str(),
                    content_length,
                    p.label(),
                    p.size
                );
                return Err(OtaError::ImageTooLarge {
                    size: content_length,
                    capacity: p.size,
                });
            }
        }

        let label = target.map(PartitionInfo::label);
        if let Err(e) = flash.begin(content_length, kind, label) {
            log::error!("Update begin failed for {}: {}", kind.as_str(), e);
            return Err(OtaError::BeginRejected(e));
        }

        log::info!(
            "Writing {} ({} bytes) to {}",
            kind.as_str(),
            content_length,
            label.unwrap_or("default partition")
        );

        Ok(Self {
            flash,
            kind,
            target: target.cloned(),
            expected: content_length,
            written: 0,
            hasher: Sha256::new(),
            open: true,
        })
    }

    /// Returns how many bytes the flash accepted. Anything short of
    /// `data.len()` means the transaction is broken and must be aborted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if !self.open {
            return 0;
        }
        let accepted = self.flash.write(data);
        self.hasher.update(&data[..accepted.min(data.len())]);
        self.written += accepted;
        if accepted != data.len() {
            log::error!(
                "Flash write short: {} of {} bytes at offset {}",
                accepted,
                data.len(),
                self.written - accepted
            );
        }
        accepted
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Validate the image and, for firmware, make the target bootable and
    /// record `version` for its label.
    pub fn finalize(
        mut self,
        partitions: &mut dyn PartitionTable,
        store: &mut dyn ConfigStore,
        version: &str,
    ) -> Result<FlashedImage, OtaError> {
        // end() closes the transaction whether or not validation passes
        self.open = false;
        if let Err(e) = self.flash.end() {
            log::error!("{} image end failed: {}", self.kind.as_str(), e);
            return Err(OtaError::FinalizeFailed(e));
        }

        let sha256 = format!("{:x}", self.hasher.finalize_reset());
        log::info!(
            "{} image complete: {} bytes, sha256 {}",
            self.kind.as_str(),
            self.written,
            sha256
        );

        let mut boot_label = None;
        if self.kind == ImageKind::Firmware {
            if let Some(target) = &self.target {
                if let Err(e) = partitions.set_boot_partition(target) {
                    log::error!("Failed to set boot partition '{}': {}", target.label(), e);
                    return Err(OtaError::SetBootFailed(e));
                }
                log::info!("Boot partition set to {}", target.label());

                if let Err(e) = config::set_partition_version(store, target.label(), version) {
                    log::warn!("Failed to record version for {}: {}", target.label(), e);
                }
                boot_label = Some(target.label().to_string());
            }
        }

        Ok(FlashedImage {
            kind: self.kind,
            bytes: self.written,
            sha256,
            boot_label,
        })
    }

    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.open {
            log::warn!(
                "Aborting {} update after {}/{} bytes",
                self.kind.as_str(),
                self.written,
                self.expected
            );
            self.flash.abort();
            self.open = false;
        }
    }
}

impl Drop for UpdateSession<'_> {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}
