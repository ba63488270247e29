//! Boot validation and rollback.
//!
//! Every boot of an OTA image bumps a counter in NVS. The application clears
//! it once it is fully up ([`BootValidator::mark_boot_successful`]). An image
//! that keeps crashing before that point pushes the counter past
//! [`MAX_BOOT_FAILURES`] and the next boot switches back to the factory
//! (bootstrap) firmware.

use crate::config::ConfigStore;
use crate::platform::{Hardware, PlatformError};

pub const MAX_BOOT_FAILURES: u32 = 3;
pub const BOOT_COUNT_KEY: &str = "boot_count";

const CRITICAL_FAILURE_PAUSE_MS: u32 = 3000;
const REBOOT_DELAY_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Uninitialized,
    Checking,
    /// Running the factory image; nothing is counted
    FactoryOk,
    NormalOk,
    RollingBack,
}

/// What the caller should do after a boot check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    Proceed,
    /// A reset has been issued. Nothing else should run.
    Rebooting,
}

#[derive(Debug)]
pub struct BootValidator {
    state: BootState,
    boot_count: u32,
}

impl Default for BootValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl BootValidator {
    pub fn new() -> Self {
        Self {
            state: BootState::Uninitialized,
            boot_count: 0,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    pub fn is_factory_partition(&self, hw: &Hardware) -> bool {
        hw.partitions.running().is_some_and(|p| p.is_factory())
    }

    /// Count this boot and decide whether the running image gets another try.
    pub fn begin(&mut self, hw: &mut Hardware, store: &mut dyn ConfigStore) -> BootDecision {
        log::info!("Boot validator starting...");
        self.state = BootState::Checking;

        if let Some(running) = hw.partitions.running() {
            log::info!(
                "Running from partition: {} at 0x{:x}",
                running.label(),
                running.address
            );
            if running.is_factory() {
                log::info!("Running from factory partition (bootstrap)");
                self.state = BootState::FactoryOk;
                return BootDecision::Proceed;
            }
        } else {
            log::warn!("Cannot determine running partition");
        }

        self.boot_count = increment_boot_count(store);
        log::info!("Boot count: {} / {}", self.boot_count, MAX_BOOT_FAILURES);

        if self.boot_count > MAX_BOOT_FAILURES {
            log::error!("Too many boot failures, rolling back");
            return self.rollback(hw);
        }

        self.state = BootState::NormalOk;
        BootDecision::Proceed
    }

    /// Clear the counter and confirm the image with the bootloader. Safe to
    /// call more than once.
    pub fn mark_boot_successful(&mut self, hw: &mut Hardware, store: &mut dyn ConfigStore) {
        if !matches!(self.state, BootState::FactoryOk | BootState::NormalOk) {
            log::warn!("Cannot mark successful - not initialized");
            return;
        }

        log::info!("Marking boot as successful");
        if let Err(e) = store.set_u32(BOOT_COUNT_KEY, 0) {
            log::warn!("Failed to reset boot counter: {}", e);
        }
        self.boot_count = 0;

        match hw.partitions.mark_running_valid() {
            Ok(()) => log::info!("OTA rollback cancelled - firmware validated"),
            Err(PlatformError::InvalidState) => log::info!("No pending OTA rollback (normal boot)"),
            Err(e) => log::error!("Failed to cancel rollback: {}", e),
        }
    }

    pub fn on_ota_failed(&mut self, hw: &mut Hardware, message: &str) -> BootDecision {
        self.on_critical_failure(hw, "OTA Update", message)
    }

    /// Escape hatch for initialization code that finds the image unusable.
    pub fn on_critical_failure(
        &mut self,
        hw: &mut Hardware,
        component: &str,
        message: &str,
    ) -> BootDecision {
        log::error!("=============================================");
        log::error!("  CRITICAL BOOT FAILURE");
        log::error!("=============================================");
        log::error!("  Component: {}", component);
        log::error!("  Error: {}", message);
        log::error!("");
        log::error!("  Rolling back to bootloader for recovery...");
        log::error!("  Use bootloader to reconfigure or reinstall.");
        log::error!("=============================================");

        hw.system.sleep_ms(CRITICAL_FAILURE_PAUSE_MS);
        self.rollback(hw)
    }

    // Factory first, then the bootloader's own rollback, then a bare reset.
    fn rollback(&mut self, hw: &mut Hardware) -> BootDecision {
        self.state = BootState::RollingBack;
        log::info!("Attempting fallback to factory partition...");

        match hw.partitions.factory() {
            Some(factory) => match hw.partitions.set_boot_partition(&factory) {
                Ok(()) => {
                    log::info!("Boot partition set to {}, rebooting...", factory.label());
                    hw.system.sleep_ms(REBOOT_DELAY_MS);
                    hw.system.restart();
                    return BootDecision::Rebooting;
                }
                Err(e) => log::error!("Failed to set boot partition: {}", e),
            },
            None => log::error!("Factory partition not found!"),
        }

        log::info!("Trying ESP-IDF rollback mechanism...");
        match hw.partitions.mark_running_invalid_and_reboot() {
            Ok(()) => BootDecision::Rebooting,
            Err(e) => {
                log::error!("OTA rollback failed: {}, restarting", e);
                hw.system.restart();
                BootDecision::Rebooting
            }
        }
    }
}

fn increment_boot_count(store: &mut dyn ConfigStore) -> u32 {
    let previous = match store.get_u32(BOOT_COUNT_KEY) {
        Ok(count) => count.unwrap_or(0),
        Err(e) => {
            log::warn!("Failed to read boot counter: {}", e);
            0
        }
    };
    let count = previous.saturating_add(1);
    if let Err(e) = store.set_u32(BOOT_COUNT_KEY, count) {
        log::warn!("Failed to persist boot counter: {}", e);
    }
    count
}
