//! Application context: owns the hardware and every long-lived OTA component
//! and hands out borrows to them.

use crate::boot::{BootDecision, BootValidator};
use crate::config::{self, ConfigStore, OtaSettings, StoreError};
use crate::network::RealtimeLink;
use crate::ota::{
    OtaError, OtaManager, RetryPolicy, UpdateContext, UpdateDescriptor, UpdateOutcome,
};
use crate::platform::Hardware;
use crate::progress::ProgressSink;
use crate::version::{self, Board, FIRMWARE_VERSION};

const MS_PER_HOUR: u64 = 3_600_000;

pub struct App {
    hw: Hardware,
    config: Box<dyn ConfigStore>,
    boot_store: Box<dyn ConfigStore>,
    display: Box<dyn ProgressSink>,
    realtime: Box<dyn RealtimeLink>,
    boot: BootValidator,
    ota: OtaManager,
    retry: RetryPolicy,
    last_check_ms: u64,
}

impl App {
    /// `config` backs the "config" namespace, `boot_store` the "boot" one.
    pub fn new(
        hw: Hardware,
        config: Box<dyn ConfigStore>,
        boot_store: Box<dyn ConfigStore>,
        display: Box<dyn ProgressSink>,
        realtime: Box<dyn RealtimeLink>,
    ) -> Self {
        let settings = OtaSettings::load(&*config);
        Self {
            hw,
            config,
            boot_store,
            display,
            realtime,
            boot: BootValidator::new(),
            ota: OtaManager::new(settings, Board::compiled(), FIRMWARE_VERSION),
            retry: RetryPolicy::default(),
            last_check_ms: 0,
        }
    }

    /// Override the board and running version (host runs and tests).
    pub fn with_identity(mut self, board: Board, current_version: &str) -> Self {
        let settings = self.ota.settings().clone();
        self.ota = OtaManager::new(settings, board, current_version);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn boot(&self) -> &BootValidator {
        &self.boot
    }

    pub fn ota(&self) -> &OtaManager {
        &self.ota
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hw
    }

    pub fn config(&self) -> &dyn ConfigStore {
        &*self.config
    }

    /// First thing after power-on: count the boot and, if the image gets to
    /// run, record its version against the partition it runs from.
    pub fn start(&mut self) -> BootDecision {
        log::info!("{}", version::version_info());

        let decision = self.boot.begin(&mut self.hw, &mut *self.boot_store);
        if decision == BootDecision::Rebooting {
            return decision;
        }

        if let Some(running) = self.hw.partitions.running() {
            let current = self.ota.current_version().to_string();
            match config::set_partition_version(&mut *self.config, running.label(), &current) {
                Ok(()) => log::info!("Stored version {} for {}", current, running.label()),
                Err(e) => log::warn!("Failed to store partition version: {}", e),
            }
        }
        decision
    }

    /// Call once the application is fully initialized.
    pub fn confirm_boot(&mut self) {
        self.boot.mark_boot_successful(&mut self.hw, &mut *self.boot_store);
    }

    /// Initialization hit something it cannot recover from.
    pub fn fail_boot(&mut self, component: &str, message: &str) -> BootDecision {
        self.boot.on_critical_failure(&mut self.hw, component, message)
    }

    pub fn update_settings(&mut self, settings: OtaSettings) -> Result<(), StoreError> {
        settings.save(&mut *self.config)?;
        self.ota.set_settings(settings);
        Ok(())
    }

    pub fn check_for_update(&mut self) -> Result<UpdateDescriptor, OtaError> {
        self.last_check_ms = self.hw.system.millis();
        self.ota.check_for_update(&mut self.hw).cloned()
    }

    /// One update attempt, checking first if no update is known yet.
    pub fn run_update(&mut self) -> Result<UpdateOutcome, OtaError> {
        if !self.ota.is_update_available() {
            self.check_for_update()?;
        }
        self.ota.perform_update(UpdateContext {
            hw: &mut self.hw,
            config: &mut *self.config,
            display: &mut *self.display,
            realtime: &mut *self.realtime,
        })
    }

    /// Update with backoff. Only partial downloads are retried.
    pub fn update_with_retries(&mut self) -> Result<UpdateOutcome, OtaError> {
        let mut attempt = 1;
        loop {
            match self.run_update() {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "Update attempt {}/{} failed ({}), retrying in {} ms",
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    self.hw.system.sleep_ms(delay);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("Update failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Main-loop hook. Runs a check once the configured interval has passed
    /// since the last one; returns whether a check ran.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        let interval_ms = u64::from(self.ota.settings().check_interval_hours) * MS_PER_HOUR;
        if interval_ms == 0 || now_ms.saturating_sub(self.last_check_ms) < interval_ms {
            return false;
        }

        log::info!("Periodic update check");
        match self.check_for_update() {
            Ok(descriptor) if descriptor.update_available => {
                log::info!("Update {} is available", descriptor.latest_version)
            }
            Ok(_) => {}
            Err(e) => log::warn!("Periodic update check failed: {}", e),
        }
        self.last_check_ms = now_ms;
        true
    }
}
