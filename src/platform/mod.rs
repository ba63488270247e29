//! Hardware abstraction for the OTA and boot-validation code.
//!
//! Everything that touches flash, the partition table, the watchdog, the heap
//! or the network goes through the traits in this module. Two backends exist:
//! the ESP-IDF one (device builds) and [`sim`], a deterministic in-memory
//! platform used by the tests and by the host build of the binary.

use std::fmt;

use heapless::String as LabelString;

use crate::network::HttpClient;

#[cfg(target_os = "espidf")]
pub mod esp;
pub mod sim;

/// ESP-IDF partition labels are at most 16 bytes.
pub type PartitionLabel = LabelString<16>;

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Recovery (bootstrap) firmware, never written by OTA
    Factory,
    /// One of the A/B application slots
    OtaApp(u8),
    /// LittleFS / SPIFFS data region
    Filesystem,
}

/// Read-only view of one partition table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub label: PartitionLabel,
    pub kind: PartitionKind,
    pub address: u32,
    pub size: usize,
}

impl PartitionInfo {
    pub fn new(label: &str, kind: PartitionKind, address: u32, size: usize) -> Self {
        let mut owned = PartitionLabel::new();
        for ch in label.chars() {
            if owned.push(ch).is_err() {
                break;
            }
        }
        Self {
            label: owned,
            kind,
            address,
            size,
        }
    }

    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    pub fn is_factory(&self) -> bool {
        self.kind == PartitionKind::Factory
    }
}

/// Which region an update writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Firmware,
    Filesystem,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Firmware => "firmware",
            ImageKind::Filesystem => "filesystem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    NotFound,
    NoSpace { requested: usize, available: usize },
    /// No pending rollback to cancel (normal boot)
    InvalidState,
    NotOpen,
    Validation(String),
    Io(String),
    Esp(i32),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NotFound => write!(f, "not found"),
            PlatformError::NoSpace {
                requested,
                available,
            } => write!(f, "not enough space ({} > {})", requested, available),
            PlatformError::InvalidState => write!(f, "invalid state"),
            PlatformError::NotOpen => write!(f, "no update in progress"),
            PlatformError::Validation(msg) => write!(f, "validation failed: {}", msg),
            PlatformError::Io(msg) => write!(f, "io error: {}", msg),
            PlatformError::Esp(code) => write!(f, "esp error {}", code),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Clock, heap, watchdog and reset control.
pub trait SystemControl {
    /// Milliseconds since boot.
    fn millis(&self) -> u64;

    /// Block the calling task, letting other tasks run.
    fn sleep_ms(&self, ms: u32);

    fn free_heap(&self) -> usize;

    fn largest_free_block(&self) -> usize;

    /// Widen the task watchdog and unsubscribe background tasks for a long
    /// blocking transfer.
    fn prepare_watchdog_for_update(&mut self, timeout_secs: u32);

    /// Hardware reset. Returns only on platforms that can observe the reset
    /// (the simulator); on the device it does not return.
    fn restart(&mut self);
}

/// Partition table queries and boot selection.
pub trait PartitionTable {
    fn running(&self) -> Option<PartitionInfo>;

    /// The inactive A/B slot, if the layout has one.
    fn next_update(&self) -> Option<PartitionInfo>;

    fn factory(&self) -> Option<PartitionInfo>;

    fn filesystem(&self) -> Option<PartitionInfo>;

    fn boot_partition(&self) -> Option<PartitionInfo>;

    fn set_boot_partition(&mut self, partition: &PartitionInfo) -> Result<(), PlatformError>;

    /// Confirm the running image. `Err(InvalidState)` means nothing was pending.
    fn mark_running_valid(&mut self) -> Result<(), PlatformError>;

    /// Platform-native rollback; reboots on success.
    fn mark_running_invalid_and_reboot(&mut self) -> Result<(), PlatformError>;
}

/// The flash-update primitive. Global on the device: only one transaction may
/// be open at a time.
pub trait FlashWriter {
    /// Open a transaction. Firmware updates bind to `label` when given.
    fn begin(&mut self, size: usize, kind: ImageKind, label: Option<&str>) -> Result<(), PlatformError>;

    /// Append to the open transaction, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Validate and close the transaction.
    fn end(&mut self) -> Result<(), PlatformError>;

    /// Discard the open transaction, if any.
    fn abort(&mut self);
}

/// Everything the OTA subsystem needs from the board, owned in one place.
pub struct Hardware {
    pub system: Box<dyn SystemControl>,
    pub partitions: Box<dyn PartitionTable>,
    pub flash: Box<dyn FlashWriter>,
    pub http: Box<dyn HttpClient>,
}

impl Hardware {
    pub fn new(
        system: Box<dyn SystemControl>,
        partitions: Box<dyn PartitionTable>,
        flash: Box<dyn FlashWriter>,
        http: Box<dyn HttpClient>,
    ) -> Self {
        Self {
            system,
            partitions,
            flash,
            http,
        }
    }
}
