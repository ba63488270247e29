// LED matrix firmware: OTA updates and boot validation
//
// Everything hardware-facing goes through `platform`, so the whole crate runs
// on the host against `platform::sim` as well as on the ESP32.

pub mod app;
pub mod boot;
pub mod config;
pub mod logging;
pub mod network;
pub mod ota;
pub mod platform;
pub mod progress;
pub mod version;

pub use app::App;
pub use boot::{BootDecision, BootValidator};
pub use ota::{OtaError, OtaManager};
