//! ESP-IDF backend (device builds only).

mod flash;
mod http;
mod nvs;
mod partitions;
mod system;
mod wifi;

pub use flash::EspFlash;
pub use http::EspHttp;
pub use nvs::EspNvsStore;
pub use partitions::EspPartitions;
pub use system::EspSystem;
pub use wifi::connect_wifi;

use esp_idf_sys::{esp_err_t, EspError};

use super::{Hardware, PlatformError};

/// The real board.
pub fn hardware() -> anyhow::Result<Hardware> {
    Ok(Hardware::new(
        Box::new(EspSystem::new()),
        Box::new(EspPartitions),
        Box::new(EspFlash::new()),
        Box::new(EspHttp::new()),
    ))
}

fn check(code: esp_err_t) -> Result<(), PlatformError> {
    EspError::convert(code).map_err(|e| PlatformError::Esp(e.code()))
}
