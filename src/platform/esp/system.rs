use esp_idf_hal::delay::FreeRtos;
use esp_idf_sys::{
    esp_get_free_heap_size, esp_restart, esp_task_wdt_config_t, esp_task_wdt_reconfigure,
    esp_timer_get_time, heap_caps_get_largest_free_block, MALLOC_CAP_8BIT,
};

use super::check;
use crate::platform::SystemControl;

#[derive(Debug, Default)]
pub struct EspSystem;

impl EspSystem {
    pub fn new() -> Self {
        Self
    }
}

impl SystemControl for EspSystem {
    fn millis(&self) -> u64 {
        (unsafe { esp_timer_get_time() } / 1000) as u64
    }

    fn sleep_ms(&self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn free_heap(&self) -> usize {
        unsafe { esp_get_free_heap_size() as usize }
    }

    fn largest_free_block(&self) -> usize {
        unsafe { heap_caps_get_largest_free_block(MALLOC_CAP_8BIT) }
    }

    fn prepare_watchdog_for_update(&mut self, timeout_secs: u32) {
        // idle_core_mask 0 drops the idle tasks so a long flash erase cannot trip them
        let config = esp_task_wdt_config_t {
            timeout_ms: timeout_secs * 1000,
            idle_core_mask: 0,
            trigger_panic: false,
        };
        match check(unsafe { esp_task_wdt_reconfigure(&config as *const _) }) {
            Ok(()) => log::info!("Watchdog timeout set to {} seconds for update", timeout_secs),
            Err(e) => log::warn!("Watchdog reconfiguration failed: {}", e),
        }
    }

    fn restart(&mut self) {
        unsafe { esp_restart() };
    }
}
