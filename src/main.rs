use anyhow::Result;

use led_matrix_display::boot::BootDecision;
use led_matrix_display::{logging, version, App};

#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use led_matrix_display::config::{BOOT_NAMESPACE, CONFIG_NAMESPACE};
    use led_matrix_display::network::NoRealtime;
    use led_matrix_display::platform::esp::{self, EspNvsStore};
    use led_matrix_display::progress::LogProgress;

    const LOOP_DELAY_MS: u32 = 1000;

    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    log::info!("LED Matrix {} starting", version::display_version());

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mut app = App::new(
        esp::hardware()?,
        Box::new(EspNvsStore::new(nvs.clone(), CONFIG_NAMESPACE)?),
        Box::new(EspNvsStore::new(nvs.clone(), BOOT_NAMESPACE)?),
        Box::new(LogProgress::default()),
        Box::new(NoRealtime),
    );

    if app.start() == BootDecision::Rebooting {
        // The reset is already under way
        loop {
            FreeRtos::delay_ms(LOOP_DELAY_MS);
        }
    }

    // A missing network is not the image's fault, so it never triggers a rollback
    let _wifi = match esp::connect_wifi(peripherals.modem, sys_loop, nvs) {
        Ok(wifi) => Some(wifi),
        Err(e) => {
            log::error!("WiFi unavailable, update checks will fail: {}", e);
            None
        }
    };

    app.confirm_boot();
    log::info!("Boot confirmed, entering main loop");

    loop {
        let now = app.hardware().system.millis();
        if app.tick(now) && app.ota().is_update_available() {
            if let Err(e) = app.update_with_retries() {
                log::error!("Automatic update failed: {}", e);
            }
        }
        FreeRtos::delay_ms(LOOP_DELAY_MS);
    }
}

/// Host build: one full boot-check-update cycle against the simulator.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use led_matrix_display::config::{ConfigStore, MemoryStore, KEY_MANIFEST_URL};
    use led_matrix_display::network::NoRealtime;
    use led_matrix_display::ota::UpdateOutcome;
    use led_matrix_display::platform::sim::{SimBoard, SimRoute};
    use led_matrix_display::progress::LogProgress;
    use led_matrix_display::version::Board;

    const MANIFEST_URL: &str = "https://updates.local/manifest.json";

    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        if !logging::set_max_level_from_str(&level) {
            log::warn!("Unknown LOG_LEVEL '{}'", level);
        }
    }
    log::info!("Simulated run, {}", version::version_info());

    let board = SimBoard::new();
    let firmware: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let filesystem = vec![0xFFu8; 64 * 1024];
    board.http.serve(
        MANIFEST_URL,
        SimRoute::ok(
            r#"{"version": "99.0.0", "build_id": "sim",
                "firmware": {"esp32": {"url": "https://updates.local/firmware-esp32.bin"}},
                "filesystem": {"esp32": {"url": "https://updates.local/littlefs-esp32.bin"}}}"#,
        ),
    );
    board
        .http
        .serve("https://updates.local/firmware-esp32.bin", SimRoute::ok(firmware));
    board
        .http
        .serve("https://updates.local/littlefs-esp32.bin", SimRoute::ok(filesystem));

    let mut config = MemoryStore::new();
    config.set_string(KEY_MANIFEST_URL, MANIFEST_URL)?;

    let mut app = App::new(
        board.hardware(),
        Box::new(config),
        Box::new(MemoryStore::new()),
        Box::new(LogProgress::default()),
        Box::new(NoRealtime),
    )
    .with_identity(Board::Esp32, version::FIRMWARE_VERSION);

    if app.start() == BootDecision::Rebooting {
        anyhow::bail!("simulated boot requested a rollback");
    }
    app.confirm_boot();

    let descriptor = app.check_for_update()?;
    log::info!("Status: {}", descriptor.to_json()?);

    match app.update_with_retries()? {
        UpdateOutcome::Rebooting => log::info!(
            "Update flashed, next boot from {} ({} restart issued)",
            board.partitions.boot_label(),
            board.system.restart_count()
        ),
    }
    Ok(())
}
