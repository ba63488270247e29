fn main() -> anyhow::Result<()> {
    // Host builds (tests, simulator) have no ESP-IDF environment to export
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "espidf" {
        return Ok(());
    }

    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");

    // Default OTA endpoints and WiFi credentials can be baked in from the environment
    for key in ["OTA_UPDATE_URL", "OTA_MANIFEST_URL", "WIFI_SSID", "WIFI_PASSWORD"] {
        println!("cargo:rerun-if-env-changed={}", key);
        if let Ok(value) = std::env::var(key) {
            println!("cargo:rustc-env={}={}", key, value);
        }
    }

    Ok(())
}
