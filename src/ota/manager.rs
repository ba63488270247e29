// OTA Manager - finds updates and flashes them through the partition/session layer

use serde::Serialize;

use super::bundle::{self, HEADER_SIZE};
use super::download::{
    HeapFloor, StopReason, StreamDownloader, DOWNLOAD_BUFFER_SIZE, HEADER_TIMEOUT_MS,
};
use super::partition::PartitionSelector;
use super::release::{is_newer, Manifest, Release, ResolvedRelease};
use super::session::{FlashedImage, UpdateSession};
use super::OtaError;
use crate::config::{ConfigStore, OtaSettings};
use crate::network::http::read_body;
use crate::network::{HttpRequest, HttpResponse, RealtimeLink};
use crate::platform::{
    FlashWriter, Hardware, ImageKind, PartitionInfo, PartitionTable, SystemControl,
};
use crate::progress::{self, ProgressSink, FILESYSTEM_SPAN, FIRMWARE_SPAN};
use crate::version::Board;

pub const REALTIME_COOLDOWN_MS: u64 = 600_000;
pub const UPDATE_WATCHDOG_SECS: u32 = 120;
const LOW_HEAP_WARNING: usize = 80_000;
const MAX_METADATA_BYTES: usize = 64 * 1024;
const METADATA_IDLE_TIMEOUT_MS: u64 = 30_000;
const RELEASE_ACCEPT: &str = "application/vnd.github.v3+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    Downloading(ImageKind),
    Rebooting,
    Failed,
}

/// Result of the last successful check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UpdateDescriptor {
    pub current_version: String,
    pub latest_version: String,
    #[serde(rename = "download_url")]
    pub firmware_url: String,
    #[serde(skip)]
    pub filesystem_url: String,
    #[serde(skip)]
    pub bundle_url: String,
    pub update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
}

impl UpdateDescriptor {
    pub fn is_bundle(&self) -> bool {
        !self.bundle_url.is_empty()
    }

    pub fn to_json(&self) -> Result<String, OtaError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How `perform_update` ended when it returns at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Images are flashed and the reset was issued. On the device this is
    /// never observed.
    Rebooting,
}

/// Everything an update touches, borrowed from the application.
pub struct UpdateContext<'a> {
    pub hw: &'a mut Hardware,
    pub config: &'a mut dyn ConfigStore,
    pub display: &'a mut dyn ProgressSink,
    pub realtime: &'a mut dyn RealtimeLink,
}

pub struct OtaManager {
    settings: OtaSettings,
    board: Board,
    current_version: String,
    descriptor: Option<UpdateDescriptor>,
    state: OtaState,
}

impl OtaManager {
    pub fn new(settings: OtaSettings, board: Board, current_version: &str) -> Self {
        Self {
            settings,
            board,
            current_version: current_version.to_string(),
            descriptor: None,
            state: OtaState::Idle,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn descriptor(&self) -> Option<&UpdateDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn settings(&self) -> &OtaSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: OtaSettings) {
        self.settings = settings;
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn is_update_available(&self) -> bool {
        self.descriptor.as_ref().is_some_and(|d| d.update_available)
    }

    /// Find the latest release: the manifest first when one is configured,
    /// the release API otherwise or when the manifest is unusable.
    ///
    /// "Up to date" is a successful check; errors mean no latest version
    /// could be determined.
    pub fn check_for_update(&mut self, hw: &mut Hardware) -> Result<&UpdateDescriptor, OtaError> {
        self.state = OtaState::Checking;
        self.descriptor = None;

        let found = if self.settings.has_manifest() {
            match self.check_manifest(hw) {
                Ok(found) => Ok(found),
                Err(e) => {
                    log::warn!("Manifest check failed ({}), falling back to release API", e);
                    self.check_release_api(hw)
                }
            }
        } else {
            self.check_release_api(hw)
        };

        let (release, build_id, build_date) = match found {
            Ok(found) => found,
            Err(e) => {
                log::error!("Update check failed: {}", e);
                self.state = OtaState::Failed;
                return Err(e);
            }
        };

        let update_available = is_newer(&release.version, &self.current_version);
        if update_available {
            log::info!(
                "Update available: {} -> {}",
                self.current_version,
                release.version
            );
            self.state = OtaState::UpdateAvailable;
        } else {
            log::info!("Already on latest version: {}", self.current_version);
            self.state = OtaState::UpToDate;
        }

        let descriptor = self.descriptor.insert(UpdateDescriptor {
            current_version: self.current_version.clone(),
            latest_version: release.version,
            firmware_url: release.firmware_url,
            filesystem_url: release.filesystem_url,
            bundle_url: release.bundle_url,
            update_available,
            build_id,
            build_date,
        });
        Ok(descriptor)
    }

    fn check_manifest(
        &self,
        hw: &mut Hardware,
    ) -> Result<(ResolvedRelease, Option<String>, Option<String>), OtaError> {
        log::info!("Fetching manifest from {}", self.settings.manifest_url);
        let request =
            HttpRequest::get(&self.settings.manifest_url).tls_verify(self.settings.tls_verify);
        let body = fetch_text(hw, &request)?;
        let manifest = Manifest::parse(&body)?;

        log::info!(
            "Manifest: version={}, build_id={}, build_date={}",
            manifest.version,
            manifest.build_id.as_deref().unwrap_or("unknown"),
            manifest.build_date.as_deref().unwrap_or("unknown")
        );
        let release = manifest.resolve(self.board)?;
        Ok((release, manifest.build_id, manifest.build_date))
    }

    fn check_release_api(
        &self,
        hw: &mut Hardware,
    ) -> Result<(ResolvedRelease, Option<String>, Option<String>), OtaError> {
        if self.settings.update_url.is_empty() {
            return Err(OtaError::NoUpdateUrl);
        }
        log::info!("Checking for updates at {}", self.settings.update_url);
        let request = HttpRequest::get(&self.settings.update_url)
            .header("Accept", RELEASE_ACCEPT)
            .tls_verify(self.settings.tls_verify);
        let body = fetch_text(hw, &request)?;
        let release = Release::parse(&body)?.resolve(self.board)?;
        Ok((release, None, None))
    }

    /// Download and flash the release found by the last check, then reset.
    ///
    /// On failure the open transaction is aborted, the boot partition is what
    /// it was before the call, and the error is shown on the display. No
    /// retries happen here.
    pub fn perform_update(&mut self, ctx: UpdateContext<'_>) -> Result<UpdateOutcome, OtaError> {
        let descriptor = match &self.descriptor {
            Some(d) if d.update_available => d.clone(),
            _ => {
                log::info!("No update available");
                return Err(OtaError::NoUpdateAvailable);
            }
        };
        if !descriptor.is_bundle()
            && (descriptor.firmware_url.is_empty() || descriptor.filesystem_url.is_empty())
        {
            log::error!("Missing firmware or filesystem URL");
            return Err(OtaError::MissingAssetUrls);
        }

        let UpdateContext {
            hw,
            config,
            display,
            realtime,
        } = ctx;

        log::info!(
            "Starting update from {} to {}",
            descriptor.current_version,
            descriptor.latest_version
        );

        // The realtime socket competes for heap and bandwidth during the transfer
        if realtime.is_active() {
            log::info!("Disconnecting realtime link for update");
            realtime.disconnect();
        }
        realtime.defer_reconnect_until(hw.system.millis() + REALTIME_COOLDOWN_MS);
        hw.system.prepare_watchdog_for_update(UPDATE_WATCHDOG_SECS);
        log::info!("Heap before download: {} bytes", hw.system.free_heap());

        let previous_boot = hw.partitions.boot_partition();

        let result = {
            let Hardware {
                system,
                partitions,
                flash,
                http,
            } = &mut *hw;
            let mut flasher = Flasher {
                system: &**system,
                partitions: &mut **partitions,
                flash: &mut **flash,
                config: &mut *config,
                display: &mut *display,
                version: &descriptor.latest_version,
                buffer: vec![0u8; DOWNLOAD_BUFFER_SIZE],
                state: &mut self.state,
            };
            if descriptor.is_bundle() {
                let request =
                    HttpRequest::get(&descriptor.bundle_url).tls_verify(self.settings.tls_verify);
                match http.get(&request) {
                    Ok(response) => flasher.install_bundle(response),
                    Err(e) => Err(e.into()),
                }
            } else {
                let tls_verify = self.settings.tls_verify;
                let mut fetch = |url: &str| {
                    http.get(&HttpRequest::get(url).tls_verify(tls_verify))
                        .map_err(OtaError::from)
                };
                fetch(&descriptor.firmware_url)
                    .and_then(|response| flasher.install_image(response, ImageKind::Firmware))
                    .and_then(|_| fetch(&descriptor.filesystem_url))
                    .and_then(|response| flasher.install_image(response, ImageKind::Filesystem))
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            log::error!("Update to {} failed: {}", descriptor.latest_version, e);
            self.state = OtaState::Failed;
            restore_boot_partition(&mut *hw.partitions, previous_boot.as_ref());
            display.on_error(e.display_message());
            return Err(e);
        }

        log::info!(
            "Update to {} successful, rebooting",
            descriptor.latest_version
        );
        self.state = OtaState::Rebooting;
        display.on_progress(100, "Rebooting...");
        hw.system.sleep_ms(1000);
        hw.system.restart();
        Ok(UpdateOutcome::Rebooting)
    }
}

/// GET a small JSON document.
fn fetch_text(hw: &mut Hardware, request: &HttpRequest) -> Result<String, OtaError> {
    let mut response = hw.http.get(request).map_err(|e| {
        log::error!("Request to {} failed: {}", request.url, e);
        OtaError::from(e)
    })?;
    let status = response.status();
    if status != 200 {
        log::error!("Request to {} failed: HTTP {}", request.url, status);
        return Err(OtaError::HttpStatus(status));
    }
    Ok(read_body(
        response.as_mut(),
        &*hw.system,
        MAX_METADATA_BYTES,
        METADATA_IDLE_TIMEOUT_MS,
    )?)
}

fn restore_boot_partition(partitions: &mut dyn PartitionTable, previous: Option<&PartitionInfo>) {
    let Some(previous) = previous else {
        return;
    };
    let current = partitions.boot_partition();
    if current.as_ref().map(PartitionInfo::label) == Some(previous.label()) {
        return;
    }
    log::warn!("Restoring boot partition to {}", previous.label());
    if let Err(e) = partitions.set_boot_partition(previous) {
        log::error!("Failed to restore boot partition {}: {}", previous.label(), e);
    }
}

/// The flashing half of an update, with disjoint borrows of the hardware.
struct Flasher<'a> {
    system: &'a dyn SystemControl,
    partitions: &'a mut dyn PartitionTable,
    flash: &'a mut dyn FlashWriter,
    config: &'a mut dyn ConfigStore,
    display: &'a mut dyn ProgressSink,
    version: &'a str,
    buffer: Vec<u8>,
    state: &'a mut OtaState,
}

impl Flasher<'_> {
    fn target_for(&self, kind: ImageKind) -> Result<PartitionInfo, OtaError> {
        let selector = PartitionSelector::new(&*self.partitions);
        let target = match kind {
            ImageKind::Firmware => selector.target_partition(),
            ImageKind::Filesystem => selector.filesystem_partition(),
        };
        target.ok_or_else(|| {
            log::error!("No partition for {} image", kind.as_str());
            OtaError::NoTargetPartition
        })
    }

    /// One image per response (dual-asset mode).
    fn install_image(
        &mut self,
        mut response: Box<dyn HttpResponse>,
        kind: ImageKind,
    ) -> Result<FlashedImage, OtaError> {
        let status = response.status();
        if status != 200 {
            log::error!("{} download failed: HTTP {}", kind.as_str(), status);
            return Err(OtaError::HttpStatus(status));
        }
        let length = match response.content_length() {
            Some(len) if len > 0 => len,
            _ => {
                log::error!("Invalid content length for {}", kind.as_str());
                return Err(OtaError::MissingContentLength);
            }
        };
        log::info!("{} size: {} bytes", kind.as_str(), length);

        self.flash_segment(response.as_mut(), length, kind)
    }

    /// Firmware and filesystem from one LMWB stream.
    fn install_bundle(&mut self, mut response: Box<dyn HttpResponse>) -> Result<(), OtaError> {
        let status = response.status();
        if status != 200 {
            log::error!("Bundle download failed: HTTP {}", status);
            return Err(OtaError::HttpStatus(status));
        }
        let content_length = response.content_length();
        if let Some(len) = content_length {
            log::info!("Bundle size: {} bytes", len);
            if len <= HEADER_SIZE {
                log::error!("Bundle too small for LMWB format");
                return Err(OtaError::InvalidBundle("too small"));
            }
        }

        let mut raw = [0u8; HEADER_SIZE];
        if !StreamDownloader::new(self.system).read_exact(
            response.as_mut(),
            &mut raw,
            HEADER_TIMEOUT_MS,
        ) {
            log::error!("Timeout reading bundle header");
            return Err(OtaError::HeaderTimeout);
        }
        let header = bundle::parse_header(&raw).map_err(|e| {
            log::error!("Rejecting bundle: {}", e);
            e
        })?;
        log::info!(
            "Bundle: app={} bytes, fs={} bytes",
            header.app_size,
            header.fs_size
        );

        if let Some(len) = content_length {
            if len != header.total_len() {
                // Chunked or proxied responses may misreport; the segment sizes rule
                log::warn!(
                    "Bundle size mismatch: got {}, expected {}",
                    len,
                    header.total_len()
                );
            }
        }

        self.flash_segment(response.as_mut(), header.app_size as usize, ImageKind::Firmware)?;

        if response.available() == 0 && !response.connected() {
            log::error!("Stream closed before filesystem segment");
            return Err(OtaError::Incomplete {
                kind: ImageKind::Filesystem,
                written: 0,
                expected: header.fs_size as usize,
            });
        }

        self.flash_segment(response.as_mut(), header.fs_size as usize, ImageKind::Filesystem)?;
        log::info!("Bundle update complete");
        Ok(())
    }

    /// Stream `length` bytes of `source` into a fresh session for `kind`.
    fn flash_segment(
        &mut self,
        source: &mut dyn HttpResponse,
        length: usize,
        kind: ImageKind,
    ) -> Result<FlashedImage, OtaError> {
        let target = self.target_for(kind)?;
        let (span, floor, label) = match kind {
            ImageKind::Firmware => (FIRMWARE_SPAN, HeapFloor::FIRMWARE, "Firmware"),
            ImageKind::Filesystem => (FILESYSTEM_SPAN, HeapFloor::DEFAULT, "Filesystem"),
        };

        if kind == ImageKind::Firmware && self.system.free_heap() < LOW_HEAP_WARNING {
            log::warn!(
                "Low heap before firmware download: {} bytes",
                self.system.free_heap()
            );
        }

        *self.state = OtaState::Downloading(kind);
        self.display
            .on_progress(span.0, &format!("Flashing {}...", kind.as_str()));

        let mut session = UpdateSession::begin(&mut *self.flash, length, kind, Some(&target))?;

        let display = &mut *self.display;
        let transfer = StreamDownloader::new(self.system).heap_floor(floor).copy(
            source,
            &mut self.buffer,
            length,
            |chunk| session.write(chunk),
            |p| {
                display.on_progress(
                    progress::scale(p.percent, span.0, span.1),
                    &format!("{} {}%", label, p.percent),
                )
            },
        );

        match transfer.stop {
            StopReason::Complete => {}
            StopReason::LowHeap { free } => {
                session.abort();
                return Err(OtaError::LowHeap { free });
            }
            _ => {
                log::error!(
                    "{} incomplete: wrote {} of {}",
                    kind.as_str(),
                    transfer.copied,
                    length
                );
                session.abort();
                return Err(OtaError::Incomplete {
                    kind,
                    written: transfer.copied,
                    expected: length,
                });
            }
        }

        session.finalize(&mut *self.partitions, &mut *self.config, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, MemoryStore};
    use crate::platform::sim::{SimBoard, SimDisplay, SimRealtime, SimRoute};

    const MANIFEST_URL: &str = "https://updates.local/manifest.json";
    const RELEASE_URL: &str = "https://api.github.local/releases/latest";

    fn settings(manifest: bool) -> OtaSettings {
        OtaSettings {
            update_url: RELEASE_URL.to_string(),
            manifest_url: if manifest { MANIFEST_URL.to_string() } else { String::new() },
            tls_verify: true,
            check_interval_hours: 24,
        }
    }

    fn manifest_body(version: &str) -> String {
        format!(
            r#"{{"version": "{}", "build_id": "b42",
                "firmware": {{"esp32": {{"url": "https://u/fw.bin"}}}},
                "filesystem": {{"esp32": {{"url": "https://u/fs.bin"}}}}}}"#,
            version
        )
    }

    fn image(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn manifest_check_finds_newer_version() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("2.0.0")));
        let mut hw = board.hardware();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");

        let descriptor = ota.check_for_update(&mut hw).unwrap();
        assert!(descriptor.update_available);
        assert_eq!(descriptor.latest_version, "2.0.0");
        assert_eq!(descriptor.build_id.as_deref(), Some("b42"));
        assert_eq!(ota.state(), OtaState::UpdateAvailable);
        assert_eq!(board.http.request_count(RELEASE_URL), 0);
    }

    #[test]
    fn same_version_is_a_successful_check() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("1.9.0")));
        let mut hw = board.hardware();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");

        assert!(!ota.check_for_update(&mut hw).unwrap().update_available);
        assert_eq!(ota.state(), OtaState::UpToDate);
    }

    #[test]
    fn broken_manifest_falls_back_to_release_api() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok("{not json"));
        board.http.serve(
            RELEASE_URL,
            SimRoute::ok(
                r#"{"tag_name": "v2.1.0", "assets": [
                    {"name": "firmware-esp32.bin", "browser_download_url": "https://gh/fw.bin"},
                    {"name": "littlefs-esp32.bin", "browser_download_url": "https://gh/fs.bin"}]}"#,
            ),
        );
        let mut hw = board.hardware();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");

        let descriptor = ota.check_for_update(&mut hw).unwrap();
        assert_eq!(descriptor.latest_version, "2.1.0");
        assert_eq!(descriptor.firmware_url, "https://gh/fw.bin");

        let release_request = board
            .http
            .requests()
            .into_iter()
            .find(|r| r.url == RELEASE_URL)
            .unwrap();
        assert!(release_request
            .headers
            .iter()
            .any(|(k, v)| k == "Accept" && v == RELEASE_ACCEPT));
    }

    #[test]
    fn failed_check_clears_descriptor() {
        let board = SimBoard::new();
        board.http.serve(RELEASE_URL, SimRoute::status(500));
        let mut hw = board.hardware();
        let mut ota = OtaManager::new(settings(false), Board::Esp32, "1.9.0");

        assert_eq!(
            ota.check_for_update(&mut hw).err(),
            Some(OtaError::HttpStatus(500))
        );
        assert!(ota.descriptor().is_none());
        assert_eq!(ota.state(), OtaState::Failed);
    }

    #[test]
    fn descriptor_serializes_for_status_api() {
        let descriptor = UpdateDescriptor {
            current_version: "1.9.0".into(),
            latest_version: "2.0.0".into(),
            firmware_url: "https://u/fw.bin".into(),
            filesystem_url: "https://u/fs.bin".into(),
            bundle_url: String::new(),
            update_available: true,
            build_id: None,
            build_date: None,
        };
        let json: serde_json::Value = serde_json::from_str(&descriptor.to_json().unwrap()).unwrap();
        assert_eq!(json["download_url"], "https://u/fw.bin");
        assert_eq!(json["update_available"], true);
        assert!(json.get("filesystem_url").is_none());
        assert!(json.get("build_id").is_none());
    }

    #[test]
    fn dual_asset_update_flashes_both_and_reboots() {
        let board = SimBoard::new();
        let fw = image(20_000, 1);
        let fs = image(6_000, 2);
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("2.0.0")));
        board.http.serve("https://u/fw.bin", SimRoute::ok(fw.clone()));
        board.http.serve("https://u/fs.bin", SimRoute::ok(fs.clone()));
        let mut hw = board.hardware();
        let mut config = MemoryStore::new();
        let mut display = SimDisplay::new();
        let mut realtime = SimRealtime::connected();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");
        ota.check_for_update(&mut hw).unwrap();

        let outcome = ota
            .perform_update(UpdateContext {
                hw: &mut hw,
                config: &mut config,
                display: &mut display,
                realtime: &mut realtime,
            })
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Rebooting);
        assert_eq!(board.system.restart_count(), 1);
        assert_eq!(board.system.watchdog_timeout_secs(), Some(UPDATE_WATCHDOG_SECS));
        assert_eq!(board.partitions.boot_label(), "ota_1");
        assert_eq!(config::partition_version(&config, "ota_1").as_deref(), Some("2.0.0"));

        let images = board.flash.images();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].kind, ImageKind::Firmware);
        assert_eq!(images[0].label.as_deref(), Some("ota_1"));
        assert_eq!(images[0].data, fw);
        assert_eq!(images[1].kind, ImageKind::Filesystem);
        assert_eq!(images[1].data, fs);

        assert_eq!(realtime.disconnect_count(), 1);
        assert!(realtime.reconnect_after().unwrap() >= REALTIME_COOLDOWN_MS);

        let percents = display.percents();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.contains(&85));
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(ota.state(), OtaState::Rebooting);
    }

    #[test]
    fn truncated_filesystem_restores_boot_partition() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("2.0.0")));
        board.http.serve("https://u/fw.bin", SimRoute::ok(image(8_000, 1)));
        board
            .http
            .serve("https://u/fs.bin", SimRoute::ok(image(6_000, 2)).close_after(3_000));
        let mut hw = board.hardware();
        let mut config = MemoryStore::new();
        let mut display = SimDisplay::new();
        let mut realtime = SimRealtime::default();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");
        ota.check_for_update(&mut hw).unwrap();

        let err = ota
            .perform_update(UpdateContext {
                hw: &mut hw,
                config: &mut config,
                display: &mut display,
                realtime: &mut realtime,
            })
            .unwrap_err();

        assert_eq!(
            err,
            OtaError::Incomplete {
                kind: ImageKind::Filesystem,
                written: 3_000,
                expected: 6_000
            }
        );
        assert!(err.is_retryable());
        assert_eq!(board.partitions.boot_label(), "ota_0");
        assert_eq!(board.system.restart_count(), 0);
        assert_eq!(board.flash.abort_count(), 1);
        assert!(!board.flash.is_open());
        assert_eq!(display.errors(), vec!["Download incomplete".to_string()]);
        assert_eq!(ota.state(), OtaState::Failed);
    }

    #[test]
    fn update_without_check_is_rejected() {
        let board = SimBoard::new();
        let mut hw = board.hardware();
        let mut config = MemoryStore::new();
        let mut display = SimDisplay::new();
        let mut realtime = SimRealtime::connected();
        let mut ota = OtaManager::new(settings(false), Board::Esp32, "1.9.0");

        let result = ota.perform_update(UpdateContext {
            hw: &mut hw,
            config: &mut config,
            display: &mut display,
            realtime: &mut realtime,
        });
        assert_eq!(result, Err(OtaError::NoUpdateAvailable));
        // Nothing was torn down for a rejected request
        assert_eq!(realtime.disconnect_count(), 0);
        assert_eq!(board.flash.begin_count(), 0);
    }

    #[test]
    fn firmware_without_content_length_is_rejected() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("2.0.0")));
        board.http.serve(
            "https://u/fw.bin",
            SimRoute::ok(image(4_000, 1)).without_content_length(),
        );
        let mut hw = board.hardware();
        let mut config = MemoryStore::new();
        let mut display = SimDisplay::new();
        let mut realtime = SimRealtime::default();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");
        ota.check_for_update(&mut hw).unwrap();

        let result = ota.perform_update(UpdateContext {
            hw: &mut hw,
            config: &mut config,
            display: &mut display,
            realtime: &mut realtime,
        });
        assert_eq!(result, Err(OtaError::MissingContentLength));
        assert_eq!(board.flash.begin_count(), 0);
    }

    #[test]
    fn low_heap_aborts_firmware_flash() {
        let board = SimBoard::new();
        board.http.serve(MANIFEST_URL, SimRoute::ok(manifest_body("2.0.0")));
        board.http.serve("https://u/fw.bin", SimRoute::ok(image(8_000, 1)));
        board.http.serve("https://u/fs.bin", SimRoute::ok(image(1_000, 2)));
        board.system.set_heap(45_000, 40_000);
        let mut hw = board.hardware();
        let mut config = MemoryStore::new();
        let mut display = SimDisplay::new();
        let mut realtime = SimRealtime::default();
        let mut ota = OtaManager::new(settings(true), Board::Esp32, "1.9.0");
        ota.check_for_update(&mut hw).unwrap();

        let result = ota.perform_update(UpdateContext {
            hw: &mut hw,
            config: &mut config,
            display: &mut display,
            realtime: &mut realtime,
        });
        assert_eq!(result, Err(OtaError::LowHeap { free: 45_000 }));
        assert_eq!(board.flash.abort_count(), 1);
        assert!(board.flash.images().is_empty());
        assert_eq!(board.partitions.boot_label(), "ota_0");
    }
}
