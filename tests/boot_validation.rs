// Boot validation across simulated resets

use std::cell::RefCell;
use std::rc::Rc;

use led_matrix_display::boot::{BootDecision, BootState, BOOT_COUNT_KEY, MAX_BOOT_FAILURES};
use led_matrix_display::config::{ConfigStore, MemoryStore, StoreError, KEY_MANIFEST_URL};
use led_matrix_display::network::NoRealtime;
use led_matrix_display::ota::UpdateOutcome;
use led_matrix_display::platform::sim::{SimBoard, SimDisplay, SimRoute};
use led_matrix_display::version::Board;
use led_matrix_display::App;

const MANIFEST_URL: &str = "https://updates.local/manifest.json";

/// NVS survives resets, so every simulated boot shares one store.
#[derive(Clone, Default)]
struct SharedStore(Rc<RefCell<MemoryStore>>);

impl ConfigStore for SharedStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.0.borrow().get_string(key)
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.0.borrow_mut().set_string(key, value)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.0.borrow().get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.0.borrow_mut().set_u32(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.0.borrow_mut().remove(key)
    }
}

struct Device {
    board: SimBoard,
    config: SharedStore,
    boot: SharedStore,
}

impl Device {
    fn new() -> Self {
        let mut config = SharedStore::default();
        config.set_string(KEY_MANIFEST_URL, MANIFEST_URL).unwrap();
        Self {
            board: SimBoard::new(),
            config,
            boot: SharedStore::default(),
        }
    }

    /// Power on with whatever image the bootloader picks.
    fn power_on(&self, version: &str) -> App {
        self.board.partitions.reboot();
        App::new(
            self.board.hardware(),
            Box::new(self.config.clone()),
            Box::new(self.boot.clone()),
            Box::new(SimDisplay::new()),
            Box::new(NoRealtime),
        )
        .with_identity(Board::Esp32, version)
    }

    fn boot_count(&self) -> Option<u32> {
        self.boot.get_u32(BOOT_COUNT_KEY).unwrap()
    }

    fn install_update(&self) {
        self.board.http.serve(
            MANIFEST_URL,
            SimRoute::ok(
                r#"{"version": "2.0.0",
                    "firmware": {"esp32": {"url": "https://u/fw.bin"}},
                    "filesystem": {"esp32": {"url": "https://u/fs.bin"}}}"#,
            ),
        );
        self.board
            .http
            .serve("https://u/fw.bin", SimRoute::ok(vec![0xE9; 16_000]));
        self.board
            .http
            .serve("https://u/fs.bin", SimRoute::ok(vec![0xFF; 4_000]));

        let mut app = self.power_on("1.9.0");
        assert_eq!(app.start(), BootDecision::Proceed);
        app.confirm_boot();
        assert_eq!(app.run_update(), Ok(UpdateOutcome::Rebooting));
    }
}

#[test]
fn confirmed_update_becomes_permanent() {
    let device = Device::new();
    device.install_update();

    let mut app = device.power_on("2.0.0");
    assert_eq!(device.board.partitions.running_label(), "ota_1");
    assert!(device.board.partitions.rollback_pending());

    assert_eq!(app.start(), BootDecision::Proceed);
    assert_eq!(app.boot().boot_count(), 1);
    app.confirm_boot();

    assert_eq!(device.boot_count(), Some(0));
    assert!(!device.board.partitions.rollback_pending());
    assert_eq!(device.board.partitions.valid_mark_count(), 1);
}

#[test]
fn crashing_update_falls_back_to_factory() {
    let device = Device::new();
    device.install_update();
    let restarts_after_update = device.board.system.restart_count();

    // The new image dies before it can confirm itself
    for expected in 1..=MAX_BOOT_FAILURES {
        let mut app = device.power_on("2.0.0");
        assert_eq!(app.start(), BootDecision::Proceed);
        assert_eq!(app.boot().boot_count(), expected);
    }

    let mut app = device.power_on("2.0.0");
    assert_eq!(app.start(), BootDecision::Rebooting);
    assert_eq!(app.boot().state(), BootState::RollingBack);
    assert_eq!(device.board.partitions.boot_label(), "factory");
    assert_eq!(
        device.board.system.restart_count(),
        restarts_after_update + 1
    );

    let mut app = device.power_on("1.0.0");
    assert_eq!(app.start(), BootDecision::Proceed);
    assert_eq!(app.boot().state(), BootState::FactoryOk);
    assert!(app.boot().is_factory_partition(app.hardware()));
    assert_eq!(device.boot_count(), Some(MAX_BOOT_FAILURES + 1));
}

#[test]
fn critical_init_failure_rolls_back_immediately() {
    let device = Device::new();
    let mut app = device.power_on("1.9.0");
    app.start();

    assert_eq!(
        app.fail_boot("Display", "panel did not respond"),
        BootDecision::Rebooting
    );
    assert_eq!(device.board.partitions.boot_label(), "factory");
    assert_eq!(device.board.system.restart_count(), 1);
}

#[test]
fn confirm_before_start_changes_nothing() {
    let mut device = Device::new();
    device.boot.set_u32(BOOT_COUNT_KEY, 2).unwrap();
    let mut app = device.power_on("1.9.0");

    app.confirm_boot();
    assert_eq!(device.boot_count(), Some(2));

    app.start();
    assert_eq!(device.boot_count(), Some(3));
}
