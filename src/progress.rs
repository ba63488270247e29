// Update progress as seen by the LED matrix (or whatever else is listening)

/// Receives update progress. On the device this drives the matrix's progress
/// bar; rendering itself lives elsewhere.
pub trait ProgressSink {
    fn on_progress(&mut self, percent: u8, message: &str);

    fn on_error(&mut self, message: &str);
}

/// Sink that only logs, for headless builds.
#[derive(Debug, Default)]
pub struct LogProgress {
    last_percent: Option<u8>,
}

impl ProgressSink for LogProgress {
    fn on_progress(&mut self, percent: u8, message: &str) {
        if self.last_percent != Some(percent) {
            log::info!("[{:>3}%] {}", percent, message);
            self.last_percent = Some(percent);
        }
    }

    fn on_error(&mut self, message: &str) {
        log::error!("[ERR] {}", message);
        self.last_percent = None;
    }
}

/// Map a phase-local percentage onto its share of the whole update.
///
/// The firmware image covers 0-85 % of the bar and the filesystem 85-100 %.
pub fn scale(percent: u8, start: u8, end: u8) -> u8 {
    let span = u32::from(end.saturating_sub(start));
    let scaled = u32::from(start) + u32::from(percent.min(100)) * span / 100;
    scaled.min(100) as u8
}

pub const FIRMWARE_SPAN: (u8, u8) = (0, 85);
pub const FILESYSTEM_SPAN: (u8, u8) = (85, 100);
