// Chunked copy from a network stream into a flash sink, plus retry policy

use crate::network::ByteSource;
use crate::platform::SystemControl;

pub const DOWNLOAD_BUFFER_SIZE: usize = 2048;
pub const IDLE_TIMEOUT_MS: u64 = 60_000;
pub const HEADER_TIMEOUT_MS: u64 = 10_000;

const YIELD_MS: u32 = 5;
const IDLE_POLL_MS: u32 = 20;
const SLOW_READ_MS: u64 = 1_000;
const SLOW_WRITE_MS: u64 = 500;
const PROGRESS_STEP: u8 = 5;

/// Minimum heap headroom while flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFloor {
    pub min_free: usize,
    /// Below this much free heap, a fragmented heap is also fatal.
    pub fragmented_free: usize,
    pub min_block: usize,
}

impl HeapFloor {
    pub const DEFAULT: HeapFloor = HeapFloor {
        min_free: 30_000,
        fragmented_free: 50_000,
        min_block: 20_000,
    };

    /// Used while the application image is written.
    pub const FIRMWARE: HeapFloor = HeapFloor::flat(50_000);

    pub const fn flat(min_free: usize) -> Self {
        Self {
            min_free,
            fragmented_free: 0,
            min_block: 0,
        }
    }

    pub fn is_breached(&self, free: usize, largest_block: usize) -> bool {
        free < self.min_free || (free < self.fragmented_free && largest_block < self.min_block)
    }
}

impl Default for HeapFloor {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_written: usize,
    pub total: usize,
    pub percent: u8,
}

/// Why a copy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Complete,
    /// Peer closed with bytes still owed
    Closed,
    IdleTimeout,
    ShortWrite,
    LowHeap { free: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub copied: usize,
    pub stop: StopReason,
}

impl Transfer {
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Complete
    }
}

pub struct StreamDownloader<'a> {
    system: &'a dyn SystemControl,
    idle_timeout_ms: u64,
    heap_floor: HeapFloor,
}

impl<'a> StreamDownloader<'a> {
    pub fn new(system: &'a dyn SystemControl) -> Self {
        Self {
            system,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
            heap_floor: HeapFloor::DEFAULT,
        }
    }

    #[must_use]
    pub fn heap_floor(mut self, floor: HeapFloor) -> Self {
        self.heap_floor = floor;
        self
    }

    #[must_use]
    pub fn idle_timeout_ms(mut self, timeout: u64) -> Self {
        self.idle_timeout_ms = timeout;
        self
    }

    /// Copy up to `expected_total` bytes from `source` into `write_sink`.
    ///
    /// Never fails outright: the returned [`Transfer`] says how far it got and
    /// why it stopped. A sink that accepts fewer bytes than offered ends the
    /// copy, and those bytes are not counted.
    pub fn copy<S, W, P>(
        &self,
        source: &mut S,
        buffer: &mut [u8],
        expected_total: usize,
        mut write_sink: W,
        mut progress_sink: P,
    ) -> Transfer
    where
        S: ByteSource + ?Sized,
        W: FnMut(&[u8]) -> usize,
        P: FnMut(DownloadProgress),
    {
        let mut copied = 0usize;
        let mut last_step = 0u8;

        if buffer.is_empty() {
            log::error!("Download buffer is empty");
            return Transfer {
                copied,
                stop: StopReason::ShortWrite,
            };
        }

        while copied < expected_total {
            self.system.sleep_ms(YIELD_MS);

            let mut available = source.available();
            if available == 0 {
                let wait_start = self.system.millis();
                while available == 0 && source.connected() {
                    if self.system.millis().saturating_sub(wait_start) > self.idle_timeout_ms {
                        log::error!(
                            "Stream timeout waiting for data ({}s) at {}/{} bytes",
                            self.idle_timeout_ms / 1000,
                            copied,
                            expected_total
                        );
                        return Transfer {
                            copied,
                            stop: StopReason::IdleTimeout,
                        };
                    }
                    self.system.sleep_ms(IDLE_POLL_MS);
                    available = source.available();
                }
                if available == 0 {
                    log::warn!(
                        "Connection closed at {}/{} bytes",
                        copied,
                        expected_total
                    );
                    return Transfer {
                        copied,
                        stop: StopReason::Closed,
                    };
                }
            }

            let to_read = available
                .min(buffer.len())
                .min(expected_total - copied);

            let read_start = self.system.millis();
            let n = source.read(&mut buffer[..to_read]);
            let read_time = self.system.millis().saturating_sub(read_start);
            if read_time > SLOW_READ_MS {
                log::warn!("Slow read: {} ms for {} bytes", read_time, n);
            }
            if n == 0 {
                continue;
            }

            let write_start = self.system.millis();
            let written = write_sink(&buffer[..n]);
            let write_time = self.system.millis().saturating_sub(write_start);
            if write_time > SLOW_WRITE_MS {
                log::warn!("Slow write: {} ms for {} bytes", write_time, written);
            }

            if written != n {
                log::error!("Write failed: wrote {} of {} bytes", written, n);
                return Transfer {
                    copied,
                    stop: StopReason::ShortWrite,
                };
            }
            copied += written;

            let percent = percent_of(copied, expected_total);
            let step = percent / PROGRESS_STEP;
            if step > last_step {
                last_step = step;
                progress_sink(DownloadProgress {
                    bytes_written: copied,
                    total: expected_total,
                    percent,
                });

                let free = self.system.free_heap();
                let block = self.system.largest_free_block();
                log::info!("{}% complete, heap: {} bytes (block={})", percent, free, block);
                if self.heap_floor.is_breached(free, block) {
                    log::error!("Heap too low ({} bytes, block {}), aborting", free, block);
                    return Transfer {
                        copied,
                        stop: StopReason::LowHeap { free },
                    };
                }
            }
        }

        Transfer {
            copied,
            stop: StopReason::Complete,
        }
    }

    /// Fill `buf` completely within `timeout_ms`.
    pub fn read_exact<S>(&self, source: &mut S, buf: &mut [u8], timeout_ms: u64) -> bool
    where
        S: ByteSource + ?Sized,
    {
        let start = self.system.millis();
        let mut filled = 0usize;

        while filled < buf.len() {
            if self.system.millis().saturating_sub(start) > timeout_ms {
                log::error!("Timeout reading {} bytes (got {})", buf.len(), filled);
                return false;
            }
            if source.available() > 0 {
                filled += source.read(&mut buf[filled..]);
            } else if !source.connected() {
                log::error!("Connection closed reading {} bytes (got {})", buf.len(), filled);
                return false;
            }
            self.system.sleep_ms(YIELD_MS);
        }
        true
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (done as u64 * 100) / total as u64;
    percent.min(100) as u8
}

/// Backoff schedule for whole-download retries, applied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u32,
    pub max_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 15_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> u32 {
        let shift = retry.saturating_sub(1).min(16);
        self.initial_delay_ms
            .saturating_mul(1u32 << shift)
            .min(self.max_delay_ms)
    }
}

/// A transfer that made progress but did not finish is worth retrying. One
/// that wrote nothing points at a configuration or server problem instead.
pub fn should_retry(written: usize, expected: usize) -> bool {
    written > 0 && written < expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::{ScriptedSource, SimSystem};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn copies_complete_source() {
        let system = SimSystem::new();
        let data = payload(10_000);
        let mut source = ScriptedSource::from_bytes(&data, 1460);
        let mut out = Vec::new();
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];

        let transfer = StreamDownloader::new(&system).copy(
            &mut source,
            &mut buf,
            data.len(),
            |chunk| {
                out.extend_from_slice(chunk);
                chunk.len()
            },
            |_| {},
        );

        assert!(transfer.is_complete());
        assert_eq!(transfer.copied, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn closed_source_returns_partial_count() {
        let system = SimSystem::new();
        let data = payload(5_000);
        let mut source = ScriptedSource::from_bytes(&data, 1000);
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];

        let transfer = StreamDownloader::new(&system).copy(
            &mut source,
            &mut buf,
            10_000,
            |chunk| chunk.len(),
            |_| {},
        );

        assert_eq!(transfer.copied, 5_000);
        assert_eq!(transfer.stop, StopReason::Closed);
    }

    #[test]
    fn stalled_source_times_out() {
        let system = SimSystem::new();
        let data = payload(3_000);
        let mut source = ScriptedSource::from_bytes(&data, 1000).stall_forever();
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];

        let transfer = StreamDownloader::new(&system).copy(
            &mut source,
            &mut buf,
            10_000,
            |chunk| chunk.len(),
            |_| {},
        );

        assert_eq!(transfer.copied, 3_000);
        assert_eq!(transfer.stop, StopReason::IdleTimeout);
        assert!(system.millis() > IDLE_TIMEOUT_MS);
    }

    #[test]
    fn short_write_returns_count_before_it() {
        let system = SimSystem::new();
        let data = payload(8_000);
        let mut source = ScriptedSource::from_bytes(&data, 1000);
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];
        let mut calls = 0;

        let transfer = StreamDownloader::new(&system).copy(
            &mut source,
            &mut buf,
            data.len(),
            |chunk| {
                calls += 1;
                if calls == 3 {
                    chunk.len() / 2
                } else {
                    chunk.len()
                }
            },
            |_| {},
        );

        assert_eq!(transfer.copied, 2_000);
        assert_eq!(transfer.stop, StopReason::ShortWrite);
    }

    #[test]
    fn progress_fires_on_five_percent_steps() {
        let system = SimSystem::new();
        let data = payload(10_000);
        let mut source = ScriptedSource::from_bytes(&data, 100);
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];
        let mut seen = Vec::new();

        StreamDownloader::new(&system).copy(
            &mut source,
            &mut buf,
            data.len(),
            |chunk| chunk.len(),
            |p| seen.push(p.percent),
        );

        // 1% per chunk, reported at 5, 10, ... 100
        assert_eq!(seen.first(), Some(&5));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[1] / 5 > w[0] / 5));
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn low_heap_aborts_mid_copy() {
        let system = SimSystem::new();
        let heap = system.clone();
        let data = payload(10_000);
        let mut source = ScriptedSource::from_bytes(&data, 1000);
        let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];
        let mut writes = 0;

        let transfer = StreamDownloader::new(&system)
            .heap_floor(HeapFloor::FIRMWARE)
            .copy(
                &mut source,
                &mut buf,
                data.len(),
                |chunk| {
                    writes += 1;
                    if writes == 4 {
                        heap.set_heap(40_000, 30_000);
                    }
                    chunk.len()
                },
                |_| {},
            );

        assert_eq!(transfer.copied, 4_000);
        assert_eq!(transfer.stop, StopReason::LowHeap { free: 40_000 });
    }

    #[test]
    fn fragmented_heap_breaches_default_floor() {
        let floor = HeapFloor::DEFAULT;
        assert!(floor.is_breached(29_000, 29_000));
        assert!(floor.is_breached(45_000, 10_000));
        assert!(!floor.is_breached(45_000, 30_000));
        assert!(!floor.is_breached(120_000, 10_000));
    }

    #[test]
    fn read_exact_fills_across_chunks() {
        let system = SimSystem::new();
        let mut source = ScriptedSource::from_chunks(vec![b"LMW".to_vec(), b"B0123".to_vec()]);
        let mut buf = [0u8; 8];
        assert!(StreamDownloader::new(&system).read_exact(&mut source, &mut buf, 1_000));
        assert_eq!(&buf, b"LMWB0123");
    }

    #[test]
    fn read_exact_times_out() {
        let system = SimSystem::new();
        let mut source = ScriptedSource::from_chunks(vec![b"LM".to_vec()]).stall_forever();
        let mut buf = [0u8; 16];
        assert!(!StreamDownloader::new(&system).read_exact(&mut source, &mut buf, HEADER_TIMEOUT_MS));
    }

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), 2_000);
        assert_eq!(policy.delay_for(2), 4_000);
        assert_eq!(policy.delay_for(3), 8_000);
        assert_eq!(policy.delay_for(4), 15_000);
    }

    #[test]
    fn only_partial_transfers_are_retryable() {
        assert!(should_retry(100, 1_000));
        assert!(!should_retry(0, 1_000));
        assert!(!should_retry(1_000, 1_000));
    }
}
