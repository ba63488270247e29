//! Deterministic in-memory platform.
//!
//! Every handle is cheap to clone and shares its state, so a test can move one
//! clone into [`Hardware`] and keep another to inspect what happened. The clock
//! only moves when something sleeps, which makes minute-long timeouts run
//! instantly.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use super::{
    FlashWriter, Hardware, ImageKind, PartitionInfo, PartitionKind, PartitionTable, PlatformError,
    SystemControl,
};
use crate::network::{ByteSource, HttpClient, HttpRequest, HttpResponse, RealtimeLink};
use crate::progress::ProgressSink;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SystemState {
    now_ms: Cell<u64>,
    free_heap: Cell<usize>,
    largest_block: Cell<usize>,
    restarts: Cell<u32>,
    watchdog_secs: Cell<Option<u32>>,
}

/// Simulated clock, heap and reset line.
#[derive(Debug, Clone)]
pub struct SimSystem {
    state: Rc<SystemState>,
}

impl Default for SimSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSystem {
    pub fn new() -> Self {
        Self {
            state: Rc::new(SystemState {
                now_ms: Cell::new(0),
                free_heap: Cell::new(180 * 1024),
                largest_block: Cell::new(110 * 1024),
                restarts: Cell::new(0),
                watchdog_secs: Cell::new(None),
            }),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.state.now_ms.set(self.state.now_ms.get() + ms);
    }

    pub fn set_heap(&self, free: usize, largest_block: usize) {
        self.state.free_heap.set(free);
        self.state.largest_block.set(largest_block);
    }

    pub fn restart_count(&self) -> u32 {
        self.state.restarts.get()
    }

    pub fn watchdog_timeout_secs(&self) -> Option<u32> {
        self.state.watchdog_secs.get()
    }
}

impl SystemControl for SimSystem {
    fn millis(&self) -> u64 {
        self.state.now_ms.get()
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance(u64::from(ms));
    }

    fn free_heap(&self) -> usize {
        self.state.free_heap.get()
    }

    fn largest_free_block(&self) -> usize {
        self.state.largest_block.get()
    }

    fn prepare_watchdog_for_update(&mut self, timeout_secs: u32) {
        self.state.watchdog_secs.set(Some(timeout_secs));
    }

    fn restart(&mut self) {
        log::info!("[sim] restart requested");
        self.state.restarts.set(self.state.restarts.get() + 1);
    }
}

// ---------------------------------------------------------------------------
// Partition table
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TableState {
    entries: Vec<PartitionInfo>,
    running: String,
    boot: String,
    rollback_pending: bool,
    fail_set_boot: bool,
    fail_native_rollback: bool,
    native_rollbacks: u32,
    valid_marks: u32,
}

/// A/B layout with an optional factory slot and one filesystem partition.
#[derive(Debug, Clone)]
pub struct SimPartitionTable {
    state: Rc<RefCell<TableState>>,
}

impl Default for SimPartitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl SimPartitionTable {
    /// factory + ota_0 + ota_1 + spiffs, running from ota_0.
    pub fn standard() -> Self {
        let entries = vec![
            PartitionInfo::new("factory", PartitionKind::Factory, 0x10000, 0x180000),
            PartitionInfo::new("ota_0", PartitionKind::OtaApp(0), 0x190000, 0x1E0000),
            PartitionInfo::new("ota_1", PartitionKind::OtaApp(1), 0x370000, 0x1E0000),
            PartitionInfo::new("spiffs", PartitionKind::Filesystem, 0x550000, 0x80000),
        ];
        Self {
            state: Rc::new(RefCell::new(TableState {
                entries,
                running: "ota_0".to_string(),
                boot: "ota_0".to_string(),
                rollback_pending: false,
                fail_set_boot: false,
                fail_native_rollback: false,
                native_rollbacks: 0,
                valid_marks: 0,
            })),
        }
    }

    #[must_use]
    pub fn running_from(self, label: &str) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.running = label.to_string();
            state.boot = label.to_string();
        }
        self
    }

    #[must_use]
    pub fn without_factory(self) -> Self {
        self.state
            .borrow_mut()
            .entries
            .retain(|p| p.kind != PartitionKind::Factory);
        self
    }

    /// Single application slot: no inactive partition to update into.
    #[must_use]
    pub fn without_secondary_slot(self) -> Self {
        self.state
            .borrow_mut()
            .entries
            .retain(|p| p.kind != PartitionKind::OtaApp(1));
        self
    }

    #[must_use]
    pub fn with_pending_rollback(self) -> Self {
        self.state.borrow_mut().rollback_pending = true;
        self
    }

    /// What the bootloader does on reset: run the selected image. A newly
    /// selected OTA image starts out pending verification.
    pub fn reboot(&self) {
        let mut state = self.state.borrow_mut();
        if state.boot == state.running {
            return;
        }
        let pending = state
            .entries
            .iter()
            .any(|p| p.label() == state.boot && matches!(p.kind, PartitionKind::OtaApp(_)));
        state.rollback_pending = pending;
        state.running = state.boot.clone();
    }

    pub fn running_label(&self) -> String {
        self.state.borrow().running.clone()
    }

    pub fn fail_set_boot(&self, fail: bool) {
        self.state.borrow_mut().fail_set_boot = fail;
    }

    pub fn fail_native_rollback(&self, fail: bool) {
        self.state.borrow_mut().fail_native_rollback = fail;
    }

    pub fn boot_label(&self) -> String {
        self.state.borrow().boot.clone()
    }

    pub fn native_rollback_count(&self) -> u32 {
        self.state.borrow().native_rollbacks
    }

    pub fn valid_mark_count(&self) -> u32 {
        self.state.borrow().valid_marks
    }

    pub fn rollback_pending(&self) -> bool {
        self.state.borrow().rollback_pending
    }

    fn find(&self, pred: impl Fn(&PartitionInfo) -> bool) -> Option<PartitionInfo> {
        self.state.borrow().entries.iter().find(|&p| pred(p)).cloned()
    }
}

impl PartitionTable for SimPartitionTable {
    fn running(&self) -> Option<PartitionInfo> {
        let label = self.state.borrow().running.clone();
        self.find(|p| p.label() == label)
    }

    fn next_update(&self) -> Option<PartitionInfo> {
        let running = self.running();
        let next_index = match running.map(|p| p.kind) {
            Some(PartitionKind::OtaApp(0)) => 1,
            _ => 0,
        };
        self.find(|p| p.kind == PartitionKind::OtaApp(next_index))
            .or_else(|| {
                let label = self.state.borrow().running.clone();
                self.find(|p| matches!(p.kind, PartitionKind::OtaApp(_)) && p.label() != label)
            })
    }

    fn factory(&self) -> Option<PartitionInfo> {
        self.find(|p| p.kind == PartitionKind::Factory)
    }

    fn filesystem(&self) -> Option<PartitionInfo> {
        self.find(|p| p.kind == PartitionKind::Filesystem)
    }

    fn boot_partition(&self) -> Option<PartitionInfo> {
        let label = self.state.borrow().boot.clone();
        self.find(|p| p.label() == label)
    }

    fn set_boot_partition(&mut self, partition: &PartitionInfo) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        if state.fail_set_boot {
            return Err(PlatformError::Esp(-1));
        }
        if !state.entries.iter().any(|p| p.label == partition.label) {
            return Err(PlatformError::NotFound);
        }
        state.boot = partition.label().to_string();
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        if !state.rollback_pending {
            return Err(PlatformError::InvalidState);
        }
        state.rollback_pending = false;
        state.valid_marks += 1;
        Ok(())
    }

    fn mark_running_invalid_and_reboot(&mut self) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        if state.fail_native_rollback {
            return Err(PlatformError::Esp(-1));
        }
        state.native_rollbacks += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

/// An image that was written and closed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenImage {
    pub kind: ImageKind,
    pub label: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct FlashState {
    open: Option<(ImageKind, Option<String>, usize)>,
    pending: Vec<u8>,
    images: Vec<WrittenImage>,
    begins: u32,
    aborts: u32,
    reject_begin: bool,
    accept_limit: Option<usize>,
    fail_end: bool,
}

/// Records every transaction instead of touching flash.
#[derive(Debug, Clone, Default)]
pub struct SimFlash {
    state: Rc<RefCell<FlashState>>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_begin(&self, reject: bool) {
        self.state.borrow_mut().reject_begin = reject;
    }

    /// Accept at most `bytes` per transaction, then report short writes.
    pub fn short_write_after(&self, bytes: usize) {
        self.state.borrow_mut().accept_limit = Some(bytes);
    }

    pub fn fail_end(&self, fail: bool) {
        self.state.borrow_mut().fail_end = fail;
    }

    pub fn images(&self) -> Vec<WrittenImage> {
        self.state.borrow().images.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open.is_some()
    }

    pub fn begin_count(&self) -> u32 {
        self.state.borrow().begins
    }

    pub fn abort_count(&self) -> u32 {
        self.state.borrow().aborts
    }
}

impl FlashWriter for SimFlash {
    fn begin(&mut self, size: usize, kind: ImageKind, label: Option<&str>) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        if state.open.is_some() {
            return Err(PlatformError::InvalidState);
        }
        if state.reject_begin {
            return Err(PlatformError::Esp(-2));
        }
        state.begins += 1;
        state.open = Some((kind, label.map(str::to_string), size));
        state.pending.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut state = self.state.borrow_mut();
        if state.open.is_none() {
            return 0;
        }
        let accepted = match state.accept_limit {
            Some(limit) => data.len().min(limit.saturating_sub(state.pending.len())),
            None => data.len(),
        };
        state.pending.extend_from_slice(&data[..accepted]);
        accepted
    }

    fn end(&mut self) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        let (kind, label, size) = state.open.take().ok_or(PlatformError::NotOpen)?;
        let data = std::mem::take(&mut state.pending);
        if state.fail_end {
            return Err(PlatformError::Validation("image check failed".to_string()));
        }
        if data.len() != size {
            return Err(PlatformError::Validation(format!(
                "incomplete image ({} of {} bytes)",
                data.len(),
                size
            )));
        }
        state.images.push(WrittenImage { kind, label, data });
        Ok(())
    }

    fn abort(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.open.take().is_some() {
            state.aborts += 1;
        }
        state.pending.clear();
    }
}

// ---------------------------------------------------------------------------
// Byte streams and HTTP
// ---------------------------------------------------------------------------

/// A byte stream fed from a queue of chunks. Each chunk becomes available in
/// one piece, like one TCP segment.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    chunks: VecDeque<Vec<u8>>,
    stall: bool,
}

impl ScriptedSource {
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect(),
            stall: false,
        }
    }

    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self::from_chunks(data.chunks(chunk_size).map(<[u8]>::to_vec).collect())
    }

    /// Keep the connection open with no data once the chunks run out.
    #[must_use]
    pub fn stall_forever(mut self) -> Self {
        self.stall = true;
        self
    }
}

impl ByteSource for ScriptedSource {
    fn available(&mut self) -> usize {
        self.chunks.front().map_or(0, Vec::len)
    }

    fn connected(&mut self) -> bool {
        !self.chunks.is_empty() || self.stall
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(front) = self.chunks.front_mut() else {
            return 0;
        };
        let n = buf.len().min(front.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            self.chunks.pop_front();
        }
        n
    }
}

#[derive(Debug)]
pub struct SimResponse {
    status: u16,
    content_length: Option<usize>,
    source: ScriptedSource,
}

impl SimResponse {
    pub fn new(status: u16, content_length: Option<usize>, source: ScriptedSource) -> Self {
        Self {
            status,
            content_length,
            source,
        }
    }
}

impl ByteSource for SimResponse {
    fn available(&mut self) -> usize {
        self.source.available()
    }

    fn connected(&mut self) -> bool {
        self.source.connected()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.source.read(buf)
    }
}

impl HttpResponse for SimResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<usize> {
        self.content_length
    }
}

/// How the simulated server answers one URL.
#[derive(Debug, Clone)]
pub struct SimRoute {
    status: u16,
    body: Vec<u8>,
    content_length: Option<usize>,
    chunk_size: usize,
    cut_at: Option<usize>,
    stall: bool,
}

impl SimRoute {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            status: 200,
            content_length: Some(body.len()),
            body,
            chunk_size: 1460,
            cut_at: None,
            stall: false,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    #[must_use]
    pub fn without_content_length(mut self) -> Self {
        self.content_length = None;
        self
    }

    #[must_use]
    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Close the connection after `bytes` (Content-Length still announces all).
    #[must_use]
    pub fn close_after(mut self, bytes: usize) -> Self {
        self.cut_at = Some(bytes);
        self
    }

    /// Go silent after `bytes`, keeping the connection open.
    #[must_use]
    pub fn stall_after(mut self, bytes: usize) -> Self {
        self.cut_at = Some(bytes);
        self.stall = true;
        self
    }

    fn respond(&self) -> SimResponse {
        let end = self.cut_at.unwrap_or(self.body.len()).min(self.body.len());
        let mut source = ScriptedSource::from_bytes(&self.body[..end], self.chunk_size);
        if self.stall {
            source = source.stall_forever();
        }
        SimResponse::new(self.status, self.content_length, source)
    }
}

#[derive(Debug, Default)]
struct HttpState {
    routes: BTreeMap<String, SimRoute>,
    requests: Vec<HttpRequest>,
}

/// URL-keyed canned responses. Unknown URLs fail at the transport level.
#[derive(Debug, Clone, Default)]
pub struct SimHttp {
    state: Rc<RefCell<HttpState>>,
}

impl SimHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, route: SimRoute) {
        self.state.borrow_mut().routes.insert(url.to_string(), route);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

impl HttpClient for SimHttp {
    fn get(&mut self, request: &HttpRequest) -> Result<Box<dyn HttpResponse>, PlatformError> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        match state.routes.get(&request.url) {
            Some(route) => Ok(Box::new(route.respond())),
            None => Err(PlatformError::Io(format!("connection refused: {}", request.url))),
        }
    }
}

// ---------------------------------------------------------------------------
// Whole board
// ---------------------------------------------------------------------------

/// Handles to every simulated peripheral.
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    pub system: SimSystem,
    pub partitions: SimPartitionTable,
    pub flash: SimFlash,
    pub http: SimHttp,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partitions: SimPartitionTable) -> Self {
        Self {
            partitions,
            ..Self::default()
        }
    }

    /// Boxed clones for the code under test; `self` keeps observing.
    pub fn hardware(&self) -> Hardware {
        Hardware::new(
            Box::new(self.system.clone()),
            Box::new(self.partitions.clone()),
            Box::new(self.flash.clone()),
            Box::new(self.http.clone()),
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    Progress(u8, String),
    Error(String),
}

/// Progress sink that records what the matrix would have shown.
#[derive(Debug, Clone, Default)]
pub struct SimDisplay {
    events: Rc<RefCell<Vec<DisplayEvent>>>,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DisplayEvent> {
        self.events.borrow().clone()
    }

    pub fn percents(&self) -> Vec<u8> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Progress(p, _) => Some(*p),
                DisplayEvent::Error(_) => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Error(msg) => Some(msg.clone()),
                DisplayEvent::Progress(..) => None,
            })
            .collect()
    }
}

impl ProgressSink for SimDisplay {
    fn on_progress(&mut self, percent: u8, message: &str) {
        self.events
            .borrow_mut()
            .push(DisplayEvent::Progress(percent, message.to_string()));
    }

    fn on_error(&mut self, message: &str) {
        self.events
            .borrow_mut()
            .push(DisplayEvent::Error(message.to_string()));
    }
}

#[derive(Debug, Default)]
struct RealtimeState {
    active: bool,
    disconnects: u32,
    reconnect_after: Option<u64>,
}

/// Realtime link that records disconnects and cooldowns.
#[derive(Debug, Clone, Default)]
pub struct SimRealtime {
    state: Rc<RefCell<RealtimeState>>,
}

impl SimRealtime {
    pub fn connected() -> Self {
        let link = Self::default();
        link.state.borrow_mut().active = true;
        link
    }

    pub fn disconnect_count(&self) -> u32 {
        self.state.borrow().disconnects
    }

    pub fn reconnect_after(&self) -> Option<u64> {
        self.state.borrow().reconnect_after
    }
}

impl RealtimeLink for SimRealtime {
    fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    fn disconnect(&mut self) {
        let mut state = self.state.borrow_mut();
        state.active = false;
        state.disconnects += 1;
    }

    fn defer_reconnect_until(&mut self, until_ms: u64) {
        self.state.borrow_mut().reconnect_after = Some(until_ms);
    }
}
