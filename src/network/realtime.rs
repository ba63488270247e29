/// The realtime (WebSocket) connection, seen from the updater.
///
/// It competes with a download for heap and bandwidth, so it is torn down for
/// the duration of an update and kept down for a cooldown window.
pub trait RealtimeLink {
    fn is_active(&self) -> bool;

    fn disconnect(&mut self);

    /// Do not reconnect before `until_ms` (uptime milliseconds).
    fn defer_reconnect_until(&mut self, until_ms: u64);
}

/// Stand-in for builds without a realtime client.
#[derive(Debug, Default)]
pub struct NoRealtime;

impl RealtimeLink for NoRealtime {
    fn is_active(&self) -> bool {
        false
    }

    fn disconnect(&mut self) {}

    fn defer_reconnect_until(&mut self, _until_ms: u64) {}
}
