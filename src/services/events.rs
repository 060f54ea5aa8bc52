use serde::Serialize;
use serde_json::Value;

/// Supervisor lifecycle transition (`TransitionEvent` payload)
pub const EVENT_RELAY_STATE: &str = "relay_state";
/// Timestamped monitor line (`RelayLogLine` payload)
pub const EVENT_RELAY_LOG: &str = "relay_log";
/// Restart scheduled after a crash (attempt, maxAttempts, delaySecs)
pub const EVENT_RELAY_RECONNECTING: &str = "relay_reconnecting";
/// Restart budget exhausted or spawn failure (`{ "error": .. }`)
pub const EVENT_RELAY_FAILED: &str = "relay_failed";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        sink.emit(event, value);
    }
}
