//! Mock event sink for tests

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use super::{EventSink, GatewayError};

/// Recording event sink with a toggleable connection state
pub struct MockGateway {
    connected: AtomicBool,
    fail_emits: AtomicBool,
    events: Mutex<Vec<(String, Value)>>,
}

impl MockGateway {
    /// Create a mock sink that reports as connected
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_emits: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every subsequent emit return an error
    pub fn fail_emits(&self, fail: bool) {
        self.fail_emits.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    /// Payloads of every recorded event with the given name
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn last_event(&self, name: &str) -> Option<Value> {
        self.events_named(name).pop()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventSink for MockGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), GatewayError> {
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(GatewayError::EmitError(
                "scripted emit failure".to_string(),
            ));
        }
        self.events.lock().push((event.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
