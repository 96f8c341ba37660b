//! Advisory messages for the user.

use parking_lot::Mutex;

/// Receives one-line advisories about conditions that did not fail the call,
/// such as a protocol downgrade or a retry after a connection reset.
pub trait UiSink: Send + Sync {
    fn advise(&self, message: &str);
}

/// Writes advisories as `tracing` warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUi;

impl UiSink for TracingUi {
    fn advise(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Keeps advisories in memory.
#[derive(Debug, Default)]
pub struct RecordingUi {
    messages: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl UiSink for RecordingUi {
    fn advise(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
