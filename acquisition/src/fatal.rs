//! Process-wide fatal error cell.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::error;

/// Set once by whichever thread first hits an unrecoverable fault; every
/// worker checks it each iteration and shuts down.
#[derive(Debug, Default)]
pub struct FatalError {
    raised: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FatalError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error. Only the first message is kept; returns whether
    /// this call was the one recorded.
    pub fn raise(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut slot = self
            .message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            error!("Additional fatal error: {message}");
            return false;
        }
        error!("Fatal error: {message}");
        *slot = Some(message);
        self.raised.store(true, Ordering::Release);
        true
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn message(&self) -> Option<String> {
        if !self.is_raised() {
            return None;
        }
        self.message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
