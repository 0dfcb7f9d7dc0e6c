//! Cooperative shutdown flag
//!
//! Polled between units of work; never interrupts work in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown request, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create an unraised signal
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask long-running phases to stop at their next checkpoint
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested; migration will stop at the next checkpoint");
        }
    }

    /// Check whether shutdown was requested
    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
