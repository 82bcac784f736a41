//! Session cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{DfuError, DfuResult};

/// Shared abort request, checked by the session at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`DfuError::Aborted`] once cancellation was requested.
    pub fn checkpoint(&self) -> DfuResult<()> {
        if self.is_cancelled() {
            Err(DfuError::Aborted)
        } else {
            Ok(())
        }
    }
}
