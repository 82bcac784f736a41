//! Failure classification and retry budget.

use tracing::{info, warn};

use super::error::{DfuError, DfuResult};

/// Session step during which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    /// Buttonless jump into the bootloader.
    EnableDfuMode,
    Transfer,
}

/// What to do about a failure that is not escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The link loss is the peer rebooting as asked. No budget consumed.
    Expected,
    /// Reconnect and restart the step. `attempt` is 1-based.
    Retry { attempt: u32 },
}

/// Decides between expected, retryable and fatal failures.
#[derive(Debug, Clone)]
pub struct RecoveryController {
    budget: u32,
    used: u32,
}

impl RecoveryController {
    pub fn new(budget: u32) -> Self {
        Self { budget, used: 0 }
    }

    /// Classify `error` raised during `step`.
    ///
    /// # Returns
    /// The recovery to apply, or the error that ends the session: fatal
    /// errors unchanged, retryable ones as [`DfuError::RetriesExhausted`]
    /// once the budget is spent.
    pub fn decide(&mut self, step: Step, error: DfuError) -> DfuResult<Recovery> {
        if step == Step::EnableDfuMode && error.is_link_loss() {
            info!("Link dropped while entering bootloader, peer is rebooting");
            return Ok(Recovery::Expected);
        }

        if !error.is_retriable() {
            return Err(error);
        }

        if self.used >= self.budget {
            warn!(attempts = self.used, error = %error, "Retry budget exhausted");
            return Err(DfuError::RetriesExhausted {
                attempts: self.used,
                last: Box::new(error),
            });
        }

        self.used += 1;
        warn!(
            ?step,
            attempt = self.used,
            budget = self.budget,
            error = %error,
            "Retrying after transient failure"
        );
        Ok(Recovery::Retry { attempt: self.used })
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.budget - self.used
    }
}
