//! Single-assignment completion handle shared with the caller.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use super::error::{DfuError, ERROR_INTERNAL};

/// Successful outcome of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub device_address: String,
}

/// Failed outcome of a transfer, in the string-coded form callers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message} (code {code})")]
pub struct TransferError {
    pub code: String,
    pub message: String,
}

impl TransferError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&DfuError> for TransferError {
    fn from(error: &DfuError) -> Self {
        Self::new(error.error_code(), error.to_string())
    }
}

impl From<DfuError> for TransferError {
    fn from(error: DfuError) -> Self {
        Self::from(&error)
    }
}

pub type TransferOutcome = Result<TransferResult, TransferError>;

type ReleaseHook = Box<dyn FnOnce(bool) + Send>;

/// Resolved or rejected exactly once; consumed by either.
///
/// The release hook runs before the outcome is delivered, so by the time the
/// caller observes completion the session is no longer registered.
pub struct CompletionSlot {
    sender: Option<oneshot::Sender<TransferOutcome>>,
    on_release: Option<ReleaseHook>,
}

impl CompletionSlot {
    pub fn new() -> (Self, PendingTransfer) {
        let (sender, receiver) = oneshot::channel();
        let slot = Self {
            sender: Some(sender),
            on_release: None,
        };
        (slot, PendingTransfer { receiver })
    }

    /// Run `hook(completed)` when the slot settles.
    pub fn on_release(mut self, hook: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn resolve(mut self, device_address: impl Into<String>) {
        self.settle(Ok(TransferResult {
            device_address: device_address.into(),
        }));
    }

    pub fn reject(mut self, error: TransferError) {
        self.settle(Err(error));
    }

    fn settle(&mut self, outcome: TransferOutcome) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        if let Some(hook) = self.on_release.take() {
            hook(outcome.is_ok());
        }
        // The caller may have dropped its handle; nothing left to notify.
        let _ = sender.send(outcome);
    }
}

impl Drop for CompletionSlot {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!("Session ended without settling its completion");
            self.settle(Err(TransferError::new(
                ERROR_INTERNAL,
                "Session ended without a result",
            )));
        }
    }
}

/// Future resolving to the outcome of one transfer.
#[derive(Debug)]
pub struct PendingTransfer {
    receiver: oneshot::Receiver<TransferOutcome>,
}

impl Future for PendingTransfer {
    type Output = TransferOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(TransferError::new(ERROR_INTERNAL, "Session dropped its completion"))
            })
        })
    }
}
