use crate::dfu::DfuEvent;

#[cfg(test)]
use mockall::automock;

/// Receives every event a session emits.
///
/// Called from the session's worker thread, so implementations must not
/// block for long.
#[cfg_attr(test, automock)]
pub trait DfuEventListener: Send + Sync {
    fn on_event(&self, event: DfuEvent);
}

impl<F> DfuEventListener for F
where
    F: Fn(DfuEvent) + Send + Sync,
{
    fn on_event(&self, event: DfuEvent) {
        self(event)
    }
}
