//! Session states and the events reported to the caller.

use serde::{Serialize, Serializer};

use super::streamer::TransferProgress;

/// Lifecycle state of one DFU session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    /// Application asked to jump into the bootloader.
    EnablingDfuMode,
    /// A firmware part is about to be transferred.
    Starting,
    Validating,
    Disconnecting,
    Completed,
    Aborted,
    Failed { code: u32, message: String },
}

impl SessionState {
    /// Wire name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::EnablingDfuMode => "ENABLING_DFU_MODE",
            SessionState::Starting => "DFU_PROCESS_STARTING",
            SessionState::Validating => "FIRMWARE_VALIDATING",
            SessionState::Disconnecting => "DEVICE_DISCONNECTING",
            SessionState::Completed => "DFU_COMPLETED",
            SessionState::Aborted => "DFU_ABORTED",
            SessionState::Failed { .. } => "DFU_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed { .. }
        )
    }

    /// Get a human-readable message for this state.
    pub fn message(&self) -> String {
        match self {
            SessionState::Idle => "Waiting to start".into(),
            SessionState::Connecting => "Connecting to device...".into(),
            SessionState::EnablingDfuMode => "Entering bootloader mode...".into(),
            SessionState::Starting => "Starting firmware transfer...".into(),
            SessionState::Validating => "Validating firmware...".into(),
            SessionState::Disconnecting => "Disconnecting...".into(),
            SessionState::Completed => "Update complete!".into(),
            SessionState::Aborted => "Update aborted".into(),
            SessionState::Failed { code, message } => {
                format!("Update failed: {} (code {})", message, code)
            }
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Notification emitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DfuEvent {
    /// Emitted at every state transition.
    #[serde(rename = "DFUStateChanged", rename_all = "camelCase")]
    StateChanged {
        state: SessionState,
        device_address: String,
    },

    /// Emitted after every acknowledged window.
    #[serde(rename = "DFUProgress", rename_all = "camelCase")]
    Progress {
        device_address: String,
        percent: u8,
        speed: f32,
        avg_speed: f32,
        current_part: usize,
        parts_total: usize,
    },

    /// The completion notification shown after a successful update expired.
    #[serde(rename = "DFUNotificationDismissed", rename_all = "camelCase")]
    NotificationDismissed { device_address: String },
}

impl DfuEvent {
    pub fn state_changed(device_address: &str, state: SessionState) -> Self {
        DfuEvent::StateChanged {
            state,
            device_address: device_address.to_string(),
        }
    }

    pub fn progress(device_address: &str, progress: &TransferProgress) -> Self {
        DfuEvent::Progress {
            device_address: device_address.to_string(),
            percent: progress.percent,
            speed: progress.speed,
            avg_speed: progress.avg_speed,
            current_part: progress.current_part,
            parts_total: progress.total_parts,
        }
    }

    /// Event name as seen by the caller.
    pub fn name(&self) -> &'static str {
        match self {
            DfuEvent::StateChanged { .. } => "DFUStateChanged",
            DfuEvent::Progress { .. } => "DFUProgress",
            DfuEvent::NotificationDismissed { .. } => "DFUNotificationDismissed",
        }
    }

    pub fn device_address(&self) -> &str {
        match self {
            DfuEvent::StateChanged { device_address, .. }
            | DfuEvent::Progress { device_address, .. }
            | DfuEvent::NotificationDismissed { device_address } => device_address,
        }
    }
}
