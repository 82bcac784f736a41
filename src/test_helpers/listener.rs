use std::sync::Mutex;

use crate::dfu::{DfuEvent, SessionState};
use crate::traits::DfuEventListener;

/// Listener that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<DfuEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DfuEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn percents(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DfuEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }

    /// `(current_part, parts_total)` of every progress event.
    pub fn progress_parts(&self) -> Vec<(usize, usize)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DfuEvent::Progress {
                    current_part,
                    parts_total,
                    ..
                } => Some((current_part, parts_total)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    pub fn count_state(&self, state: &SessionState) -> usize {
        self.states().iter().filter(|s| *s == state).count()
    }
}

impl DfuEventListener for RecordingListener {
    fn on_event(&self, event: DfuEvent) {
        self.events.lock().unwrap().push(event);
    }
}
