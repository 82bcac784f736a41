//! Session registry and entry point for firmware transfers.
//!
//! Sessions are keyed by normalized device address; at most one runs per
//! device. Each session is a synchronous [`DfuStateMachine`] on a Tokio
//! blocking worker. The caller awaits its [`PendingTransfer`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::dfu::config::{millis, DEFAULT_DISMISS_DELAY};
use crate::dfu::{
    firmware_reader, normalize_address, CancelToken, CompletionSlot, DfuError, DfuEvent,
    DfuStateMachine, PendingTransfer, SessionConfig, Timeouts, TransferError, TransportFactory,
};
use crate::traits::DfuEventListener;

/// Settings shared by every session a manager starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    pub timeouts: Timeouts,
    /// How long after completion the dismissal event follows.
    #[serde(with = "millis")]
    pub dismiss_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            dismiss_delay: DEFAULT_DISMISS_DELAY,
        }
    }
}

/// Optional per-transfer settings, as sent by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartOptions {
    /// Reconnect budget for transient link failures. Defaults to none.
    pub retries: Option<u32>,
    /// Preferred ATT MTU. MTU negotiation is skipped when absent.
    pub max_mtu: Option<usize>,
    /// Reconnect to the bootloader at the application's address.
    pub keep_bond: Option<bool>,
}

/// One request to update a device.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub address: String,
    pub device_name: Option<String>,
    pub image_path: PathBuf,
    /// Packets per receipt notification. Values below one mean one.
    pub prn_value: i64,
    pub options: StartOptions,
}

impl StartRequest {
    pub fn new(address: impl Into<String>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            device_name: None,
            image_path: image_path.into(),
            prn_value: 0,
            options: StartOptions::default(),
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_prn(mut self, prn_value: i64) -> Self {
        self.prn_value = prn_value;
        self
    }

    pub fn with_options(mut self, options: StartOptions) -> Self {
        self.options = options;
        self
    }

    fn session_config(&self, timeouts: Timeouts) -> SessionConfig {
        let mut config = SessionConfig::new(self.address.clone())
            .with_prn_interval(self.prn_value)
            .with_retries(self.options.retries.unwrap_or(0))
            .with_mtu(self.options.max_mtu)
            .with_timeouts(timeouts);
        config.device_name = self.device_name.clone();
        config.keep_bond = self.options.keep_bond.unwrap_or(false);
        config
    }
}

/// Scheduled dismissal, tagged so a finished task only removes itself.
struct Followup {
    id: u64,
    handle: AbortHandle,
}

/// State shared between the manager and the sessions it started.
struct Registry {
    listener: Arc<dyn DfuEventListener>,
    sessions: Mutex<HashMap<String, CancelToken>>,
    followups: Mutex<HashMap<String, Followup>>,
    next_followup: AtomicU64,
}

impl Registry {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelToken>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn followups(&self) -> std::sync::MutexGuard<'_, HashMap<String, Followup>> {
        self.followups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_followup(&self, key: &str) {
        if let Some(followup) = self.followups().remove(key) {
            debug!(device = %key, "Cancelling pending notification dismissal");
            followup.handle.abort();
        }
    }

    /// Emit [`DfuEvent::NotificationDismissed`] after `delay`, unless cancelled first.
    fn schedule_dismissal(
        self: &Arc<Self>,
        runtime: &Handle,
        key: String,
        address: String,
        delay: Duration,
    ) {
        let id = self.next_followup.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);
        let task_key = key.clone();

        // Held across spawn and insert so the task never sees a stale entry.
        let mut followups = self.followups();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut followups = registry.followups();
                match followups.get(&task_key) {
                    Some(followup) if followup.id == id => {
                        followups.remove(&task_key);
                    }
                    _ => return,
                }
            }
            registry
                .listener
                .on_event(DfuEvent::NotificationDismissed {
                    device_address: address,
                });
        });

        let previous = followups.insert(
            key,
            Followup {
                id,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }
}

/// Runs firmware transfers, one session per device.
pub struct DfuManager<F: TransportFactory> {
    factory: Arc<F>,
    config: ManagerConfig,
    registry: Arc<Registry>,
}

impl<F: TransportFactory> Clone for DfuManager<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            config: self.config,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<F: TransportFactory> DfuManager<F> {
    pub fn new(factory: F, listener: Arc<dyn DfuEventListener>) -> Self {
        Self::with_config(factory, listener, ManagerConfig::default())
    }

    pub fn with_config(
        factory: F,
        listener: Arc<dyn DfuEventListener>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            config,
            registry: Arc::new(Registry {
                listener,
                sessions: Mutex::new(HashMap::new()),
                followups: Mutex::new(HashMap::new()),
                next_followup: AtomicU64::new(0),
            }),
        }
    }

    /// Start updating `request.address` with the image at `request.image_path`.
    ///
    /// Fails without contacting the device when the image cannot be parsed,
    /// when a session for the same device is already running, or when called
    /// outside a Tokio runtime. Otherwise the returned future settles once the
    /// session reaches a terminal state.
    pub fn start_transfer(&self, request: StartRequest) -> Result<PendingTransfer, TransferError> {
        let runtime = Handle::try_current().map_err(|_| TransferError::from(DfuError::NoRuntime))?;

        let package = firmware_reader::parse(&request.image_path).map_err(|e| {
            warn!(path = %request.image_path.display(), error = %e, "Rejecting firmware image");
            TransferError::from(e)
        })?;

        let key = normalize_address(&request.address);
        let cancel = CancelToken::new();
        {
            let mut sessions = self.registry.sessions();
            if sessions.contains_key(&key) {
                warn!(device = %request.address, "DFU session already running");
                return Err(DfuError::Busy {
                    address: request.address,
                }
                .into());
            }
            sessions.insert(key.clone(), cancel.clone());
        }
        self.registry.cancel_followup(&key);

        let transport = match self.factory.open(&request.address) {
            Ok(transport) => transport,
            Err(e) => {
                self.registry.sessions().remove(&key);
                return Err(e.into());
            }
        };

        let config = request.session_config(self.config.timeouts);
        let (slot, pending) = CompletionSlot::new();
        let slot = {
            let registry = Arc::clone(&self.registry);
            let runtime = runtime.clone();
            let address = request.address.clone();
            let dismiss_delay = self.config.dismiss_delay;
            slot.on_release(move |completed| {
                // The dismissal is registered before the device is released,
                // so the next start for it always finds and cancels it.
                let mut sessions = registry.sessions();
                if completed {
                    registry.schedule_dismissal(&runtime, key.clone(), address, dismiss_delay);
                }
                sessions.remove(&key);
            })
        };

        info!(
            device = %request.address,
            path = %request.image_path.display(),
            "Scheduling DFU session"
        );

        let machine = DfuStateMachine::new(
            config,
            package,
            transport,
            Arc::clone(&self.registry.listener),
            cancel,
            slot,
        );
        // Detached: the completion slot reports the outcome.
        drop(runtime.spawn_blocking(move || machine.run()));

        Ok(pending)
    }

    /// Request cancellation of the session for `address`.
    ///
    /// Returns `false` when no session is running for it.
    pub fn abort(&self, address: &str) -> bool {
        let key = normalize_address(address);
        match self.registry.sessions().get(&key) {
            Some(cancel) => {
                info!(device = %address, "Aborting DFU session");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.registry
            .sessions()
            .contains_key(&normalize_address(address))
    }

    /// Normalized addresses of all running sessions, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.sessions().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Abort every running session and drop pending dismissals.
    pub fn shutdown(&self) {
        let aborted = {
            let sessions = self.registry.sessions();
            for cancel in sessions.values() {
                cancel.cancel();
            }
            sessions.len()
        };

        let followups: Vec<Followup> = self.registry.followups().drain().map(|(_, f)| f).collect();
        for followup in &followups {
            followup.handle.abort();
        }

        info!(
            sessions = aborted,
            followups = followups.len(),
            "DFU manager shut down"
        );
    }
}
