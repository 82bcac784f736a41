//! DFU session sequencing.
//!
//! ```text
//! Idle -> Connecting -(application)-> EnablingDfuMode -> Connecting
//!      -> per part: Starting -> Validating -> (reboot) Connecting
//!      -> Disconnecting -> Completed
//! ```
//!
//! Any state may end in `Failed` or `Aborted`. Transport failures are routed
//! through the [`RecoveryController`], which either retries the step on a
//! fresh connection or escalates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::completion::{CompletionSlot, TransferError};
use super::config::SessionConfig;
use super::device::{display_label, DeviceAddress};
use super::error::{DfuError, DfuResult};
use super::events::{DfuEvent, SessionState};
use super::firmware_reader::FirmwarePackage;
use super::protocol::DfuProtocol;
use super::recovery::{Recovery, RecoveryController, Step};
use super::streamer;
use super::transport::{BleTransport, DeviceMode, TransportSession};
use crate::traits::DfuEventListener;

/// Granularity of cancellable pauses.
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// One DFU session, from connect to a terminal state.
pub struct DfuStateMachine<T: BleTransport> {
    config: SessionConfig,
    package: Arc<FirmwarePackage>,
    protocol: DfuProtocol<T>,
    listener: Arc<dyn DfuEventListener>,
    recovery: RecoveryController,
    state: SessionState,
    /// Address the peer currently advertises under.
    current: DeviceAddress,
    completion: Option<CompletionSlot>,
}

impl<T: BleTransport> DfuStateMachine<T> {
    pub fn new(
        config: SessionConfig,
        package: FirmwarePackage,
        transport: T,
        listener: Arc<dyn DfuEventListener>,
        cancel: CancelToken,
        completion: CompletionSlot,
    ) -> Self {
        let session = TransportSession::new(transport, config.timeouts);
        let protocol = DfuProtocol::new(session, cancel, config.timeouts.ack);

        Self {
            current: DeviceAddress::parse(&config.target_address),
            recovery: RecoveryController::new(config.retry_count),
            package: Arc::new(package),
            protocol,
            listener,
            state: SessionState::Idle,
            completion: Some(completion),
            config,
        }
    }

    /// Drive the session to a terminal state and settle the completion.
    pub fn run(mut self) -> SessionState {
        let label = display_label(
            &self.config.target_address,
            self.config.device_name.as_deref(),
        );
        info!(
            device = %label,
            parts = self.package.parts().len(),
            bytes = self.package.total_size(),
            prn = self.config.prn_interval,
            retries = self.config.retry_count,
            "Starting DFU session"
        );

        let started = Instant::now();
        let result = self.execute();
        self.finish(result, started.elapsed());
        self.state
    }

    fn execute(&mut self) -> DfuResult<()> {
        let mode = self.run_step(Step::Connect, Self::connect)?;
        if mode == DeviceMode::Application {
            self.enable_dfu_mode()?;
        }

        let parts = self.package.parts().len();
        for index in 0..parts {
            if index > 0 {
                // Previous part was activated; the bootloader restarts.
                self.pause(self.config.timeouts.reboot_delay)?;
            }
            self.run_step(Step::Transfer, |machine| machine.transfer_part(index))?;
        }

        self.transition(SessionState::Disconnecting);
        self.protocol.session_mut().disconnect();
        Ok(())
    }

    /// Run `op`, retrying on a fresh connection while the recovery
    /// controller allows it.
    fn run_step<R>(
        &mut self,
        step: Step,
        mut op: impl FnMut(&mut Self) -> DfuResult<R>,
    ) -> DfuResult<R> {
        loop {
            let error = match op(self) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.recovery.decide(step, error)? {
                Recovery::Retry { attempt } => {
                    debug!(
                        attempt,
                        remaining = self.recovery.remaining(),
                        "Reconnecting for retry"
                    );
                    self.protocol.session_mut().disconnect();
                }
                // Only raised for the bootloader jump, which handles it itself.
                Recovery::Expected => {
                    self.protocol.session_mut().disconnect();
                }
            }
        }
    }

    fn connect(&mut self) -> DfuResult<DeviceMode> {
        self.protocol.cancel_token().checkpoint()?;
        self.transition(SessionState::Connecting);

        let address = self.current.to_string();
        let session = self.protocol.session_mut();
        let mode = session.connect(&address)?;
        let mtu = session.negotiate_mtu(
            self.config.mtu_negotiation_enabled,
            self.config.preferred_mtu,
        );

        info!(%address, ?mode, mtu, "Connected to peer");
        Ok(mode)
    }

    /// Ask the application to reboot into the bootloader and follow it.
    fn enable_dfu_mode(&mut self) -> DfuResult<()> {
        self.transition(SessionState::EnablingDfuMode);

        loop {
            let error = match self.protocol.enter_bootloader() {
                Ok(()) => break,
                Err(e) => e,
            };

            match self.recovery.decide(Step::EnableDfuMode, error)? {
                Recovery::Expected => break,
                Recovery::Retry { .. } => {
                    self.protocol.session_mut().disconnect();
                    if self.run_step(Step::Connect, Self::connect)? == DeviceMode::Bootloader {
                        info!("Peer already in bootloader mode");
                        return Ok(());
                    }
                    self.transition(SessionState::EnablingDfuMode);
                }
            }
        }

        self.protocol.session_mut().disconnect();
        self.current = self.current.bootloader_address(self.config.keep_bond);
        info!(bootloader = %self.current, "Peer rebooting into bootloader");
        self.pause(self.config.timeouts.reboot_delay)
    }

    fn transfer_part(&mut self, index: usize) -> DfuResult<()> {
        if !self.protocol.session().is_connected() && self.connect()? == DeviceMode::Application {
            return Err(DfuError::ServiceNotFound {
                address: self.current.to_string(),
            });
        }

        let package = self.package.clone();
        let part = &package.parts()[index];
        let total_parts = package.parts().len();
        let prn = self.config.prn_interval;

        self.transition(SessionState::Starting);
        info!(
            part = index + 1,
            total_parts,
            kind = ?part.kind,
            bytes = part.size_bytes(),
            "Transferring part"
        );

        self.protocol.start_dfu(part)?;
        if let Some(init) = &part.init_packet {
            self.protocol.send_init_packet(init)?;
        }
        self.protocol.set_prn(prn)?;
        self.protocol.receive_firmware_image()?;

        let listener = self.listener.clone();
        let address = self.config.target_address.clone();
        let on_progress = |progress| listener.on_event(DfuEvent::progress(&address, &progress));
        let result =
            streamer::stream(&mut self.protocol, part, prn, index, total_parts, on_progress)?;

        self.transition(SessionState::Validating);
        let expected = crc16::State::<crc16::CCITT_FALSE>::calculate(&part.payload);
        self.protocol.validate(expected, result.crc)?;
        self.protocol.activate_and_reset()?;
        self.protocol.session_mut().disconnect();

        info!(part = index + 1, "Part activated");
        Ok(())
    }

    /// Sleep for `duration`, waking early on abort.
    fn pause(&self, duration: Duration) -> DfuResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.protocol.cancel_token().checkpoint()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(PAUSE_SLICE));
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.name(), to = next.name(), "State transition");
        self.state = next.clone();
        self.listener
            .on_event(DfuEvent::state_changed(&self.config.target_address, next));
    }

    fn finish(&mut self, result: DfuResult<()>, elapsed: Duration) {
        let Some(completion) = self.completion.take() else {
            return;
        };

        match result {
            Ok(()) => {
                self.transition(SessionState::Completed);
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    retries = self.recovery.used(),
                    "DFU completed"
                );
                completion.resolve(self.config.target_address.clone());
            }
            Err(DfuError::Aborted) => {
                self.protocol.reset();
                self.protocol.session_mut().disconnect();
                self.transition(SessionState::Aborted);
                warn!("DFU aborted");
                completion.reject(TransferError::from(&DfuError::Aborted));
            }
            Err(e) => {
                self.protocol.session_mut().disconnect();
                let code = e.error_code();
                let message = e.to_string();
                error!(code, %message, "DFU failed");
                self.transition(SessionState::Failed {
                    code,
                    message: message.clone(),
                });
                completion.reject(TransferError::new(code, message));
            }
        }
    }
}
