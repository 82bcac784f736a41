//! Legacy DFU control point protocol.
//!
//! Drives one bootloader through the command sequence for a firmware part:
//! 1. StartDfu + image sizes
//! 2. InitDfuParams (init packet), when the part carries one
//! 3. Packet receipt notification interval
//! 4. ReceiveFirmwareImage followed by the image packets
//! 5. ReportReceipt, Validate, ActivateAndReset

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::cancel::CancelToken;
use super::config::{DfuOpcode, DfuResponseStatus, BUTTONLESS_ENTER_BOOTLOADER};
use super::error::{DfuError, DfuResult, StreamError, WriteError};
use super::firmware_reader::FirmwarePart;
use super::packet::{
    build_command, build_enter_bootloader, build_image_sizes, build_init_params_complete,
    build_init_params_start, build_prn_request, build_start_dfu, packets, parse_buttonless_response,
    parse_prn, DfuResponse,
};
use super::transport::{BleTransport, DfuCharacteristic, Notification, TransportSession};

/// Control point protocol handler.
///
/// Every write is preceded by a cancellation check and every wait is followed
/// by one, so an abort request is honored at the next suspension point.
pub struct DfuProtocol<T: BleTransport> {
    session: TransportSession<T>,
    cancel: CancelToken,
    ack_timeout: Duration,
}

impl<T: BleTransport> DfuProtocol<T> {
    pub fn new(session: TransportSession<T>, cancel: CancelToken, ack_timeout: Duration) -> Self {
        Self {
            session,
            cancel,
            ack_timeout,
        }
    }

    pub fn session(&self) -> &TransportSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut TransportSession<T> {
        &mut self.session
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn write_control(&mut self, data: &[u8]) -> DfuResult<()> {
        self.cancel.checkpoint()?;
        trace!(command = ?data, "Control point write");
        self.session.write_control(data)
    }

    /// Write one image packet.
    pub fn write_packet(&mut self, data: &[u8]) -> DfuResult<()> {
        self.cancel.checkpoint()?;
        self.session.write_chunk(data)
    }

    /// Wait for the first notification `accept` recognises.
    ///
    /// Notifications it does not recognise are discarded. Fails with
    /// [`StreamError::AckTimeout`] when the acknowledgement timeout elapses.
    fn wait_for<R>(
        &mut self,
        what: &'static str,
        mut accept: impl FnMut(&Notification) -> Option<DfuResult<R>>,
    ) -> DfuResult<R> {
        let deadline = Instant::now() + self.ack_timeout;

        loop {
            self.cancel.checkpoint()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(waiting_for = what, "Acknowledgement timed out");
                return Err(StreamError::AckTimeout.into());
            }

            let Some(notification) = self.session.wait_notification(remaining)? else {
                continue;
            };

            match accept(&notification) {
                Some(result) => {
                    self.cancel.checkpoint()?;
                    return result;
                }
                None => trace!(
                    waiting_for = what,
                    value = ?notification.value,
                    "Ignoring unrelated notification"
                ),
            }
        }
    }

    /// Wait for the response to `opcode`, failing on a non-success status.
    fn wait_response(&mut self, opcode: DfuOpcode) -> DfuResult<DfuResponse> {
        let response = self.wait_for("response", |n| {
            if n.characteristic != DfuCharacteristic::ControlPoint
                || n.value.first() != Some(&(DfuOpcode::Response as u8))
            {
                return None;
            }
            match DfuResponse::parse(&n.value) {
                Ok(r) if r.request == opcode as u8 => Some(Ok(r)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })?;

        if let Some(message) = response.error_message() {
            debug!(%message, "Peer rejected command");
            return Err(WriteError::PeerRejected {
                opcode: response.request,
                status: response.status,
            }
            .into());
        }
        Ok(response)
    }

    /// Ask the application to reboot into the bootloader.
    ///
    /// The peer answers on the buttonless characteristic and then drops the
    /// link on its own.
    pub fn enter_bootloader(&mut self) -> DfuResult<()> {
        self.cancel.checkpoint()?;
        self.session.write_buttonless(&build_enter_bootloader())?;

        let status = self.wait_for("buttonless response", |n| {
            (n.characteristic == DfuCharacteristic::Buttonless)
                .then(|| parse_buttonless_response(&n.value))
        })?;

        if status != DfuResponseStatus::Success as u8 {
            return Err(WriteError::PeerRejected {
                opcode: BUTTONLESS_ENTER_BOOTLOADER,
                status,
            }
            .into());
        }
        Ok(())
    }

    /// Announce the part and its sizes; the peer erases flash before answering.
    pub fn start_dfu(&mut self, part: &FirmwarePart) -> DfuResult<()> {
        self.write_control(&build_start_dfu(part.kind))?;
        self.write_packet(&build_image_sizes(part.image_sizes()))?;
        self.wait_response(DfuOpcode::StartDfu)?;
        Ok(())
    }

    /// Transfer the init packet framed by InitDfuParams commands.
    pub fn send_init_packet(&mut self, init: &[u8]) -> DfuResult<()> {
        self.write_control(&build_init_params_start())?;
        let packet_size = self.session.packet_size();
        for chunk in packets(init, packet_size) {
            self.write_packet(chunk)?;
        }
        self.write_control(&build_init_params_complete())?;
        self.wait_response(DfuOpcode::InitDfuParams)?;
        Ok(())
    }

    /// Request a receipt notification every `interval` packets.
    pub fn set_prn(&mut self, interval: u16) -> DfuResult<()> {
        self.write_control(&build_prn_request(interval))
    }

    /// Tell the bootloader that image packets follow.
    pub fn receive_firmware_image(&mut self) -> DfuResult<()> {
        self.write_control(&build_command(DfuOpcode::ReceiveFirmwareImage))
    }

    /// Wait for the next packet receipt notification.
    ///
    /// # Returns
    /// Number of image bytes the peer has received.
    pub fn wait_prn(&mut self) -> DfuResult<u32> {
        self.wait_for("packet receipt", |n| {
            if n.characteristic != DfuCharacteristic::ControlPoint {
                return None;
            }
            match n.value.first().copied() {
                Some(op) if op == DfuOpcode::PacketReceiptNotification as u8 => {
                    Some(parse_prn(&n.value))
                }
                // A failed receive is reported instead of the next receipt.
                Some(op) if op == DfuOpcode::Response as u8 => {
                    let r = DfuResponse::parse(&n.value).ok()?;
                    let receive_failed =
                        r.request == DfuOpcode::ReceiveFirmwareImage as u8 && !r.is_success();
                    receive_failed.then(|| {
                        Err(WriteError::PeerRejected {
                            opcode: r.request,
                            status: r.status,
                        }
                        .into())
                    })
                }
                _ => None,
            }
        })
    }

    /// Ask the peer how much it received and the CRC16 of it.
    pub fn report_receipt(&mut self) -> DfuResult<(u32, u16)> {
        self.write_control(&build_command(DfuOpcode::ReportReceipt))?;
        self.wait_response(DfuOpcode::ReportReceipt)?.receipt()
    }

    /// Ask the peer to validate the image.
    ///
    /// A CRC error status means the image the peer holds does not match
    /// `expected_crc`; `reported_crc` is what the peer reported for it.
    pub fn validate(&mut self, expected_crc: u16, reported_crc: u16) -> DfuResult<()> {
        self.write_control(&build_command(DfuOpcode::ValidateFirmware))?;
        match self.wait_response(DfuOpcode::ValidateFirmware) {
            Err(DfuError::Write(WriteError::PeerRejected { status, .. }))
                if status == DfuResponseStatus::CrcError as u8 =>
            {
                Err(StreamError::CrcMismatch {
                    expected: expected_crc,
                    actual: reported_crc,
                }
                .into())
            }
            other => other.map(|_| ()),
        }
    }

    /// Activate the image. The peer resets without answering.
    pub fn activate_and_reset(&mut self) -> DfuResult<()> {
        self.write_control(&build_command(DfuOpcode::ActivateAndReset))?;
        self.session.mark_disconnected();
        Ok(())
    }

    /// Best-effort reset of the bootloader, used when a session is aborted.
    pub fn reset(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        if let Err(e) = self.session.write_control(&build_command(DfuOpcode::SystemReset)) {
            debug!(error = %e, "Reset command not delivered");
        }
    }
}
