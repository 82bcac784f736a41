//! BLE transport layer for DFU communication.
//!
//! Provides a trait-based abstraction over the GATT client, enabling both a
//! real radio stack and simulated peripherals in tests. [`TransportSession`]
//! owns the connection lifecycle on top of it.

use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{
    packet_size_for_mtu, Timeouts, BUTTONLESS_DFU_UUID, BUTTONLESS_SERVICE_UUID,
    DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID, DFU_SERVICE_UUID, MIN_MTU,
};
use super::error::{ConnectError, DfuError, DfuResult, WriteError};

/// Firmware running on the peer when the connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Application exposing the buttonless DFU characteristic.
    Application,
    /// Bootloader exposing the DFU service.
    Bootloader,
}

/// Characteristics the engine writes to or receives notifications from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuCharacteristic {
    ControlPoint,
    Packet,
    Buttonless,
}

impl DfuCharacteristic {
    pub fn uuid(&self) -> Uuid {
        match self {
            DfuCharacteristic::ControlPoint => DFU_CONTROL_POINT_UUID,
            DfuCharacteristic::Packet => DFU_PACKET_UUID,
            DfuCharacteristic::Buttonless => BUTTONLESS_DFU_UUID,
        }
    }

    /// Service the characteristic is discovered under.
    pub fn service(&self) -> Uuid {
        match self {
            DfuCharacteristic::ControlPoint | DfuCharacteristic::Packet => DFU_SERVICE_UUID,
            DfuCharacteristic::Buttonless => BUTTONLESS_SERVICE_UUID,
        }
    }
}

/// A value notified by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: DfuCharacteristic,
    pub value: Vec<u8>,
}

impl Notification {
    pub fn new(characteristic: DfuCharacteristic, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
        }
    }
}

/// Trait for BLE GATT operations used by the DFU engine.
///
/// Every call blocks until it completes or its timeout elapses. Implementations
/// report a dropped link as [`ConnectError::LinkLost`] and a peer without the
/// DFU service or buttonless characteristic as [`DfuError::ServiceNotFound`].
#[cfg_attr(test, automock)]
pub trait BleTransport: Send {
    /// Connect, discover services and enable notifications.
    fn connect(&mut self, address: &str, timeout: Duration) -> DfuResult<DeviceMode>;

    /// Request an ATT MTU. Returns the MTU agreed by the peer.
    fn request_mtu(&mut self, preferred: usize, timeout: Duration) -> DfuResult<usize>;

    /// Write a value to a characteristic.
    fn write(&mut self, characteristic: DfuCharacteristic, data: &[u8]) -> DfuResult<()>;

    /// Wait for the next notification.
    ///
    /// # Returns
    /// `None` when nothing arrived within `timeout`.
    fn read_notification(&mut self, timeout: Duration) -> DfuResult<Option<Notification>>;

    /// Drop the connection. Never fails.
    fn disconnect(&mut self);
}

/// Creates one transport per session.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: BleTransport + 'static;

    fn open(&self, address: &str) -> DfuResult<Self::Transport>;
}

/// Connection lifecycle for one DFU session.
pub struct TransportSession<T: BleTransport> {
    transport: T,
    timeouts: Timeouts,
    connected: bool,
    mtu: usize,
}

impl<T: BleTransport> TransportSession<T> {
    pub fn new(transport: T, timeouts: Timeouts) -> Self {
        Self {
            transport,
            timeouts,
            connected: false,
            mtu: MIN_MTU,
        }
    }

    /// Connect to `address`, bounded by the connect timeout.
    pub fn connect(&mut self, address: &str) -> DfuResult<DeviceMode> {
        if self.connected {
            self.transport.disconnect();
            self.connected = false;
        }
        self.mtu = MIN_MTU;

        let started = Instant::now();
        let mode = self.transport.connect(address, self.timeouts.connect)?;

        // A transport that returns late still counts as a timeout.
        if started.elapsed() > self.timeouts.connect {
            self.transport.disconnect();
            return Err(ConnectError::Timeout {
                operation: "connect",
            }
            .into());
        }

        debug!(address, ?mode, "Connected");
        self.connected = true;
        Ok(mode)
    }

    /// Negotiate the MTU. Best effort: any failure falls back to the minimum.
    pub fn negotiate_mtu(&mut self, enabled: bool, preferred: usize) -> usize {
        self.mtu = MIN_MTU;
        if !enabled || !self.connected {
            return self.mtu;
        }

        match self.transport.request_mtu(preferred, self.timeouts.mtu) {
            Ok(agreed) => {
                self.mtu = agreed.clamp(MIN_MTU, preferred.max(MIN_MTU));
                debug!(requested = preferred, agreed = self.mtu, "MTU negotiated");
            }
            Err(e) => {
                warn!(error = %e, "MTU request failed, using {} bytes", MIN_MTU);
            }
        }
        self.mtu
    }

    /// Write an image packet to the Packet characteristic.
    pub fn write_chunk(&mut self, data: &[u8]) -> DfuResult<()> {
        self.write(DfuCharacteristic::Packet, data)
    }

    /// Write a command to the Control Point characteristic.
    pub fn write_control(&mut self, data: &[u8]) -> DfuResult<()> {
        self.write(DfuCharacteristic::ControlPoint, data)
    }

    /// Write to the buttonless DFU characteristic.
    pub fn write_buttonless(&mut self, data: &[u8]) -> DfuResult<()> {
        self.write(DfuCharacteristic::Buttonless, data)
    }

    fn write(&mut self, characteristic: DfuCharacteristic, data: &[u8]) -> DfuResult<()> {
        if !self.connected {
            return Err(WriteError::NotConnected.into());
        }
        self.transport
            .write(characteristic, data)
            .map_err(|e| self.track_link(e))
    }

    /// Wait up to `timeout` for a notification.
    pub fn wait_notification(&mut self, timeout: Duration) -> DfuResult<Option<Notification>> {
        if !self.connected {
            return Err(ConnectError::LinkLost.into());
        }
        self.transport
            .read_notification(timeout)
            .map_err(|e| self.track_link(e))
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            debug!("Disconnecting");
        }
        self.transport.disconnect();
        self.connected = false;
    }

    /// Mark the link as down after the peer rebooted on its own.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Largest image packet for the current MTU.
    pub fn packet_size(&self) -> usize {
        packet_size_for_mtu(self.mtu)
    }

    fn track_link(&mut self, error: DfuError) -> DfuError {
        if error.is_link_loss() {
            self.connected = false;
        }
        error
    }
}
