//! Nordic legacy DFU (Device Firmware Update) engine over BLE.
//!
//! # Protocol Overview
//!
//! A session consists of:
//! 1. **Connect** - Connect to the target and discover the DFU service
//! 2. **Bootloader Entry** - Applications are asked to reboot into the
//!    bootloader through the buttonless DFU characteristic
//! 3. **Per Part** - StartDfu, init packet, image packets acknowledged by
//!    packet receipt notifications, receipt report
//! 4. **Validation** - The bootloader checks the image CRC
//! 5. **Activation** - The bootloader applies the part and resets
//!
//! # Example
//!
//! ```ignore
//! use ble_dfu::dfu::{
//!     firmware_reader, CancelToken, CompletionSlot, DfuStateMachine, SessionConfig,
//! };
//!
//! let package = firmware_reader::parse("firmware.zip")?;
//! let config = SessionConfig::new("C0:FF:EE:00:00:10").with_prn_interval(12);
//! let (slot, pending) = CompletionSlot::new();
//! let cancel = CancelToken::new();
//! let machine = DfuStateMachine::new(config, package, transport, listener, cancel, slot);
//! let state = machine.run();
//! ```

mod cancel;
mod completion;
pub mod config;
mod device;
pub mod error;
mod events;
pub mod firmware_reader;
mod hex;
mod packet;
mod protocol;
mod recovery;
mod state_machine;
mod streamer;
mod transport;

pub use cancel::CancelToken;
pub use completion::{
    CompletionSlot, PendingTransfer, TransferError, TransferOutcome, TransferResult,
};
pub use config::{DfuImageType, SessionConfig, Timeouts};
pub use device::{display_label, normalize_address, DeviceAddress};
pub use error::{ConnectError, DfuError, DfuResult, ParseError, StreamError, WriteError};
pub use events::{DfuEvent, SessionState};
pub use firmware_reader::{FirmwarePackage, FirmwarePart};
pub use recovery::{Recovery, RecoveryController, Step};
pub use state_machine::DfuStateMachine;
pub use streamer::{StreamResult, TransferProgress};
pub use transport::{
    BleTransport, DeviceMode, DfuCharacteristic, Notification, TransportFactory, TransportSession,
};

#[cfg(test)]
pub use transport::MockBleTransport;
