//! BLE firmware update sessions for Nordic legacy DFU bootloaders.
//!
//! [`DfuManager`] is the entry point: it parses the firmware image, runs one
//! session per device on a blocking worker and reports progress through a
//! [`DfuEventListener`]. The radio itself is supplied by the caller through
//! [`TransportFactory`].

pub mod bridge;
pub mod dfu;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use bridge::{
    validate_firmware_package, DfuManager, ManagerConfig, PackageInfo, PartInfo, StartOptions,
    StartRequest,
};
pub use dfu::{
    BleTransport, DfuError, DfuEvent, PendingTransfer, SessionState, TransferError,
    TransferResult, TransportFactory,
};
pub use traits::DfuEventListener;
