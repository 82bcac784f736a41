//! Configuration constants and session settings for the BLE DFU engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// Nordic legacy DFU service.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// DFU Control Point characteristic (write + notify).
pub const DFU_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);

/// DFU Packet characteristic (write without response).
pub const DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

/// Buttonless DFU characteristic exposed by the application firmware.
pub const BUTTONLESS_DFU_UUID: Uuid = Uuid::from_u128(0x8ec90003_f315_4f60_9fb8_838830daea50);

/// Nordic buttonless DFU service (16-bit UUID 0xFE59) holding that characteristic.
pub const BUTTONLESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe59_0000_1000_8000_00805f9b34fb);

// ============================================================================
// Link Layer
// ============================================================================

/// Minimum ATT MTU every BLE link supports.
pub const MIN_MTU: usize = 23;

/// Largest ATT MTU we ever request.
pub const MAX_MTU: usize = 517;

/// ATT write header (opcode + handle) subtracted from the MTU.
pub const ATT_HEADER_SIZE: usize = 3;

// ============================================================================
// Timeouts
// ============================================================================

/// Default timeout for establishing a connection (including discovery).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for an MTU exchange.
pub const DEFAULT_MTU_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout waiting for a response or packet receipt notification.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Time the peer needs to reboot into (or out of) the bootloader.
pub const DEFAULT_REBOOT_DELAY: Duration = Duration::from_millis(1000);

/// Delay before the completion notification is dismissed.
pub const DEFAULT_DISMISS_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Control Point Opcodes (Legacy DFU)
// ============================================================================

/// Legacy DFU control point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Start DFU with image type; sizes follow on the packet characteristic
    StartDfu = 0x01,
    /// Initialize DFU parameters (init packet framing)
    InitDfuParams = 0x02,
    /// Receive firmware image (data follows on the packet characteristic)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset
    SystemReset = 0x06,
    /// Report received image size and CRC
    ReportReceipt = 0x07,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response from bootloader
    Response = 0x10,
    /// Packet receipt notification from bootloader
    PacketReceiptNotification = 0x11,
}


/// Buttonless DFU opcodes.
pub const BUTTONLESS_ENTER_BOOTLOADER: u8 = 0x01;

/// Buttonless response opcode.
pub const BUTTONLESS_RESPONSE: u8 = 0x20;

/// DFU image type (what firmware component is being updated).
///
/// Sent as a single byte in the StartDfu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
pub enum DfuImageType {
    Softdevice = 0x01,
    Bootloader = 0x02,
    SoftdeviceBootloader = 0x03,
    Application = 0x04,
}

impl DfuImageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuImageType::Softdevice),
            0x02 => Some(DfuImageType::Bootloader),
            0x03 => Some(DfuImageType::SoftdeviceBootloader),
            0x04 => Some(DfuImageType::Application),
            _ => None,
        }
    }

    /// Manifest key for this image type.
    pub fn manifest_key(&self) -> &'static str {
        match self {
            DfuImageType::Softdevice => "softdevice",
            DfuImageType::Bootloader => "bootloader",
            DfuImageType::SoftdeviceBootloader => "softdevice_bootloader",
            DfuImageType::Application => "application",
        }
    }
}

/// DFU response status codes from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl DfuResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuResponseStatus::Success),
            0x02 => Some(DfuResponseStatus::InvalidState),
            0x03 => Some(DfuResponseStatus::NotSupported),
            0x04 => Some(DfuResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(DfuResponseStatus::CrcError),
            0x06 => Some(DfuResponseStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResponseStatus::Success => "Operation successful",
            DfuResponseStatus::InvalidState => "Invalid state for this operation",
            DfuResponseStatus::NotSupported => "Operation not supported",
            DfuResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            DfuResponseStatus::CrcError => "CRC validation failed",
            DfuResponseStatus::OperationFailed => "Operation failed",
        }
    }
}

// ============================================================================
// Session Settings
// ============================================================================

/// Independently configurable timeouts for one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Connection establishment, including service discovery.
    #[serde(with = "millis")]
    pub connect: Duration,
    /// MTU exchange.
    #[serde(with = "millis")]
    pub mtu: Duration,
    /// Any response or packet receipt notification.
    #[serde(with = "millis")]
    pub ack: Duration,
    /// Pause after the peer reboots before reconnecting.
    #[serde(with = "millis")]
    pub reboot_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            mtu: DEFAULT_MTU_TIMEOUT,
            ack: DEFAULT_ACK_TIMEOUT,
            reboot_delay: DEFAULT_REBOOT_DELAY,
        }
    }
}

/// Settings for one DFU session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub target_address: String,
    pub device_name: Option<String>,
    pub retry_count: u32,
    /// Packets per receipt notification; never zero.
    pub prn_interval: u16,
    pub mtu_negotiation_enabled: bool,
    pub preferred_mtu: usize,
    pub keep_bond: bool,
    pub timeouts: Timeouts,
}

impl SessionConfig {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
            device_name: None,
            retry_count: 0,
            prn_interval: 1,
            mtu_negotiation_enabled: false,
            preferred_mtu: MIN_MTU,
            keep_bond: false,
            timeouts: Timeouts::default(),
        }
    }

    /// Set the PRN interval. Zero disables nothing: it is treated as one,
    /// so every packet is acknowledged.
    pub fn with_prn_interval(mut self, prn: i64) -> Self {
        self.prn_interval = normalize_prn(prn);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_mtu(mut self, preferred: Option<usize>) -> Self {
        match preferred {
            Some(mtu) => {
                self.mtu_negotiation_enabled = true;
                self.preferred_mtu = mtu.clamp(MIN_MTU, MAX_MTU);
            }
            None => {
                self.mtu_negotiation_enabled = false;
                self.preferred_mtu = MIN_MTU;
            }
        }
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Normalize a caller-supplied PRN value into a usable interval.
pub fn normalize_prn(prn: i64) -> u16 {
    prn.clamp(1, u16::MAX as i64) as u16
}

/// Packet payload size for a given ATT MTU.
pub fn packet_size_for_mtu(mtu: usize) -> usize {
    mtu.max(MIN_MTU) - ATT_HEADER_SIZE
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
