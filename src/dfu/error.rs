//! DFU error types for the BLE firmware update engine.

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Code reported to the caller when a session is aborted.
pub const ERROR_ABORTED: u32 = 2;
/// Link lost, or retries exhausted after repeated link loss.
pub const ERROR_DEVICE_DISCONNECTED: u32 = 0x1000;
pub const ERROR_FILE_NOT_FOUND: u32 = 0x1001;
pub const ERROR_FILE_ERROR: u32 = 0x1002;
pub const ERROR_FILE_INVALID: u32 = 0x1003;
pub const ERROR_SERVICE_NOT_FOUND: u32 = 0x1006;
pub const ERROR_INVALID_RESPONSE: u32 = 0x1008;
pub const ERROR_FILE_TYPE_UNSUPPORTED: u32 = 0x1009;
pub const ERROR_FILE_SIZE_INVALID: u32 = 0x100C;
pub const ERROR_CRC_ERROR: u32 = 0x100D;
pub const ERROR_SESSION_BUSY: u32 = 0x1010;
pub const ERROR_INTERNAL: u32 = 0x1011;
/// Remote errors carry the peer's status byte in the low bits.
pub const ERROR_REMOTE_MASK: u32 = 0x2000;
/// Connection errors carry a GATT status in the low bits.
pub const ERROR_CONNECTION_MASK: u32 = 0x8000;

const GATT_CONN_TIMEOUT: u32 = 0x08;
const GATT_ERROR: u32 = 0x85;

/// Firmware package parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unsupported firmware format: {reason}")]
    UnsupportedFormat { reason: String },

    #[error("Corrupt firmware archive: {reason}")]
    CorruptArchive { reason: String },

    #[error("Firmware image is empty")]
    EmptyImage,
}

/// Connection lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Connection or MTU exchange did not complete within its bound.
    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    /// The link dropped unexpectedly.
    #[error("Link lost")]
    LinkLost,

    /// The peer or radio stack refused the connection.
    #[error("Connection rejected: {reason}")]
    Rejected { reason: String },
}

/// Write failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("Not connected")]
    NotConnected,

    /// The bootloader answered a command with a non-success status.
    #[error("Peer rejected opcode 0x{opcode:02X} with status 0x{status:02X}")]
    PeerRejected { opcode: u8, status: u8 },
}

/// Packet streaming failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Timeout waiting for acknowledgement")]
    AckTimeout,

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The peer's receipt count disagrees with what was sent.
    #[error("Receipt mismatch: sent {expected} bytes, peer reports {actual}")]
    ReceiptMismatch { expected: u32, actual: u32 },
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error while reading the image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A notification could not be decoded or answered the wrong request.
    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// The peer exposes neither the DFU service nor the buttonless characteristic.
    #[error("DFU service not found on {address}")]
    ServiceNotFound { address: String },

    /// A session is already running for this address.
    #[error("A DFU session is already running for {address}")]
    Busy { address: String },

    /// Operation was cancelled by user.
    #[error("DFU ABORTED")]
    Aborted,

    /// Maximum retry attempts exceeded.
    #[error("Max retries ({attempts}) exceeded: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DfuError>,
    },

    /// The session worker could not be scheduled.
    #[error("No async runtime available to run the session")]
    NoRuntime,
}

impl DfuError {
    /// Check if this error is retriable (transient link errors that may succeed
    /// after a reconnect).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::Connect(ConnectError::LinkLost)
                | DfuError::Connect(ConnectError::Timeout { .. })
                | DfuError::Write(WriteError::NotConnected)
                | DfuError::Stream(StreamError::AckTimeout)
        )
    }

    /// Whether this error means the link went down.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            DfuError::Connect(ConnectError::LinkLost) | DfuError::Write(WriteError::NotConnected)
        )
    }

    /// Numeric error code reported to the caller.
    pub fn error_code(&self) -> u32 {
        match self {
            DfuError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
            DfuError::Io(_) => ERROR_FILE_ERROR,
            DfuError::Parse(ParseError::UnsupportedFormat { .. }) => ERROR_FILE_TYPE_UNSUPPORTED,
            DfuError::Parse(ParseError::CorruptArchive { .. }) => ERROR_FILE_INVALID,
            DfuError::Parse(ParseError::EmptyImage) => ERROR_FILE_SIZE_INVALID,
            DfuError::Connect(ConnectError::LinkLost) => ERROR_DEVICE_DISCONNECTED,
            DfuError::Connect(ConnectError::Timeout { .. }) => {
                ERROR_CONNECTION_MASK | GATT_CONN_TIMEOUT
            }
            DfuError::Connect(ConnectError::Rejected { .. }) => ERROR_CONNECTION_MASK | GATT_ERROR,
            DfuError::Write(WriteError::NotConnected) => ERROR_DEVICE_DISCONNECTED,
            DfuError::Write(WriteError::PeerRejected { status, .. }) => {
                ERROR_REMOTE_MASK | *status as u32
            }
            DfuError::Stream(StreamError::AckTimeout) => ERROR_CONNECTION_MASK | GATT_CONN_TIMEOUT,
            DfuError::Stream(StreamError::CrcMismatch { .. }) => ERROR_CRC_ERROR,
            DfuError::Stream(StreamError::ReceiptMismatch { .. }) => ERROR_INVALID_RESPONSE,
            DfuError::InvalidResponse { .. } => ERROR_INVALID_RESPONSE,
            DfuError::ServiceNotFound { .. } => ERROR_SERVICE_NOT_FOUND,
            DfuError::Busy { .. } => ERROR_SESSION_BUSY,
            DfuError::Aborted => ERROR_ABORTED,
            DfuError::RetriesExhausted { .. } => ERROR_DEVICE_DISCONNECTED,
            DfuError::NoRuntime => ERROR_INTERNAL,
        }
    }

    pub(crate) fn invalid_response(reason: impl Into<String>) -> Self {
        DfuError::InvalidResponse {
            reason: reason.into(),
        }
    }
}
