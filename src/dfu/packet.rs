//! Legacy DFU control point encoding.
//!
//! Commands are written to the Control Point characteristic, image data and
//! the start sizes to the Packet characteristic. Every multi-byte field is
//! little-endian.

use super::config::{
    DfuImageType, DfuOpcode, DfuResponseStatus, BUTTONLESS_ENTER_BOOTLOADER, BUTTONLESS_RESPONSE,
};
use super::error::{DfuError, DfuResult};

/// InitDfuParams sub-command: init packet bytes follow.
const INIT_PACKET_RECEIVE: u8 = 0x00;

/// InitDfuParams sub-command: init packet complete.
const INIT_PACKET_COMPLETE: u8 = 0x01;

// ============================================================================
// Command Builders
// ============================================================================

/// Build a StartDfu command: `[0x01, image_type]`.
pub fn build_start_dfu(image_type: DfuImageType) -> Vec<u8> {
    vec![DfuOpcode::StartDfu as u8, image_type as u8]
}

/// Build the image size packet sent after StartDfu: `[sd, bl, app]` as u32.
pub fn build_image_sizes(sizes: [u32; 3]) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    for size in sizes {
        data.extend_from_slice(&size.to_le_bytes());
    }
    data
}

/// Build the InitDfuParams command announcing init packet bytes.
pub fn build_init_params_start() -> Vec<u8> {
    vec![DfuOpcode::InitDfuParams as u8, INIT_PACKET_RECEIVE]
}

/// Build the InitDfuParams command closing the init packet.
pub fn build_init_params_complete() -> Vec<u8> {
    vec![DfuOpcode::InitDfuParams as u8, INIT_PACKET_COMPLETE]
}

/// Build a packet receipt notification request: `[0x08, n_lo, n_hi]`.
pub fn build_prn_request(interval: u16) -> Vec<u8> {
    let mut data = vec![DfuOpcode::PacketReceiptNotificationRequest as u8];
    data.extend_from_slice(&interval.to_le_bytes());
    data
}

/// Build a single-byte control command.
pub fn build_command(opcode: DfuOpcode) -> Vec<u8> {
    vec![opcode as u8]
}

/// Build the buttonless Enter Bootloader command.
pub fn build_enter_bootloader() -> Vec<u8> {
    vec![BUTTONLESS_ENTER_BOOTLOADER]
}

// ============================================================================
// Firmware Chunking
// ============================================================================

/// Split a payload into packets of at most `packet_size` bytes.
///
/// Every packet but the last is full; concatenating the packets yields the
/// payload unchanged.
pub fn packets(payload: &[u8], packet_size: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(packet_size.max(1))
}

/// Number of packets needed for a payload.
pub fn packet_count(payload_len: usize, packet_size: usize) -> usize {
    payload_len.div_ceil(packet_size.max(1))
}

// ============================================================================
// Notification Parsing
// ============================================================================

/// A response notification: `[0x10, request_opcode, status, payload...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuResponse {
    /// The opcode this response answers.
    pub request: u8,
    pub status: u8,
    pub payload: Vec<u8>,
}

impl DfuResponse {
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        match data {
            [op, request, status, payload @ ..] if *op == DfuOpcode::Response as u8 => Ok(Self {
                request: *request,
                status: *status,
                payload: payload.to_vec(),
            }),
            _ => Err(DfuError::invalid_response(format!(
                "not a control point response: {:02X?}",
                data
            ))),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DfuResponseStatus::Success as u8
    }

    /// Get an error message if not successful.
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let description = DfuResponseStatus::from_byte(self.status)
            .map(|s| s.description())
            .unwrap_or("Unknown status");
        Some(format!(
            "Opcode 0x{:02X} failed: {} (0x{:02X})",
            self.request, description, self.status
        ))
    }

    /// Decode the ReportReceipt payload: `(offset, crc16)`.
    pub fn receipt(&self) -> DfuResult<(u32, u16)> {
        match self.payload.as_slice() {
            [a, b, c, d, e, f, ..] => Ok((
                u32::from_le_bytes([*a, *b, *c, *d]),
                u16::from_le_bytes([*e, *f]),
            )),
            _ => Err(DfuError::invalid_response(
                "receipt report shorter than 6 bytes",
            )),
        }
    }
}

/// Parse a packet receipt notification: `[0x11, bytes u32]`.
pub fn parse_prn(data: &[u8]) -> DfuResult<u32> {
    match data {
        [op, a, b, c, d, ..] if *op == DfuOpcode::PacketReceiptNotification as u8 => {
            Ok(u32::from_le_bytes([*a, *b, *c, *d]))
        }
        _ => Err(DfuError::invalid_response(format!(
            "not a packet receipt notification: {:02X?}",
            data
        ))),
    }
}

/// Parse the buttonless response: `[0x20, 0x01, status]`, returns the status.
pub fn parse_buttonless_response(data: &[u8]) -> DfuResult<u8> {
    match data {
        [BUTTONLESS_RESPONSE, BUTTONLESS_ENTER_BOOTLOADER, status, ..] => Ok(*status),
        _ => Err(DfuError::invalid_response(format!(
            "not a buttonless response: {:02X?}",
            data
        ))),
    }
}
