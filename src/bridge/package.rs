use std::path::Path;

use serde::Serialize;

use crate::dfu::{firmware_reader, DfuImageType, FirmwarePart, TransferError};

/// Summary of one part of a firmware package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub kind: DfuImageType,
    /// Size of the image in bytes.
    pub size: usize,
    /// Size of the init packet in bytes, zero when absent.
    pub init_size: usize,
    /// CRC16 of the image as it will be reported after transfer.
    pub crc16: u16,
}

impl From<&FirmwarePart> for PartInfo {
    fn from(part: &FirmwarePart) -> Self {
        Self {
            kind: part.kind,
            size: part.size_bytes(),
            init_size: part.init_packet.as_ref().map_or(0, Vec::len),
            crc16: crc16::State::<crc16::CCITT_FALSE>::calculate(&part.payload),
        }
    }
}

/// Information about a firmware package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    /// Parts in transfer order.
    pub parts: Vec<PartInfo>,
    pub total_size: usize,
}

/// Validate that a firmware image can be transferred, without touching any device.
pub fn validate_firmware_package<P: AsRef<Path>>(path: P) -> Result<PackageInfo, TransferError> {
    let package = firmware_reader::parse(path)?;

    Ok(PackageInfo {
        parts: package.parts().iter().map(PartInfo::from).collect(),
        total_size: package.total_size(),
    })
}
