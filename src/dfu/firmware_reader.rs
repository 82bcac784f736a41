//! Firmware package reader.
//!
//! Accepts three inputs:
//! - `*.bin` - raw application binary
//! - `*.hex` - Intel HEX application image
//! - a zip package containing `manifest.json`, one binary per part and an
//!   optional init packet (`*.dat`) per part

use std::io::{Read, Seek};
use std::path::Path;

use serde::Deserialize;

use super::config::DfuImageType;
use super::error::{DfuResult, ParseError};
use super::hex;

/// Local file header magic that starts every zip archive.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// One firmware component to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePart {
    pub kind: DfuImageType,
    pub payload: Vec<u8>,
    pub init_packet: Option<Vec<u8>>,
    /// Softdevice and bootloader sizes of a combined part.
    pub combined_sizes: Option<(u32, u32)>,
}

impl FirmwarePart {
    pub fn new(kind: DfuImageType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            init_packet: None,
            combined_sizes: None,
        }
    }

    pub fn with_init_packet(mut self, init: Vec<u8>) -> Self {
        self.init_packet = Some(init);
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Sizes announced in the Start DFU packet: `[softdevice, bootloader, application]`.
    pub fn image_sizes(&self) -> [u32; 3] {
        let len = self.payload.len() as u32;
        match self.kind {
            DfuImageType::Softdevice => [len, 0, 0],
            DfuImageType::Bootloader => [0, len, 0],
            DfuImageType::SoftdeviceBootloader => {
                let (sd, bl) = self.combined_sizes.unwrap_or((len, 0));
                [sd, bl, 0]
            }
            DfuImageType::Application => [0, 0, len],
        }
    }
}

/// Ordered set of firmware parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePackage {
    parts: Vec<FirmwarePart>,
}

impl FirmwarePackage {
    /// Build a package, enforcing ordering and the one-part-per-kind rule.
    pub fn new(mut parts: Vec<FirmwarePart>) -> DfuResult<Self> {
        if parts.is_empty() {
            return Err(ParseError::CorruptArchive {
                reason: "package contains no firmware parts".into(),
            }
            .into());
        }

        parts.sort_by_key(|p| p.kind);
        for pair in parts.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(ParseError::CorruptArchive {
                    reason: format!("duplicate {} part", pair[0].kind.manifest_key()),
                }
                .into());
            }
        }

        let has = |kind| parts.iter().any(|p: &FirmwarePart| p.kind == kind);
        if has(DfuImageType::SoftdeviceBootloader)
            && (has(DfuImageType::Softdevice) || has(DfuImageType::Bootloader))
        {
            return Err(ParseError::CorruptArchive {
                reason: "combined softdevice_bootloader overlaps separate parts".into(),
            }
            .into());
        }

        if parts.iter().any(|p| p.payload.is_empty()) {
            return Err(ParseError::EmptyImage.into());
        }

        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[FirmwarePart] {
        &self.parts
    }

    pub fn total_size(&self) -> usize {
        self.parts.iter().map(FirmwarePart::size_bytes).sum()
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    softdevice: Option<PartManifest>,
    bootloader: Option<PartManifest>,
    softdevice_bootloader: Option<PartManifest>,
    application: Option<PartManifest>,
}

#[derive(Debug, Deserialize)]
struct PartManifest {
    bin_file: String,
    dat_file: Option<String>,
    init_packet_data: Option<InitPacketData>,
    info_read_only_metadata: Option<CombinedMetadata>,
}

#[derive(Debug, Deserialize)]
struct InitPacketData {
    firmware_crc16: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct CombinedMetadata {
    sd_size: u32,
    bl_size: u32,
}

/// Read and parse a firmware image or package.
pub fn parse<P: AsRef<Path>>(path: P) -> DfuResult<FirmwarePackage> {
    let path = path.as_ref();
    let content = std::fs::read(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("bin") => read_raw_binary(content),
        Some("hex") => read_hex(&content),
        _ if content.starts_with(&ZIP_MAGIC) => read_zip(std::io::Cursor::new(content)),
        Some("zip") => Err(ParseError::CorruptArchive {
            reason: "not a zip archive".into(),
        }
        .into()),
        _ => Err(ParseError::UnsupportedFormat {
            reason: format!("cannot determine firmware format of {}", path.display()),
        }
        .into()),
    }
}

fn read_raw_binary(content: Vec<u8>) -> DfuResult<FirmwarePackage> {
    if content.is_empty() {
        return Err(ParseError::EmptyImage.into());
    }
    FirmwarePackage::new(vec![FirmwarePart::new(DfuImageType::Application, content)])
}

fn read_hex(content: &[u8]) -> DfuResult<FirmwarePackage> {
    if !hex::looks_like_hex(content) {
        return Err(ParseError::UnsupportedFormat {
            reason: "file is not Intel HEX".into(),
        }
        .into());
    }
    let binary = hex::decode(content)?;
    FirmwarePackage::new(vec![FirmwarePart::new(DfuImageType::Application, binary)])
}

/// Read every part listed in the archive's manifest.
fn read_zip<R: Read + Seek>(reader: R) -> DfuResult<FirmwarePackage> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| ParseError::CorruptArchive {
        reason: e.to_string(),
    })?;

    let manifest = read_manifest(&mut archive)?;
    let entries = [
        (DfuImageType::Softdevice, manifest.softdevice),
        (DfuImageType::Bootloader, manifest.bootloader),
        (DfuImageType::SoftdeviceBootloader, manifest.softdevice_bootloader),
        (DfuImageType::Application, manifest.application),
    ];

    let mut parts = Vec::new();
    for (kind, entry) in entries {
        if let Some(entry) = entry {
            parts.push(read_part(&mut archive, kind, entry)?);
        }
    }

    FirmwarePackage::new(parts)
}

fn read_part<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    kind: DfuImageType,
    entry: PartManifest,
) -> DfuResult<FirmwarePart> {
    let payload = read_file_from_zip(archive, &entry.bin_file)?;
    let payload = if entry.bin_file.to_ascii_lowercase().ends_with(".hex") {
        hex::decode(&payload)?
    } else {
        payload
    };

    if payload.is_empty() {
        return Err(ParseError::EmptyImage.into());
    }

    if let Some(expected) = entry.init_packet_data.and_then(|d| d.firmware_crc16) {
        let actual = crc16::State::<crc16::CCITT_FALSE>::calculate(&payload);
        if actual != expected {
            return Err(ParseError::CorruptArchive {
                reason: format!(
                    "{} CRC16 mismatch: manifest 0x{:04X}, image 0x{:04X}",
                    entry.bin_file, expected, actual
                ),
            }
            .into());
        }
    }

    let mut part = FirmwarePart::new(kind, payload);

    if let Some(dat) = entry.dat_file {
        part.init_packet = Some(read_file_from_zip(archive, &dat)?);
    }

    if kind == DfuImageType::SoftdeviceBootloader {
        let meta = entry.info_read_only_metadata.ok_or_else(|| ParseError::CorruptArchive {
            reason: "softdevice_bootloader entry lacks size metadata".into(),
        })?;
        if meta.sd_size as u64 + meta.bl_size as u64 != part.payload.len() as u64 {
            return Err(ParseError::CorruptArchive {
                reason: format!(
                    "combined sizes {} + {} do not match image length {}",
                    meta.sd_size,
                    meta.bl_size,
                    part.payload.len()
                ),
            }
            .into());
        }
        part.combined_sizes = Some((meta.sd_size, meta.bl_size));
    }

    Ok(part)
}

/// Read and parse the manifest.json from the archive.
fn read_manifest<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> DfuResult<ManifestInner> {
    let contents = read_file_from_zip(archive, "manifest.json")?;
    let raw: RawManifest =
        serde_json::from_slice(&contents).map_err(|e| ParseError::CorruptArchive {
            reason: format!("invalid manifest.json: {}", e),
        })?;
    Ok(raw.manifest)
}

/// Read a file from the zip archive by name.
fn read_file_from_zip<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| ParseError::CorruptArchive {
        reason: format!("missing file in package: {}", name),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data).map_err(|e| ParseError::CorruptArchive {
        reason: format!("cannot read {}: {}", name, e),
    })?;

    Ok(data)
}
