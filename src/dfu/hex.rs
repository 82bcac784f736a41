//! Intel HEX decoding.
//!
//! Converts an Intel HEX image into the contiguous binary the bootloader
//! expects. Gaps between records are filled with erased flash (`0xFF`).

use std::collections::BTreeMap;

use super::error::{DfuResult, ParseError};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Value of unprogrammed flash.
const ERASED: u8 = 0xFF;

/// Largest span an image may cover; nRF5 parts have at most 1 MiB of flash.
pub const MAX_IMAGE_SIZE: u64 = 1024 * 1024;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

/// Whether the content looks like Intel HEX (first non-blank byte is `:`).
pub fn looks_like_hex(content: &[u8]) -> bool {
    content
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b':')
}

/// Decode Intel HEX text into a contiguous binary starting at the lowest
/// programmed address.
pub fn decode(content: &[u8]) -> DfuResult<Vec<u8>> {
    if !content.is_ascii() {
        return Err(ParseError::UnsupportedFormat {
            reason: "HEX file is not ASCII".into(),
        }
        .into());
    }
    let text = std::str::from_utf8(content).map_err(|_| ParseError::UnsupportedFormat {
        reason: "HEX file is not ASCII".into(),
    })?;

    let mut upper: u32 = 0;
    let mut chunks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut seen_eof = false;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if seen_eof {
            break;
        }

        let record = parse_record(line, index + 1)?;
        match record.kind {
            RECORD_DATA => {
                let address = upper + record.offset as u32;
                chunks.insert(address, record.data);
            }
            RECORD_EOF => seen_eof = true,
            RECORD_EXT_SEGMENT => upper = (be_u16(&record.data, index + 1)? as u32) << 4,
            RECORD_EXT_LINEAR => upper = (be_u16(&record.data, index + 1)? as u32) << 16,
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
            other => {
                return Err(ParseError::UnsupportedFormat {
                    reason: format!("line {}: unknown record type 0x{:02X}", index + 1, other),
                }
                .into())
            }
        }
    }

    if !seen_eof {
        return Err(ParseError::CorruptArchive {
            reason: "HEX file has no end-of-file record".into(),
        }
        .into());
    }

    let Some((&start, _)) = chunks.iter().next() else {
        return Err(ParseError::EmptyImage.into());
    };
    // Records may end past the 32-bit address space, so measure in u64.
    let end = chunks
        .iter()
        .map(|(&address, data)| address as u64 + data.len() as u64)
        .max()
        .unwrap_or(start as u64);

    let span = end - start as u64;
    if span > MAX_IMAGE_SIZE {
        return Err(ParseError::CorruptArchive {
            reason: format!(
                "HEX image spans {} bytes, more than the {} byte limit",
                span, MAX_IMAGE_SIZE
            ),
        }
        .into());
    }

    let mut binary = vec![ERASED; span as usize];
    for (address, data) in chunks {
        let offset = (address - start) as usize;
        binary[offset..offset + data.len()].copy_from_slice(&data);
    }

    Ok(binary)
}

fn parse_record(line: &str, line_no: usize) -> DfuResult<Record> {
    let body = line.strip_prefix(':').ok_or_else(|| ParseError::UnsupportedFormat {
        reason: format!("line {}: missing ':' start code", line_no),
    })?;

    if body.len() % 2 != 0 || body.len() < 10 {
        return Err(ParseError::CorruptArchive {
            reason: format!("line {}: truncated record", line_no),
        }
        .into());
    }

    let mut bytes = Vec::with_capacity(body.len() / 2);
    for i in (0..body.len()).step_by(2) {
        let byte = u8::from_str_radix(&body[i..i + 2], 16).map_err(|_| {
            ParseError::UnsupportedFormat {
                reason: format!("line {}: invalid hex digit", line_no),
            }
        })?;
        bytes.push(byte);
    }

    let length = bytes[0] as usize;
    if bytes.len() != length + 5 {
        return Err(ParseError::CorruptArchive {
            reason: format!("line {}: length field does not match record", line_no),
        }
        .into());
    }

    // Sum of all bytes including the checksum is zero modulo 256.
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(ParseError::CorruptArchive {
            reason: format!("line {}: checksum mismatch", line_no),
        }
        .into());
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + length].to_vec(),
    })
}

fn be_u16(data: &[u8], line_no: usize) -> DfuResult<u16> {
    match data {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(ParseError::CorruptArchive {
            reason: format!("line {}: address record must carry 2 bytes", line_no),
        }
        .into()),
    }
}
