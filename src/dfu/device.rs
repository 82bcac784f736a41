//! Target device addressing.
//!
//! Android-style stacks identify peripherals by MAC address, Apple stacks by
//! an opaque identifier. After the buttonless jump the bootloader may
//! advertise under a different address, so the session tracks both.

use std::fmt;

/// Address of a DFU target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    /// 48-bit public or static random address.
    Mac([u8; 6]),
    /// Platform identifier that cannot be interpreted.
    Opaque(String),
}

impl DeviceAddress {
    /// Parse an address string. `AA:BB:CC:DD:EE:FF` (either case, `:` or `-`)
    /// becomes a MAC; anything else is kept verbatim.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();

        if parts.len() == 6 && parts.iter().all(|p| p.len() == 2) {
            let mut bytes = [0u8; 6];
            for (byte, part) in bytes.iter_mut().zip(&parts) {
                match u8::from_str_radix(part, 16) {
                    Ok(value) => *byte = value,
                    Err(_) => return DeviceAddress::Opaque(trimmed.to_string()),
                }
            }
            return DeviceAddress::Mac(bytes);
        }

        DeviceAddress::Opaque(trimmed.to_string())
    }

    /// Address the bootloader advertises under after the buttonless jump.
    ///
    /// Without bond sharing the bootloader uses the application address + 1.
    pub fn bootloader_address(&self, keep_bond: bool) -> DeviceAddress {
        match self {
            DeviceAddress::Mac(bytes) if !keep_bond => {
                let mut value = [0u8; 8];
                value[2..].copy_from_slice(bytes);
                let next = (u64::from_be_bytes(value) + 1) & 0xFFFF_FFFF_FFFF;
                let mut out = [0u8; 6];
                out.copy_from_slice(&next.to_be_bytes()[2..]);
                DeviceAddress::Mac(out)
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Mac(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            DeviceAddress::Opaque(id) => f.write_str(id),
        }
    }
}

/// Key used by the session registry.
pub fn normalize_address(raw: &str) -> String {
    DeviceAddress::parse(raw).to_string()
}

/// Get a display label for a target.
pub fn display_label(address: &str, device_name: Option<&str>) -> String {
    match device_name {
        Some(name) if !name.is_empty() => format!("{} ({})", name, address),
        _ => address.to_string(),
    }
}
