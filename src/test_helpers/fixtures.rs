use std::io::Write;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use zip::write::FileOptions;

use super::temp::TestContext;
use crate::dfu::DfuImageType;

struct PartEntry {
    kind: DfuImageType,
    bin: Vec<u8>,
    dat: Option<Vec<u8>>,
    crc16: Option<u16>,
    combined_sizes: Option<(u32, u32)>,
}

/// Builder for firmware package archives.
pub struct PackageBuilder {
    parts: Vec<PartEntry>,
    raw_manifest: Option<String>,
    include_manifest: bool,
    skipped: Vec<String>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            raw_manifest: None,
            include_manifest: true,
            skipped: Vec::new(),
        }
    }

    fn part(mut self, kind: DfuImageType, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.parts.push(PartEntry {
            kind,
            bin: bin.to_vec(),
            dat: dat.map(<[u8]>::to_vec),
            crc16: None,
            combined_sizes: None,
        });
        self
    }

    pub fn application(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.part(DfuImageType::Application, bin, dat)
    }

    pub fn bootloader(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.part(DfuImageType::Bootloader, bin, dat)
    }

    pub fn softdevice(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.part(DfuImageType::Softdevice, bin, dat)
    }

    pub fn softdevice_bootloader(mut self, bin: &[u8], sd_size: u32, bl_size: u32) -> Self {
        self = self.part(DfuImageType::SoftdeviceBootloader, bin, None);
        if let Some(last) = self.parts.last_mut() {
            last.combined_sizes = Some((sd_size, bl_size));
        }
        self
    }

    /// Declare `firmware_crc16` for the most recently added part.
    pub fn firmware_crc16(mut self, crc: u16) -> Self {
        if let Some(last) = self.parts.last_mut() {
            last.crc16 = Some(crc);
        }
        self
    }

    pub fn raw_manifest(mut self, manifest: &str) -> Self {
        self.raw_manifest = Some(manifest.to_string());
        self
    }

    pub fn without_manifest(mut self) -> Self {
        self.include_manifest = false;
        self
    }

    /// Reference `name` from the manifest without adding it to the archive.
    pub fn skip_file(mut self, name: &str) -> Self {
        self.skipped.push(name.to_string());
        self
    }

    fn manifest(&self) -> String {
        if let Some(raw) = &self.raw_manifest {
            return raw.clone();
        }

        let mut entries = Map::new();
        for part in &self.parts {
            let key = part.kind.manifest_key();
            let mut entry = json!({ "bin_file": format!("{}.bin", key) });
            if part.dat.is_some() {
                entry["dat_file"] = json!(format!("{}.dat", key));
            }
            if let Some(crc) = part.crc16 {
                entry["init_packet_data"] = json!({ "firmware_crc16": crc });
            }
            if let Some((sd, bl)) = part.combined_sizes {
                entry["info_read_only_metadata"] = json!({ "sd_size": sd, "bl_size": bl });
            }
            entries.insert(key.to_string(), entry);
        }
        entries.insert("dfu_version".into(), json!(0.5));

        json!({ "manifest": Value::Object(entries) }).to_string()
    }

    /// Write the archive into the test directory.
    pub fn write(self, ctx: &TestContext, name: &str) -> PathBuf {
        let path = ctx.path(name);
        let file = std::fs::File::create(&path).expect("Failed to create package");
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        if self.include_manifest {
            files.push(("manifest.json".into(), self.manifest().into_bytes()));
        }
        for part in &self.parts {
            let key = part.kind.manifest_key();
            files.push((format!("{}.bin", key), part.bin.clone()));
            if let Some(dat) = &part.dat {
                files.push((format!("{}.dat", key), dat.clone()));
            }
        }

        for (file_name, content) in files {
            if self.skipped.contains(&file_name) {
                continue;
            }
            zip.start_file(file_name, options).expect("Failed to start entry");
            zip.write_all(&content).expect("Failed to write entry");
        }
        zip.finish().expect("Failed to finish package");
        path
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
