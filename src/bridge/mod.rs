//! Caller-facing surface: session registry, start options and package checks.

mod manager;
mod package;

pub use manager::{DfuManager, ManagerConfig, StartOptions, StartRequest};
pub use package::{validate_firmware_package, PackageInfo, PartInfo};
