/// Firmware images discovered on disk and the builds that group them.
use serde::Serialize;
use std::path::PathBuf;

use super::format::format_build_date;

/// A single firmware image. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareFile {
    /// File name only, e.g. `corne_left.uf2`.
    pub name: String,
    /// Full path to the image.
    pub path: PathBuf,
    /// Size in bytes at scan time.
    pub size: u64,
}

/// A set of firmware files sharing one directory.
///
/// `date` is the `YYYYMMDD` directory name for dated builds and empty for
/// the flat build found directly in the firmware root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Build {
    pub date: String,
    pub path: PathBuf,
    pub files: Vec<FirmwareFile>,
}

impl Build {
    /// `true` for the undated build in the firmware root.
    pub fn is_flat(&self) -> bool {
        self.date.is_empty()
    }

    /// Human-readable label, e.g. `2025-01-15` or `current`.
    pub fn label(&self) -> String {
        format_build_date(&self.date)
    }

    /// Total size of every file in the build.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Pick the image to flash onto `side`.
    ///
    /// The first file whose name contains the side (case-insensitive) wins.
    /// A build holding exactly one file is used for any side. Otherwise
    /// there is no firmware for this side.
    pub fn file_for_side(&self, side: &str) -> Option<&FirmwareFile> {
        let needle = side.to_lowercase();
        self.files
            .iter()
            .find(|f| f.name.to_lowercase().contains(&needle))
            .or_else(|| match self.files.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }

    /// The settings-reset image, if the build ships one.
    pub fn reset_file(&self) -> Option<&FirmwareFile> {
        self.files.iter().find(|f| {
            let name = f.name.to_lowercase();
            name.contains("reset") || name.contains("settings")
        })
    }
}
