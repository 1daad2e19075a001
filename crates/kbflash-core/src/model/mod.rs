/// Data model shared by the workers and the orchestrator.
///
/// Re-exports the firmware build types, the volume presence event and the
/// display formatting helpers.
pub mod firmware;
pub mod format;

pub use firmware::{Build, FirmwareFile};
pub use format::{format_build_date, format_size};

/// A presence transition reported by the detector.
///
/// `path` is where the volume was found, or where it is expected to appear
/// when `connected` is `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEvent {
    pub connected: bool,
    pub path: std::path::PathBuf,
}
