/// Platform-specific functionality -- where bootloader volumes get mounted
/// and who the current user is.

pub mod mounts;

pub use mounts::{resolve_username, VolumeLocator};
