/// KBFlash Core -- the engine behind the firmware flashing workflow.
///
/// This crate contains no terminal or UI code. It provides:
/// - **Detector:** polls for the bootloader volume and reports transitions.
/// - **Scanner:** discovers flat and dated firmware builds.
/// - **Build:** native and containerised build strategies behind one trait.
/// - **Flash:** durable, cancellable copy of an image onto the volume.
/// - **Config:** TOML configuration with defaults and validation.
///
/// Long-running work happens on background threads that report over
/// bounded crossbeam channels and stop when their [`CancelFlag`] is set.
pub mod build;
pub mod config;
pub mod detector;
pub mod error;
pub mod flash;
pub mod model;
pub mod platform;
pub mod scanner;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared cancellation flag, set by the owner and polled by the worker.
pub type CancelFlag = Arc<AtomicBool>;
