/// Flash executor -- copies one firmware image onto a mounted bootloader
/// volume.
///
/// The bootloader starts writing as soon as bytes arrive, so the copy is
/// strict: fixed 32 KiB chunks, a short write is fatal, the final size must
/// equal the source size, and the destination is synced before success is
/// reported. Cancellation is checked before every chunk read. The source
/// is never modified and nothing is retried here.
use crate::error::FlashError;
use crate::CancelFlag;
use crossbeam_channel::{bounded, Receiver, TrySendError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Copy buffer size.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Flash progress updates that may queue before new ones are dropped.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Bytes copied so far out of the source size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    pub bytes_written: u64,
    pub total: u64,
}

impl FlashProgress {
    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            return 100;
        }
        (self.bytes_written.min(self.total) * 100 / self.total) as i32
    }
}

/// Result of one flash. `bytes_written` counts exactly what reached the
/// destination before the copy stopped.
#[derive(Debug)]
pub struct FlashOutcome {
    pub success: bool,
    pub bytes_written: u64,
    pub error: Option<FlashError>,
}

impl FlashOutcome {
    fn succeeded(bytes_written: u64) -> Self {
        Self {
            success: true,
            bytes_written,
            error: None,
        }
    }

    fn failed(error: FlashError, bytes_written: u64) -> Self {
        Self {
            success: false,
            bytes_written,
            error: Some(error),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(FlashError::Cancelled))
    }
}

/// Where `source` lands on the volume: its base name inside `device_dir`.
pub fn destination_path(source: &Path, device_dir: &Path) -> Option<PathBuf> {
    source.file_name().map(|name| device_dir.join(name))
}

/// Copy `source` into `device_dir`.
pub fn flash(source: &Path, device_dir: &Path, cancel: &AtomicBool) -> FlashOutcome {
    flash_with_progress(source, device_dir, cancel, &mut |_| {})
}

/// Like [`flash`], reporting progress after every chunk.
pub fn flash_with_progress(
    source: &Path,
    device_dir: &Path,
    cancel: &AtomicBool,
    on_progress: &mut dyn FnMut(FlashProgress),
) -> FlashOutcome {
    if cancel.load(Ordering::Relaxed) {
        return FlashOutcome::failed(FlashError::Cancelled, 0);
    }

    let mut src = match File::open(source) {
        Ok(f) => f,
        Err(e) => {
            return FlashOutcome::failed(
                FlashError::OpenSource {
                    path: source.to_path_buf(),
                    source: e,
                },
                0,
            )
        }
    };

    let expected = match src.metadata() {
        Ok(meta) => meta.len(),
        Err(e) => {
            return FlashOutcome::failed(
                FlashError::StatSource {
                    path: source.to_path_buf(),
                    source: e,
                },
                0,
            )
        }
    };

    let Some(dest_path) = destination_path(source, device_dir) else {
        return FlashOutcome::failed(
            FlashError::CreateDestination {
                path: device_dir.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"),
            },
            0,
        );
    };

    let mut dst = match File::create(&dest_path) {
        Ok(f) => f,
        Err(e) => {
            return FlashOutcome::failed(
                FlashError::CreateDestination {
                    path: dest_path,
                    source: e,
                },
                0,
            )
        }
    };

    info!(
        "Flashing {} ({} bytes) -> {}",
        source.display(),
        expected,
        dest_path.display()
    );

    let (written, copied) = copy_chunks(&mut src, &mut dst, cancel, expected, on_progress);
    if let Err(e) = copied {
        return FlashOutcome::failed(e, written);
    }

    if written != expected {
        return FlashOutcome::failed(
            FlashError::SizeMismatch {
                written,
                expected,
            },
            written,
        );
    }

    if let Err(e) = dst.sync_all() {
        return FlashOutcome::failed(FlashError::Sync(e), written);
    }

    debug!("Flash of {} complete", dest_path.display());
    FlashOutcome::succeeded(written)
}

/// Copy until EOF in [`CHUNK_SIZE`] pieces.
///
/// Returns the bytes written alongside the result so a failed or cancelled
/// copy still reports exactly how far it got.
pub fn copy_chunks<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cancel: &AtomicBool,
    total: u64,
    on_progress: &mut dyn FnMut(FlashProgress),
) -> (u64, Result<(), FlashError>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return (written, Err(FlashError::Cancelled));
        }

        let read = match reader.read(&mut buf) {
            Ok(0) => return (written, Ok(())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Err(FlashError::Copy(e))),
        };

        let wrote = match writer.write(&buf[..read]) {
            Ok(n) => n,
            Err(e) => return (written, Err(FlashError::Copy(e))),
        };
        written += wrote as u64;
        if wrote != read {
            return (written, Err(FlashError::ShortWrite { read, written: wrote }));
        }

        on_progress(FlashProgress {
            bytes_written: written,
            total,
        });
    }
}

/// Handle to a flash running on a background thread.
pub struct FlashHandle {
    /// Best-effort progress; updates are dropped when this is full.
    pub progress_rx: Receiver<FlashProgress>,
    /// Exactly one message: the outcome.
    pub outcome_rx: Receiver<FlashOutcome>,
    cancel: CancelFlag,
    _thread: Option<thread::JoinHandle<()>>,
}

impl FlashHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Run [`flash_with_progress`] on a background thread.
pub fn start_flash(source: PathBuf, device_dir: PathBuf) -> io::Result<FlashHandle> {
    let (progress_tx, progress_rx) = bounded::<FlashProgress>(PROGRESS_CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = bounded::<FlashOutcome>(1);
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();

    let thread = thread::Builder::new()
        .name("kbflash-flasher".into())
        .spawn(move || {
            let outcome = flash_with_progress(&source, &device_dir, &cancel_clone, &mut |p| {
                if let Err(TrySendError::Full(_)) = progress_tx.try_send(p) {
                    debug!("Flash progress dropped at {} bytes", p.bytes_written);
                }
            });
            let _ = outcome_tx.send(outcome);
        })?;

    Ok(FlashHandle {
        progress_rx,
        outcome_rx,
        cancel,
        _thread: Some(thread),
    })
}
