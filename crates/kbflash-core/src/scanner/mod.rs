/// Firmware scanner -- discovers builds in the firmware directory.
///
/// Two layouts are recognised and may be mixed:
/// - **Flat:** images directly in the firmware root (one undated build).
/// - **Dated:** images in immediate `YYYYMMDD` subdirectories, one build each.
///
/// Results are ordered newest first with the flat build, if any, last.
use crate::error::ScanError;
use crate::model::{Build, FirmwareFile};
use glob::Pattern;
use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Scan `root` for builds whose files match the glob `pattern`.
///
/// A missing root yields an empty list. Unreadable dated subdirectories are
/// skipped. Cancellation is checked on entry and before every subdirectory;
/// a cancelled scan returns [`ScanError::Cancelled`], never a partial list.
pub fn scan_builds(
    root: &Path,
    pattern: &str,
    cancel: &AtomicBool,
) -> Result<Vec<Build>, ScanError> {
    check_cancel(cancel)?;
    let pattern = Pattern::new(pattern)?;

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ScanError::Io {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let mut builds = Vec::new();

    let flat_files = scan_directory(root, &pattern).map_err(|source| ScanError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    if !flat_files.is_empty() {
        builds.push(Build {
            date: String::new(),
            path: root.to_path_buf(),
            files: flat_files,
        });
    }

    for entry in entries {
        check_cancel(cancel)?;

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {e}", root.display());
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_date_dir(&name) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let files = match scan_directory(&path, &pattern) {
            Ok(files) => files,
            Err(e) => {
                warn!("Skipping build directory {}: {e}", path.display());
                continue;
            }
        };
        if !files.is_empty() {
            builds.push(Build {
                date: name,
                path,
                files,
            });
        }
    }

    sort_builds(&mut builds);
    debug!("Scanned {}: {} build(s)", root.display(), builds.len());
    Ok(builds)
}

/// Newest build, or `None` when the directory holds no firmware.
pub fn find_latest(
    root: &Path,
    pattern: &str,
    cancel: &AtomicBool,
) -> Result<Option<Build>, ScanError> {
    Ok(scan_builds(root, pattern, cancel)?.into_iter().next())
}

/// Dated builds by date descending, the flat build always last.
pub fn sort_builds(builds: &mut [Build]) {
    builds.sort_by(|a, b| match (a.is_flat(), b.is_flat()) {
        (true, true) => CmpOrdering::Equal,
        (true, false) => CmpOrdering::Greater,
        (false, true) => CmpOrdering::Less,
        (false, false) => b.date.cmp(&a.date),
    });
}

/// `true` if `name` is exactly eight ASCII digits (`YYYYMMDD`).
pub fn is_date_dir(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Matching regular files in one directory, sorted by name.
fn scan_directory(dir: &Path, pattern: &Pattern) -> io::Result<Vec<FirmwareFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.matches(&name) {
            continue;
        }
        let path = entry.path();
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Cannot stat {}: {e}", path.display());
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }
        files.push(FirmwareFile {
            name,
            path,
            size: meta.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), ScanError> {
    if cancel.load(Ordering::Relaxed) {
        Err(ScanError::Cancelled)
    } else {
        Ok(())
    }
}
