/// Firmware build execution.
///
/// Two interchangeable strategies implement [`Builder`]:
/// - [`NativeBuilder`]: runs a configured command (e.g. `./build.sh {{side}}`).
/// - [`ContainerBuilder`]: runs `west build` inside a ZMK toolchain image.
///
/// The orchestrator only sees the trait. [`start_build`] runs a batch on a
/// background thread and reports progress over a bounded channel. Progress
/// is best-effort: when the consumer falls behind, updates are dropped
/// rather than stalling the build.
pub mod container;
pub mod native;
pub mod process;
pub mod progress;

pub use container::ContainerBuilder;
pub use native::NativeBuilder;
pub use progress::ProgressTracker;

use crate::error::BuildError;
use crate::CancelFlag;
use crossbeam_channel::{bounded, Receiver, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Placeholder in native build arguments replaced with the target side.
pub const SIDE_PLACEHOLDER: &str = "{{side}}";

/// Sentinel percent marking an error line seen while the build continues.
pub const ERROR_PERCENT: i32 = -1;

/// Maximum number of progress messages that may queue up in the channel.
///
/// Anything beyond this is dropped on the worker side.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// One progress update from a running build.
///
/// `percent` is derived from `current` and the largest `total` seen so far.
/// Raw output lines carry zero counts and zero percent; error lines carry
/// [`ERROR_PERCENT`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub current: u32,
    pub total: u32,
    pub percent: i32,
    pub message: String,
}

impl BuildProgress {
    /// A raw output line with no progress information.
    pub fn output(line: impl Into<String>) -> Self {
        Self {
            message: line.into(),
            ..Self::default()
        }
    }

    /// A phase update at a fixed percent.
    pub fn status(percent: i32, message: impl Into<String>) -> Self {
        Self {
            percent,
            message: message.into(),
            ..Self::default()
        }
    }

    /// An error line reported by the tool without aborting the build.
    pub fn error_line(line: impl Into<String>) -> Self {
        Self::status(ERROR_PERCENT, line)
    }

    pub fn is_error(&self) -> bool {
        self.percent < 0
    }
}

/// Result of building one target. Never partially successful.
#[derive(Debug)]
pub enum BuildOutcome {
    Success,
    Failed(BuildError),
    Cancelled,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map a worker result, keeping cancellation distinct from failure.
    pub fn from_result(result: Result<(), BuildError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(BuildError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }
}

/// A firmware build strategy.
pub trait Builder: Send + Sync {
    /// Short strategy name for logs, e.g. `native`.
    fn name(&self) -> &'static str;

    /// Checks that must pass before any target is built.
    fn preflight(&self, _cancel: &AtomicBool) -> Result<(), BuildError> {
        Ok(())
    }

    /// Build one target, reporting progress through `progress`.
    fn build(
        &self,
        target: &str,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(BuildProgress),
    ) -> BuildOutcome;
}

/// Replace [`SIDE_PLACEHOLDER`] in every argument.
pub fn substitute_side(args: &[String], side: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(SIDE_PLACEHOLDER, side))
        .collect()
}

/// Build `targets` strictly in order, stopping at the first outcome that is
/// not a success. Returns only the outcomes completed so far.
///
/// With more than one target each side's percent is scaled into its slice
/// of the whole run and messages are prefixed with `[side]`.
pub fn build_batch(
    builder: &dyn Builder,
    targets: &[String],
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(BuildProgress),
) -> Vec<BuildOutcome> {
    let count = targets.len().max(1) as i32;
    let mut outcomes = Vec::with_capacity(targets.len());

    for (i, target) in targets.iter().enumerate() {
        let base = i as i32 * 100 / count;
        let mut scoped = |mut p: BuildProgress| {
            if count > 1 {
                if p.percent >= 0 {
                    p.percent = base + p.percent / count;
                }
                p.message = format!("[{target}] {}", p.message);
            }
            progress(p);
        };

        info!("Building {target} with {} builder", builder.name());
        let outcome = builder.build(target, cancel, &mut scoped);
        let stop = !outcome.is_success();
        outcomes.push(outcome);
        if stop {
            break;
        }
    }

    outcomes
}

/// Handle to a running build batch.
pub struct BuildHandle {
    /// Best-effort progress; updates are dropped when this is full.
    pub progress_rx: Receiver<BuildProgress>,
    /// Exactly one message: the outcomes of the batch.
    pub outcome_rx: Receiver<Vec<BuildOutcome>>,
    cancel: CancelFlag,
    _thread: Option<thread::JoinHandle<()>>,
}

impl BuildHandle {
    /// Request the build to stop. The child process is terminated.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Run `preflight` and then [`build_batch`] on a background thread.
pub fn start_build(builder: Arc<dyn Builder>, targets: Vec<String>) -> std::io::Result<BuildHandle> {
    let (progress_tx, progress_rx) = bounded::<BuildProgress>(PROGRESS_CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = bounded::<Vec<BuildOutcome>>(1);
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();

    let thread = thread::Builder::new()
        .name("kbflash-builder".into())
        .spawn(move || {
            let mut dropped: u64 = 0;
            let mut send_progress = |p: BuildProgress| match progress_tx.try_send(p) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
            };

            let outcomes = match builder.preflight(&cancel_clone) {
                Ok(()) => build_batch(builder.as_ref(), &targets, &cancel_clone, &mut send_progress),
                Err(e) => vec![BuildOutcome::from_result(Err(e))],
            };

            if dropped > 0 {
                debug!("Build worker dropped {dropped} progress update(s)");
            }
            let _ = outcome_tx.send(outcomes);
        })?;

    Ok(BuildHandle {
        progress_rx,
        outcome_rx,
        cancel,
        _thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Emits one progress line per target and fails on a chosen target.
    struct Scripted {
        fail_on: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl Builder for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn build(
            &self,
            target: &str,
            _cancel: &AtomicBool,
            progress: &mut dyn FnMut(BuildProgress),
        ) -> BuildOutcome {
            self.seen.lock().unwrap().push(target.to_string());
            progress(BuildProgress::status(100, "done"));
            if self.fail_on == Some(target) {
                BuildOutcome::Failed(BuildError::Worker("boom".into()))
            } else {
                BuildOutcome::Success
            }
        }
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn substitute_side_rewrites_every_occurrence() {
        let args = targets(&["-DSHIELD=corne_{{side}}", "{{side}}/{{side}}", "-p"]);
        assert_eq!(
            substitute_side(&args, "left"),
            targets(&["-DSHIELD=corne_left", "left/left", "-p"])
        );
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let builder = Scripted {
            fail_on: Some("left"),
            seen: Mutex::new(Vec::new()),
        };
        let cancel = AtomicBool::new(false);
        let outcomes = build_batch(&builder, &targets(&["left", "right"]), &cancel, &mut |_| {});
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_success());
        assert_eq!(*builder.seen.lock().unwrap(), targets(&["left"]));
    }

    #[test]
    fn batch_scales_percent_and_prefixes_side() {
        let builder = Scripted {
            fail_on: None,
            seen: Mutex::new(Vec::new()),
        };
        let cancel = AtomicBool::new(false);
        let mut updates = Vec::new();
        let outcomes = build_batch(
            &builder,
            &targets(&["left", "right"]),
            &cancel,
            &mut |p| updates.push(p),
        );
        assert_eq!(outcomes.len(), 2);
        assert_eq!(updates[0].percent, 50);
        assert_eq!(updates[0].message, "[left] done");
        assert_eq!(updates[1].percent, 100);
        assert_eq!(updates[1].message, "[right] done");
    }

    #[test]
    fn single_target_is_not_rescaled() {
        let builder = Scripted {
            fail_on: None,
            seen: Mutex::new(Vec::new()),
        };
        let cancel = AtomicBool::new(false);
        let mut updates = Vec::new();
        build_batch(&builder, &targets(&["main"]), &cancel, &mut |p| updates.push(p));
        assert_eq!(updates[0].percent, 100);
        assert_eq!(updates[0].message, "done");
    }

    #[test]
    fn outcome_keeps_cancellation_distinct() {
        assert!(BuildOutcome::from_result(Err(BuildError::Cancelled)).is_cancelled());
        assert!(matches!(
            BuildOutcome::from_result(Err(BuildError::Worker("x".into()))),
            BuildOutcome::Failed(_)
        ));
        assert!(BuildOutcome::from_result(Ok(())).is_success());
    }
}
