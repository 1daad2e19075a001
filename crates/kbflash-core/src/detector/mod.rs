/// Volume presence detector -- polls for a bootloader volume and reports
/// connect/disconnect transitions.
///
/// # Usage
///
/// ```ignore
/// let handle = start_detector(VolumeLocator::for_volume("NICENANO"), interval)?;
/// // receive transitions on handle.receiver
/// handle.stop();
/// ```
///
/// The first event always reflects the state at start-up. After that an
/// event is sent only when `connected` or the resolved path changes, so an
/// unchanged poll never produces a message.
///
/// # Cancellation
///
/// `stop()` (or dropping the handle) sets the cancel flag. The worker checks
/// it between short sleep slices and before every send, exits, and drops its
/// sender so the receiver disconnects.
use crate::model::VolumeEvent;
use crate::platform::VolumeLocator;
use crate::CancelFlag;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Transitions are rare, so a small buffer is plenty.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Granularity at which the worker re-checks the cancel flag while idle.
const CANCEL_SLICE: Duration = Duration::from_millis(25);

/// Handle to a running detector worker.
pub struct DetectorHandle {
    /// Presence transitions, starting with the initial state.
    pub receiver: Receiver<VolumeEvent>,
    cancel: CancelFlag,
    thread: Option<thread::JoinHandle<()>>,
}

impl DetectorHandle {
    /// Signal the worker to stop. Non-blocking.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to exit.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start polling `locator` every `poll_interval` on a background thread.
pub fn start_detector(
    locator: VolumeLocator,
    poll_interval: Duration,
) -> std::io::Result<DetectorHandle> {
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();
    let (tx, rx) = bounded::<VolumeEvent>(EVENT_CHANNEL_CAPACITY);

    let thread = thread::Builder::new()
        .name("kbflash-detector".into())
        .spawn(move || run_detector(locator, poll_interval, cancel_clone, tx))?;

    Ok(DetectorHandle {
        receiver: rx,
        cancel,
        thread: Some(thread),
    })
}

/// Remembers the last emitted event and lets only changes through.
#[derive(Debug, Default)]
pub struct EdgeFilter {
    last: Option<VolumeEvent>,
}

impl EdgeFilter {
    /// Returns the event if it differs from the previous emission.
    pub fn accept(&mut self, event: VolumeEvent) -> Option<VolumeEvent> {
        if self.last.as_ref() == Some(&event) {
            return None;
        }
        self.last = Some(event.clone());
        Some(event)
    }
}

fn run_detector(
    locator: VolumeLocator,
    poll_interval: Duration,
    cancel: CancelFlag,
    tx: Sender<VolumeEvent>,
) {
    debug!("Detector: watching {:?}", locator.candidates());
    let mut edges = EdgeFilter::default();

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if let Some(event) = edges.accept(locator.probe()) {
            debug!(
                "Detector: connected={} path={}",
                event.connected,
                event.path.display()
            );
            if !deliver(&tx, event, &cancel) {
                break;
            }
        }
        if !sleep_unless_cancelled(poll_interval, &cancel) {
            break;
        }
    }

    debug!("Detector: stopped");
}

/// Block until `event` is queued, giving up on cancellation or when the
/// receiver has gone away.
fn deliver(tx: &Sender<VolumeEvent>, event: VolumeEvent, cancel: &AtomicBool) -> bool {
    let mut pending = event;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(pending, CANCEL_SLICE) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => pending = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Sleep for `total`, waking every [`CANCEL_SLICE`] to check the flag.
/// Returns `false` if cancellation was requested.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(CANCEL_SLICE);
        thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::Relaxed)
}
