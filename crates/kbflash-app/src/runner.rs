/// Headless console driver.
///
/// Issues one command to the orchestrator, then pumps worker messages on a
/// fixed tick until the flow settles: back in `Idle`, or in `Complete`
/// (which is acknowledged). Each new status line is handed to the caller.
/// Waiting for the device is bounded by `wait_timeout`; on expiry the
/// session is cancelled.
use crate::log::LogEntry;
use crate::state::{Command, CommandError, FlowState, Orchestrator};
use crossbeam_channel::tick;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub tick: Duration,
    pub wait_timeout: Duration,
}

impl RunOptions {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            tick: DEFAULT_TICK,
            wait_timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no device within {}s while {state}", .waited.as_secs())]
    Timeout { state: FlowState, waited: Duration },

    #[error("{0}")]
    Failed(String),
}

/// Run `command` to completion. Returns the steps the session completed.
pub fn run_command(
    orchestrator: &mut Orchestrator,
    command: Command,
    options: RunOptions,
    on_log: &mut dyn FnMut(&LogEntry),
) -> Result<Vec<String>, RunError> {
    let mut seen = orchestrator.log().pushed();
    let result = orchestrator.handle_command(command);
    flush_log(orchestrator, &mut seen, on_log);
    result?;

    let ticker = tick(options.tick);
    let mut phase = orchestrator.state();
    let mut phase_started = Instant::now();

    loop {
        orchestrator.process_messages();
        flush_log(orchestrator, &mut seen, on_log);

        let state = orchestrator.state();
        if state != phase {
            phase = state;
            phase_started = Instant::now();
        }

        match state {
            FlowState::Idle => {
                return match orchestrator.last_failure() {
                    Some(failure) => Err(RunError::Failed(failure.to_string())),
                    None => Ok(Vec::new()),
                };
            }
            FlowState::Complete => {
                let steps = orchestrator.completed_steps().to_vec();
                orchestrator.handle_command(Command::Acknowledge)?;
                flush_log(orchestrator, &mut seen, on_log);
                return Ok(steps);
            }
            s if s.is_waiting() && phase_started.elapsed() >= options.wait_timeout => {
                orchestrator.handle_command(Command::Cancel)?;
                flush_log(orchestrator, &mut seen, on_log);
                return Err(RunError::Timeout {
                    state: s,
                    waited: options.wait_timeout,
                });
            }
            _ => {}
        }

        let _ = ticker.recv();
    }
}

fn flush_log(orchestrator: &Orchestrator, seen: &mut u64, on_log: &mut dyn FnMut(&LogEntry)) {
    for entry in orchestrator.log().since(*seen) {
        on_log(entry);
    }
    *seen = orchestrator.log().pushed();
}
