/// Streaming execution of an external build tool.
///
/// stdout and stderr are read line by line on two reader threads and
/// merged into one channel, so the caller sees output as it is produced.
/// The cancel flag is checked before every line and while idle; on
/// cancellation the whole process group is killed and reaped.
use crate::error::BuildError;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Output lines kept for the failure diagnostic.
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run `command` to completion, calling `on_line` for every output line.
///
/// A non-zero exit becomes [`BuildError::ExitStatus`] carrying the last
/// [`DIAGNOSTIC_TAIL_LINES`] lines of output.
pub fn run_streaming(
    mut command: Command,
    cancel: &AtomicBool,
    on_line: &mut dyn FnMut(&str),
) -> Result<(), BuildError> {
    let program = command.get_program().to_string_lossy().into_owned();
    if cancel.load(Ordering::Relaxed) {
        return Err(BuildError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!("Spawning {:?}", command);
    let mut child = command.spawn().map_err(|source| BuildError::Spawn {
        program: program.clone(),
        source,
    })?;

    let (tx, rx) = unbounded::<String>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader("kbflash-stdout", stdout, tx.clone(), &mut child)?;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader("kbflash-stderr", stderr, tx, &mut child)?;
    }

    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
    let mut exited = false;
    loop {
        if cancel.load(Ordering::Relaxed) {
            terminate(&mut child);
            return Err(BuildError::Cancelled);
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                if cancel.load(Ordering::Relaxed) {
                    terminate(&mut child);
                    return Err(BuildError::Cancelled);
                }
                on_line(&line);
                if tail.len() == DIAGNOSTIC_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                // A leftover grandchild can hold the pipes open after the
                // tool itself has exited; stop once output has gone quiet.
                if exited {
                    break;
                }
                exited = matches!(child.try_wait(), Ok(Some(_)));
            }
        }
    }

    let status = child.wait().map_err(|source| BuildError::Io {
        context: format!("waiting for {program}"),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::ExitStatus {
            program,
            status,
            diagnostic: tail.into(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    tx: Sender<String>,
    child: &mut Child,
) -> Result<(), BuildError> {
    let spawned = thread::Builder::new()
        .name(name.into())
        .spawn(move || forward_lines(stream, tx));
    match spawned {
        Ok(_) => Ok(()),
        Err(e) => {
            terminate(child);
            Err(BuildError::Worker(format!("cannot start output reader: {e}")))
        }
    }
}

/// Forward complete lines until EOF or the receiver goes away.
/// Invalid UTF-8 is replaced rather than aborting the stream.
fn forward_lines<R: Read>(stream: R, tx: Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output reader stopped: {e}");
                break;
            }
        }
    }
}

/// Kill the child and everything it started, then reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!("killpg({pid}) failed: {e}");
            }
        }
    }
    if let Err(e) = child.kill() {
        debug!("kill failed: {e}");
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap cancelled build process: {e}");
    }
}
