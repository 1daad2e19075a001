/// Native build strategy: run a user-supplied command on the host.
use super::process::run_streaming;
use super::{substitute_side, BuildOutcome, BuildProgress, Builder, ProgressTracker};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone)]
pub struct NativeBuilder {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl NativeBuilder {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for `side` with placeholders substituted.
    pub fn command_for(&self, side: &str) -> (String, Vec<String>) {
        (self.command.clone(), substitute_side(&self.args, side))
    }
}

impl Builder for NativeBuilder {
    fn name(&self) -> &'static str {
        "native"
    }

    fn build(
        &self,
        target: &str,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(BuildProgress),
    ) -> BuildOutcome {
        let (program, args) = self.command_for(target);
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut tracker = ProgressTracker::line_start();
        let result = run_streaming(command, cancel, &mut |line| {
            progress(
                tracker
                    .observe(line)
                    .unwrap_or_else(|| BuildProgress::output(line)),
            )
        });
        BuildOutcome::from_result(result)
    }
}
