/// Flashing orchestrator -- the flow state machine.
///
/// Owns the [`FlowState`], the firmware list, the device status and the
/// side cursor of the current session. Background workers (detector,
/// builder, flasher) report over channels; `process_messages()` drains
/// them and feeds each message through `handle_message()`, which is the
/// only place transitions happen besides `handle_command()`.
///
/// # Side safety
///
/// After side N is flashed the session always moves to `WaitingDisconnect`,
/// so side N+1 can only start after a disconnect *and* a fresh connect
/// have been observed, even if the device never physically moved.
use crate::log::StatusLog;
use chrono::{DateTime, Local};
use kbflash_core::build::{start_build, BuildHandle, BuildOutcome, BuildProgress, Builder};
use kbflash_core::config::Config;
use kbflash_core::detector::{start_detector, DetectorHandle};
use kbflash_core::error::ScanError;
use kbflash_core::flash::{start_flash, FlashHandle, FlashOutcome, FlashProgress};
use kbflash_core::model::{format_size, Build, VolumeEvent};
use kbflash_core::platform::VolumeLocator;
use kbflash_core::scanner::scan_builds;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Maximum worker messages handled per `process_messages()` call.
const MAX_MESSAGES_PER_TICK: usize = 300;

/// How long `start_detection()` waits for the initial presence report.
const FIRST_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Target name that builds every configured side.
pub const ALL_TARGETS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Building,
    WaitingDisconnect,
    WaitingDevice,
    Flashing,
    Complete,
}

impl FlowState {
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingDisconnect | Self::WaitingDevice)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::WaitingDisconnect => "waiting for disconnect",
            Self::WaitingDevice => "waiting for device",
            Self::Flashing => "flashing",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connected,
}

/// User requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build one side, or every side with [`ALL_TARGETS`].
    Build(String),
    /// Flash every side of the selected build.
    Flash,
    /// Flash the reset image to the first side. Needs `confirmed`.
    FactoryReset { confirmed: bool },
    /// Abandon a session that is waiting for the device.
    Cancel,
    /// Dismiss a completed session.
    Acknowledge,
    SelectBuild(usize),
    Rescan,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Flash => "flash",
            Self::FactoryReset { .. } => "factory reset",
            Self::Cancel => "cancel",
            Self::Acknowledge => "acknowledge",
            Self::SelectBuild(_) => "select build",
            Self::Rescan => "rescan",
        }
    }
}

/// Worker reports consumed by the orchestrator.
#[derive(Debug)]
pub enum Message {
    Device(VolumeEvent),
    BuildProgress(BuildProgress),
    BuildFinished(Vec<BuildOutcome>),
    FlashProgress(FlashProgress),
    FlashFinished(FlashOutcome),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("cannot {command} while {state}")]
    NotPermitted {
        command: &'static str,
        state: FlowState,
    },

    #[error("build not enabled in config")]
    BuildDisabled,

    #[error("unknown build target: {0}")]
    UnknownTarget(String),

    #[error("no firmware files found")]
    NoFirmware,

    #[error("no reset firmware found")]
    NoResetFirmware,

    #[error("factory reset is only available for split keyboards")]
    ResetUnsupported,

    #[error("factory reset needs confirmation")]
    NotConfirmed,

    #[error("no build at position {0}")]
    NoSuchBuild(usize),

    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("cannot start worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Flash,
    FactoryReset,
}

/// One flashing session, from the command until Complete or Idle.
#[derive(Debug, Clone)]
pub struct Session {
    pub kind: SessionKind,
    /// Build the session flashes from, fixed at start.
    pub build: Build,
    /// Index into the side sequence.
    pub cursor: usize,
    /// Label of the side currently waited for or flashed.
    pub target: String,
    /// Image for a factory reset session.
    pub reset_file: Option<PathBuf>,
    pub started_at: DateTime<Local>,
    pub completed_steps: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    sides: Vec<String>,
    locator: VolumeLocator,
    builder: Option<Arc<dyn Builder>>,

    // ── Flow ───────────────────────────────────────────
    state: FlowState,
    session: Option<Session>,
    last_failure: Option<String>,

    // ── Firmware ───────────────────────────────────────
    builds: Vec<Build>,
    selected: usize,

    // ── Device ─────────────────────────────────────────
    device: DeviceStatus,
    device_path: Option<PathBuf>,

    // ── Workers ────────────────────────────────────────
    detector: Option<DetectorHandle>,
    build_handle: Option<BuildHandle>,
    flash_handle: Option<FlashHandle>,
    build_target: String,
    build_percent: i32,
    flash_percent: i32,

    log: StatusLog,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let sides = config.keyboard.sides();
        let locator = VolumeLocator::for_volume(&config.device.name);
        let builder = config.build.builder();
        Self {
            config,
            sides,
            locator,
            builder,
            state: FlowState::Idle,
            session: None,
            last_failure: None,
            builds: Vec::new(),
            selected: 0,
            device: DeviceStatus::Disconnected,
            device_path: None,
            detector: None,
            build_handle: None,
            flash_handle: None,
            build_target: String::new(),
            build_percent: 0,
            flash_percent: 0,
            log: StatusLog::new(),
        }
    }

    /// Replace the configured build strategy.
    pub fn with_builder(mut self, builder: Option<Arc<dyn Builder>>) -> Self {
        self.builder = builder;
        self
    }

    /// Watch explicit mount paths instead of the platform defaults.
    pub fn with_locator(mut self, locator: VolumeLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Scan for firmware and start watching for the device.
    pub fn start(&mut self) -> Result<(), CommandError> {
        self.log.info(format!("Started - {}", self.config.keyboard.name));
        if let Err(e) = self.rescan() {
            self.log.error(format!("Scan failed: {e}"));
        }
        self.start_detection()?;
        Ok(())
    }

    /// (Re)start the detector. Any previous worker is cancelled first, so
    /// at most one poller runs at a time.
    pub fn start_detection(&mut self) -> std::io::Result<()> {
        if let Some(old) = self.detector.take() {
            old.stop();
        }
        self.device = DeviceStatus::Disconnected;
        self.device_path = None;
        let handle = start_detector(self.locator.clone(), self.config.device.poll_interval)?;

        // The first event is the current state; take it now so a command
        // issued right after start sees the real device status.
        let first = handle.receiver.recv_timeout(FIRST_EVENT_TIMEOUT).ok();
        self.detector = Some(handle);
        if let Some(event) = first {
            self.on_device(event);
        }
        Ok(())
    }

    /// Re-read the firmware directory. Keeps the selection in range.
    pub fn rescan(&mut self) -> Result<usize, ScanError> {
        let cancel = AtomicBool::new(false);
        self.builds = scan_builds(
            &self.config.build.firmware_dir,
            &self.config.build.file_pattern,
            &cancel,
        )?;
        if self.selected >= self.builds.len() {
            self.selected = 0;
        }
        self.log.info(format!("Found {} build(s)", self.builds.len()));
        Ok(self.builds.len())
    }

    /// Stop every worker. A running build is cancelled and its child killed.
    pub fn shutdown(&mut self) {
        if let Some(d) = self.detector.take() {
            d.stop();
        }
        if let Some(b) = self.build_handle.take() {
            b.cancel();
        }
        if let Some(f) = self.flash_handle.take() {
            f.cancel();
        }
    }

    // ── Accessors ──────────────────────────────────────

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sides(&self) -> &[String] {
        &self.sides
    }

    pub fn builds(&self) -> &[Build] {
        &self.builds
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_build(&self) -> Option<&Build> {
        self.builds.get(self.selected)
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.device
    }

    pub fn device_path(&self) -> Option<&PathBuf> {
        self.device_path.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Steps finished in the current session.
    pub fn completed_steps(&self) -> &[String] {
        self.session
            .as_ref()
            .map(|s| s.completed_steps.as_slice())
            .unwrap_or(&[])
    }

    pub fn session_started_at(&self) -> Option<DateTime<Local>> {
        self.session.as_ref().map(|s| s.started_at)
    }

    pub fn build_target(&self) -> &str {
        &self.build_target
    }

    pub fn build_percent(&self) -> i32 {
        self.build_percent
    }

    pub fn flash_percent(&self) -> i32 {
        self.flash_percent
    }

    pub fn log(&self) -> &StatusLog {
        &self.log
    }

    /// Message of the most recent failed operation, cleared by new commands.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn build_enabled(&self) -> bool {
        self.builder.is_some()
    }

    /// Targets offered for building: each side, plus `all` when split.
    pub fn build_targets(&self) -> Vec<String> {
        let mut targets = self.sides.clone();
        if self.sides.len() > 1 {
            targets.push(ALL_TARGETS.to_string());
        }
        targets
    }

    pub fn can_factory_reset(&self) -> bool {
        self.config.keyboard.is_split()
    }

    // ── Commands ───────────────────────────────────────

    /// Apply a user command. Rejected commands leave the state unchanged
    /// and add a warning to the log.
    pub fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        let result = self.apply_command(&command);
        if let Err(e) = &result {
            self.log.warning(e.to_string());
        }
        result
    }

    fn apply_command(&mut self, command: &Command) -> Result<(), CommandError> {
        let permitted = match command {
            Command::Cancel => self.state.is_waiting() || self.state == FlowState::Complete,
            Command::Acknowledge => self.state == FlowState::Complete,
            _ => self.state == FlowState::Idle,
        };
        if !permitted {
            return Err(CommandError::NotPermitted {
                command: command.name(),
                state: self.state,
            });
        }

        match command {
            Command::Build(target) => self.begin_build(target),
            Command::Flash => self.prepare_flash(),
            Command::FactoryReset { confirmed } => self.prepare_factory_reset(*confirmed),
            Command::Cancel => {
                if self.state.is_waiting() {
                    self.log.info("Cancelled");
                }
                self.finish_session(FlowState::Idle);
                Ok(())
            }
            Command::Acknowledge => {
                self.finish_session(FlowState::Idle);
                Ok(())
            }
            Command::SelectBuild(index) => {
                if *index >= self.builds.len() {
                    return Err(CommandError::NoSuchBuild(*index));
                }
                self.selected = *index;
                Ok(())
            }
            Command::Rescan => {
                self.rescan()?;
                Ok(())
            }
        }
    }

    /// Expand a requested target into the ordered list the worker builds.
    pub fn expand_target(&self, target: &str) -> Result<Vec<String>, CommandError> {
        if target == ALL_TARGETS {
            if self.sides.len() > 1 {
                return Ok(self.sides.clone());
            }
            return Ok(vec![ALL_TARGETS.to_string()]);
        }
        if self.sides.iter().any(|s| s == target) {
            Ok(vec![target.to_string()])
        } else {
            Err(CommandError::UnknownTarget(target.to_string()))
        }
    }

    fn begin_build(&mut self, target: &str) -> Result<(), CommandError> {
        let builder = self.builder.clone().ok_or(CommandError::BuildDisabled)?;
        let targets = self.expand_target(target)?;

        let handle = start_build(builder, targets)?;
        self.last_failure = None;
        self.build_handle = Some(handle);
        self.build_target = target.to_string();
        self.build_percent = 0;
        self.state = FlowState::Building;
        self.log.info(format!("Building: {target}"));
        Ok(())
    }

    fn prepare_flash(&mut self) -> Result<(), CommandError> {
        let build = match self.selected_build() {
            Some(b) if !b.files.is_empty() => b.clone(),
            _ => return Err(CommandError::NoFirmware),
        };
        let first = self.sides.first().cloned().ok_or(CommandError::NoFirmware)?;

        self.last_failure = None;
        self.session = Some(Session {
            kind: SessionKind::Flash,
            build,
            cursor: 0,
            target: first,
            reset_file: None,
            started_at: Local::now(),
            completed_steps: Vec::new(),
        });

        let name = self.target_display_name();
        if self.device == DeviceStatus::Connected {
            self.state = FlowState::WaitingDisconnect;
            self.log.warning(format!("Unplug device, then connect {name}"));
        } else {
            self.state = FlowState::WaitingDevice;
            self.log.info(format!("Connect {name} and double-tap reset..."));
        }
        Ok(())
    }

    fn prepare_factory_reset(&mut self, confirmed: bool) -> Result<(), CommandError> {
        if !self.can_factory_reset() {
            return Err(CommandError::ResetUnsupported);
        }
        if !confirmed {
            return Err(CommandError::NotConfirmed);
        }
        let build = self.selected_build().cloned().ok_or(CommandError::NoFirmware)?;
        let reset_file = build
            .reset_file()
            .map(|f| f.path.clone())
            .ok_or(CommandError::NoResetFirmware)?;
        let first = self.sides.first().cloned().unwrap_or_else(|| "left".into());

        self.last_failure = None;
        self.session = Some(Session {
            kind: SessionKind::FactoryReset,
            build,
            cursor: 0,
            target: format!("{first} (reset)"),
            reset_file: Some(reset_file),
            started_at: Local::now(),
            completed_steps: Vec::new(),
        });
        self.log.warning("Factory reset started");

        if self.device == DeviceStatus::Connected {
            self.begin_flash();
        } else {
            self.state = FlowState::WaitingDevice;
            let target = self.session.as_ref().map(|s| s.target.clone()).unwrap_or_default();
            self.log.info(format!("Connect {target} and double-tap reset..."));
        }
        Ok(())
    }

    fn target_display_name(&self) -> String {
        if !self.config.keyboard.is_split() {
            return "keyboard".to_string();
        }
        self.session
            .as_ref()
            .map(|s| s.target.clone())
            .unwrap_or_default()
    }

    // ── Worker messages ────────────────────────────────

    /// Drain every worker channel without blocking.
    ///
    /// Flash and build outcomes are handled before device events, so a
    /// volume that vanishes right after a flash (the bootloader rebooting)
    /// is seen as the disconnect that releases the next side.
    /// Returns `true` if anything was handled.
    pub fn process_messages(&mut self) -> bool {
        let mut pending = Vec::new();

        if let Some(h) = &self.flash_handle {
            pending.extend(h.progress_rx.try_iter().map(Message::FlashProgress));
            if let Ok(outcome) = h.outcome_rx.try_recv() {
                pending.push(Message::FlashFinished(outcome));
            }
        }
        if let Some(h) = &self.build_handle {
            pending.extend(
                h.progress_rx
                    .try_iter()
                    .take(MAX_MESSAGES_PER_TICK)
                    .map(Message::BuildProgress),
            );
            if let Ok(outcomes) = h.outcome_rx.try_recv() {
                pending.push(Message::BuildFinished(outcomes));
            }
        }
        if let Some(d) = &self.detector {
            pending.extend(
                d.receiver
                    .try_iter()
                    .take(MAX_MESSAGES_PER_TICK)
                    .map(Message::Device),
            );
        }

        let handled = !pending.is_empty();
        for message in pending {
            self.handle_message(message);
        }
        handled
    }

    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Device(event) => self.on_device(event),
            Message::BuildProgress(p) => self.on_build_progress(p),
            Message::BuildFinished(outcomes) => self.on_build_finished(outcomes),
            Message::FlashProgress(p) => self.flash_percent = p.percent(),
            Message::FlashFinished(outcome) => self.on_flash_finished(outcome),
        }
    }

    fn on_device(&mut self, event: VolumeEvent) {
        if event.connected {
            self.device = DeviceStatus::Connected;
            self.device_path = Some(event.path);
            self.log.success("Device connected");
            if self.state == FlowState::WaitingDevice {
                self.begin_flash();
            }
        } else {
            self.device = DeviceStatus::Disconnected;
            self.device_path = None;
            self.log.info("Device disconnected");
            if self.state == FlowState::WaitingDisconnect {
                self.state = FlowState::WaitingDevice;
                let name = self.target_display_name();
                self.log.info(format!("Now connect {name}..."));
            }
        }
    }

    fn on_build_progress(&mut self, progress: BuildProgress) {
        if self.state != FlowState::Building {
            return;
        }
        if progress.is_error() {
            self.log.warning(progress.message);
        } else {
            debug!("build: {}", progress.message);
            self.build_percent = self.build_percent.max(progress.percent.min(100));
        }
    }

    fn on_build_finished(&mut self, outcomes: Vec<BuildOutcome>) {
        self.build_handle = None;
        if self.state != FlowState::Building {
            debug!("Ignoring build outcome while {}", self.state);
            return;
        }
        self.state = FlowState::Idle;

        let failure = outcomes.into_iter().find(|o| !o.is_success());
        match failure {
            None => {
                self.build_percent = 100;
                self.log.success("Build complete");
                if let Err(e) = self.rescan() {
                    self.log.error(format!("Scan failed: {e}"));
                }
            }
            Some(BuildOutcome::Cancelled) => {
                self.last_failure = Some("build cancelled".into());
                self.log.warning("Build cancelled");
            }
            Some(BuildOutcome::Failed(e)) => {
                let message = format!("Build failed: {e}");
                self.last_failure = Some(message.clone());
                self.log.error(message);
            }
            Some(BuildOutcome::Success) => {}
        }
    }

    /// Start copying the current side's image onto the connected volume.
    fn begin_flash(&mut self) {
        let Some(session) = self.session.as_ref() else {
            self.state = FlowState::Idle;
            return;
        };
        let target = session.target.clone();

        let source = match session.kind {
            SessionKind::FactoryReset => session.reset_file.clone(),
            SessionKind::Flash => session.build.file_for_side(&target).map(|f| f.path.clone()),
        };
        let Some(source) = source else {
            self.fail_session(format!("No firmware file for {target}"));
            return;
        };
        let Some(device_dir) = self.device_path.clone() else {
            self.fail_session("Device path unknown".to_string());
            return;
        };

        match start_flash(source, device_dir) {
            Ok(handle) => {
                self.flash_handle = Some(handle);
                self.flash_percent = 0;
                self.state = FlowState::Flashing;
                self.log.info(format!("Flashing {target}"));
            }
            Err(e) => self.fail_session(format!("Flash failed: cannot start worker: {e}")),
        }
    }

    fn on_flash_finished(&mut self, outcome: FlashOutcome) {
        self.flash_handle = None;
        if self.state != FlowState::Flashing {
            debug!("Ignoring flash outcome while {}", self.state);
            return;
        }

        if !outcome.success {
            let message = match &outcome.error {
                _ if outcome.is_cancelled() => "Flash cancelled".to_string(),
                Some(e) => format!("Flash failed: {e}"),
                None => "Flash failed".to_string(),
            };
            self.fail_session(message);
            return;
        }

        self.flash_percent = 100;
        let Some(session) = self.session.as_mut() else {
            self.state = FlowState::Idle;
            return;
        };
        let done = session.target.clone();
        session.completed_steps.push(format!("{done} flashed"));
        self.log.success(format!(
            "{done} flashed ({})",
            format_size(outcome.bytes_written)
        ));

        let next = match session.kind {
            SessionKind::FactoryReset => None,
            SessionKind::Flash => {
                session.cursor += 1;
                self.sides.get(session.cursor).cloned()
            }
        };

        match next {
            Some(side) => {
                session.target = side;
                self.state = FlowState::WaitingDisconnect;
                let name = self.target_display_name();
                self.log.warning(format!("Unplug device, then connect {name}"));
            }
            None => {
                self.state = FlowState::Complete;
                self.log.success("Flash complete");
            }
        }
    }

    /// Abort the session: back to Idle with the cursor discarded.
    fn fail_session(&mut self, message: String) {
        self.log.error(message.clone());
        self.last_failure = Some(message);
        self.finish_session(FlowState::Idle);
    }

    fn finish_session(&mut self, state: FlowState) {
        self.session = None;
        self.state = state;
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbflash_core::model::FirmwareFile;
    use std::path::Path;

    fn config(split: bool) -> Config {
        let text = if split {
            "[keyboard]\nname = \"corne\"\ntype = \"split\"\n[device]\nname = \"NICENANO\"\n"
        } else {
            "[keyboard]\nname = \"macro\"\n[device]\nname = \"NICENANO\"\n"
        };
        Config::from_toml_str(text).unwrap()
    }

    fn build(names: &[&str]) -> Build {
        Build {
            date: "20250115".into(),
            path: PathBuf::from("/fw/20250115"),
            files: names
                .iter()
                .map(|n| FirmwareFile {
                    name: n.to_string(),
                    path: Path::new("/fw/20250115").join(n),
                    size: 1024,
                })
                .collect(),
        }
    }

    fn orchestrator(split: bool, files: &[&str]) -> Orchestrator {
        let mut o = Orchestrator::new(config(split)).with_builder(None);
        o.builds = vec![build(files)];
        o
    }

    fn connected(path: &str) -> Message {
        Message::Device(VolumeEvent {
            connected: true,
            path: PathBuf::from(path),
        })
    }

    fn disconnected() -> Message {
        Message::Device(VolumeEvent {
            connected: false,
            path: PathBuf::from("/Volumes/NICENANO"),
        })
    }

    fn flashed(bytes: u64) -> Message {
        Message::FlashFinished(FlashOutcome {
            success: true,
            bytes_written: bytes,
            error: None,
        })
    }

    #[test]
    fn flash_while_connected_waits_for_disconnect() {
        let mut o = orchestrator(true, &["corne_left.uf2", "corne_right.uf2"]);
        o.handle_message(connected("/Volumes/NICENANO"));
        o.handle_command(Command::Flash).unwrap();
        assert_eq!(o.state(), FlowState::WaitingDisconnect);
        o.handle_message(disconnected());
        assert_eq!(o.state(), FlowState::WaitingDevice);
    }

    #[test]
    fn flash_while_disconnected_waits_for_device() {
        let mut o = orchestrator(true, &["corne_left.uf2", "corne_right.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        assert_eq!(o.state(), FlowState::WaitingDevice);
        assert_eq!(o.session().unwrap().target, "left");
        assert!(o.session_started_at().is_some());
    }

    #[test]
    fn successful_side_requires_disconnect_before_next() {
        let mut o = orchestrator(true, &["corne_left.uf2", "corne_right.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        // Pretend the left side is flashing.
        o.state = FlowState::Flashing;
        o.device = DeviceStatus::Connected;
        o.handle_message(flashed(1024));
        assert_eq!(o.state(), FlowState::WaitingDisconnect);
        assert_eq!(o.session().unwrap().target, "right");
        assert_eq!(o.completed_steps(), ["left flashed"]);

        // A connect event alone never starts the next side.
        o.handle_message(connected("/Volumes/NICENANO"));
        assert_eq!(o.state(), FlowState::WaitingDisconnect);
    }

    #[test]
    fn last_side_completes_and_acknowledge_returns_to_idle() {
        let mut o = orchestrator(false, &["macro.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        o.state = FlowState::Flashing;
        o.handle_message(flashed(10));
        assert_eq!(o.state(), FlowState::Complete);
        assert_eq!(o.completed_steps(), ["main flashed"]);
        assert!(o.handle_command(Command::Flash).is_err());
        o.handle_command(Command::Acknowledge).unwrap();
        assert_eq!(o.state(), FlowState::Idle);
        assert!(o.session().is_none());
    }

    #[test]
    fn failed_flash_discards_cursor() {
        let mut o = orchestrator(true, &["corne_left.uf2", "corne_right.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        o.state = FlowState::Flashing;
        o.handle_message(Message::FlashFinished(FlashOutcome {
            success: false,
            bytes_written: 12,
            error: Some(kbflash_core::error::FlashError::SizeMismatch {
                written: 12,
                expected: 20,
            }),
        }));
        assert_eq!(o.state(), FlowState::Idle);
        assert!(o.session().is_none());
        assert!(o.last_failure().unwrap().contains("size mismatch"));
    }

    #[test]
    fn cancelled_flash_is_logged_once() {
        let mut o = orchestrator(true, &["corne_left.uf2", "corne_right.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        o.state = FlowState::Flashing;
        o.handle_message(Message::FlashFinished(FlashOutcome {
            success: false,
            bytes_written: 0,
            error: Some(kbflash_core::error::FlashError::Cancelled),
        }));
        assert_eq!(o.state(), FlowState::Idle);
        assert_eq!(o.last_failure(), Some("Flash cancelled"));
        assert_eq!(o.log().last().unwrap().message, "Flash cancelled");
    }

    #[test]
    fn missing_side_file_returns_to_idle() {
        let mut o = orchestrator(true, &["a.uf2", "b.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        o.handle_message(connected("/Volumes/NICENANO"));
        assert_eq!(o.state(), FlowState::Idle);
        assert_eq!(o.last_failure(), Some("No firmware file for left"));
    }

    #[test]
    fn cancel_from_waiting_returns_to_idle() {
        let mut o = orchestrator(true, &["corne_left.uf2"]);
        o.handle_command(Command::Flash).unwrap();
        o.handle_command(Command::Cancel).unwrap();
        assert_eq!(o.state(), FlowState::Idle);
        assert!(matches!(
            o.handle_command(Command::Cancel),
            Err(CommandError::NotPermitted { .. })
        ));
    }

    #[test]
    fn flash_without_firmware_is_rejected() {
        let mut o = orchestrator(true, &[]);
        assert!(matches!(
            o.handle_command(Command::Flash),
            Err(CommandError::NoFirmware)
        ));
        assert_eq!(o.state(), FlowState::Idle);
        assert_eq!(o.log().last().unwrap().message, "no firmware files found");
    }

    #[test]
    fn build_requires_builder() {
        let mut o = orchestrator(true, &[]);
        assert!(matches!(
            o.handle_command(Command::Build("left".into())),
            Err(CommandError::BuildDisabled)
        ));
    }

    #[test]
    fn all_target_expands_to_sides() {
        let o = orchestrator(true, &[]);
        assert_eq!(o.expand_target("all").unwrap(), ["left", "right"]);
        assert_eq!(o.expand_target("right").unwrap(), ["right"]);
        assert!(o.expand_target("middle").is_err());
        assert_eq!(o.build_targets(), ["left", "right", "all"]);

        let o = orchestrator(false, &[]);
        assert_eq!(o.expand_target("all").unwrap(), ["all"]);
        assert_eq!(o.build_targets(), ["main"]);
    }

    #[test]
    fn factory_reset_rules() {
        let mut o = orchestrator(false, &["settings_reset.uf2"]);
        assert!(matches!(
            o.handle_command(Command::FactoryReset { confirmed: true }),
            Err(CommandError::ResetUnsupported)
        ));

        let mut o = orchestrator(true, &["corne_left.uf2"]);
        assert!(matches!(
            o.handle_command(Command::FactoryReset { confirmed: false }),
            Err(CommandError::NotConfirmed)
        ));
        assert!(matches!(
            o.handle_command(Command::FactoryReset { confirmed: true }),
            Err(CommandError::NoResetFirmware)
        ));

        let mut o = orchestrator(true, &["corne_left.uf2", "settings_reset.uf2"]);
        o.handle_command(Command::FactoryReset { confirmed: true }).unwrap();
        assert_eq!(o.state(), FlowState::WaitingDevice);
        let session = o.session().unwrap();
        assert_eq!(session.target, "left (reset)");
        assert_eq!(session.kind, SessionKind::FactoryReset);

        // A reset flashes one side only.
        o.state = FlowState::Flashing;
        o.handle_message(flashed(1));
        assert_eq!(o.state(), FlowState::Complete);
    }

    #[test]
    fn build_progress_never_regresses() {
        let mut o = orchestrator(true, &[]);
        o.state = FlowState::Building;
        o.handle_message(Message::BuildProgress(BuildProgress::status(40, "a")));
        o.handle_message(Message::BuildProgress(BuildProgress::output("raw")));
        assert_eq!(o.build_percent(), 40);
        o.handle_message(Message::BuildProgress(BuildProgress::error_line("x: error: y")));
        assert_eq!(o.build_percent(), 40);
        assert_eq!(o.log().last().unwrap().message, "x: error: y");
    }

    #[test]
    fn build_failure_returns_to_idle_with_diagnostic() {
        let mut o = orchestrator(true, &[]);
        o.state = FlowState::Building;
        o.handle_message(Message::BuildFinished(vec![BuildOutcome::Failed(
            kbflash_core::error::BuildError::RuntimeUnavailable("docker is not running".into()),
        )]));
        assert_eq!(o.state(), FlowState::Idle);
        assert_eq!(o.last_failure(), Some("Build failed: docker is not running"));
    }

    #[test]
    fn select_build_is_bounds_checked() {
        let mut o = orchestrator(true, &["a.uf2"]);
        o.handle_command(Command::SelectBuild(0)).unwrap();
        assert!(matches!(
            o.handle_command(Command::SelectBuild(3)),
            Err(CommandError::NoSuchBuild(3))
        ));
    }
}
