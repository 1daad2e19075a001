/// KBFlash App -- the flashing orchestrator and its console frontend.
///
/// - `state`: flow state machine driving detector, builder and flasher.
/// - `log`: rolling status log exposed to frontends.
/// - `runner`: headless driver used by the CLI.
pub mod log;
pub mod runner;
pub mod state;

pub use runner::{run_command, RunError, RunOptions};
pub use state::{Command, CommandError, DeviceStatus, FlowState, Message, Orchestrator};
