//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kbflash")]
#[command(author, version, about = "Build and flash keyboard firmware onto UF2 bootloader volumes", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: $XDG_CONFIG_HOME/kbflash/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an example config file
    Init,

    /// List firmware builds, newest first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build firmware for one side, or `all`
    Build {
        /// Side to build (default: all sides)
        target: Option<String>,
    },

    /// Flash every side of the newest (or chosen) build
    Flash {
        /// Build to flash, as YYYYMMDD
        #[arg(long, value_parser = parse_date_key)]
        date: Option<String>,
    },

    /// Flash the settings-reset image to the first side
    Reset {
        /// Confirm the factory reset
        #[arg(long)]
        yes: bool,
    },
}

/// Accept only `YYYYMMDD` build keys.
fn parse_date_key(s: &str) -> Result<String, String> {
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        Ok(s.to_string())
    } else {
        Err(format!("expected YYYYMMDD, got {s:?}"))
    }
}
