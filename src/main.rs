//! kbflash -- build and flash keyboard firmware.
//!
//! Thin binary entry point. All logic lives in the `kbflash-core`
//! and `kbflash-app` crates.

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use kbflash_app::log::LogEntry;
use kbflash_app::state::ALL_TARGETS;
use kbflash_app::{run_command, Command, Orchestrator, RunOptions};
use kbflash_core::config::{self, Config};
use kbflash_core::model::{format_build_date, format_size};
use kbflash_core::scanner::scan_builds;
use std::sync::atomic::AtomicBool;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init => {
            let path = config::generate_example_config(cli.config.as_deref())?;
            println!("Created config at {}", path.display());
            Ok(())
        }
        Commands::List { json } => {
            let cfg = load_config(&cli)?;
            list(&cfg, json)
        }
        Commands::Build { ref target } => {
            let cfg = load_config(&cli)?;
            build(cfg, target.clone())
        }
        Commands::Flash { ref date } => {
            let cfg = load_config(&cli)?;
            flash(cfg, date.as_deref())
        }
        Commands::Reset { yes } => {
            let cfg = load_config(&cli)?;
            reset(cfg, yes)
        }
    }
}

/// `RUST_LOG` wins; otherwise `-v` raises the level from `warn`.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let cfg = config::load(cli.config.as_deref()).context("loading configuration")?;
    tracing::debug!("Loaded config for {}", cfg.keyboard.name);
    Ok(cfg)
}

fn print_entry(entry: &LogEntry) {
    println!("{entry}");
}

fn list(cfg: &Config, json: bool) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let builds = scan_builds(&cfg.build.firmware_dir, &cfg.build.file_pattern, &cancel)
        .with_context(|| format!("scanning {}", cfg.build.firmware_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
        return Ok(());
    }

    if builds.is_empty() {
        println!("No firmware found in {}", cfg.build.firmware_dir.display());
        return Ok(());
    }
    for build in &builds {
        println!(
            "{}  {} file(s), {}",
            build.label(),
            build.files.len(),
            format_size(build.total_size())
        );
        for file in &build.files {
            println!("    {:<32} {:>10}", file.name, format_size(file.size));
        }
    }
    Ok(())
}

fn build(cfg: Config, target: Option<String>) -> Result<()> {
    let wait_timeout = cfg.device.wait_timeout;
    let mut orchestrator = Orchestrator::new(cfg);
    let target = target.unwrap_or_else(|| match orchestrator.sides() {
        [only] => only.clone(),
        _ => ALL_TARGETS.to_string(),
    });

    run_command(
        &mut orchestrator,
        Command::Build(target),
        RunOptions::new(wait_timeout),
        &mut print_entry,
    )?;
    Ok(())
}

fn flash(cfg: Config, date: Option<&str>) -> Result<()> {
    println!("Keyboard: {}", cfg.keyboard.name);
    let wait_timeout = cfg.device.wait_timeout;
    let mut orchestrator = Orchestrator::new(cfg);
    orchestrator.start()?;

    if let Some(date) = date {
        let Some(index) = orchestrator.builds().iter().position(|b| b.date == date) else {
            bail!("no build dated {date}");
        };
        orchestrator.handle_command(Command::SelectBuild(index))?;
    }
    let Some(selected) = orchestrator.selected_build() else {
        bail!(
            "no firmware found in {}",
            orchestrator.config().build.firmware_dir.display()
        );
    };
    println!(
        "Using firmware: {} ({} files)",
        format_build_date(&selected.date),
        selected.files.len()
    );

    let steps = run_command(
        &mut orchestrator,
        Command::Flash,
        RunOptions::new(wait_timeout),
        &mut print_entry,
    )?;
    println!("Done: {}", steps.join(", "));
    Ok(())
}

fn reset(cfg: Config, confirmed: bool) -> Result<()> {
    let wait_timeout = cfg.device.wait_timeout;
    let mut orchestrator = Orchestrator::new(cfg);
    orchestrator.start()?;

    run_command(
        &mut orchestrator,
        Command::FactoryReset { confirmed },
        RunOptions::new(wait_timeout),
        &mut print_entry,
    )?;
    println!("Factory reset complete");
    Ok(())
}
