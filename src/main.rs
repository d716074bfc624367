mod cli;
mod commands;
mod config;
mod emulator;
mod engine;
mod error;
mod hook;
mod paths;
mod progress;
mod property;
mod registry;
mod runner;
mod settings;
mod transport;
mod ui;
mod vm;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use commands::Context;
use config::AppConfig;
use hook::{CommandHook, NoHook, ScriptHook};
use opflow::Reactor;
use registry::{Environment, Sdk};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use vm::HostCapacity;
use vm::vbox::VBoxManage;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::from(e.downcast_ref::<error::Error>().map_or(1, error::Error::exit_code))
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    if let Command::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "enginectl", &mut io::stdout());
        return Ok(0);
    }

    let mut ctx = load_context(cli.quiet)?;
    match cli.command {
        Command::Engine(cmd) => commands::engine::run(&mut ctx, cmd),
        Command::Emulator(cmd) => commands::emulator::run(&mut ctx, cmd).map(|()| 0),
        Command::Config(cmd) => commands::config::run(&mut ctx, cmd).map(|()| 0),
        Command::Completions { .. } => Ok(0),
    }
}

fn load_context(quiet: bool) -> Result<Context> {
    let config_dir = paths::config_dir()?;
    let app = AppConfig::load(&config_dir)?;
    let reactor = Reactor::new().context("Failed to start the reactor")?;
    let program = std::env::current_exe().context("Could not locate the enginectl binary")?;

    let env = Environment::new(
        reactor.handle(),
        Arc::new(VBoxManage::new(app.vboxmanage.clone())),
        HostCapacity::detect(),
        paths::targets_tools_dir(&config_dir),
        program,
        app.system_settings_only,
        app.device_models.clone(),
    );
    let sdk = match Sdk::load(env, &config_dir, &paths::system_config_dir()) {
        Ok(sdk) => sdk,
        Err(e) if e.is_fatal_to_load() => {
            return Err(anyhow::Error::new(e).context(format!(
                "Could not load the settings from {}",
                config_dir.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let hook: Box<dyn ScriptHook> = match app.hook {
        Some(program) => Box::new(CommandHook::new(program)),
        None => Box::new(NoHook),
    };

    Ok(Context {
        reactor,
        sdk,
        hook,
        quiet,
        auto_stop_vms: config::auto_stop_vms(),
    })
}
