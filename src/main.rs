use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use p1p2gateway_lib::serialport::BusPort;
use p1p2gateway_lib::{Config, Engine};
use std::{ops::Deref, panic, path::Path};

mod commandline;
mod daemon;
mod mqtt;
mod udp;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn load_config(args: &commandline::CliArgs) -> Result<Config> {
    let mut config = if Path::new(&args.config_file).exists() {
        Config::load(&args.config_file)
            .with_context(|| format!("Cannot load config file '{}'", args.config_file))?
    } else {
        info!(
            "Config file '{}' not found, using defaults",
            args.config_file
        );
        Config::default()
    };
    if let Some(address) = args.address {
        config.controller.address = address;
    }
    config
        .validate()
        .with_context(|| "Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_config(&args)?;

    match args.command {
        commandline::CliCommands::Config => {
            print!(
                "{}",
                serde_yaml::to_string(&config).with_context(|| "Cannot serialize config")?
            );
        }
        commandline::CliCommands::Run { output } => {
            let port = BusPort::open(&args.device, args.timeout)
                .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
            let mut engine = Engine::new(config).with_context(|| "Cannot start engine")?;
            daemon::queue_initial(&mut engine, &args.commands);
            daemon::run(port, engine, output, args.connect)?;
        }
    }

    Ok(())
}
