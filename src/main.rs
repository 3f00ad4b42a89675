use anyhow::{Context, Result};
use argh::FromArgs;
use log::debug;
use pipeshell::config::Config;
use pipeshell::relay::SignalRelay;
use pipeshell::{Interpreter, Registry, logging};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(FromArgs)]
/// A line-oriented shell that runs pipelines of external programs.
struct Args {
    #[argh(option, short = 'c')]
    /// run this command line and exit.
    command: Option<String>,

    #[argh(option)]
    /// configuration file to use instead of ~/.config/pipeshell/config.toml.
    config: Option<PathBuf>,

    #[argh(option)]
    /// log level: off, error, warn, info, debug or trace.
    log_level: Option<String>,

    #[argh(positional)]
    /// script to run instead of reading commands interactively.
    script: Option<PathBuf>,
}

fn run(args: Args) -> Result<i32> {
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    let level = logging::parse_level(args.log_level.as_deref().unwrap_or(&config.log_level));
    logging::init(level, config.log_file.as_deref())?;

    let registry = Arc::new(Registry::new());
    let relay = SignalRelay::install(Arc::clone(&registry)).context("failed to install signal relay")?;
    let mut shell = Interpreter::new(&config, registry)?;

    let code = if let Some(command) = &args.command {
        debug!("running -c {:?}", command);
        shell.execute_line(command)?
    } else if let Some(script) = &args.script {
        shell.run_script(script)?
    } else {
        shell.repl()?
    };

    relay.shutdown();
    Ok(code)
}

fn main() -> std::process::ExitCode {
    let args: Args = argh::from_env();
    match run(args) {
        Ok(code) => std::process::ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("pipeshell: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
