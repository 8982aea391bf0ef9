use clap::Parser;
use dotenv::dotenv;
use loghub::service::setup_tracing;
use loghub::{App, AppConfig, AppError, AppResult};
use std::path::PathBuf;
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    // load .env before reading any environment variable
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let app_config = AppConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        let printed = serde_json::to_string_pretty(&app_config)
            .map_err(|e| AppError::InvalidValue(e.to_string()))?;
        println!("{printed}");
        return Ok(());
    }

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 | 1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = rt.block_on(setup_tracing(&app_config.tracing))?;

    let app = App::new(app_config);
    let res = rt.block_on(app.run(async {
        if let Err(err) = signal::ctrl_c().await {
            error!(cause = %err, "failed to listen for ctrl-c");
        }
    }));
    match &res {
        Ok(()) => info!("log service exited"),
        Err(err) => error!(cause = %err, "log service exited with error"),
    }
    res
}
