mod app;
mod manager;
mod models;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use app::cli;
use manager::task_manager::TaskManager;
use models::config::Config;

#[derive(Parser, Debug)]
#[command(version, about = "Run shell commands inside a sandbox root with timeouts and background tasks")]
struct Args {
    /// Directory commands run in; also holds the task store
    #[arg(short = 'r', long = "saferoot")]
    safe_root: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let safe_root = match args.safe_root.canonicalize() {
        Ok(path) if path.is_dir() => path,
        Ok(path) => {
            error!("Sandbox root {} is not a directory", path.display());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Sandbox root {} is unusable: {}", args.safe_root.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "{} {} starting in {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        safe_root.display()
    );

    let manager = match TaskManager::open(Config::new(safe_root)) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Could not load task state: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cli::run_cli(&manager) {
        error!("Front end stopped: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
