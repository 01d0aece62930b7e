//! canisterd - Container Runtime Daemon
//!
//! Brings up the lifecycle engine over an on-disk package repository,
//! autostarts the containers that ask for it, and serves the control
//! protocol on a unix socket until a shutdown request arrives.
//!
//! ## Usage
//!
//! ```sh
//! canisterd [--repository <dir>] [--run-dir <dir>] [--socket <path>] [--verbose]
//! ```

use canister::engine::{Engine, EngineConfig};
use canister::launcher::NativeLauncher;
use canister::platform::KernelInventory;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// Defaults
// =============================================================================

/// Returns the platform-appropriate state directory.
///
/// - Linux: `/var/lib/canister` (persistent packages)
/// - elsewhere: `~/.canister`
fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/canister")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::home_dir()
            .map(|h| h.join(".canister"))
            .unwrap_or_else(|| PathBuf::from(".canister"))
    }
}

/// Returns the platform-appropriate runtime directory.
fn default_run_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/run/canister")
    }

    #[cfg(not(target_os = "linux"))]
    {
        default_data_dir().join("run")
    }
}

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
struct Options {
    repository: PathBuf,
    run_dir: PathBuf,
    socket: PathBuf,
    verbose: bool,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        repository: default_data_dir().join("repository"),
        run_dir: default_run_dir(),
        socket: default_run_dir().join("console.sock"),
        verbose: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--repository" => {
                options.repository = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--repository requires a path")?;
            }
            "--run-dir" => {
                options.run_dir = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--run-dir requires a path")?;
            }
            "--socket" => {
                options.socket = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--socket requires a path")?;
            }
            "--verbose" | "-v" => options.verbose = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(options)
}

fn print_help() {
    println!(
        "canisterd - container runtime daemon

USAGE:
    canisterd [OPTIONS]

OPTIONS:
    --repository <dir>   package repository [default: {}]
    --run-dir <dir>      unpacked container roots [default: {}]
    --socket <path>      console unix socket [default: {}]
    -v, --verbose        debug logging
    -h, --help           this text",
        default_data_dir().join("repository").display(),
        default_run_dir().display(),
        default_run_dir().join("console.sock").display(),
    );
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            return ExitCode::FAILURE;
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if options.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set tracing subscriber");
        return ExitCode::FAILURE;
    }

    info!("canisterd {}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig {
        run_dir: options.run_dir,
        repository_dir: options.repository,
    };
    let inventory = KernelInventory::detect();
    let engine = match Engine::new(config, Arc::new(NativeLauncher::new()), inventory) {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    engine.autostart().await;

    #[cfg(unix)]
    {
        let console = canister::console::Console::new(engine);
        if let Err(e) = console.serve_unix(&options.socket).await {
            error!("console failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    #[cfg(not(unix))]
    {
        error!("no console transport on this platform");
        return ExitCode::FAILURE;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}
