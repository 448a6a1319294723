//! fogd - Fog control-plane daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use fog_core::FogConfig;
use fogd::Daemon;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Fog control-plane daemon.
#[derive(Parser)]
#[command(name = "fogd")]
#[command(about = "Orchestrates AI coding assistants across git repositories")]
#[command(version)]
struct Cli {
    /// State directory (default: ~/.fog, env: FOG_HOME)
    #[arg(long)]
    home: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    port: Option<u16>,

    /// Cap on concurrently active runs
    #[arg(long)]
    max_parallel: Option<usize>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match FogConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(home) = cli.home {
        config.home = home;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max_parallel) = cli.max_parallel {
        config.max_parallel = max_parallel;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
