//! podlink: dial pods by name through on-demand port-forward tunnels.
//!
//! Resolves symbolic addresses such as `web-0.default.pod.cluster.local:8080`
//! to a tunnel that is established lazily, and exposes it through a local
//! proxy listener or a one-off reachability probe.

mod backend;
mod commands;
mod config;
mod policy;
mod proxy;

use clap::{Parser, Subcommand};
use config::{BackendKind, Overrides, Settings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

/// podlink: redirect connections to pods through port-forward tunnels
#[derive(Parser, Debug)]
#[command(name = "podlink", version, about = "Dial pods by name through on-demand port-forward tunnels")]
struct Cli {
    /// Config file path (default: ~/.podlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tunnel backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable debug logging for podlink
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen locally and redirect every connection to the pod
    Forward {
        /// Pod address, e.g. web-0.default.pod.cluster.local:8080
        addr: String,

        /// Local listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Seconds to wait for the tunnel on each connection
        #[arg(long)]
        dial_timeout: Option<u64>,
    },

    /// Open the tunnel, connect once, and report the redirected endpoint
    Probe {
        /// Pod address, e.g. web-0.default.pod.cluster.local:8080
        addr: String,

        /// Seconds to wait for the tunnel
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show the name, scope and port parsed from an address
    Parse {
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = if cli.verbose {
        EnvFilter::new("podlink=debug,podlink_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("podlink: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Command::Forward {
            addr,
            listen,
            dial_timeout,
        } => {
            let settings = Settings::load(
                Some(config_path.as_path()),
                Overrides {
                    listen,
                    backend: cli.backend,
                    dial_timeout_secs: dial_timeout,
                },
            )?;
            commands::forward::run(&addr, &settings).await
        }
        Command::Probe { addr, timeout } => {
            let settings = Settings::load(
                Some(config_path.as_path()),
                Overrides {
                    backend: cli.backend,
                    ..Overrides::default()
                },
            )?;
            commands::probe::run(&addr, &settings, Duration::from_secs(timeout)).await
        }
        Command::Parse { addr } => commands::parse::run(&addr),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub(crate) async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
