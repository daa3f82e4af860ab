//! `phev-pipe` entry point.
//!
//! Connects to the head unit, runs the session until Ctrl-C, and logs every
//! protocol event.
//!
//! # Usage
//!
//! ```text
//! phev-pipe [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Configuration file [default: platform config dir]
//!   --host <HOST>     Head unit address (overrides [vehicle].host)
//!   --port <PORT>     Head unit port (overrides [vehicle].port)
//!   --mac <MAC>       Device MAC, aa:bb:cc:dd:ee:ff (overrides [client].mac)
//!   --register        Register this device if the car does not know it yet
//! ```
//!
//! ```text
//! main()
//!  ├─ load_config()          --config, else the platform default path
//!  ├─ Session::new()         TcpTransport + default PHEV stages
//!  ├─ ctrl_c task            SessionHandle::stop()
//!  └─ spawn_blocking         session.start(mac); session.run()
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use phev_pipe::application::dispatch::logging_handler;
use phev_pipe::infrastructure::stages::phev_stages;
use phev_pipe::infrastructure::storage::config::{
    config_file_path, load_config, parse_mac, AppConfig,
};
use phev_pipe::infrastructure::transport::TcpTransport;
use phev_pipe::{Session, SessionSettings};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Session client for the PHEV head-unit protocol.
#[derive(Debug, Parser)]
#[command(name = "phev-pipe", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "PHEV_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PHEV_HOST")]
    host: Option<String>,

    #[arg(long, env = "PHEV_PORT")]
    port: Option<u16>,

    /// MAC address announced to the car.
    #[arg(long, env = "PHEV_MAC")]
    mac: Option<String>,

    /// Register this device with the car when needed.
    #[arg(long, env = "PHEV_REGISTER")]
    register: bool,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.vehicle.host = host;
        }
        if let Some(port) = self.port {
            config.vehicle.port = port;
        }
        if let Some(mac) = self.mac {
            config.client.mac = mac;
        }
        if self.register {
            config.session.register_device = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    let path = match cli.config.take() {
        Some(path) => path,
        None => config_file_path()?,
    };
    let mut config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    cli.apply(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!(config = %path.display(), "phev-pipe starting");

    let mac = parse_mac(&config.client.mac)?;
    let transport = TcpTransport::new(
        config.vehicle.host.clone(),
        config.vehicle.port,
        config.vehicle.read_timeout(),
    );
    let settings = SessionSettings::new(
        Box::new(transport),
        phev_stages(&config.session.filtered_registers),
    )
    .with_config(config.session.clone())
    .on_registration_complete(|status| {
        info!(vin = ?status.vin, "device registered with vehicle");
    });

    let mut session = Session::new(settings);
    session.register_event_handler(logging_handler)?;
    let handle = session.handle();

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            if handle.stop().is_err() {
                error!("session already gone");
            }
        }
    });

    info!(
        host = %config.vehicle.host,
        port = config.vehicle.port,
        "connecting to vehicle.  Press Ctrl-C to exit."
    );

    let result = tokio::task::spawn_blocking(move || {
        session.start(mac);
        session.run()
    })
    .await?;

    match result {
        Ok(()) => {
            info!("phev-pipe stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "session ended");
            Err(e.into())
        }
    }
}
