//! Solarflare relay daemon
//!
//! Binary entry point for `solarflared`.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use solarflare::Solarflared;
use solarflare_common::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "solarflared")]
#[command(about = "Realtime Postgres relay with row-scoped fan-out", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "solarflared.toml")]
    config: PathBuf,

    /// Postgres connection string
    #[arg(long, env = "DB_CONNECTION_STRING")]
    database_url: Option<String>,

    /// Secret used to verify subscriber JWTs
    #[arg(long, env = "JWT_SECRET_KEY", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Socket server port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Path to the table manifest
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line and environment values override the file
    fn apply(self, config: &mut RelayConfig) {
        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }
        if let Some(secret) = self.jwt_secret {
            config.jwt_secret = Some(secret);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(manifest) = self.manifest {
            config.manifest_path = manifest;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("Solarflare relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config)?;
        toml::from_str(&content)?
    } else {
        info!("Using default configuration");
        RelayConfig::default()
    };
    args.apply(&mut config);

    let relay = match Solarflared::new(config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!(code = e.error_code(), "Startup failed: {}", e);
            return Err(e.into());
        }
    };

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(code = e.error_code(), "Relay stopped: {}", e);
                return Err(e.into());
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
