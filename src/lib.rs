//! Solarflare
//!
//! Realtime Postgres relay with row-scoped fan-out, plus an optimistic
//! client replica.
//!
//! # Components
//!
//! - **Relay** (`solarflared`) - tails a wal2json replication slot and
//!   broadcasts committed changes to subscribed sockets
//! - **Auth** - verifies subscriber JWTs and extracts the RLS scope claim
//! - **Client** - keeps a local, optimistically editable copy of tables

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use solarflare_auth as auth;
pub use solarflare_client as client;
pub use solarflare_common as common;
pub use solarflare_realtime as realtime;

use std::sync::Arc;
use tracing::info;

use solarflare_auth::JwtVerifier;
use solarflare_common::config::RelayConfig;
use solarflare_common::error::{Error, Result};
use solarflare_common::manifest::Manifest;
use solarflare_realtime::{PgDatabase, RelayServer, ReplicationStream, SocketServer, TableRegistry};

/// The relay daemon: one database connection, one socket server, one
/// replication stream
pub struct Solarflared {
    config: RelayConfig,
    database: Arc<PgDatabase>,
    server: Arc<RelayServer>,
}

impl Solarflared {
    /// Validate configuration, load the manifest and prepare the database.
    ///
    /// # Errors
    /// Fails on missing settings, an invalid manifest, a database without
    /// logical WAL, or a published table without a single-column primary
    /// key.
    pub async fn new(config: RelayConfig) -> Result<Self> {
        info!("Initializing Solarflare relay");
        config.validate()?;

        let manifest = Manifest::load(&config.manifest_path)?;
        info!(
            path = %config.manifest_path.display(),
            tables = manifest.tables.len(),
            "Loaded manifest"
        );

        let database = Arc::new(PgDatabase::connect(&config.database).await?);
        database.verify_wal_level().await?;

        let registry = TableRegistry::build(&manifest, database.as_ref()).await?;
        database.ensure_replication_slot().await?;

        let secret = config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| Error::ConfigError("JWT secret is not set".to_string()))?;
        let server = Arc::new(RelayServer::new(
            registry,
            JwtVerifier::new(secret),
            database.clone(),
        ));

        Ok(Self {
            config,
            database,
            server,
        })
    }

    /// Get reference to the relay server
    #[must_use]
    pub fn server(&self) -> &RelayServer {
        &self.server
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Serve sockets and stream changes until either stops.
    ///
    /// # Errors
    /// Returns the error that stopped the socket server or the replication
    /// stream.
    pub async fn run(&self) -> Result<()> {
        let socket = SocketServer::new(self.server.clone(), self.config.bind_address());
        let replication = ReplicationStream::new(
            self.database.clone(),
            self.server.clone(),
            &self.config.database,
        );

        info!("Starting Solarflare relay");
        info!("  - Socket: ws://{}", self.config.bind_address());
        info!("  - Slot: {}", self.config.database.slot_name);

        tokio::select! {
            result = socket.run() => result,
            result = replication.run() => result,
        }
    }
}
