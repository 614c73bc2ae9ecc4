//! Configuration types for the relay

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to bind to
    pub host: String,
    /// Port for the socket server (default: 54321)
    pub port: u16,
    /// Path to the `solarflare.json` manifest
    pub manifest_path: PathBuf,
    /// Secret used to verify subscriber JWTs
    pub jwt_secret: Option<String>,
    /// Database connection configuration
    pub database: DatabaseConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 54321,
            manifest_path: PathBuf::from("solarflare.json"),
            jwt_secret: None,
            database: DatabaseConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Check that every required setting is present
    pub fn validate(&self) -> Result<()> {
        if self.database.url.as_deref().map_or(true, str::is_empty) {
            return Err(Error::ConfigError(
                "database connection string is not set (DB_CONNECTION_STRING)".to_string(),
            ));
        }
        if self.jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(Error::ConfigError(
                "JWT secret is not set (JWT_SECRET_KEY)".to_string(),
            ));
        }
        if self.database.slot_name.is_empty() {
            return Err(Error::ConfigError("replication slot name is empty".to_string()));
        }
        if self.database.poll_interval_ms == 0 || self.database.ack_interval_secs == 0 {
            return Err(Error::ConfigError(
                "poll and acknowledgement intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database connection and replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string
    pub url: Option<String>,
    /// Logical replication slot using the wal2json plugin
    pub slot_name: String,
    /// How often the slot is polled for new changes
    pub poll_interval_ms: u64,
    /// How often processed changes are acknowledged to the database
    pub ack_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            slot_name: "solarflared".to_string(),
            poll_interval_ms: 100,
            ack_interval_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.database.url = Some("postgres://localhost/app".to_string());
        config.jwt_secret = Some("secret".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 54321);
        assert_eq!(config.database.slot_name, "solarflared");
        assert_eq!(config.database.ack_interval_secs, 10);
        assert_eq!(config.bind_address(), "0.0.0.0:54321");
    }

    #[test]
    fn test_validate_requires_database_and_secret() {
        assert!(RelayConfig::default().validate().is_err());

        let mut config = complete_config();
        assert!(config.validate().is_ok());

        config.jwt_secret = Some(String::new());
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_serialization() {
        let config = complete_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, parsed.port);
        assert_eq!(config.database.url, parsed.database.url);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: RelayConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.database.poll_interval_ms, 100);
    }
}
