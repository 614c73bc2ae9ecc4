//! Postgres access
//!
//! One regular (non-replication) connection serves startup checks, primary
//! key introspection, bootstrap reads and the wal2json slot. Changes are
//! read with `pg_logical_slot_peek_changes` and acknowledged separately with
//! `pg_replication_slot_advance`, so the slot only moves past changes the
//! relay has already routed.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use solarflare_common::config::DatabaseConfig;
use solarflare_common::error::{Error, Result};
use solarflare_common::types::{Row, ScopeKey, TableInfo, TableRef};

use crate::filter::SnapshotQuery;
use crate::lsn::Lsn;
use crate::replication::ChangeSource;
use crate::snapshot::SnapshotSource;
use crate::tables::Introspect;

const OUTPUT_PLUGIN: &str = "wal2json";

const PRIMARY_KEY_SQL: &str = "\
    SELECT a.attname::text \
    FROM pg_index i \
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
    WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
    ORDER BY a.attnum";

const PEEK_CHANGES_SQL: &str = "\
    SELECT lsn::text, data \
    FROM pg_logical_slot_peek_changes($1, NULL, NULL, 'format-version', '1')";

fn db_error(context: &str, e: &tokio_postgres::Error) -> Error {
    Error::DatabaseError(format!("{context}: {e}"))
}

/// Connection to the published database
pub struct PgDatabase {
    client: Client,
    slot_name: String,
    connection: JoinHandle<()>,
}

impl PgDatabase {
    /// Connect and spawn the connection driver
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::ConfigError("database connection string is not set".into()))?;

        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| db_error("connect", &e))?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres connection error");
            }
        });

        info!(slot = %config.slot_name, "Connected to Postgres");
        Ok(Self {
            client,
            slot_name: config.slot_name.clone(),
            connection,
        })
    }

    /// Fail unless the server runs with `wal_level = logical`
    pub async fn verify_wal_level(&self) -> Result<()> {
        let row = self
            .client
            .query_one("SELECT current_setting('wal_level')", &[])
            .await
            .map_err(|e| db_error("read wal_level", &e))?;
        let level: String = row.try_get(0).map_err(|e| db_error("read wal_level", &e))?;

        if level == "logical" {
            Ok(())
        } else {
            Err(Error::ConfigError(format!(
                "wal_level must be 'logical', found '{level}'"
            )))
        }
    }

    /// Create the wal2json slot unless it already exists
    pub async fn ensure_replication_slot(&self) -> Result<()> {
        let existing = self
            .client
            .query_opt(
                "SELECT plugin::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await
            .map_err(|e| db_error("query replication slots", &e))?;

        if let Some(row) = existing {
            let plugin: Option<String> =
                row.try_get(0).map_err(|e| db_error("query replication slots", &e))?;
            return match plugin.as_deref() {
                Some(OUTPUT_PLUGIN) => {
                    info!(slot = %self.slot_name, "Replication slot exists");
                    Ok(())
                }
                other => Err(Error::ConfigError(format!(
                    "replication slot {} uses plugin {:?}, expected {OUTPUT_PLUGIN}",
                    self.slot_name, other
                ))),
            };
        }

        self.client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, $2)",
                &[&self.slot_name, &OUTPUT_PLUGIN],
            )
            .await
            .map_err(|e| db_error("create replication slot", &e))?;

        info!(slot = %self.slot_name, plugin = OUTPUT_PLUGIN, "Created replication slot");
        Ok(())
    }
}

impl Drop for PgDatabase {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl Introspect for PgDatabase {
    async fn primary_key_columns(&self, table: &TableRef) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(PRIMARY_KEY_SQL, &[&table.sql_identifier()])
            .await
            .map_err(|e| db_error("read primary key", &e))?;

        rows.iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| db_error("read primary key", &e))
    }
}

#[async_trait]
impl SnapshotSource for PgDatabase {
    async fn select_all(&self, info: &TableInfo, scope: Option<&ScopeKey>) -> Result<Vec<Row>> {
        let query = SnapshotQuery::new(info, scope);
        let rows = match &query.scope {
            Some(scope) => self.client.query(&query.sql, &[scope]).await,
            None => self.client.query(&query.sql, &[]).await,
        }
        .map_err(|e| db_error("bootstrap read", &e))?;

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get(0).map_err(|e| db_error("bootstrap read", &e))?;
            data.push(serde_json::from_str::<Row>(&json)?);
        }
        debug!(table = %info.table, rows = data.len(), "Bootstrap read");
        Ok(data)
    }
}

#[async_trait]
impl ChangeSource for PgDatabase {
    async fn peek_changes(&self) -> Result<Vec<(Lsn, String)>> {
        let rows = self
            .client
            .query(PEEK_CHANGES_SQL, &[&self.slot_name])
            .await
            .map_err(|e| db_error("peek changes", &e))?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: String = row.try_get(0).map_err(|e| db_error("peek changes", &e))?;
            let data: String = row.try_get(1).map_err(|e| db_error("peek changes", &e))?;
            changes.push((lsn.parse()?, data));
        }
        Ok(changes)
    }

    async fn acknowledge(&self, lsn: Lsn) -> Result<()> {
        self.client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.slot_name, &lsn.to_string()],
            )
            .await
            .map_err(|e| db_error("advance replication slot", &e))?;
        Ok(())
    }
}
