//! Replication stream
//!
//! Polls the slot for committed transactions, routes each one through the
//! relay in WAL order, and periodically acknowledges the last routed
//! position so the database can reclaim WAL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use solarflare_common::change::Wal2JsonTransaction;
use solarflare_common::config::DatabaseConfig;
use solarflare_common::error::Result;

use crate::lsn::Lsn;
use crate::server::RelayServer;

/// A logical replication slot emitting wal2json transactions
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Transactions not yet acknowledged, in WAL order
    async fn peek_changes(&self) -> Result<Vec<(Lsn, String)>>;

    /// Release everything up to and including `lsn`
    async fn acknowledge(&self, lsn: Lsn) -> Result<()>;
}

/// Feeds slot changes into a [`RelayServer`]
pub struct ReplicationStream {
    source: Arc<dyn ChangeSource>,
    server: Arc<RelayServer>,
    poll_interval: Duration,
    ack_interval: Duration,
    processed: Option<Lsn>,
    acknowledged: Option<Lsn>,
}

impl ReplicationStream {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        server: Arc<RelayServer>,
        config: &DatabaseConfig,
    ) -> Self {
        Self {
            source,
            server,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            ack_interval: Duration::from_secs(config.ack_interval_secs),
            processed: None,
            acknowledged: None,
        }
    }

    /// Last position routed through the relay
    pub fn processed(&self) -> Option<Lsn> {
        self.processed
    }

    /// Last position acknowledged to the slot
    pub fn acknowledged(&self) -> Option<Lsn> {
        self.acknowledged
    }

    /// Run until the source fails.
    ///
    /// Outstanding progress is acknowledged before a source error is
    /// returned when possible.
    pub async fn run(mut self) -> Result<()> {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ack = interval(self.ack_interval);
        ack.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ack.tick().await;

        info!(
            poll = ?self.poll_interval,
            ack = ?self.ack_interval,
            "Replication stream started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        if let Err(ack_err) = self.acknowledge().await {
                            error!(code = ack_err.error_code(), "Final acknowledgement failed: {}", ack_err);
                        }
                        return Err(e);
                    }
                }
                _ = ack.tick() => {
                    self.acknowledge().await?;
                }
            }
        }
    }

    /// Route every transaction past the last processed position.
    ///
    /// Returns the number of transactions routed.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let mut routed = 0;

        for (lsn, data) in self.source.peek_changes().await? {
            if self.processed.is_some_and(|done| lsn <= done) {
                continue;
            }

            match serde_json::from_str::<Wal2JsonTransaction>(&data) {
                Ok(tx) => {
                    let delivered = self.server.on_transaction(&tx);
                    debug!(lsn = %lsn, changes = tx.change.len(), delivered, "Transaction routed");
                    routed += 1;
                }
                Err(e) => {
                    error!(lsn = %lsn, error = %e, "Unreadable wal2json transaction skipped");
                }
            }
            self.processed = Some(lsn);
        }

        Ok(routed)
    }

    /// Acknowledge the last processed position if it moved
    pub async fn acknowledge(&mut self) -> Result<()> {
        let Some(lsn) = self.processed else {
            return Ok(());
        };
        if self.acknowledged == Some(lsn) {
            return Ok(());
        }

        self.source.acknowledge(lsn).await?;
        self.acknowledged = Some(lsn);
        debug!(lsn = %lsn, "Acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotSource;
    use crate::tables::TableRegistry;
    use parking_lot::Mutex;
    use serde_json::json;
    use solarflare_auth::JwtVerifier;
    use solarflare_common::types::{TableInfo, TableRef};

    #[derive(Default)]
    struct FakeSlot {
        pending: Mutex<Vec<(Lsn, String)>>,
        acked: Mutex<Vec<Lsn>>,
    }

    impl FakeSlot {
        fn push(&self, lsn: u64, data: serde_json::Value) {
            self.pending.lock().push((Lsn::new(lsn), data.to_string()));
        }
    }

    #[async_trait]
    impl ChangeSource for FakeSlot {
        async fn peek_changes(&self) -> Result<Vec<(Lsn, String)>> {
            Ok(self.pending.lock().clone())
        }

        async fn acknowledge(&self, lsn: Lsn) -> Result<()> {
            self.pending.lock().retain(|(l, _)| *l > lsn);
            self.acked.lock().push(lsn);
            Ok(())
        }
    }

    fn stream(slot: Arc<FakeSlot>) -> (ReplicationStream, Arc<RelayServer>) {
        let registry = TableRegistry::from_tables(
            vec![TableInfo::new(TableRef::public("todos"), "id", None)],
            None,
        )
        .unwrap();
        let server = Arc::new(RelayServer::new(
            registry,
            JwtVerifier::new("secret"),
            Arc::new(MemorySnapshotSource::new()),
        ));
        let stream = ReplicationStream::new(slot, server.clone(), &DatabaseConfig::default());
        (stream, server)
    }

    fn insert(id: i64) -> serde_json::Value {
        json!({"change": [{
            "kind": "insert",
            "schema": "public",
            "table": "todos",
            "columnnames": ["id"],
            "columntypes": ["integer"],
            "columnvalues": [id]
        }]})
    }

    #[tokio::test]
    async fn test_peeked_transactions_are_routed_once() {
        let slot = Arc::new(FakeSlot::default());
        let (mut stream, server) = stream(slot.clone());
        let (id, mut rx) = server.connect();
        server.channels().join(id, "todos");
        server.channels().activate(id, "todos", Arc::from("boot"));

        slot.push(10, insert(1));
        assert_eq!(stream.poll_once().await.unwrap(), 1);
        slot.push(20, insert(2));
        assert_eq!(stream.poll_once().await.unwrap(), 1);
        assert_eq!(stream.processed(), Some(Lsn::new(20)));

        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 3);
    }

    #[tokio::test]
    async fn test_acknowledge_only_when_progressed() {
        let slot = Arc::new(FakeSlot::default());
        let (mut stream, _) = stream(slot.clone());

        stream.acknowledge().await.unwrap();
        assert!(slot.acked.lock().is_empty());

        slot.push(10, insert(1));
        stream.poll_once().await.unwrap();
        stream.acknowledge().await.unwrap();
        stream.acknowledge().await.unwrap();

        assert_eq!(*slot.acked.lock(), vec![Lsn::new(10)]);
        assert_eq!(stream.acknowledged(), Some(Lsn::new(10)));
        assert!(slot.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_transaction_is_skipped() {
        let slot = Arc::new(FakeSlot::default());
        let (mut stream, _) = stream(slot.clone());

        slot.pending.lock().push((Lsn::new(5), "{oops".to_string()));
        slot.push(6, insert(1));
        assert_eq!(stream.poll_once().await.unwrap(), 1);
        assert_eq!(stream.processed(), Some(Lsn::new(6)));
    }
}
