//! Relay server
//!
//! Owns the table registry, token verifier, channel memberships and the
//! snapshot source. The socket layer calls [`RelayServer::connect`],
//! [`RelayServer::handle_text`] and [`RelayServer::disconnect`]; the
//! replication stream calls [`RelayServer::on_transaction`]. Failed
//! subscribes are logged and never answered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use solarflare_auth::{scope_from_claims, JwtVerifier};
use solarflare_common::change::{decode, RawChange, Wal2JsonTransaction};
use solarflare_common::error::{Error, Result};
use solarflare_common::protocol::{
    BootstrapMessage, ClientMessage, Frame, ServerMessage, SubscribeMessage,
};
use solarflare_common::types::channel_name;

use crate::channel::{ChannelManager, ConnectionId};
use crate::filter;
use crate::snapshot::SnapshotSource;
use crate::tables::TableRegistry;

/// Outcome of routing one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    /// Members reached, including pending ones that buffered the frame
    pub recipients: usize,
}

/// Realtime relay server
pub struct RelayServer {
    registry: TableRegistry,
    verifier: JwtVerifier,
    channels: ChannelManager,
    snapshots: Arc<dyn SnapshotSource>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(
        registry: TableRegistry,
        verifier: JwtVerifier,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            registry,
            verifier,
            channels: ChannelManager::new(),
            snapshots,
        }
    }

    /// Get the channel manager
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Register a new connection
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        self.channels.register()
    }

    /// Drop a connection and all of its memberships
    pub fn disconnect(&self, id: ConnectionId) {
        self.channels.unregister(id);
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                let e = Error::InvalidSubscribe(e.to_string());
                warn!(connection = %id, code = e.error_code(), "Unreadable message: {}", e);
                return;
            }
        };

        match message {
            ClientMessage::Subscribe(subscribe) => {
                let query_id = subscribe.query_id.clone();
                let table = subscribe.table.clone();
                match self.subscribe(id, subscribe).await {
                    Ok(channel) => {
                        info!(connection = %id, query_id, channel, "Subscribed");
                    }
                    Err(e) => {
                        error!(
                            connection = %id,
                            query_id,
                            table = %table,
                            code = e.error_code(),
                            "Subscribe failed: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    /// Join the subscriber to its channel and send it a bootstrap snapshot.
    ///
    /// Changes broadcast while the snapshot is read are buffered for the
    /// subscriber and delivered right after the bootstrap. Returns the
    /// channel joined.
    pub async fn subscribe(&self, id: ConnectionId, msg: SubscribeMessage) -> Result<String> {
        let claims = self.verifier.verify(&msg.jwt)?;
        let info = self
            .registry
            .get(&msg.table)
            .ok_or_else(|| Error::UnknownTable(msg.table.clone()))?;

        let scope = if info.rls_enabled() {
            let claim = self.registry.claim().ok_or_else(|| {
                Error::ConfigError(format!("no JWT claim configured for {}", info.table))
            })?;
            Some(scope_from_claims(&claims, claim)?)
        } else {
            None
        };
        let channel = channel_name(&info.table, scope.as_ref());

        if !self.channels.join(id, &channel) {
            return Err(Error::TransportError(format!(
                "connection {id} closed before subscribing"
            )));
        }

        let data = match self.snapshots.select_all(info, scope.as_ref()).await {
            Ok(data) => data,
            Err(e) => {
                self.channels.leave(id, &channel);
                return Err(e);
            }
        };

        let rows = data.len();
        let frame = ServerMessage::Bootstrap(BootstrapMessage {
            info: info.clone(),
            data,
        })
        .to_frame()?;

        if self.channels.activate(id, &channel, frame) {
            debug!(connection = %id, channel, rows, "Bootstrap sent");
        }
        Ok(channel)
    }

    /// Route every change of a transaction in order.
    ///
    /// Returns the number of changes routed to a channel.
    pub fn on_transaction(&self, tx: &Wal2JsonTransaction) -> usize {
        tx.change
            .iter()
            .filter_map(|raw| self.on_change(raw))
            .count()
    }

    /// Route one change, logging anything that cannot be delivered
    pub fn on_change(&self, raw: &RawChange) -> Option<Delivery> {
        match self.route_change(raw) {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(
                    table = %raw.table_ref(),
                    kind = ?raw.kind,
                    code = e.error_code(),
                    "Change dropped: {}",
                    e
                );
                None
            }
        }
    }

    /// Decode, filter and broadcast one change
    pub fn route_change(&self, raw: &RawChange) -> Result<Option<Delivery>> {
        let table = raw.table_ref();
        let Some(info) = self.registry.get(&table) else {
            debug!(table = %table, "Change on unpublished table skipped");
            return Ok(None);
        };

        let Some(event) = decode(raw)? else {
            return Ok(None);
        };
        if !filter::has_primary_key(info, &event) {
            return Err(Error::MalformedChange(format!(
                "{:?} change on {} lacks primary key column {}",
                raw.kind,
                table,
                info.pk
            )));
        }
        let Some(channel) = filter::route(info, &event)? else {
            return Ok(None);
        };

        let frame = ServerMessage::Change(raw.clone()).to_frame()?;
        let recipients = self.channels.broadcast(&channel, &frame);
        debug!(channel, recipients, kind = ?event.kind, "Change broadcast");

        Ok(Some(Delivery {
            channel,
            recipients,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotSource;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use solarflare_common::change::RawKind;
    use solarflare_common::types::{Row, TableInfo, TableRef};

    const SECRET: &str = "relay-secret";

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn token(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn server() -> (RelayServer, Arc<MemorySnapshotSource>) {
        let registry = TableRegistry::from_tables(
            vec![
                TableInfo::new(TableRef::public("todos"), "id", None),
                TableInfo::new(
                    TableRef::public("employees"),
                    "id",
                    Some("user_id".to_string()),
                ),
            ],
            Some("user_id".to_string()),
        )
        .unwrap();
        let source = Arc::new(MemorySnapshotSource::new());
        let server = RelayServer::new(registry, JwtVerifier::new(SECRET), source.clone());
        (server, source)
    }

    fn subscribe_msg(table: &str, jwt: String) -> SubscribeMessage {
        SubscribeMessage {
            query_id: "q-1".to_string(),
            table: TableRef::public(table),
            jwt,
        }
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<ServerMessage> {
        rx.try_recv()
            .ok()
            .map(|f| serde_json::from_str(&f).unwrap())
    }

    #[tokio::test]
    async fn test_subscribe_sends_bootstrap() {
        let (server, source) = server();
        source.set_rows(TableRef::public("todos"), vec![row(json!({"id": 1, "text": "a"}))]);
        let (id, mut rx) = server.connect();

        let channel = server
            .subscribe(id, subscribe_msg("todos", token(&json!({"user_id": 1}))))
            .await
            .unwrap();
        assert_eq!(channel, "todos");

        match next(&mut rx) {
            Some(ServerMessage::Bootstrap(b)) => {
                assert_eq!(b.info.pk, "id");
                assert_eq!(b.data.len(), 1);
            }
            other => panic!("expected bootstrap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rls_scopes_bootstrap_and_changes() {
        let (server, source) = server();
        let employees = TableRef::public("employees");
        source.set_rows(
            employees.clone(),
            vec![
                row(json!({"id": 1, "user_id": 1})),
                row(json!({"id": 2, "user_id": 2})),
            ],
        );
        let (id, mut rx) = server.connect();

        let channel = server
            .subscribe(id, subscribe_msg("employees", token(&json!({"user_id": 2}))))
            .await
            .unwrap();
        assert_eq!(channel, "employees.2");
        let Some(ServerMessage::Bootstrap(b)) = next(&mut rx) else {
            panic!("expected bootstrap");
        };
        assert_eq!(b.data, vec![row(json!({"id": 2, "user_id": 2}))]);

        let other = RawChange::insert(&employees, &row(json!({"id": 3, "user_id": 1})));
        assert_eq!(server.on_change(&other).unwrap().recipients, 0);
        assert!(next(&mut rx).is_none());

        let mine = RawChange::update(&employees, &row(json!({"id": 2, "user_id": 2})));
        assert_eq!(server.on_change(&mine).unwrap().recipients, 1);
        assert!(matches!(next(&mut rx), Some(ServerMessage::Change(_))));
    }

    #[tokio::test]
    async fn test_subscribe_rejections() {
        let (server, _) = server();
        let (id, mut rx) = server.connect();

        let err = server
            .subscribe(id, subscribe_msg("secrets", token(&json!({"user_id": 1}))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTable(_)));

        let err = server
            .subscribe(id, subscribe_msg("employees", token(&json!({"sub": "x"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingClaim(_)));

        let err = server
            .subscribe(id, subscribe_msg("todos", "not-a-token".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken));

        let err = server
            .subscribe(id, subscribe_msg("secrets", "not-a-token".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken));

        assert!(next(&mut rx).is_none());
        assert_eq!(server.channels().count(), 0);
    }

    #[tokio::test]
    async fn test_handle_text_ignores_garbage() {
        let (server, _) = server();
        let (id, mut rx) = server.connect();
        server.handle_text(id, "{not json").await;
        server.handle_text(id, r#"{"event":"unsubscribe","payload":{}}"#).await;
        assert!(next(&mut rx).is_none());
    }

    #[test]
    fn test_change_routing_edge_cases() {
        let (server, _) = server();

        let unknown = RawChange::insert(&TableRef::public("audit"), &row(json!({"id": 1})));
        assert_eq!(server.route_change(&unknown).unwrap(), None);

        let no_rls_column =
            RawChange::delete(&TableRef::public("employees"), &row(json!({"id": 1})));
        assert!(matches!(
            server.route_change(&no_rls_column),
            Err(Error::MissingRlsColumn { .. })
        ));
        assert!(server.on_change(&no_rls_column).is_none());

        let no_pk = RawChange::insert(&TableRef::public("todos"), &row(json!({"text": "a"})));
        assert!(matches!(
            server.route_change(&no_pk),
            Err(Error::MalformedChange(_))
        ));
    }

    #[test]
    fn test_transaction_routes_changes_in_order() {
        let (server, _) = server();
        let (id, mut rx) = server.connect();
        server.channels().join(id, "todos");
        server.channels().activate(id, "todos", Arc::from("{}"));
        let _ = rx.try_recv();

        let todos = TableRef::public("todos");
        let tx = Wal2JsonTransaction {
            change: vec![
                RawChange::insert(&todos, &row(json!({"id": 1}))),
                RawChange::update(&todos, &row(json!({"id": 1, "done": true}))),
                RawChange::delete(&todos, &row(json!({"id": 1}))),
            ],
        };
        assert_eq!(server.on_transaction(&tx), 3);

        let kinds: Vec<_> = std::iter::from_fn(|| next(&mut rx))
            .map(|m| match m {
                ServerMessage::Change(c) => c.kind,
                ServerMessage::Bootstrap(_) => panic!("unexpected bootstrap"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![RawKind::Insert, RawKind::Update, RawKind::Delete]
        );
    }
}
