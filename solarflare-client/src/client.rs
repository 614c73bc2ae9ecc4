//! Subscription manager
//!
//! Couples a [`ReplicaCache`] with an outbound transport: subscribes are
//! sent on first use, inbound frames are dispatched to the cache, and a
//! reconnect re-bootstraps every ready table.

use std::cmp::Ordering;

use tokio::sync::mpsc;
use tracing::{debug, info};

use solarflare_common::protocol::{ClientMessage, ServerMessage, SubscribeMessage};
use solarflare_common::types::{Row, TableRef};

use crate::cache::{ReplicaCache, SubscribeRequest};
use crate::error::{ClientError, Result};
use crate::optimistic::OptimisticChange;
use crate::slot::PrimaryKey;
use crate::table::{Subscriber, TableView};

/// Outbound half of the socket
pub trait Transport: Send {
    fn send(&self, msg: ClientMessage) -> Result<()>;
}

/// Queues outbound messages for a connection driver
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelTransport {
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| ClientError::NotConnected)
    }
}

/// Client-side entry point to a Solarflare relay
pub struct SolarflareClient<T: Transport> {
    cache: ReplicaCache,
    transport: T,
    jwt: String,
    connected_before: bool,
}

impl<T: Transport> SolarflareClient<T> {
    pub fn new(transport: T, jwt: impl Into<String>) -> Self {
        Self {
            cache: ReplicaCache::new(),
            transport,
            jwt: jwt.into(),
            connected_before: false,
        }
    }

    /// Token sent with subsequent subscribes
    pub fn set_jwt(&mut self, jwt: impl Into<String>) {
        self.jwt = jwt.into();
    }

    /// Subscribe to `table`, sending a subscribe the first time only.
    ///
    /// If the send fails the table stays `Loading`.
    pub fn subscribe(&mut self, table: &TableRef, subscriber: Subscriber) -> Result<()> {
        match self.cache.subscribe(table, subscriber) {
            Some(request) => self.send_subscribe(request),
            None => Ok(()),
        }
    }

    /// Call after every successful socket connect.
    ///
    /// On a reconnect every tracked table is re-subscribed: ready tables
    /// drop back to `Loading`, loading tables get a fresh query id.
    /// Returns the number of subscribes sent.
    pub fn on_connected(&mut self) -> Result<usize> {
        if !self.connected_before {
            self.connected_before = true;
            debug!("Connected");
            return Ok(0);
        }

        let requests = self.cache.resubscribe_all();
        let count = requests.len();
        for request in requests {
            self.send_subscribe(request)?;
        }
        info!(tables = count, "Reconnected");
        Ok(count)
    }

    /// Dispatch one inbound message
    pub fn handle_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Bootstrap(bootstrap) => {
                self.cache.apply_bootstrap(bootstrap);
            }
            ServerMessage::Change(change) => {
                self.cache.apply_change(&change);
            }
        }
    }

    /// Parse and dispatch one inbound text frame
    pub fn handle_frame(&mut self, text: &str) -> Result<()> {
        let msg: ServerMessage = serde_json::from_str(text)?;
        self.handle_message(msg);
        Ok(())
    }

    /// Apply an optimistic edit to a ready table
    pub fn optimistic(&mut self, table: &TableRef, change: OptimisticChange) -> Result<()> {
        self.cache.optimistic(table, change)
    }

    /// Roll back the local override of one row
    pub fn clear_override(&mut self, table: &TableRef, pk: &PrimaryKey) -> Result<()> {
        self.cache.clear_override(table, pk)
    }

    /// Whether `msg` is still the outstanding subscribe of its table.
    ///
    /// Subscribes queued before a reconnect are superseded by the ones
    /// [`Self::on_connected`] issues and need not be written.
    pub fn is_current(&self, msg: &SubscribeMessage) -> bool {
        self.cache.is_pending(&msg.table, &msg.query_id)
    }

    pub fn view(&self, table: &TableRef, sort: Option<&dyn Fn(&Row, &Row) -> Ordering>) -> TableView {
        self.cache.view(table, sort)
    }

    pub fn cache(&self) -> &ReplicaCache {
        &self.cache
    }

    fn send_subscribe(&self, request: SubscribeRequest) -> Result<()> {
        debug!(table = %request.table, query_id = %request.query_id, "Sending subscribe");
        self.transport.send(ClientMessage::Subscribe(SubscribeMessage {
            query_id: request.query_id,
            table: request.table,
            jwt: self.jwt.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solarflare_common::change::RawChange;
    use solarflare_common::protocol::BootstrapMessage;
    use solarflare_common::types::TableInfo;
    use std::sync::Arc;

    fn todos() -> TableRef {
        TableRef::public("todos")
    }

    fn bootstrap(rows: serde_json::Value) -> String {
        let msg = ServerMessage::Bootstrap(BootstrapMessage {
            info: TableInfo::new(todos(), "id", None),
            data: serde_json::from_value(rows).unwrap(),
        });
        serde_json::to_string(&msg).unwrap()
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<SubscribeMessage> {
        let mut out = Vec::new();
        while let Ok(ClientMessage::Subscribe(sub)) = rx.try_recv() {
            out.push(sub);
        }
        out
    }

    #[test]
    fn test_subscribe_sends_once_with_jwt() {
        let (transport, mut rx) = ChannelTransport::unbounded();
        let mut client = SolarflareClient::new(transport, "jwt-1");

        client.subscribe(&todos(), Arc::new(|| {})).unwrap();
        client.subscribe(&todos(), Arc::new(|| {})).unwrap();

        let subs = sent(&mut rx);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].jwt, "jwt-1");
        assert_eq!(subs[0].table, todos());
    }

    #[test]
    fn test_frames_reach_the_cache() {
        let (transport, _rx) = ChannelTransport::unbounded();
        let mut client = SolarflareClient::new(transport, "jwt");
        client.subscribe(&todos(), Arc::new(|| {})).unwrap();

        client.handle_frame(&bootstrap(json!([{"id": 1}]))).unwrap();
        let change = ServerMessage::Change(RawChange::insert(
            &todos(),
            json!({"id": 2}).as_object().unwrap(),
        ));
        client.handle_frame(&serde_json::to_string(&change).unwrap()).unwrap();

        assert_eq!(client.view(&todos(), None).rows().map(<[Row]>::len), Some(2));
        assert!(client.handle_frame("{garbage").is_err());
    }

    #[test]
    fn test_reconnect_resubscribes_ready_tables() {
        let (transport, mut rx) = ChannelTransport::unbounded();
        let mut client = SolarflareClient::new(transport, "jwt-1");

        assert_eq!(client.on_connected().unwrap(), 0);
        client.subscribe(&todos(), Arc::new(|| {})).unwrap();
        let first = sent(&mut rx);
        client.handle_frame(&bootstrap(json!([{"id": 1}]))).unwrap();

        client.set_jwt("jwt-2");
        assert_eq!(client.on_connected().unwrap(), 1);
        let again = sent(&mut rx);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].jwt, "jwt-2");
        assert_ne!(again[0].query_id, first[0].query_id);

        assert!(matches!(
            client.view(&todos(), None),
            TableView::Loading { stale: Some(_) }
        ));
        assert!(matches!(
            client.optimistic(&todos(), OptimisticChange::delete(1)),
            Err(ClientError::TableLoading(_))
        ));
    }

    #[test]
    fn test_reconnect_resubscribes_loading_tables() {
        let (transport, mut rx) = ChannelTransport::unbounded();
        let mut client = SolarflareClient::new(transport, "jwt");

        client.on_connected().unwrap();
        client.subscribe(&todos(), Arc::new(|| {})).unwrap();
        let lost = sent(&mut rx);
        assert_eq!(lost.len(), 1);
        assert!(client.is_current(&lost[0]));

        assert_eq!(client.on_connected().unwrap(), 1);
        let again = sent(&mut rx);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].table, todos());
        assert!(!client.is_current(&lost[0]));
        assert!(client.is_current(&again[0]));
        assert_eq!(client.view(&todos(), None), TableView::Loading { stale: None });

        client.handle_frame(&bootstrap(json!([{"id": 1}]))).unwrap();
        assert!(client.view(&todos(), None).is_ready());
    }

    #[test]
    fn test_send_failure_leaves_table_loading() {
        let (transport, rx) = ChannelTransport::unbounded();
        drop(rx);
        let mut client = SolarflareClient::new(transport, "jwt");

        let err = client.subscribe(&todos(), Arc::new(|| {})).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(client.view(&todos(), None), TableView::Loading { stale: None });
    }
}
