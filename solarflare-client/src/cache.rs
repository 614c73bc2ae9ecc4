//! Client replica cache
//!
//! Holds every subscribed table as [`TableState`]. Tables start `Loading`
//! on first subscribe and become `Ready` when their bootstrap arrives.
//! Confirmed changes and optimistic edits only apply to `Ready` tables.
//! Subscribers are notified after each completed transition.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use uuid::Uuid;

use solarflare_common::change::{decode, ChangeKind, RawChange};
use solarflare_common::protocol::BootstrapMessage;
use solarflare_common::types::{Row, TableRef};

use crate::error::{ClientError, Result};
use crate::optimistic::OptimisticChange;
use crate::slot::{merge, PrimaryKey, Slot};
use crate::table::{Subscriber, Subscribers, TableData, TableState, TableView};

/// A subscribe the caller must send to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub query_id: String,
    pub table: TableRef,
}

impl SubscribeRequest {
    fn new(table: TableRef) -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
            table,
        }
    }
}

/// Optimistic replica of every subscribed table
#[derive(Debug, Default)]
pub struct ReplicaCache {
    tables: HashMap<TableRef, TableState>,
}

impl ReplicaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for `table`.
    ///
    /// The first subscription to a table moves it to `Loading` and returns
    /// the subscribe request to send; later ones only add the subscriber.
    pub fn subscribe(&mut self, table: &TableRef, subscriber: Subscriber) -> Option<SubscribeRequest> {
        if let Some(state) = self.tables.get_mut(table) {
            state.subscribers_mut().insert(subscriber);
            return None;
        }

        let request = SubscribeRequest::new(table.clone());
        let mut subscribers = Subscribers::default();
        subscribers.insert(subscriber);
        self.tables.insert(
            table.clone(),
            TableState::Loading {
                query_id: request.query_id.clone(),
                subscribers,
                stale: None,
            },
        );
        debug!(table = %table, query_id = %request.query_id, "Table loading");
        Some(request)
    }

    /// Install a bootstrap snapshot. Returns `true` if it was applied.
    pub fn apply_bootstrap(&mut self, msg: BootstrapMessage) -> bool {
        let table = msg.info.table.clone();
        let Some(state) = self.tables.get_mut(&table) else {
            error!(table = %table, "Bootstrap for untracked table dropped");
            return false;
        };
        let TableState::Loading { subscribers, .. } = state else {
            debug!(table = %table, "Bootstrap for ready table ignored");
            return false;
        };

        let mut data = TableData::new(msg.info);
        for row in msg.data {
            match PrimaryKey::of_row(&row, &data.info.pk) {
                Some(pk) => {
                    data.rows.insert(pk, Slot::Normal { value: row });
                }
                None => {
                    error!(table = %table, pk = %data.info.pk, "Bootstrap row without primary key dropped");
                }
            }
        }

        let subscribers = std::mem::take(subscribers);
        debug!(table = %table, rows = data.rows.len(), "Table ready");
        *state = TableState::Ready { data, subscribers };
        state.subscribers().notify();
        true
    }

    /// Apply a server-confirmed change. Returns `true` if it was applied.
    ///
    /// Confirmed values overwrite any local override of the row.
    pub fn apply_change(&mut self, raw: &RawChange) -> bool {
        let table = raw.table_ref();
        let Some(state) = self.tables.get_mut(&table) else {
            error!(table = %table, "Change for untracked table dropped");
            return false;
        };
        let TableState::Ready { data, subscribers } = state else {
            debug!(table = %table, "Change while loading dropped");
            return false;
        };

        let event = match decode(raw) {
            Ok(Some(event)) => event,
            Ok(None) => return false,
            Err(e) => {
                error!(table = %table, "Undecodable change dropped: {}", e);
                return false;
            }
        };

        let Some(pk) = PrimaryKey::of_row(&event.row, &data.info.pk) else {
            error!(table = %table, pk = %data.info.pk, "Change without primary key dropped");
            return false;
        };

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                data.rows.insert(pk, Slot::Normal { value: event.row });
            }
            ChangeKind::Delete => {
                data.rows.remove(&pk);
            }
        }

        subscribers.notify();
        true
    }

    /// Apply an optimistic edit.
    ///
    /// Rejected edits are logged and leave the replica untouched.
    pub fn optimistic(&mut self, table: &TableRef, change: OptimisticChange) -> Result<()> {
        self.apply_optimistic(table, change)
            .inspect_err(|e| error!(table = %table, "Optimistic change rejected: {}", e))
    }

    fn apply_optimistic(&mut self, table: &TableRef, change: OptimisticChange) -> Result<()> {
        let (data, subscribers) = self.ready_mut(table)?;
        let pk = PrimaryKey::from_value(change.pk()).ok_or_else(|| ClientError::MissingPrimaryKey {
            table: table.clone(),
            column: data.info.pk.clone(),
        })?;

        let next = match (change, data.rows.get(&pk)) {
            (OptimisticChange::Insert { .. }, Some(_)) => {
                return Err(ClientError::RowExists { table: table.clone(), pk });
            }
            (OptimisticChange::Insert { pk: pk_value, data: mut data_row }, None) => {
                data_row.entry(data.info.pk.clone()).or_insert(pk_value);
                Some(Slot::Inserted { pending: data_row })
            }

            (OptimisticChange::Update { .. } | OptimisticChange::Delete { .. }, None) => {
                return Err(ClientError::RowMissing { table: table.clone(), pk });
            }
            (OptimisticChange::Update { .. } | OptimisticChange::Delete { .. }, Some(Slot::Deleted { .. })) => {
                return Err(ClientError::RowDeleted { table: table.clone(), pk });
            }

            (OptimisticChange::Update { .. }, Some(Slot::Inserted { .. })) => {
                return Err(ClientError::RowNotConfirmed { table: table.clone(), pk });
            }
            (
                OptimisticChange::Update { data: patch, .. },
                Some(Slot::Normal { value } | Slot::Updated { value, .. }),
            ) => Some(Slot::Updated {
                pending: merge(value, &patch),
                value: value.clone(),
            }),

            (OptimisticChange::Delete { .. }, Some(Slot::Inserted { .. })) => None,
            (
                OptimisticChange::Delete { .. },
                Some(Slot::Normal { value } | Slot::Updated { value, .. }),
            ) => Some(Slot::Deleted { value: value.clone() }),
        };

        match next {
            Some(slot) => {
                data.rows.insert(pk, slot);
            }
            None => {
                data.rows.remove(&pk);
            }
        }

        subscribers.notify();
        Ok(())
    }

    /// Drop the local override of a row, restoring its confirmed value.
    ///
    /// An unconfirmed insert is removed entirely.
    pub fn clear_override(&mut self, table: &TableRef, pk: &PrimaryKey) -> Result<()> {
        self.restore_confirmed(table, pk)
            .inspect_err(|e| error!(table = %table, pk = %pk, "Rollback rejected: {}", e))
    }

    fn restore_confirmed(&mut self, table: &TableRef, pk: &PrimaryKey) -> Result<()> {
        let (data, subscribers) = self.ready_mut(table)?;

        let restored = match data.rows.get(pk) {
            None => {
                return Err(ClientError::RowMissing { table: table.clone(), pk: pk.clone() });
            }
            Some(Slot::Normal { .. }) => {
                return Err(ClientError::NothingToUndo { table: table.clone(), pk: pk.clone() });
            }
            Some(Slot::Inserted { .. }) => None,
            Some(Slot::Updated { value, .. } | Slot::Deleted { value }) => {
                Some(Slot::Normal { value: value.clone() })
            }
        };

        match restored {
            Some(slot) => {
                data.rows.insert(pk.clone(), slot);
            }
            None => {
                data.rows.remove(pk);
            }
        }

        subscribers.notify();
        Ok(())
    }

    /// Re-issue a subscribe for every tracked table after a reconnect.
    ///
    /// `Ready` tables move back to `Loading` and keep their data as stale
    /// rows. Tables still loading get a fresh query id, since their
    /// outstanding subscribe died with the old socket.
    pub fn resubscribe_all(&mut self) -> Vec<SubscribeRequest> {
        let mut requests = Vec::new();

        for (table, state) in &mut self.tables {
            let request = SubscribeRequest::new(table.clone());
            match state {
                TableState::Ready { data, subscribers } => {
                    let info = data.info.clone();
                    let data = std::mem::replace(data, TableData::new(info));
                    let subscribers = std::mem::take(subscribers);
                    *state = TableState::Loading {
                        query_id: request.query_id.clone(),
                        subscribers,
                        stale: Some(data),
                    };
                }
                TableState::Loading { query_id, .. } => {
                    query_id.clone_from(&request.query_id);
                }
            }
            requests.push(request);
        }

        if !requests.is_empty() {
            warn!(tables = requests.len(), "Re-subscribing after reconnect");
        }
        requests
    }

    /// Whether `query_id` is the outstanding subscribe of `table`
    pub fn is_pending(&self, table: &TableRef, query_id: &str) -> bool {
        self.tables
            .get(table)
            .and_then(TableState::query_id)
            .is_some_and(|current| current == query_id)
    }

    /// Current projection of `table`
    pub fn view(&self, table: &TableRef, sort: Option<&dyn Fn(&Row, &Row) -> Ordering>) -> TableView {
        match self.tables.get(table) {
            None => TableView::Untracked,
            Some(TableState::Loading { stale, .. }) => TableView::Loading {
                stale: stale.as_ref().map(|data| data.project(sort)),
            },
            Some(TableState::Ready { data, .. }) => TableView::Ready(data.project(sort)),
        }
    }

    /// Visible rows of a ready table, deserialized into `T`
    pub fn typed_rows<T: DeserializeOwned>(&self, table: &TableRef) -> Result<Vec<T>> {
        let data = self.ready(table)?;
        data.project(None)
            .into_iter()
            .map(|row| serde_json::from_value(row.into()).map_err(ClientError::from))
            .collect()
    }

    pub fn state(&self, table: &TableRef) -> Option<&TableState> {
        self.tables.get(table)
    }

    /// Slot of one row in a ready table
    pub fn slot(&self, table: &TableRef, pk: &PrimaryKey) -> Option<&Slot> {
        match self.tables.get(table)? {
            TableState::Ready { data, .. } => data.rows.get(pk),
            TableState::Loading { .. } => None,
        }
    }

    /// Every table the replica tracks
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.keys()
    }

    fn ready(&self, table: &TableRef) -> Result<&TableData> {
        match self.tables.get(table) {
            None => Err(ClientError::UntrackedTable(table.clone())),
            Some(TableState::Loading { .. }) => Err(ClientError::TableLoading(table.clone())),
            Some(TableState::Ready { data, .. }) => Ok(data),
        }
    }

    fn ready_mut(&mut self, table: &TableRef) -> Result<(&mut TableData, &Subscribers)> {
        match self.tables.get_mut(table) {
            None => Err(ClientError::UntrackedTable(table.clone())),
            Some(TableState::Loading { .. }) => Err(ClientError::TableLoading(table.clone())),
            Some(TableState::Ready { data, subscribers }) => Ok((data, &*subscribers)),
        }
    }
}
