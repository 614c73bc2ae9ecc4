//! Per-table replica state

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use solarflare_common::types::{Row, TableInfo};

use crate::slot::{PrimaryKey, Slot};

/// Change callback. Invoked synchronously after a transition completes,
/// so it must not call back into the replica; schedule a re-read instead.
pub type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// Set of subscribers, deduplicated by identity
#[derive(Clone, Default)]
pub struct Subscribers(Vec<Subscriber>);

impl Subscribers {
    /// Add `subscriber`; returns `false` if it is already present
    pub fn insert(&mut self, subscriber: Subscriber) -> bool {
        if self.0.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            return false;
        }
        self.0.push(subscriber);
        true
    }

    pub fn notify(&self) {
        for subscriber in &self.0 {
            subscriber();
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscribers({})", self.0.len())
    }
}

/// Rows of a bootstrapped table keyed by primary key
#[derive(Debug, Clone)]
pub struct TableData {
    pub info: TableInfo,
    pub rows: BTreeMap<PrimaryKey, Slot>,
}

impl TableData {
    pub fn new(info: TableInfo) -> Self {
        Self {
            info,
            rows: BTreeMap::new(),
        }
    }

    /// Visible rows, optionally sorted
    pub fn project(&self, sort: Option<&dyn Fn(&Row, &Row) -> Ordering>) -> Vec<Row> {
        let mut rows: Vec<Row> = self.rows.values().filter_map(Slot::visible).cloned().collect();
        if let Some(sort) = sort {
            rows.sort_by(|a, b| sort(a, b));
        }
        rows
    }
}

/// Lifecycle of one subscribed table
#[derive(Debug)]
pub enum TableState {
    /// Subscribe sent, bootstrap not yet received. `stale` holds the data
    /// of a previous bootstrap while re-subscribing after a reconnect.
    Loading {
        query_id: String,
        subscribers: Subscribers,
        stale: Option<TableData>,
    },
    /// Bootstrapped; confirmed changes and optimistic edits apply
    Ready {
        data: TableData,
        subscribers: Subscribers,
    },
}

impl TableState {
    pub fn subscribers(&self) -> &Subscribers {
        match self {
            Self::Loading { subscribers, .. } | Self::Ready { subscribers, .. } => subscribers,
        }
    }

    pub fn subscribers_mut(&mut self) -> &mut Subscribers {
        match self {
            Self::Loading { subscribers, .. } | Self::Ready { subscribers, .. } => subscribers,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// Query id of an outstanding subscribe
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Self::Loading { query_id, .. } => Some(query_id),
            Self::Ready { .. } => None,
        }
    }
}

/// Read-only projection of a table for rendering
#[derive(Debug, Clone, PartialEq)]
pub enum TableView {
    /// Never subscribed
    Untracked,
    /// Waiting for a bootstrap; rows of the previous one if reconnecting
    Loading { stale: Option<Vec<Row>> },
    Ready(Vec<Row>),
}

impl TableView {
    /// Rows to render, stale or current
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Untracked | Self::Loading { stale: None } => None,
            Self::Loading { stale: Some(rows) } | Self::Ready(rows) => Some(rows.as_slice()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}
