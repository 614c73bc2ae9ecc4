//! Solarflare Realtime Relay
//!
//! Streams committed row changes from a Postgres logical replication slot
//! to socket subscribers:
//! - Bootstrap snapshots on subscribe, scoped by JWT claim for RLS tables
//! - Per-table and per-scope broadcast channels
//! - Ordered delivery with no gap between bootstrap and live changes

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod filter;
pub mod lsn;
pub mod postgres;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod tables;
pub mod ws;

pub use channel::{ChannelManager, ConnectionId, Membership};
pub use lsn::Lsn;
pub use postgres::PgDatabase;
pub use replication::{ChangeSource, ReplicationStream};
pub use server::{Delivery, RelayServer};
pub use snapshot::{MemorySnapshotSource, SnapshotSource};
pub use tables::{Introspect, TableRegistry};
pub use ws::SocketServer;
