//! Solarflare Client Replica
//!
//! Keeps an in-memory, optimistically editable copy of the tables a relay
//! publishes:
//! - Bootstrap on first subscribe, live changes afterwards
//! - Local insert, update and delete overrides with rollback
//! - Automatic re-bootstrap after a reconnect

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod client;
pub mod connection;
pub mod error;
pub mod optimistic;
pub mod slot;
pub mod table;

pub use cache::{ReplicaCache, SubscribeRequest};
pub use client::{ChannelTransport, SolarflareClient, Transport};
pub use connection::{Backoff, ClientOptions, Connection, SharedClient};
pub use error::{ClientError, Result};
pub use optimistic::OptimisticChange;
pub use slot::{PrimaryKey, Slot};
pub use table::{Subscriber, TableState, TableView};
