//! Solarflare Common Types and Utilities
//!
//! Shared table identities, manifest, wire protocol, change decoding,
//! configuration and error handling for the relay and the replica.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod change;
pub mod config;
pub mod error;
pub mod manifest;
pub mod protocol;
pub mod types;

pub use change::{decode, ChangeEvent, ChangeKind, RawChange, RawKind};
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use protocol::{BootstrapMessage, ClientMessage, Frame, ServerMessage, SubscribeMessage};
pub use types::{channel_name, Row, ScopeKey, TableInfo, TableRef};
