//! Socket protocol between relay and replica
//!
//! Every frame is a JSON object `{"event": ..., "payload": ...}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::change::RawChange;
use crate::error::Result;
use crate::types::{Row, TableInfo, TableRef};

/// An encoded frame, shared between every recipient of a broadcast
pub type Frame = Arc<str>;

/// Client → relay: subscribe to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    #[serde(rename = "queryId")]
    pub query_id: String,
    #[serde(rename = "ref")]
    pub table: TableRef,
    pub jwt: String,
}

/// Relay → client: initial snapshot, unicast to the subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapMessage {
    pub info: TableInfo,
    pub data: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Bootstrap(BootstrapMessage),
    Change(RawChange),
}

impl ServerMessage {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}
