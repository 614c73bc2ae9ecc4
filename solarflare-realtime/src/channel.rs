//! Channel membership and fan-out
//!
//! Every socket connection owns an unbounded outbox of encoded frames. A
//! channel maps its member connections to a [`Membership`]: a member that
//! joined but has not yet received its bootstrap is `Pending` and collects
//! broadcasts in a buffer, which is flushed right after the bootstrap frame
//! when the member is activated. Both steps happen under the manager lock,
//! so a subscriber never sees a change ahead of its bootstrap and never
//! misses one committed while the snapshot was being read.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use solarflare_common::protocol::Frame;

/// Identifies one socket connection
pub type ConnectionId = Uuid;

/// State of one connection within one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Joined, bootstrap not yet sent; broadcasts are buffered
    Pending(Vec<Frame>),
    /// Bootstrap sent; broadcasts go straight to the outbox
    Active,
}

struct Connection {
    outbox: mpsc::UnboundedSender<Frame>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct Channels {
    connections: HashMap<ConnectionId, Connection>,
    members: HashMap<String, HashMap<ConnectionId, Membership>>,
}

impl Channels {
    fn remove_member(&mut self, id: ConnectionId, channel: &str) {
        if let Some(members) = self.members.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.members.remove(channel);
            }
        }
    }
}

/// Manages connections and their channel memberships
pub struct ChannelManager {
    inner: RwLock<Channels>,
}

impl ChannelManager {
    /// Create a new channel manager
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Channels::default()),
        }
    }

    /// Register a connection, returning its id and the receiving end of its
    /// outbox
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner.write().connections.insert(
            id,
            Connection {
                outbox: tx,
                channels: HashSet::new(),
            },
        );
        debug!(connection = %id, "Connection registered");
        (id, rx)
    }

    /// Remove a connection from every channel it joined
    pub fn unregister(&self, id: ConnectionId) {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.remove(&id) else {
            return;
        };
        for channel in &connection.channels {
            inner.remove_member(id, channel);
        }
        debug!(connection = %id, channels = connection.channels.len(), "Connection unregistered");
    }

    /// Join `channel` as a pending member.
    ///
    /// Re-joining resets an active membership to pending; a membership that
    /// is already pending keeps its buffer. Returns `false` for an unknown
    /// connection.
    pub fn join(&self, id: ConnectionId, channel: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get_mut(&id) else {
            return false;
        };
        connection.channels.insert(channel.to_string());

        let membership = inner
            .members
            .entry(channel.to_string())
            .or_default()
            .entry(id)
            .or_insert_with(|| Membership::Pending(Vec::new()));
        if *membership == Membership::Active {
            *membership = Membership::Pending(Vec::new());
        }
        true
    }

    /// Send `bootstrap` followed by every buffered frame, then mark the
    /// membership active.
    ///
    /// Returns `false` when the connection is gone or never joined.
    pub fn activate(&self, id: ConnectionId, channel: &str, bootstrap: Frame) -> bool {
        let mut inner = self.inner.write();
        let Channels {
            connections,
            members,
        } = &mut *inner;

        let Some(connection) = connections.get(&id) else {
            return false;
        };
        let Some(membership) = members.get_mut(channel).and_then(|m| m.get_mut(&id)) else {
            return false;
        };

        let buffered = match std::mem::replace(membership, Membership::Active) {
            Membership::Pending(frames) => frames,
            Membership::Active => Vec::new(),
        };
        let replayed = buffered.len();

        // A closed outbox means the connection is going away; unregister
        // cleans up after it.
        let _ = connection.outbox.send(bootstrap);
        for frame in buffered {
            let _ = connection.outbox.send(frame);
        }

        debug!(connection = %id, channel, replayed, "Membership activated");
        true
    }

    /// Leave a channel
    pub fn leave(&self, id: ConnectionId, channel: &str) {
        let mut inner = self.inner.write();
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.channels.remove(channel);
        }
        inner.remove_member(id, channel);
    }

    /// Deliver `frame` to every member of `channel`, returning the number of
    /// members reached (buffered or sent)
    pub fn broadcast(&self, channel: &str, frame: &Frame) -> usize {
        let mut inner = self.inner.write();
        let Channels {
            connections,
            members,
        } = &mut *inner;

        let Some(members) = members.get_mut(channel) else {
            trace!(channel, "No members, frame dropped");
            return 0;
        };

        for (id, membership) in members.iter_mut() {
            match membership {
                Membership::Pending(buffer) => buffer.push(frame.clone()),
                Membership::Active => {
                    if let Some(connection) = connections.get(id) {
                        let _ = connection.outbox.send(frame.clone());
                    }
                }
            }
        }
        members.len()
    }

    /// Membership of a connection in a channel
    pub fn membership(&self, id: ConnectionId, channel: &str) -> Option<Membership> {
        self.inner
            .read()
            .members
            .get(channel)
            .and_then(|m| m.get(&id))
            .cloned()
    }

    /// Number of members of a channel
    pub fn members(&self, channel: &str) -> usize {
        self.inner.read().members.get(channel).map_or(0, HashMap::len)
    }

    /// List all channels with at least one member
    pub fn topics(&self) -> Vec<String> {
        self.inner.read().members.keys().cloned().collect()
    }

    /// Get the number of channels with at least one member
    pub fn count(&self) -> usize {
        self.inner.read().members.len()
    }

    /// Get the number of registered connections
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(s: &str) -> Frame {
        Arc::from(s)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f.to_string());
        }
        out
    }

    #[test]
    fn test_pending_member_buffers_until_activated() {
        let manager = ChannelManager::new();
        let (id, mut rx) = manager.register();

        assert!(manager.join(id, "todos"));
        assert_eq!(manager.broadcast("todos", &frame("c1")), 1);
        assert!(drain(&mut rx).is_empty());

        assert!(manager.activate(id, "todos", frame("boot")));
        manager.broadcast("todos", &frame("c2"));

        assert_eq!(drain(&mut rx), vec!["boot", "c1", "c2"]);
        assert_eq!(manager.membership(id, "todos"), Some(Membership::Active));
    }

    #[test]
    fn test_rejoin_resets_active_membership() {
        let manager = ChannelManager::new();
        let (id, mut rx) = manager.register();

        manager.join(id, "todos");
        manager.activate(id, "todos", frame("boot-1"));
        manager.join(id, "todos");
        manager.broadcast("todos", &frame("c1"));
        assert_eq!(drain(&mut rx), vec!["boot-1"]);

        manager.activate(id, "todos", frame("boot-2"));
        assert_eq!(drain(&mut rx), vec!["boot-2", "c1"]);
    }

    #[test]
    fn test_rejoin_while_pending_keeps_buffer() {
        let manager = ChannelManager::new();
        let (id, mut rx) = manager.register();

        manager.join(id, "todos");
        manager.broadcast("todos", &frame("c1"));
        manager.join(id, "todos");
        manager.activate(id, "todos", frame("boot"));
        assert_eq!(drain(&mut rx), vec!["boot", "c1"]);
    }

    #[test]
    fn test_channels_are_isolated() {
        let manager = ChannelManager::new();
        let (a, mut rx_a) = manager.register();
        let (b, mut rx_b) = manager.register();

        manager.join(a, "employees.1");
        manager.activate(a, "employees.1", frame("boot"));
        manager.join(b, "employees.2");
        manager.activate(b, "employees.2", frame("boot"));

        manager.broadcast("employees.2", &frame("for-b"));
        assert_eq!(drain(&mut rx_a), vec!["boot"]);
        assert_eq!(drain(&mut rx_b), vec!["boot", "for-b"]);
    }

    #[test]
    fn test_unregister_removes_memberships() {
        let manager = ChannelManager::new();
        let (id, _rx) = manager.register();
        manager.join(id, "todos");
        manager.join(id, "employees.1");
        assert_eq!(manager.count(), 2);

        manager.unregister(id);
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.join(id, "todos"));
        assert!(!manager.activate(id, "todos", frame("boot")));
    }

    #[test]
    fn test_leave() {
        let manager = ChannelManager::new();
        let (id, _rx) = manager.register();
        manager.join(id, "todos");
        assert_eq!(manager.members("todos"), 1);

        manager.leave(id, "todos");
        assert_eq!(manager.members("todos"), 0);
        assert!(manager.topics().is_empty());
        assert_eq!(manager.broadcast("todos", &frame("c")), 0);
    }
}
