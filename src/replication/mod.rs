//! Replication of synced objects between a server and its clients.
//!
//! The server holds the authoritative record of every synced object: its owner and the set of
//!  peers subscribed to it. Subscribers hold mirrors, created and destroyed by explicit
//!  messages from the server. Property changes are tracked per reliability tier in dirty
//!  masks, and an object with pending changes is scheduled for sending at most once per tick.
//!  Only the owner's changes are accepted by the server, which relays them to the other
//!  subscribers.

pub mod client;
pub mod messages;
pub mod registry;
pub mod server;
pub mod synced;

use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;
use dashmap::DashSet;
use tracing::trace;

use crate::codec::{PacketTypeId, Reliability};
use crate::peer::Peer;
use crate::tick::{OutgoingItem, OutgoingQueue, Target};
use crate::transport::ConnectionListener;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId(pub u32);
impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OBJ#{}", self.0)
    }
}
impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a property within its synced object type. Ids must be below 64.
pub type PropertyId = u8;

pub type SyncedTypeId = u16;

/// What the tick loop sends for a scheduled synced object: one diff per tier that had changes
pub struct PreparedSync {
    pub target: Target,
    pub diffs: Vec<(Reliability, Bytes)>,
}

/// The replication side the tick loop talks to
pub trait Replication: ConnectionListener {
    /// Serializes the pending changes of a scheduled object, clearing its dirty masks. Returns
    ///  `None` if there is nothing this side should send.
    fn prepare_send(&self, id: ObjectId, local_peer: &Peer) -> Option<PreparedSync>;

    /// applies a received diff record
    fn on_diff(&self, sender: &Peer, tier: Reliability, payload: &[u8]) -> anyhow::Result<()>;

    /// handles a create / destroy / owner-changed message
    fn on_message(&self, sender: &Peer, type_id: PacketTypeId, body: &[u8]) -> anyhow::Result<()>;
}

/// Enqueues objects with pending changes for the next tick, at most once until the tick loop
///  picks them up
pub struct Scheduler {
    scheduled: DashSet<ObjectId>,
    outgoing: OutgoingQueue,
}
impl Scheduler {
    pub fn new(outgoing: OutgoingQueue) -> Scheduler {
        Scheduler {
            scheduled: DashSet::new(),
            outgoing,
        }
    }

    pub fn schedule(&self, id: ObjectId) {
        if self.scheduled.insert(id) {
            trace!("scheduling {:?} for sending", id);
            self.outgoing.push(OutgoingItem::Synced(id));
        }
    }

    /// Called when the tick loop dequeues the object: changes from here on schedule it again
    pub fn unschedule(&self, id: ObjectId) -> bool {
        self.scheduled.remove(&id).is_some()
    }

    pub fn is_scheduled(&self, id: ObjectId) -> bool {
        self.scheduled.contains(&id)
    }
}
