use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::peer::Peer;
use crate::replication::ObjectId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectReason {
    /// this side chose to disconnect
    Manual,
    /// the other side disconnected
    Forced,
    /// the other side stopped responding to pings
    Timeout,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetEvent {
    PeerConnected(Peer),
    PeerDisconnected {
        peer: Peer,
        reason: DisconnectReason,
        /// the payload the remote side sent with its disconnection request, if any
        payload: Option<Bytes>,
    },
    SyncedObjectCreated {
        id: ObjectId,
        owner: Peer,
    },
    SyncedObjectDestroyed {
        id: ObjectId,
    },
    SyncedOwnerChanged {
        id: ObjectId,
        owner: Peer,
    },
}

pub struct EventNotifier {
    sender: broadcast::Sender<NetEvent>,
}
impl Default for EventNotifier {
    fn default() -> Self {
        EventNotifier::new()
    }
}
impl EventNotifier {
    pub fn new() -> EventNotifier {
        let (sender, _) = broadcast::channel(1024);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NetEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
