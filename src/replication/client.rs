use std::sync::Arc;

use anyhow::{anyhow, bail};
use dashmap::DashMap;
use tracing::{debug, info, trace};

use crate::codec::{PacketTypeId, Reliability};
use crate::events::{EventNotifier, NetEvent};
use crate::peer::Peer;
use crate::replication::messages::{decode_message, SyncedObjectCreated, SyncedObjectDestroyed, SyncedOwnerChanged, SYNCED_OBJECT_CREATED, SYNCED_OBJECT_DESTROYED, SYNCED_OWNER_CHANGED};
use crate::replication::registry::SyncedRegistry;
use crate::replication::server::diffs_for;
use crate::replication::synced::{Synced, SyncedEntry, SyncedObject};
use crate::replication::{ObjectId, PreparedSync, Replication, Scheduler};
use crate::tick::{OutgoingQueue, Target};
use crate::transport::ConnectionListener;
use crate::util::buf_ext::BufExt;

/// The subscriber side of replication: maintains mirrors of the objects the server subscribed
///  this client to, and sends changes for the objects this client owns.
pub struct ClientReplication {
    mirrors: DashMap<ObjectId, Arc<dyn SyncedEntry>>,
    registry: Arc<SyncedRegistry>,
    scheduler: Arc<Scheduler>,
    events: Arc<EventNotifier>,
}

impl ClientReplication {
    pub fn new(registry: Arc<SyncedRegistry>, outgoing: OutgoingQueue, events: Arc<EventNotifier>) -> ClientReplication {
        ClientReplication {
            mirrors: DashMap::new(),
            registry,
            scheduler: Arc::new(Scheduler::new(outgoing)),
            events,
        }
    }

    pub fn get<T: SyncedObject>(&self, id: ObjectId) -> Option<Synced<T>> {
        let entry = self.mirrors.get(&id)?.clone();
        Synced::from_entry(entry)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.mirrors.iter()
            .map(|e| *e.key())
            .collect()
    }

    fn on_created(&self, msg: SyncedObjectCreated) -> anyhow::Result<()> {
        let owner = Peer::unaddressed(msg.owner_guid.as_str());

        if let Some(existing) = self.mirrors.get(&msg.id) {
            debug!("{:?} is mirrored already, refreshing its state", msg.id);
            return existing.apply_diff(&mut msg.state.as_ref());
        }

        let entry = self.registry.instantiate(msg.synced_type, msg.id, owner.clone(), self.scheduler.clone())?;
        entry.apply_diff(&mut msg.state.as_ref())?;
        entry.on_created();

        info!("mirroring synced object {:?} owned by {:?}", msg.id, owner);
        self.mirrors.insert(msg.id, entry);
        self.events.send_event(NetEvent::SyncedObjectCreated { id: msg.id, owner });
        Ok(())
    }

    fn on_destroyed(&self, msg: SyncedObjectDestroyed) -> anyhow::Result<()> {
        let (_, entry) = self.mirrors.remove(&msg.id)
            .ok_or_else(|| anyhow!("destroy for unknown synced object {:?}", msg.id))?;

        info!("synced object {:?} was destroyed", msg.id);
        self.scheduler.unschedule(msg.id);
        entry.on_destroyed();
        self.events.send_event(NetEvent::SyncedObjectDestroyed { id: msg.id });
        Ok(())
    }

    fn on_owner_changed(&self, msg: SyncedOwnerChanged) -> anyhow::Result<()> {
        let entry = self.mirrors.get(&msg.id)
            .ok_or_else(|| anyhow!("owner change for unknown synced object {:?}", msg.id))?
            .clone();

        let owner = Peer::unaddressed(msg.owner_guid.as_str());
        debug!("{:?} is now owned by {:?}", msg.id, owner);
        entry.set_owner(owner.clone());
        self.events.send_event(NetEvent::SyncedOwnerChanged { id: msg.id, owner });
        Ok(())
    }
}

impl ConnectionListener for ClientReplication {
    fn on_peer_connected(&self, _peer: &Peer) {}

    /// the server is gone, and with it every mirror
    fn on_peer_disconnected(&self, peer: &Peer) {
        let ids = self.object_ids();
        if !ids.is_empty() {
            info!("disconnected from {:?}: dropping {} mirrored objects", peer, ids.len());
        }
        for id in ids {
            if let Some((_, entry)) = self.mirrors.remove(&id) {
                self.scheduler.unschedule(id);
                entry.on_destroyed();
                self.events.send_event(NetEvent::SyncedObjectDestroyed { id });
            }
        }
    }
}

impl Replication for ClientReplication {
    fn prepare_send(&self, id: ObjectId, local_peer: &Peer) -> Option<PreparedSync> {
        self.scheduler.unschedule(id);
        let entry = self.mirrors.get(&id)?.clone();

        let owner = entry.owner();
        if owner != *local_peer {
            debug!("discarding local changes to {:?}: it is owned by {:?}", id, owner);
            entry.clear_dirty();
            return None;
        }

        let diffs = diffs_for(entry.as_ref());
        if diffs.is_empty() {
            return None;
        }
        Some(PreparedSync {
            target: Target::AllConnected,
            diffs,
        })
    }

    fn on_diff(&self, sender: &Peer, _tier: Reliability, payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = payload;
        let id = ObjectId(buf.try_u32()?);
        let entry = self.mirrors.get(&id)
            .ok_or_else(|| anyhow!("diff for unknown synced object {:?}", id))?
            .clone();

        trace!("applying diff for {:?} from {:?}", id, sender);
        entry.apply_diff(&mut buf)
    }

    fn on_message(&self, _sender: &Peer, type_id: PacketTypeId, body: &[u8]) -> anyhow::Result<()> {
        match type_id {
            SYNCED_OBJECT_CREATED => self.on_created(decode_message(body)?),
            SYNCED_OBJECT_DESTROYED => self.on_destroyed(decode_message(body)?),
            SYNCED_OWNER_CHANGED => self.on_owner_changed(decode_message(body)?),
            other => bail!("unknown replication message type {:#x}", other),
        }
    }
}
