use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};

use crate::codec::{PacketTypeId, Reliability};
use crate::config::DisconnectionBehavior;
use crate::events::{EventNotifier, NetEvent};
use crate::peer::Peer;
use crate::replication::messages::{SyncedObjectCreated, SyncedObjectDestroyed, SyncedOwnerChanged};
use crate::replication::synced::{validate_properties, Synced, SyncedCell, SyncedEntry, SyncedObject};
use crate::replication::{ObjectId, PreparedSync, Replication, Scheduler};
use crate::tick::{OutgoingItem, OutgoingQueue, Target};
use crate::transport::ConnectionListener;
use crate::util::buf_ext::{BufExt, MAX_PREFIXED_LEN};

struct SyncedRecord {
    entry: Arc<dyn SyncedEntry>,
    /// always contains the owner
    subscribers: FxHashSet<Peer>,
}

/// The authoritative side of replication: creates and destroys objects, manages ownership and
///  subscriptions, and relays diffs from owners to the other subscribers.
pub struct ServerReplication {
    objects: DashMap<ObjectId, SyncedRecord>,
    next_id: AtomicU32,
    scheduler: Arc<Scheduler>,
    outgoing: OutgoingQueue,
    events: Arc<EventNotifier>,
    on_disconnect: DisconnectionBehavior,
}

impl ServerReplication {
    pub fn new(outgoing: OutgoingQueue, events: Arc<EventNotifier>, on_disconnect: DisconnectionBehavior) -> ServerReplication {
        ServerReplication {
            objects: DashMap::new(),
            next_id: AtomicU32::new(0),
            scheduler: Arc::new(Scheduler::new(outgoing.clone())),
            outgoing,
            events,
            on_disconnect,
        }
    }

    /// the full state of an object as owned by `owner`, failing if it does not fit a single
    ///  creation message
    fn created_message(entry: &dyn SyncedEntry, owner: &Peer) -> anyhow::Result<SyncedObjectCreated> {
        let mut state = BytesMut::new();
        entry.write_full_state(&mut state)?;
        if state.len() > MAX_PREFIXED_LEN {
            bail!("state of {:?} is {} bytes, at most {} fit a creation message", entry.id(), state.len(), MAX_PREFIXED_LEN);
        }
        Ok(SyncedObjectCreated {
            id: entry.id(),
            synced_type: entry.synced_type(),
            owner_guid: owner.guid().to_string(),
            state: state.freeze(),
        })
    }

    fn send_to(&self, peers: Vec<Peer>, packet: impl crate::codec::Packet) {
        if peers.is_empty() {
            return;
        }
        self.outgoing.push(OutgoingItem::Packet {
            target: Target::Peers(peers),
            packet: Arc::new(packet),
        });
    }

    /// Registers a new object owned by `owner`, subscribed by the owner and `subscribers`, and
    ///  sends its initial state to all of them. An object whose state does not serialize is
    ///  rejected before anything is registered.
    pub fn create<T: SyncedObject>(&self, object: T, owner: Peer, subscribers: &[Peer]) -> anyhow::Result<Synced<T>> {
        validate_properties::<T>()?;

        let id = ObjectId(self.next_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1));
        let cell = Arc::new(SyncedCell::new(id, object, owner.clone(), self.scheduler.clone()));
        let entry: Arc<dyn SyncedEntry> = cell.clone();
        let created = Self::created_message(entry.as_ref(), &owner)?;
        entry.on_created();

        let mut subscriber_set = FxHashSet::default();
        subscriber_set.insert(owner.clone());
        subscriber_set.extend(subscribers.iter().cloned());

        info!("creating synced object {:?} ({}) owned by {:?}", id, std::any::type_name::<T>(), owner);
        let targets = subscriber_set.iter().cloned().collect();
        self.objects.insert(id, SyncedRecord { entry, subscribers: subscriber_set });

        self.send_to(targets, created);
        self.events.send_event(NetEvent::SyncedObjectCreated { id, owner });
        Ok(Synced::from_cell(cell))
    }

    pub fn get<T: SyncedObject>(&self, id: ObjectId) -> Option<Synced<T>> {
        let entry = self.objects.get(&id)?.entry.clone();
        Synced::from_entry(entry)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.iter()
            .map(|r| *r.key())
            .collect()
    }

    pub fn owner_of(&self, id: ObjectId) -> Option<Peer> {
        self.objects.get(&id)
            .map(|r| r.entry.owner())
    }

    pub fn subscribers_of(&self, id: ObjectId) -> Option<Vec<Peer>> {
        self.objects.get(&id)
            .map(|r| r.subscribers.iter().cloned().collect())
    }

    pub fn destroy(&self, id: ObjectId) -> anyhow::Result<()> {
        let (_, record) = self.objects.remove(&id)
            .ok_or_else(|| anyhow!("no synced object {:?}", id))?;

        info!("destroying synced object {:?}", id);
        self.scheduler.unschedule(id);
        record.entry.on_destroyed();

        self.send_to(record.subscribers.into_iter().collect(), SyncedObjectDestroyed { id });
        self.events.send_event(NetEvent::SyncedObjectDestroyed { id });
        Ok(())
    }

    /// Transfers ownership. The new owner becomes a subscriber if it is not one already.
    pub fn set_owner(&self, id: ObjectId, new_owner: Peer) -> anyhow::Result<()> {
        let (created, targets) = {
            let mut record = self.objects.get_mut(&id)
                .ok_or_else(|| anyhow!("no synced object {:?}", id))?;

            if record.entry.owner() == new_owner {
                debug!("{:?} is already owned by {:?}", id, new_owner);
                return Ok(());
            }

            let created = if record.subscribers.contains(&new_owner) {
                None
            }
            else {
                Some(Self::created_message(record.entry.as_ref(), &new_owner)?)
            };

            info!("ownership of {:?} changes from {:?} to {:?}", id, record.entry.owner(), new_owner);
            record.entry.set_owner(new_owner.clone());
            record.subscribers.insert(new_owner.clone());
            (created, record.subscribers.iter().cloned().collect::<Vec<_>>())
        };

        if let Some(created) = created {
            self.send_to(vec![new_owner.clone()], created);
        }
        self.send_to(targets, SyncedOwnerChanged { id, owner_guid: new_owner.guid().to_string() });
        self.events.send_event(NetEvent::SyncedOwnerChanged { id, owner: new_owner });
        Ok(())
    }

    /// Adds subscribers, sending the object's full state to each new one. Returns the peers that
    ///  were actually added.
    pub fn add_subscriptions(&self, id: ObjectId, peers: &[Peer]) -> anyhow::Result<Vec<Peer>> {
        if peers.is_empty() {
            bail!("no peers to subscribe to {:?}", id);
        }

        let (added, created) = {
            let mut record = self.objects.get_mut(&id)
                .ok_or_else(|| anyhow!("no synced object {:?}", id))?;
            let created = Self::created_message(record.entry.as_ref(), &record.entry.owner())?;

            let added = peers.iter()
                .filter(|p| record.subscribers.insert((*p).clone()))
                .cloned()
                .collect::<Vec<_>>();
            (added, created)
        };

        debug!("subscribed {:?} to {:?}", added, id);
        self.send_to(added.clone(), created);
        Ok(added)
    }

    /// Removes subscribers, destroying the mirror on each of them. The owner can not be
    ///  unsubscribed.
    pub fn remove_subscriptions(&self, id: ObjectId, peers: &[Peer]) -> anyhow::Result<Vec<Peer>> {
        if peers.is_empty() {
            bail!("no peers to unsubscribe from {:?}", id);
        }

        let removed = {
            let mut record = self.objects.get_mut(&id)
                .ok_or_else(|| anyhow!("no synced object {:?}", id))?;
            let owner = record.entry.owner();

            let mut removed = Vec::new();
            for peer in peers {
                if *peer == owner {
                    debug!("not unsubscribing owner {:?} from {:?}", peer, id);
                    continue;
                }
                if record.subscribers.remove(peer) {
                    removed.push(peer.clone());
                }
            }
            removed
        };

        debug!("unsubscribed {:?} from {:?}", removed, id);
        self.send_to(removed.clone(), SyncedObjectDestroyed { id });
        Ok(removed)
    }
}

impl ConnectionListener for ServerReplication {
    fn on_peer_connected(&self, _peer: &Peer) {}

    fn on_peer_disconnected(&self, peer: &Peer) {
        let owned = self.objects.iter()
            .filter(|r| r.entry.owner() == *peer)
            .map(|r| *r.key())
            .collect::<Vec<_>>();

        match self.on_disconnect {
            DisconnectionBehavior::DestroySyncedObjects => {
                for id in &owned {
                    if let Some(mut record) = self.objects.get_mut(id) {
                        record.subscribers.remove(peer);
                    }
                    // concurrently destroyed objects are gone already
                    let _ = self.destroy(*id);
                }
            }
            DisconnectionBehavior::PreserveSyncedObjects => {
                if !owned.is_empty() {
                    info!("preserving {} synced objects owned by disconnected {:?}", owned.len(), peer);
                }
            }
        }

        for mut record in self.objects.iter_mut() {
            if record.entry.owner() != *peer {
                record.subscribers.remove(peer);
            }
        }
    }
}

impl Replication for ServerReplication {
    fn prepare_send(&self, id: ObjectId, _local_peer: &Peer) -> Option<PreparedSync> {
        self.scheduler.unschedule(id);
        let record = match self.objects.get(&id) {
            Some(r) => r,
            None => {
                trace!("{:?} was destroyed before it was sent", id);
                return None;
            }
        };

        let diffs = diffs_for(record.entry.as_ref());
        if diffs.is_empty() {
            return None;
        }
        Some(PreparedSync {
            target: Target::Peers(record.subscribers.iter().cloned().collect()),
            diffs,
        })
    }

    fn on_diff(&self, sender: &Peer, tier: Reliability, payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = payload;
        let id = ObjectId(buf.try_u32()?);

        let targets = {
            let record = self.objects.get(&id)
                .ok_or_else(|| anyhow!("diff for unknown synced object {:?}", id))?;

            let owner = record.entry.owner();
            if owner != *sender {
                bail!("rejecting diff for {:?} from {:?}: owned by {:?}", id, sender, owner);
            }
            record.entry.apply_diff(&mut buf)?;

            record.subscribers.iter()
                .filter(|p| *p != sender)
                .cloned()
                .collect::<Vec<_>>()
        };

        if !targets.is_empty() {
            trace!("relaying diff for {:?} to {:?}", id, targets);
            self.outgoing.push(OutgoingItem::SyncedDiff {
                tier,
                diff: bytes::Bytes::copy_from_slice(payload),
                targets,
            });
        }
        Ok(())
    }

    fn on_message(&self, sender: &Peer, type_id: PacketTypeId, _body: &[u8]) -> anyhow::Result<()> {
        bail!("unexpected replication message {:#x} from {:?}", type_id, sender)
    }
}

/// one diff per tier that has something to send, each prefixed with the object id
pub(crate) fn diffs_for(entry: &dyn SyncedEntry) -> Vec<(Reliability, bytes::Bytes)> {
    let mut diffs = Vec::new();
    for tier in [Reliability::Reliable, Reliability::Unreliable] {
        let mut buf = BytesMut::new();
        buf.put_u32(entry.id().0);
        match entry.write_diff(tier, &mut buf) {
            Ok(true) => diffs.push((tier, buf.freeze())),
            Ok(false) => {}
            Err(e) => warn!("dropping {:?} diff for {:?}: {:#}", tier, entry.id(), e),
        }
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Packet;
    use crate::replication::messages::{SYNCED_OBJECT_CREATED, SYNCED_OBJECT_DESTROYED, SYNCED_OWNER_CHANGED};
    use crate::test_util::synced::{Counter, Transform};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer(guid: &str) -> Peer {
        Peer::new(guid, "127.0.0.1:5000".parse().unwrap(), Default::default())
    }

    fn replication(on_disconnect: DisconnectionBehavior) -> (ServerReplication, UnboundedReceiver<OutgoingItem>) {
        let (outgoing, recv) = OutgoingQueue::new();
        (ServerReplication::new(outgoing, Arc::new(EventNotifier::new()), on_disconnect), recv)
    }

    /// drains the queue into (packet type, sorted target guids) pairs
    fn sent_packets(recv: &mut UnboundedReceiver<OutgoingItem>) -> Vec<(PacketTypeId, Vec<String>)> {
        let mut result = Vec::new();
        while let Ok(item) = recv.try_recv() {
            if let OutgoingItem::Packet { target: Target::Peers(peers), packet } = item {
                let mut guids = peers.iter().map(|p| p.guid().to_string()).collect::<Vec<_>>();
                guids.sort();
                result.push((packet.packet_type(), guids));
            }
        }
        result
    }

    fn diff(id: ObjectId, value: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(id.0);
        buf.put_u8(1);
        buf.put_u8(Counter::VALUE);
        buf.put_i32(value);
        buf.to_vec()
    }

    #[test]
    fn test_create_sends_full_state_to_subscribers() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter { value: 3, ..Counter::default() }, peer("a"), &[peer("b"), peer("a")]).unwrap();

        assert_eq!(counter.id(), ObjectId(1));
        assert_eq!(counter.read(|c| c.created), 1);
        assert_eq!(sent_packets(&mut recv), vec![(SYNCED_OBJECT_CREATED, vec!["a".to_string(), "b".to_string()])]);
        assert_eq!(replication.owner_of(counter.id()), Some(peer("a")));
    }

    #[test]
    fn test_local_modification_targets_all_subscribers() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[peer("b")]).unwrap();
        sent_packets(&mut recv);

        counter.modify(Counter::VALUE, |c| c.value = 5).unwrap();
        assert!(matches!(recv.try_recv(), Ok(OutgoingItem::Synced(id)) if id == counter.id()));

        let prepared = replication.prepare_send(counter.id(), &peer("server")).unwrap();
        assert_eq!(prepared.diffs.len(), 1);
        assert_eq!(prepared.diffs[0].0, Reliability::Reliable);
        assert_eq!(prepared.diffs[0].1.as_ref(), diff(counter.id(), 5).as_slice());
        match prepared.target {
            Target::Peers(peers) => assert_eq!(peers.len(), 2),
            _ => panic!("unexpected target"),
        }

        assert!(replication.prepare_send(counter.id(), &peer("server")).is_none());
    }

    #[test]
    fn test_diff_from_owner_is_applied_and_relayed() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[peer("b"), peer("c")]).unwrap();
        sent_packets(&mut recv);

        let payload = diff(counter.id(), 5);
        replication.on_diff(&peer("a"), Reliability::Reliable, &payload).unwrap();
        assert_eq!(counter.read(|c| c.value), 5);

        match recv.try_recv() {
            Ok(OutgoingItem::SyncedDiff { tier, diff, targets }) => {
                assert_eq!(tier, Reliability::Reliable);
                assert_eq!(diff.as_ref(), payload.as_slice());
                let mut guids = targets.iter().map(|p| p.guid().to_string()).collect::<Vec<_>>();
                guids.sort();
                assert_eq!(guids, vec!["b", "c"]);
            }
            _ => panic!("expected a relayed diff"),
        }
    }

    #[test]
    fn test_diff_from_non_owner_is_rejected() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[peer("b")]).unwrap();
        sent_packets(&mut recv);

        assert!(replication.on_diff(&peer("b"), Reliability::Reliable, &diff(counter.id(), 9)).is_err());
        assert_eq!(counter.read(|c| c.value), 0);
        assert!(recv.try_recv().is_err());

        assert!(replication.on_diff(&peer("a"), Reliability::Reliable, &diff(ObjectId(99), 9)).is_err());
    }

    #[test]
    fn test_destroy() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[peer("b")]).unwrap();
        counter.modify(Counter::VALUE, |c| c.value = 1).unwrap();
        sent_packets(&mut recv);

        replication.destroy(counter.id()).unwrap();
        assert_eq!(counter.read(|c| c.destroyed), 1);
        assert_eq!(sent_packets(&mut recv), vec![(SYNCED_OBJECT_DESTROYED, vec!["a".to_string(), "b".to_string()])]);
        assert!(replication.prepare_send(counter.id(), &peer("server")).is_none());
        assert!(replication.destroy(counter.id()).is_err());
    }

    #[test]
    fn test_set_owner_subscribes_new_owner() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[]).unwrap();
        sent_packets(&mut recv);

        replication.set_owner(counter.id(), peer("b")).unwrap();
        assert_eq!(counter.owner(), peer("b"));
        assert_eq!(counter.read(|c| c.owner_changes), 1);
        assert_eq!(sent_packets(&mut recv), vec![
            (SYNCED_OBJECT_CREATED, vec!["b".to_string()]),
            (SYNCED_OWNER_CHANGED, vec!["a".to_string(), "b".to_string()]),
        ]);

        assert!(replication.on_diff(&peer("a"), Reliability::Reliable, &diff(counter.id(), 2)).is_err());
        assert!(replication.on_diff(&peer("b"), Reliability::Reliable, &diff(counter.id(), 2)).is_ok());
    }

    #[test]
    fn test_subscriptions() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let counter = replication.create(Counter::default(), peer("a"), &[]).unwrap();
        sent_packets(&mut recv);

        assert!(replication.add_subscriptions(counter.id(), &[]).is_err());
        assert_eq!(replication.add_subscriptions(counter.id(), &[peer("a"), peer("b")]).unwrap(), vec![peer("b")]);
        assert_eq!(sent_packets(&mut recv), vec![(SYNCED_OBJECT_CREATED, vec!["b".to_string()])]);

        assert_eq!(replication.remove_subscriptions(counter.id(), &[peer("a"), peer("b")]).unwrap(), vec![peer("b")]);
        assert_eq!(sent_packets(&mut recv), vec![(SYNCED_OBJECT_DESTROYED, vec!["b".to_string()])]);
        assert_eq!(replication.subscribers_of(counter.id()), Some(vec![peer("a")]));

        assert!(replication.add_subscriptions(ObjectId(77), &[peer("b")]).is_err());
    }

    fn huge_name() -> String {
        "x".repeat(MAX_PREFIXED_LEN + 1)
    }

    #[test]
    fn test_create_rejects_unserializable_state() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let transform = Transform { name: huge_name(), ..Transform::default() };

        assert!(replication.create(transform, peer("a"), &[peer("b")]).is_err());
        assert!(replication.object_ids().is_empty());
        assert!(sent_packets(&mut recv).is_empty());
    }

    #[test]
    fn test_unserializable_state_keeps_owner_and_subscribers() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let transform = replication.create(Transform::default(), peer("a"), &[]).unwrap();
        transform.modify(Transform::NAME, |t| t.name = huge_name()).unwrap();
        sent_packets(&mut recv);

        assert!(replication.set_owner(transform.id(), peer("b")).is_err());
        assert!(replication.add_subscriptions(transform.id(), &[peer("c")]).is_err());

        assert_eq!(transform.owner(), peer("a"));
        assert_eq!(replication.subscribers_of(transform.id()), Some(vec![peer("a")]));
        assert!(sent_packets(&mut recv).is_empty());
    }

    #[test]
    fn test_unserializable_diff_is_dropped() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let transform = replication.create(Transform::default(), peer("a"), &[peer("b")]).unwrap();
        sent_packets(&mut recv);

        transform.modify(Transform::NAME, |t| t.name = huge_name()).unwrap();
        transform.modify(Transform::X, |t| t.x = 2.0).unwrap();

        let prepared = replication.prepare_send(transform.id(), &peer("server")).unwrap();
        assert_eq!(prepared.diffs.len(), 1);
        assert_eq!(prepared.diffs[0].0, Reliability::Unreliable);
    }

    #[test]
    fn test_disconnect_destroys_owned_objects() {
        let (replication, mut recv) = replication(DisconnectionBehavior::DestroySyncedObjects);
        let owned = replication.create(Counter::default(), peer("a"), &[peer("b")]).unwrap();
        let other = replication.create(Counter::default(), peer("b"), &[peer("a")]).unwrap();
        sent_packets(&mut recv);

        replication.on_peer_disconnected(&peer("a"));

        assert!(replication.owner_of(owned.id()).is_none());
        assert_eq!(sent_packets(&mut recv), vec![(SYNCED_OBJECT_DESTROYED, vec!["b".to_string()])]);
        assert_eq!(replication.subscribers_of(other.id()), Some(vec![peer("b")]));
    }

    #[test]
    fn test_disconnect_preserves_owned_objects() {
        let (replication, mut recv) = replication(DisconnectionBehavior::PreserveSyncedObjects);
        let owned = replication.create(Counter::default(), peer("a"), &[peer("b")]).unwrap();
        sent_packets(&mut recv);

        replication.on_peer_disconnected(&peer("a"));

        assert_eq!(replication.owner_of(owned.id()), Some(peer("a")));
        assert!(sent_packets(&mut recv).is_empty());
        assert_eq!(replication.object_ids(), vec![owned.id()]);
    }
}
