use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::channel::control::Rejection;
use crate::codec::{Packet, PacketRegistry};
use crate::config::NetConfig;
use crate::endpoint::{Endpoint, EndpointWiring};
use crate::events::NetEvent;
use crate::peer::Peer;
use crate::replication::server::ServerReplication;
use crate::replication::synced::{Synced, SyncedObject};
use crate::replication::ObjectId;
use crate::tick::{ReceivedPacket, Target};
use crate::transport::socket::{DatagramSocket, UdpDatagramSocket};
use crate::transport::Role;

/// The authoritative endpoint: accepts client connections and owns the replication state
pub struct Server {
    endpoint: Endpoint,
    replication: Arc<ServerReplication>,
}

impl Server {
    pub async fn bind(config: NetConfig, packets: PacketRegistry) -> anyhow::Result<Server> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Server::with_socket(config, packets, Arc::new(socket))
    }

    pub fn with_socket(config: NetConfig, packets: PacketRegistry, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Server> {
        let wiring = EndpointWiring::new();
        let replication = Arc::new(ServerReplication::new(
            wiring.outgoing.clone(),
            wiring.events.clone(),
            config.disconnection_behavior,
        ));
        let endpoint = Endpoint::start(Role::Server, config, socket, packets, wiring, replication.clone())?;

        Ok(Server {
            endpoint,
            replication,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn local_peer(&self) -> Peer {
        self.endpoint.local_peer()
    }

    /// Adds a check that every connecting peer must pass. Predicates run in the order they were
    ///  added, and the first rejection is sent back to the client.
    pub fn add_connection_predicate(&self, predicate: impl Fn(&Peer) -> Result<(), Rejection> + Send + Sync + 'static) {
        self.endpoint.adapter().add_connection_predicate(Arc::new(predicate));
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.endpoint.adapter().connected_peers()
    }

    pub fn is_connected(&self, peer: &Peer) -> bool {
        self.endpoint.adapter().is_connected(peer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.endpoint.subscribe()
    }

    /// Queues a packet for a connected peer, to be sent with the next tick
    pub fn send(&self, peer: &Peer, packet: impl Packet) -> anyhow::Result<()> {
        self.endpoint.check_connected(peer)?;
        self.endpoint.enqueue_packet(Target::Peer(peer.clone()), Arc::new(packet));
        Ok(())
    }

    /// Queues a packet for all connected peers
    pub fn broadcast(&self, packet: impl Packet) -> anyhow::Result<()> {
        self.endpoint.check_not_disposed()?;
        self.endpoint.enqueue_packet(Target::AllConnected, Arc::new(packet));
        Ok(())
    }

    /// Queues a packet for all connected peers except one, typically the packet's originator
    pub fn broadcast_except(&self, excluded: &Peer, packet: impl Packet) -> anyhow::Result<()> {
        self.endpoint.check_not_disposed()?;
        self.endpoint.enqueue_packet(Target::AllExcept(excluded.clone()), Arc::new(packet));
        Ok(())
    }

    pub async fn disconnect(&self, peer: &Peer, payload: Bytes) -> anyhow::Result<()> {
        self.endpoint.adapter().disconnect(peer, payload).await
    }

    fn connected_subset(&self, peers: &[Peer]) -> Vec<Peer> {
        peers.iter()
            .filter(|p| {
                let connected = self.is_connected(p);
                if !connected {
                    debug!("skipping {:?}: not connected", p);
                }
                connected
            })
            .cloned()
            .collect()
    }

    /// Creates a synced object owned by a connected peer. The owner and all connected peers in
    ///  `subscribers` receive the object's initial state.
    pub fn create_synced_object<T: SyncedObject>(&self, object: T, owner: &Peer, subscribers: &[Peer]) -> anyhow::Result<Synced<T>> {
        self.endpoint.check_connected(owner)?;
        self.replication.create(object, owner.clone(), &self.connected_subset(subscribers))
    }

    pub fn destroy_synced_object(&self, id: ObjectId) -> anyhow::Result<()> {
        self.endpoint.check_not_disposed()?;
        self.replication.destroy(id)
    }

    pub fn set_synced_object_owner(&self, id: ObjectId, owner: &Peer) -> anyhow::Result<()> {
        self.endpoint.check_connected(owner)?;
        self.replication.set_owner(id, owner.clone())
    }

    /// Subscribes peers to an object; peers that are not connected are skipped. Returns the
    ///  peers that were newly subscribed.
    pub fn add_synced_object_subscriptions(&self, id: ObjectId, peers: &[Peer]) -> anyhow::Result<Vec<Peer>> {
        self.endpoint.check_not_disposed()?;
        if peers.is_empty() {
            bail!("no peers to subscribe to {:?}", id);
        }
        let connected = self.connected_subset(peers);
        if connected.is_empty() {
            return Ok(Vec::new());
        }
        self.replication.add_subscriptions(id, &connected)
    }

    pub fn remove_synced_object_subscriptions(&self, id: ObjectId, peers: &[Peer]) -> anyhow::Result<Vec<Peer>> {
        self.endpoint.check_not_disposed()?;
        self.replication.remove_subscriptions(id, peers)
    }

    pub fn synced_object<T: SyncedObject>(&self, id: ObjectId) -> Option<Synced<T>> {
        self.replication.get(id)
    }

    pub fn synced_object_ids(&self) -> Vec<ObjectId> {
        self.replication.object_ids()
    }

    pub fn synced_object_subscribers(&self, id: ObjectId) -> Option<Vec<Peer>> {
        self.replication.subscribers_of(id)
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        self.endpoint.tick().await
    }

    pub async fn recv_packet(&self) -> Option<ReceivedPacket> {
        self.endpoint.recv_packet().await
    }

    pub fn try_recv_packet(&self) -> Option<ReceivedPacket> {
        self.endpoint.try_recv_packet()
    }

    pub async fn dispose(&self) {
        self.endpoint.dispose().await;
    }
}
