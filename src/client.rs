use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::codec::{Packet, PacketRegistry};
use crate::config::NetConfig;
use crate::endpoint::{Endpoint, EndpointWiring};
use crate::events::NetEvent;
use crate::peer::Peer;
use crate::replication::client::ClientReplication;
use crate::replication::registry::SyncedRegistry;
use crate::replication::synced::{Synced, SyncedObject};
use crate::replication::ObjectId;
use crate::tick::{ReceivedPacket, Target};
use crate::transport::socket::{DatagramSocket, UdpDatagramSocket};
use crate::transport::{ConnectOutcome, Role};

/// Connects to a single server and mirrors the synced objects it is subscribed to
pub struct Client {
    endpoint: Endpoint,
    replication: Arc<ClientReplication>,
}

impl Client {
    pub async fn bind(config: NetConfig, packets: PacketRegistry, synced: SyncedRegistry) -> anyhow::Result<Client> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Client::with_socket(config, packets, synced, Arc::new(socket))
    }

    pub fn with_socket(config: NetConfig, packets: PacketRegistry, synced: SyncedRegistry, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Client> {
        let wiring = EndpointWiring::new();
        let replication = Arc::new(ClientReplication::new(
            Arc::new(synced),
            wiring.outgoing.clone(),
            wiring.events.clone(),
        ));
        let endpoint = Endpoint::start(Role::Client, config, socket, packets, wiring, replication.clone())?;

        Ok(Client {
            endpoint,
            replication,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// This client's identity. The GUID is the one the server assigned once connected.
    pub fn local_peer(&self) -> Peer {
        self.endpoint.local_peer()
    }

    /// Runs the connection handshake. Rejection, timeout and disposal during the handshake are
    ///  outcomes; an error means the call itself was invalid.
    pub async fn connect(&self, server_addr: SocketAddr) -> anyhow::Result<ConnectOutcome> {
        self.endpoint.check_not_disposed()?;
        self.endpoint.adapter().connect(server_addr).await
    }

    pub fn server_peer(&self) -> Option<Peer> {
        self.endpoint.adapter().connected_peers()
            .into_iter()
            .next()
    }

    pub fn is_connected(&self) -> bool {
        self.server_peer().is_some()
    }

    pub async fn disconnect(&self, payload: Bytes) -> anyhow::Result<()> {
        let server = self.server_peer()
            .ok_or_else(|| anyhow!("not connected"))?;
        self.endpoint.adapter().disconnect(&server, payload).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.endpoint.subscribe()
    }

    /// Queues a packet for the server, to be sent with the next tick
    pub fn send(&self, packet: impl Packet) -> anyhow::Result<()> {
        let server = self.server_peer()
            .ok_or_else(|| anyhow!("not connected"))?;
        self.endpoint.check_connected(&server)?;
        self.endpoint.enqueue_packet(Target::Peer(server), Arc::new(packet));
        Ok(())
    }

    pub fn synced_object<T: SyncedObject>(&self, id: ObjectId) -> Option<Synced<T>> {
        self.replication.get(id)
    }

    pub fn synced_object_ids(&self) -> Vec<ObjectId> {
        self.replication.object_ids()
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
