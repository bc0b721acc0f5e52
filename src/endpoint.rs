use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use tokio::select;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec::{Packet, PacketRegistry};
use crate::config::{NetConfig, TickDriving};
use crate::events::{EventNotifier, NetEvent};
use crate::peer::Peer;
use crate::replication::Replication;
use crate::tick::{OutgoingItem, OutgoingQueue, ReceivedPacket, Target, TickLoop};
use crate::transport::socket::DatagramSocket;
use crate::transport::{ConnectionListener, Role, TransportAdapter};

/// What servers and clients have in common: the transport adapter with its background tasks, the
///  tick loop, and the queues between them and the application.
pub(crate) struct Endpoint {
    adapter: Arc<TransportAdapter>,
    tick_loop: Arc<TickLoop>,
    outgoing: OutgoingQueue,
    events: Arc<EventNotifier>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceivedPacket>>,
    /// wakes pending `recv_packet` calls on dispose
    disposed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The queues and notifier a replication engine is built on, created before the endpoint itself
pub(crate) struct EndpointWiring {
    pub outgoing: OutgoingQueue,
    pub outgoing_recv: mpsc::UnboundedReceiver<OutgoingItem>,
    pub events: Arc<EventNotifier>,
}
impl EndpointWiring {
    pub fn new() -> EndpointWiring {
        let (outgoing, outgoing_recv) = OutgoingQueue::new();
        EndpointWiring {
            outgoing,
            outgoing_recv,
            events: Arc::new(EventNotifier::new()),
        }
    }
}

impl Endpoint {
    /// Wires up the adapter and tick loop, and spawns the socket and maintenance tasks (and the
    ///  tick task for automatic tick driving)
    pub fn start<R: Replication + ConnectionListener + 'static>(
        role: Role,
        config: NetConfig,
        socket: Arc<dyn DatagramSocket>,
        packets: PacketRegistry,
        wiring: EndpointWiring,
        replication: Arc<R>,
    ) -> anyhow::Result<Endpoint> {
        config.validate()?;
        let config = Arc::new(config);

        let adapter = Arc::new(TransportAdapter::new(
            role,
            config.clone(),
            socket,
            replication.clone(),
            wiring.events.clone(),
        ));
        let (tick_loop, received) = TickLoop::new(
            config.clone(),
            adapter.clone(),
            replication,
            Arc::new(packets),
            wiring.outgoing_recv,
        );
        let tick_loop = Arc::new(tick_loop);

        let mut tasks = vec![
            tokio::spawn(adapter.clone().recv_loop()),
            tokio::spawn(adapter.clone().maintenance_loop()),
        ];
        if config.tick_driving == TickDriving::Automatic {
            tasks.push(tokio::spawn(tick_loop.clone().run()));
        }

        Ok(Endpoint {
            adapter,
            tick_loop,
            outgoing: wiring.outgoing,
            events: wiring.events,
            received: tokio::sync::Mutex::new(received),
            disposed: Notify::new(),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn adapter(&self) -> &Arc<TransportAdapter> {
        &self.adapter
    }

    pub fn check_not_disposed(&self) -> anyhow::Result<()> {
        if self.adapter.is_disposed() {
            bail!("this {:?} endpoint is disposed", self.adapter.role());
        }
        Ok(())
    }

    pub fn check_connected(&self, peer: &Peer) -> anyhow::Result<()> {
        self.check_not_disposed()?;
        if !self.adapter.is_connected(peer) {
            bail!("peer {:?} is not connected", peer);
        }
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.adapter.local_addr()
    }

    pub fn local_peer(&self) -> Peer {
        self.adapter.local_peer()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub fn enqueue_packet(&self, target: Target, packet: Arc<dyn Packet>) {
        self.outgoing.push(OutgoingItem::Packet { target, packet });
    }

    /// Runs one tick. With automatic tick driving this happens in the background anyway.
    pub async fn tick(&self) -> anyhow::Result<()> {
        self.check_not_disposed()?;
        self.tick_loop.tick().await;
        Ok(())
    }

    /// waits for the next received packet; `None` once the endpoint is disposed, including for
    ///  calls that were already waiting
    pub async fn recv_packet(&self) -> Option<ReceivedPacket> {
        let disposed = self.disposed.notified();
        tokio::pin!(disposed);
        disposed.as_mut().enable();

        if self.adapter.is_disposed() {
            return None;
        }
        select! {
            packet = async { self.received.lock().await.recv().await } => packet,
            _ = disposed => None,
        }
    }

    pub fn try_recv_packet(&self) -> Option<ReceivedPacket> {
        self.received.try_lock().ok()?
            .try_recv()
            .ok()
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    /// Stops all background tasks and resolves pending handshake waits. Every operation fails
    ///  afterwards.
    pub async fn dispose(&self) {
        if self.adapter.is_disposed() {
            return;
        }
        info!("disposing {:?} endpoint on {:?}", self.adapter.role(), self.local_addr());
        self.abort_tasks();
        self.adapter.shutdown().await;
        self.disposed.notify_waiters();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
