//! The transport adapter owns the datagram socket and one [Channel] per remote address. It runs
//!  the socket receive loop and the periodic maintenance pass (retransmission, pings, reaping
//!  half-open channels), and queues reassembled application datagrams for the tick loop.

mod handshake;
pub mod socket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use crate::channel::control::Rejection;
use crate::channel::{Channel, ConnectionState, Delivery};
use crate::codec::Reliability;
use crate::config::NetConfig;
use crate::events::{DisconnectReason, EventNotifier, NetEvent};
use crate::peer::Peer;
use crate::protocol::frame_header::{FrameFlags, FrameHeader};
use crate::transport::socket::DatagramSocket;
use crate::util::atomic_map::AtomicMap;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// The result of a connection attempt. Handshake failures are outcomes, not errors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectOutcome {
    Success(Peer),
    Rejected(Rejection),
    Timeout,
    /// the endpoint was disposed while the handshake was in progress
    Disconnected,
}

/// A reassembled datagram from a connected peer, ready to be unpacked by the tick loop
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub sender: Peer,
    pub tier: Reliability,
    pub payload: Bytes,
}

/// Decides whether a server accepts a connecting peer
pub type ConnectionPredicate = Arc<dyn Fn(&Peer) -> Result<(), Rejection> + Send + Sync>;

/// Gets notified when peers connect or disconnect. Calls happen on the socket or maintenance
///  task, so implementations must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_peer_connected(&self, peer: &Peer);
    fn on_peer_disconnected(&self, peer: &Peer);
}

pub struct TransportAdapter {
    role: Role,
    config: Arc<NetConfig>,
    socket: Arc<dyn DatagramSocket>,
    local_peer: ArcSwap<Peer>,
    channels: AtomicMap<SocketAddr, Arc<Channel>>,
    predicates: ArcSwap<Vec<ConnectionPredicate>>,
    listener: Arc<dyn ConnectionListener>,
    events: Arc<EventNotifier>,
    incoming_send: mpsc::UnboundedSender<InboundDatagram>,
    incoming_recv: Mutex<mpsc::UnboundedReceiver<InboundDatagram>>,
    disposed: AtomicBool,
}

impl TransportAdapter {
    pub fn new(
        role: Role,
        config: Arc<NetConfig>,
        socket: Arc<dyn DatagramSocket>,
        listener: Arc<dyn ConnectionListener>,
        events: Arc<EventNotifier>,
    ) -> TransportAdapter {
        let guid = config.identity.guid.clone()
            .unwrap_or_else(Peer::generate_guid);
        let local_peer = Peer::new(guid, socket.local_addr(), config.identity.properties.clone());
        info!("{:?} transport for {:?} on {:?}", role, local_peer, socket.local_addr());

        let (incoming_send, incoming_recv) = mpsc::unbounded_channel();
        TransportAdapter {
            role,
            config,
            socket,
            local_peer: ArcSwap::from_pointee(local_peer),
            channels: AtomicMap::new(),
            predicates: ArcSwap::from_pointee(Vec::new()),
            listener,
            events,
            incoming_send,
            incoming_recv: Mutex::new(incoming_recv),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_peer(&self) -> Peer {
        Peer::clone(&self.local_peer.load())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_not_disposed(&self) -> anyhow::Result<()> {
        if self.is_disposed() {
            bail!("this {:?} endpoint is disposed", self.role);
        }
        Ok(())
    }

    pub fn add_connection_predicate(&self, predicate: ConnectionPredicate) {
        self.predicates.rcu(|old| {
            let mut predicates = Vec::clone(old);
            predicates.push(predicate.clone());
            predicates
        });
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.channels.values().into_iter()
            .filter(|c| c.is_connected())
            .map(|c| c.peer())
            .collect()
    }

    pub fn is_connected(&self, peer: &Peer) -> bool {
        self.channel_for(peer)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    fn channel_for(&self, peer: &Peer) -> Option<Arc<Channel>> {
        if let Some(channel) = self.channels.get(&peer.addr()) {
            if channel.peer() == *peer {
                return Some(channel);
            }
        }
        self.channels.values().into_iter()
            .find(|c| c.peer() == *peer)
    }

    /// Sends an application payload to a connected peer. Sending to a peer without a connected
    ///  channel is a usage error.
    pub async fn send(&self, peer: &Peer, tier: Reliability, payload: &[u8]) -> anyhow::Result<()> {
        self.check_not_disposed()?;

        let channel = match self.channel_for(peer) {
            Some(c) => c,
            None => bail!("no channel for peer {:?}", peer),
        };
        if !channel.is_connected() {
            bail!("peer {:?} is not connected", peer);
        }

        match tier {
            Reliability::Reliable => { channel.send_reliable(FrameFlags::empty(), payload).await; }
            Reliability::Unreliable => { channel.send_unreliable(payload).await; }
        }
        Ok(())
    }

    /// the next reassembled datagram, if there is one
    pub fn try_next_datagram(&self) -> Option<InboundDatagram> {
        self.incoming_recv.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    pub async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop on {:?}", self.local_addr());

        let mut buf = vec![0u8; 65536];
        loop {
            let (num_read, from) = match self.socket.recv_datagram(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", %from);
            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            self.on_datagram(from, datagram)
                .instrument(span)
                .await;
        }
    }

    pub async fn on_datagram(self: &Arc<Self>, from: SocketAddr, mut datagram: Bytes) {
        let header = match FrameHeader::deser(&mut datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!("received datagram with unparsable header from {:?} - dropping: {}", from, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", header, from);

        let mut channel = match self.channels.get(&from) {
            Some(channel) => channel,
            None => match self.channel_for_unknown_addr(from, &header) {
                Some(channel) => channel,
                None => return,
            },
        };

        let mut deliveries = channel.on_frame(header, datagram.clone()).await;
        if self.role == Role::Server && deliveries == [Delivery::RemoteRestarted] {
            // the remote lost its session state, so the old channel's sequence space is useless
            info!("{:?} sent a new connection request from {:?} - replacing its channel", channel.peer(), from);
            self.tear_down(&channel, DisconnectReason::Timeout, None).await;
            channel = match self.channel_for_unknown_addr(from, &header) {
                Some(channel) => channel,
                None => return,
            };
            deliveries = channel.on_frame(header, datagram).await;
        }

        for delivery in deliveries {
            match delivery {
                Delivery::Control(message) => {
                    self.on_control(&channel, message).await;
                }
                Delivery::Data { tier, payload } => {
                    if !channel.is_connected() {
                        debug!("data from {:?} on a channel that is not connected - dropping", from);
                        continue;
                    }
                    let _ = self.incoming_send.send(InboundDatagram {
                        sender: channel.peer(),
                        tier,
                        payload,
                    });
                }
                Delivery::RemoteRestarted => {
                    debug!("connection request from {:?} for an existing {:?} channel - ignoring", from, self.role);
                }
            }
        }
    }

    /// Servers create a channel for a reliable frame from an unknown address, since that is how a
    ///  connection request arrives. Everything else from unknown addresses is stale traffic.
    fn channel_for_unknown_addr(&self, from: SocketAddr, header: &FrameHeader) -> Option<Arc<Channel>> {
        if self.role != Role::Server || !header.is_reliable() || self.is_disposed() {
            debug!("{:?} from unknown address {:?} - dropping", header, from);
            return None;
        }

        debug!("initializing channel for {:?}", from);
        let channel = Arc::new(self.new_channel(from));
        self.channels.update(|m| {
            m.entry(from).or_insert_with(|| channel.clone());
        });
        self.channels.get(&from)
    }

    fn new_channel(&self, remote_addr: SocketAddr) -> Channel {
        Channel::new(
            remote_addr,
            Peer::unaddressed(format!("pending@{}", remote_addr)),
            self.config.clone(),
            self.socket.clone(),
        )
    }

    fn remove_channel(&self, channel: &Arc<Channel>) {
        let addr = channel.remote_addr();
        self.channels.update(|m| {
            if m.get(&addr).map(|c| Arc::ptr_eq(c, channel)).unwrap_or(false) {
                m.remove(&addr);
            }
        });
    }

    /// Takes a channel down for good, notifying listeners if it was connected
    async fn tear_down(&self, channel: &Arc<Channel>, reason: DisconnectReason, payload: Option<Bytes>) {
        let prev = channel.mark_disconnected();
        self.remove_channel(channel);
        channel.awaitables().cancel_all().await;

        if prev == ConnectionState::Connected {
            let peer = channel.peer();
            info!("peer {:?} disconnected: {:?}", peer, reason);
            self.listener.on_peer_disconnected(&peer);
            self.events.send_event(NetEvent::PeerDisconnected {
                peer,
                reason,
                payload,
            });
        }
    }

    pub async fn maintenance_loop(self: Arc<Self>) {
        let mut ticks = time::interval(self.config.maintenance_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.run_maintenance().await;
        }
    }

    /// One pass over all channels: retransmit unacknowledged frames, start due pings and reap
    ///  half-open server channels
    pub async fn run_maintenance(self: &Arc<Self>) {
        let now = Instant::now();

        for channel in self.channels.values() {
            match channel.state() {
                ConnectionState::Connecting => {
                    if self.role == Role::Server && channel.age() > self.config.connection_timeout {
                        debug!("reaping half-open channel for {:?}", channel.remote_addr());
                        channel.mark_disconnected();
                        self.remove_channel(&channel);
                        continue;
                    }
                    channel.resend_expired(now).await;
                }
                ConnectionState::Connected => {
                    channel.resend_expired(now).await;
                    if channel.try_start_ping(now).await {
                        self.spawn_ping(channel);
                    }
                }
                ConnectionState::Disconnected => {
                    // a channel lingering for its last frames to be acknowledged
                    channel.resend_expired(now).await;
                }
            }
        }
    }

    /// Marks the adapter as disposed, resolving all pending handshake waits
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down {:?} transport on {:?}", self.role, self.local_addr());
        for channel in self.channels.values() {
            channel.awaitables().cancel_all().await;
        }
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.load().len()
    }
}

impl std::fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportAdapter{{{:?}@{:?}}}", self.role, self.local_addr())
    }
}

fn warn_unexpected(role: Role, what: &str, from: SocketAddr) {
    warn!("{:?} received unexpected {} from {:?} - ignoring", role, what, from);
}
