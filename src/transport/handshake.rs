use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::awaitable::{AwaitOutcome, ControlReply};
use crate::channel::control::{ConnectionResult, ControlMessage};
use crate::channel::{Channel, ConnectionState};
use crate::events::{DisconnectReason, NetEvent};
use crate::peer::Peer;
use crate::transport::{warn_unexpected, ConnectOutcome, Role, TransportAdapter};
use crate::util::buf_ext::MAX_PREFIXED_LEN;

impl TransportAdapter {
    pub(super) async fn on_control(self: &Arc<Self>, channel: &Arc<Channel>, message: ControlMessage) {
        let from = channel.remote_addr();
        debug!("control message from {:?}: {:?}", from, message);

        match message {
            ControlMessage::ConnectionRequest { awaitable, properties, .. } => {
                if self.role != Role::Server {
                    warn_unexpected(self.role, "connection request", from);
                    return;
                }
                self.on_connection_request(channel, awaitable, Peer::new(Peer::generate_guid(), from, properties)).await;
            }
            ControlMessage::ConnectionResponse { awaitable, result } => {
                if self.role != Role::Client {
                    warn_unexpected(self.role, "connection response", from);
                    return;
                }
                channel.awaitables().complete(awaitable, ControlReply::Connection(result)).await;
            }
            ControlMessage::PingRequest { awaitable } => {
                if let Err(e) = channel.send_control(&ControlMessage::PingResponse { awaitable }).await {
                    warn!("could not answer ping from {:?}: {}", from, e);
                }
            }
            ControlMessage::PingResponse { awaitable } => {
                channel.awaitables().complete(awaitable, ControlReply::Pong).await;
            }
            ControlMessage::DisconnectionRequest { awaitable, payload } => {
                self.on_disconnection_request(channel, awaitable, payload).await;
            }
            ControlMessage::DisconnectionResponse { awaitable } => {
                channel.awaitables().complete(awaitable, ControlReply::Disconnected).await;
            }
        }
    }

    async fn on_connection_request(self: &Arc<Self>, channel: &Arc<Channel>, awaitable: u16, candidate: Peer) {
        match channel.state() {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                debug!("repeated connection request from {:?} - acknowledging again", channel.remote_addr());
                self.send_accepted(channel, awaitable, &channel.peer()).await;
                return;
            }
            ConnectionState::Disconnected => {
                debug!("connection request on a disconnected channel from {:?} - ignoring", channel.remote_addr());
                return;
            }
        }

        let predicates = self.predicates.load_full();
        if let Some(rejection) = predicates.iter().find_map(|p| p(&candidate).err()) {
            info!("rejecting connection from {:?}: {}", channel.remote_addr(), rejection.reason);
            let sent = channel.send_control(&ControlMessage::ConnectionResponse {
                awaitable,
                result: ConnectionResult::Rejected(rejection),
            }).await;
            channel.mark_disconnected();

            let seq = match sent {
                Ok(seq) => seq,
                Err(e) => {
                    warn!("could not send rejection to {:?}: {}", channel.remote_addr(), e);
                    self.tear_down(channel, DisconnectReason::Forced, None).await;
                    return;
                }
            };

            // keep the channel until the rejection is acknowledged so that it can be resent
            let adapter = self.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let linger = channel.disconnect_linger().await;
                channel.wait_acked(seq, linger).await;
                adapter.tear_down(&channel, DisconnectReason::Forced, None).await;
            });
            return;
        }

        channel.set_peer(candidate.clone());
        if !channel.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            return;
        }
        self.send_accepted(channel, awaitable, &candidate).await;

        info!("accepted connection from {:?}", candidate);
        self.listener.on_peer_connected(&candidate);
        self.events.send_event(NetEvent::PeerConnected(candidate));
    }

    async fn send_accepted(&self, channel: &Channel, awaitable: u16, remote: &Peer) {
        let local = self.local_peer();
        let sent = channel.send_control(&ControlMessage::ConnectionResponse {
            awaitable,
            result: ConnectionResult::Accepted {
                assigned_guid: remote.guid().to_string(),
                remote_guid: local.guid().to_string(),
                remote_properties: local.properties().clone(),
            },
        }).await;
        if let Err(e) = sent {
            warn!("could not send connection response to {:?}: {}", channel.remote_addr(), e);
        }
    }

    async fn on_disconnection_request(self: &Arc<Self>, channel: &Arc<Channel>, awaitable: u16, payload: Bytes) {
        debug!("disconnection request from {:?}", channel.remote_addr());
        let seq = match channel.send_control(&ControlMessage::DisconnectionResponse { awaitable }).await {
            Ok(seq) => Some(seq),
            Err(e) => {
                warn!("could not send disconnection response to {:?}: {}", channel.remote_addr(), e);
                None
            }
        };

        // tear down only once the response is known to have arrived, or the linger bound expired
        let adapter = self.clone();
        let channel = channel.clone();
        let payload = if payload.is_empty() { None } else { Some(payload) };
        tokio::spawn(async move {
            let linger = channel.disconnect_linger().await;
            if let Some(seq) = seq {
                if !channel.wait_acked(seq, linger).await {
                    debug!("disconnection response to {:?} was not acknowledged within {:?}", channel.remote_addr(), linger);
                }
            }
            adapter.tear_down(&channel, DisconnectReason::Forced, payload).await;
        });
    }

    /// Performs the client side of the connection handshake. The wait is bounded by the
    ///  configured connection timeout.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<ConnectOutcome> {
        self.check_not_disposed()?;
        if self.role != Role::Client {
            bail!("only clients can initiate connections");
        }
        if self.channels.load().values().any(|c| c.state() != ConnectionState::Disconnected) {
            bail!("client is already connected or connecting");
        }

        let channel = Arc::new(self.new_channel(addr));
        self.channels.update(|m| {
            m.insert(addr, channel.clone());
        });

        let (awaitable, recv) = channel.awaitables().register().await;
        let started = Instant::now();
        info!("connecting to {:?}", addr);
        let request = ControlMessage::ConnectionRequest {
            awaitable,
            nonce: Uuid::new_v4().as_u128() as u64,
            properties: self.config.identity.properties.clone(),
        };
        if let Err(e) = channel.send_control(&request).await {
            channel.awaitables().cancel_all().await;
            channel.mark_disconnected();
            self.remove_channel(&channel);
            return Err(e);
        }

        let outcome = match channel.awaitables().wait(awaitable, recv, self.config.connection_timeout).await {
            AwaitOutcome::Completed(ControlReply::Connection(ConnectionResult::Accepted { assigned_guid, remote_guid, remote_properties })) => {
                channel.record_rtt(started.elapsed()).await;

                let local = self.local_peer().with_guid(assigned_guid);
                self.local_peer.store(Arc::new(local));

                let remote = Peer::new(remote_guid, addr, remote_properties);
                channel.set_peer(remote.clone());
                if channel.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    info!("connected to {:?} as {:?}", remote, self.local_peer());
                    self.listener.on_peer_connected(&remote);
                    self.events.send_event(NetEvent::PeerConnected(remote.clone()));
                    ConnectOutcome::Success(remote)
                }
                else {
                    ConnectOutcome::Disconnected
                }
            }
            AwaitOutcome::Completed(ControlReply::Connection(ConnectionResult::Rejected(rejection))) => {
                info!("connection to {:?} rejected: {}", addr, rejection.reason);
                ConnectOutcome::Rejected(rejection)
            }
            AwaitOutcome::Completed(other) => {
                warn!("unexpected reply to connection request: {:?}", other);
                ConnectOutcome::Disconnected
            }
            AwaitOutcome::TimedOut => {
                info!("connection to {:?} timed out", addr);
                ConnectOutcome::Timeout
            }
            AwaitOutcome::Cancelled => ConnectOutcome::Disconnected,
        };

        if !matches!(outcome, ConnectOutcome::Success(_)) {
            channel.mark_disconnected();
            self.remove_channel(&channel);
        }
        Ok(outcome)
    }

    /// Performs the initiating side of the disconnect handshake: the request is sent, and the
    ///  channel is taken down once the response arrives or the linger bound expires.
    pub async fn disconnect(&self, peer: &Peer, payload: Bytes) -> anyhow::Result<()> {
        self.check_not_disposed()?;
        let channel = match self.channel_for(peer) {
            Some(c) => c,
            None => bail!("no channel for peer {:?}", peer),
        };
        if !channel.is_connected() {
            bail!("peer {:?} is not connected", peer);
        }
        if payload.len() > MAX_PREFIXED_LEN {
            bail!("disconnection payload is limited to {} bytes, got {}", MAX_PREFIXED_LEN, payload.len());
        }

        let (awaitable, recv) = channel.awaitables().register().await;
        channel.send_control(&ControlMessage::DisconnectionRequest { awaitable, payload }).await?;

        let linger = channel.disconnect_linger().await;
        match channel.awaitables().wait(awaitable, recv, linger).await {
            AwaitOutcome::Completed(_) => debug!("disconnection from {:?} confirmed", peer),
            AwaitOutcome::TimedOut => debug!("no disconnection response from {:?} within {:?}", peer, linger),
            AwaitOutcome::Cancelled => debug!("disconnection from {:?} cancelled", peer),
        }

        self.tear_down(&channel, DisconnectReason::Manual, None).await;
        Ok(())
    }

    pub(super) fn spawn_ping(self: &Arc<Self>, channel: Arc<Channel>) {
        let adapter = self.clone();
        tokio::spawn(async move {
            let (awaitable, recv) = channel.awaitables().register().await;
            let sent_at = Instant::now();
            if let Err(e) = channel.send_control(&ControlMessage::PingRequest { awaitable }).await {
                warn!("could not send ping to {:?}: {}", channel.remote_addr(), e);
            }

            match channel.awaitables().wait(awaitable, recv, adapter.config.disconnection_timeout).await {
                AwaitOutcome::Completed(_) => {
                    channel.record_rtt(sent_at.elapsed()).await;
                }
                AwaitOutcome::TimedOut => {
                    warn!("ping to {:?} timed out", channel.remote_addr());
                    adapter.tear_down(&channel, DisconnectReason::Timeout, None).await;
                }
                AwaitOutcome::Cancelled => {}
            }
            channel.finish_ping();
        });
    }
}
