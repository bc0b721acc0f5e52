//! Per-remote-peer reliability state: sequence counters, retransmission and reorder buffers, RTT
//!  estimation and the bookkeeping for the handshakes that run on top.

pub mod awaitable;
pub mod control;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::channel::awaitable::Awaitables;
use crate::channel::control::ControlMessage;
use crate::codec::Reliability;
use crate::config::NetConfig;
use crate::peer::Peer;
use crate::protocol::frame_header::{FrameFlags, FrameHeader};
use crate::protocol::sequence::{sequence_at_or_after, SequenceNumber};
use crate::transport::socket::DatagramSocket;
use crate::util::rolling_data::RollingData;

const RTT_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// What a received frame yields for the layers above, in delivery order
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Delivery {
    Control(ControlMessage),
    Data {
        tier: Reliability,
        payload: Bytes,
    },
    /// a connection request below the low-water mark with a nonce this channel has not seen: the
    ///  remote started over on the same address
    RemoteRestarted,
}

struct PendingFrame {
    frame: Bytes,
    last_sent: Instant,
}

pub struct Channel {
    remote_addr: SocketAddr,
    peer: ArcSwap<Peer>,
    state: AtomicU8,
    created_at: Instant,
    config: Arc<NetConfig>,
    socket: Arc<dyn DatagramSocket>,

    reliable_out: SequenceNumber,
    unreliable_out: SequenceNumber,
    /// the last reliable sequence number delivered in order, i.e. the low-water mark is this + 1.
    ///  Only modified while holding the reorder buffer's lock.
    reliable_in: SequenceNumber,
    /// the highest unreliable sequence number accepted so far
    unreliable_in: SequenceNumber,
    /// nonce of the connection request delivered on this channel
    connection_nonce: AtomicU64,

    resend_buffer: Mutex<BTreeMap<u32, PendingFrame>>,
    reorder_buffer: Mutex<BTreeMap<u32, (FrameFlags, Bytes)>>,
    ack_notify: Notify,

    rtt: Mutex<RollingData<RTT_WINDOW>>,
    last_ping: Mutex<Instant>,
    ping_in_flight: AtomicBool,

    awaitables: Awaitables,
}

impl Channel {
    pub fn new(remote_addr: SocketAddr, peer: Peer, config: Arc<NetConfig>, socket: Arc<dyn DatagramSocket>) -> Channel {
        let now = Instant::now();
        Channel {
            remote_addr,
            peer: ArcSwap::from_pointee(peer),
            state: AtomicU8::new(ConnectionState::Connecting.into()),
            created_at: now,
            reliable_out: SequenceNumber::default(),
            unreliable_out: SequenceNumber::default(),
            reliable_in: SequenceNumber::default(),
            unreliable_in: SequenceNumber::default(),
            connection_nonce: AtomicU64::new(0),
            resend_buffer: Default::default(),
            reorder_buffer: Default::default(),
            ack_notify: Notify::new(),
            rtt: Mutex::new(RollingData::new(config.initial_rtt)),
            last_ping: Mutex::new(now),
            ping_in_flight: AtomicBool::new(false),
            awaitables: Awaitables::new(),
            config,
            socket,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn peer(&self) -> Peer {
        Peer::clone(&self.peer.load())
    }

    pub fn set_peer(&self, peer: Peer) {
        self.peer.store(Arc::new(peer));
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Moves from `from` to `to`, returning false if the channel was not in state `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let result = self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire).is_ok();
        if result {
            debug!("channel {:?}: {:?} -> {:?}", self.remote_addr, from, to);
        }
        result
    }

    /// Moves to Disconnected from whatever state, returning the previous state
    pub fn mark_disconnected(&self) -> ConnectionState {
        let prev = self.state.swap(ConnectionState::Disconnected.into(), Ordering::AcqRel);
        ConnectionState::try_from(prev).unwrap_or(ConnectionState::Disconnected)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn awaitables(&self) -> &Awaitables {
        &self.awaitables
    }

    fn frame(flags: FrameFlags, sequence: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN + payload.len());
        FrameHeader::new(flags, sequence).ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Sends a payload reliably, keeping it for retransmission until it is acknowledged. Returns
    ///  the frame's sequence number.
    pub async fn send_reliable(&self, extra_flags: FrameFlags, payload: &[u8]) -> u32 {
        let sequence = self.reliable_out.next();
        let frame = Self::frame(FrameFlags::RELIABLE | extra_flags, sequence, payload);

        self.resend_buffer.lock().await
            .insert(sequence, PendingFrame { frame: frame.clone(), last_sent: Instant::now() });

        trace!("sending reliable frame #{} to {:?}", sequence, self.remote_addr);
        self.socket.send_datagram(self.remote_addr, &frame).await;
        sequence
    }

    pub async fn send_unreliable(&self, payload: &[u8]) -> u32 {
        let sequence = self.unreliable_out.next();
        let frame = Self::frame(FrameFlags::empty(), sequence, payload);

        trace!("sending unreliable frame #{} to {:?}", sequence, self.remote_addr);
        self.socket.send_datagram(self.remote_addr, &frame).await;
        sequence
    }

    /// Serializes and sends a control message reliably. Nothing is sent if the message does not
    ///  serialize.
    pub async fn send_control(&self, message: &ControlMessage) -> anyhow::Result<u32> {
        let mut buf = BytesMut::new();
        message.ser(&mut buf)?;
        Ok(self.send_reliable(message.frame_flag(), &buf).await)
    }

    async fn send_ack(&self, sequence: u32) {
        let frame = Self::frame(FrameFlags::ACK, sequence, &[]);
        self.socket.send_datagram(self.remote_addr, &frame).await;
    }

    /// Processes a received frame, returning whatever became deliverable because of it
    pub async fn on_frame(&self, header: FrameHeader, payload: Bytes) -> Vec<Delivery> {
        if header.is_ack() {
            self.on_ack(header.sequence).await;
            return vec![];
        }

        if header.is_reliable() {
            self.on_reliable_frame(header, payload).await
        }
        else {
            self.on_unreliable_frame(header, payload)
        }
    }

    async fn on_reliable_frame(&self, header: FrameHeader, payload: Bytes) -> Vec<Delivery> {
        // ack everything, including duplicates: the previous ack may have been lost
        self.send_ack(header.sequence).await;

        let mut reorder_buffer = self.reorder_buffer.lock().await;

        let low_water_mark = self.reliable_in.get().wrapping_add(1);
        if !sequence_at_or_after(header.sequence, low_water_mark) {
            if self.is_new_connection_request(header.flags, &payload) {
                debug!("connection request #{} from {:?} with a new nonce", header.sequence, self.remote_addr);
                return vec![Delivery::RemoteRestarted];
            }
            trace!("duplicate reliable frame #{} from {:?} (expecting #{})", header.sequence, self.remote_addr, low_water_mark);
            return vec![];
        }
        reorder_buffer.entry(header.sequence)
            .or_insert((header.flags, payload));

        let mut result = Vec::new();
        loop {
            let expected = self.reliable_in.get().wrapping_add(1);
            match reorder_buffer.remove(&expected) {
                Some((flags, payload)) => {
                    self.reliable_in.set(expected);
                    if let Some(delivery) = self.to_delivery(flags, Reliability::Reliable, payload) {
                        result.push(delivery);
                    }
                }
                None => break,
            }
        }
        if !reorder_buffer.is_empty() {
            trace!("{} reliable frames from {:?} waiting for #{}", reorder_buffer.len(), self.remote_addr, self.reliable_in.get().wrapping_add(1));
        }
        result
    }

    fn on_unreliable_frame(&self, header: FrameHeader, payload: Bytes) -> Vec<Delivery> {
        if header.is_control() {
            warn!("unreliable control frame from {:?} - dropping", self.remote_addr);
            return vec![];
        }

        loop {
            let highest = self.unreliable_in.get();
            // NB: an equal sequence number is accepted, i.e. a repeated latest datagram is delivered again
            if !sequence_at_or_after(header.sequence, highest) {
                trace!("stale unreliable frame #{} from {:?} (highest is #{})", header.sequence, self.remote_addr, highest);
                return vec![];
            }
            if self.unreliable_in.compare_exchange(highest, header.sequence).is_ok() {
                break;
            }
        }

        self.to_delivery(header.flags, Reliability::Unreliable, payload)
            .into_iter()
            .collect()
    }

    fn is_new_connection_request(&self, flags: FrameFlags, payload: &Bytes) -> bool {
        if !flags.contains(FrameFlags::CONNECTION) {
            return false;
        }
        match ControlMessage::deser(&mut payload.as_ref()) {
            Ok(ControlMessage::ConnectionRequest { nonce, .. }) => nonce != self.connection_nonce.load(Ordering::Acquire),
            _ => false,
        }
    }

    fn to_delivery(&self, flags: FrameFlags, tier: Reliability, payload: Bytes) -> Option<Delivery> {
        if flags.intersects(FrameFlags::CONNECTION | FrameFlags::DISCONNECTION) {
            match ControlMessage::deser(&mut payload.as_ref()) {
                Ok(message) => {
                    if let ControlMessage::ConnectionRequest { nonce, .. } = &message {
                        self.connection_nonce.store(*nonce, Ordering::Release);
                    }
                    Some(Delivery::Control(message))
                }
                Err(e) => {
                    warn!("unparseable control message from {:?} - dropping: {}", self.remote_addr, e);
                    None
                }
            }
        }
        else {
            Some(Delivery::Data { tier, payload })
        }
    }

    /// Removes an acknowledged frame from the retransmission buffer. Acks for unknown sequence
    ///  numbers are ignored, so repeated acks are harmless.
    pub async fn on_ack(&self, sequence: u32) -> bool {
        let removed = self.resend_buffer.lock().await
            .remove(&sequence)
            .is_some();

        if removed {
            trace!("frame #{} acknowledged by {:?}", sequence, self.remote_addr);
            self.ack_notify.notify_waiters();
        }
        else {
            trace!("ack for unknown frame #{} from {:?}", sequence, self.remote_addr);
        }
        removed
    }

    pub async fn is_acknowledged(&self, sequence: u32) -> bool {
        !self.resend_buffer.lock().await.contains_key(&sequence)
    }

    pub async fn num_unacknowledged(&self) -> usize {
        self.resend_buffer.lock().await.len()
    }

    /// Waits until the reliable frame with the given sequence number is acknowledged, returning
    ///  false if that does not happen within `bound`
    pub async fn wait_acked(&self, sequence: u32, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.ack_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_acknowledged(sequence).await {
                return true;
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return self.is_acknowledged(sequence).await;
            }
        }
    }

    /// Sends every unacknowledged frame again that was last sent longer ago than the resend
    ///  timeout, which is derived from the current RTT. Returns the number of resent frames.
    pub async fn resend_expired(&self, now: Instant) -> usize {
        let timeout = self.config.resend_timeout(self.rtt().await);

        let expired = {
            let mut resend_buffer = self.resend_buffer.lock().await;
            resend_buffer.iter_mut()
                .filter(|(_, pending)| now.saturating_duration_since(pending.last_sent) > timeout)
                .map(|(&sequence, pending)| {
                    pending.last_sent = now;
                    (sequence, pending.frame.clone())
                })
                .collect::<Vec<_>>()
        };

        for (sequence, frame) in &expired {
            debug!("resending frame #{} to {:?}", sequence, self.remote_addr);
            self.socket.send_datagram(self.remote_addr, frame).await;
        }
        expired.len()
    }

    pub async fn rtt(&self) -> Duration {
        self.rtt.lock().await.mean()
    }

    pub async fn record_rtt(&self, sample: Duration) {
        trace!("RTT sample for {:?}: {:?}", self.remote_addr, sample);
        self.rtt.lock().await.add_sample(sample);
    }

    pub async fn disconnect_linger(&self) -> Duration {
        self.config.disconnect_linger(self.rtt().await)
    }

    /// Marks a ping as started if none is in flight and the ping interval has passed since the
    ///  previous one
    pub async fn try_start_ping(&self, now: Instant) -> bool {
        let mut last_ping = self.last_ping.lock().await;
        if now.saturating_duration_since(*last_ping) < self.config.ping_interval {
            return false;
        }
        if self.ping_in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        *last_ping = now;
        true
    }

    pub fn finish_ping(&self) {
        self.ping_in_flight.store(false, Ordering::Release);
    }
}
