//! The per-update pipeline. Each tick first drains the outgoing queue into per-peer, per-tier
//!  batches of records and sends them, then unpacks received datagrams and dispatches their
//!  records. Each phase gets a share of the tick's time budget; what does not fit stays queued
//!  for the next tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::codec::{encode_packet, split_packet_record, Packet, PacketContext, PacketRegistry, Reliability, FIRST_RESERVED_PACKET_TYPE};
use crate::config::NetConfig;
use crate::peer::Peer;
use crate::protocol::frame_header::FrameHeader;
use crate::protocol::records::{RecordHint, RecordReader, RecordWriter, RECORD_HEADER_LEN};
use crate::replication::{ObjectId, Replication};
use crate::transport::{InboundDatagram, TransportAdapter};

/// share of the tick budget for each of the send and receive phases
const PHASE_SHARE: f64 = 0.45;

#[derive(Debug, Clone)]
pub enum Target {
    Peer(Peer),
    Peers(Vec<Peer>),
    AllConnected,
    AllExcept(Peer),
}

#[derive(Debug)]
pub enum OutgoingItem {
    Packet {
        target: Target,
        packet: Arc<dyn Packet>,
    },
    /// a synced object with pending changes
    Synced(ObjectId),
    /// a diff received from an object's owner, relayed verbatim
    SyncedDiff {
        tier: Reliability,
        diff: Bytes,
        targets: Vec<Peer>,
    },
}

/// The sending end of the queue the tick loop drains
#[derive(Clone)]
pub struct OutgoingQueue {
    sender: mpsc::UnboundedSender<OutgoingItem>,
}
impl OutgoingQueue {
    pub fn new() -> (OutgoingQueue, mpsc::UnboundedReceiver<OutgoingItem>) {
        let (sender, recv) = mpsc::unbounded_channel();
        (OutgoingQueue { sender }, recv)
    }

    pub fn push(&self, item: OutgoingItem) {
        if self.sender.send(item).is_err() {
            debug!("tick loop is gone - dropping outgoing item");
        }
    }
}

/// A decoded application packet, handed to the application after its receive hook succeeded
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub context: PacketContext,
    pub packet: Arc<dyn Packet>,
}

/// A complete record stream for one peer and tier
#[derive(Debug)]
pub struct Batch {
    pub peer: Peer,
    pub tier: Reliability,
    pub data: Bytes,
}

/// Collects records into per-peer, per-tier record streams. A stream is handed out for sending
///  when it reaches its tier's group size, or before a record would push it past the datagram
///  size limit. A record that could never fit a datagram is dropped.
pub struct Batcher {
    writers: FxHashMap<(Peer, Reliability), RecordWriter>,
    max_stream_len: usize,
    reliable_group_size: usize,
    unreliable_group_size: usize,
}
impl Batcher {
    pub fn new(config: &NetConfig) -> Batcher {
        Batcher {
            writers: FxHashMap::default(),
            max_stream_len: config.max_datagram_size - FrameHeader::SERIALIZED_LEN,
            reliable_group_size: config.reliable_group_size,
            unreliable_group_size: config.unreliable_group_size,
        }
    }

    fn group_size(&self, tier: Reliability) -> usize {
        match tier {
            Reliability::Reliable => self.reliable_group_size,
            Reliability::Unreliable => self.unreliable_group_size,
        }
    }

    fn take(&mut self, key: &(Peer, Reliability)) -> Option<Batch> {
        self.writers.remove(key)
            .map(|writer| Batch {
                peer: key.0.clone(),
                tier: key.1,
                data: writer.finish(),
            })
    }

    /// Adds a record, returning the batches that are ready to be sent
    pub fn append(&mut self, peer: &Peer, tier: Reliability, hint: RecordHint, payload: &[u8]) -> Vec<Batch> {
        let key = (peer.clone(), tier);
        let group_size = self.group_size(tier);
        let mut ready = Vec::new();

        // one byte for the end marker
        let record_len = RECORD_HEADER_LEN + payload.len();
        if record_len + 1 > self.max_stream_len {
            warn!("{:?} record of {} bytes for {:?} exceeds the datagram size limit - dropping", hint, payload.len(), peer);
            return ready;
        }

        let no_room = self.writers.get(&key)
            .map(|w| !w.is_empty() && w.finished_len() + record_len > self.max_stream_len)
            .unwrap_or(false);
        if no_room {
            ready.extend(self.take(&key));
        }

        let writer = self.writers.entry(key.clone()).or_default();
        writer.append_raw(hint.into(), payload);
        if writer.num_records() >= group_size {
            ready.extend(self.take(&key));
        }
        ready
    }

    /// all non-empty streams, at the end of the send phase
    pub fn drain(&mut self) -> Vec<Batch> {
        self.writers.drain()
            .filter(|(_, w)| !w.is_empty())
            .map(|((peer, tier), writer)| Batch { peer, tier, data: writer.finish() })
            .collect()
    }
}

fn run_hook(what: &str, hook: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(_) => bail!("{} panicked", what),
    }
}

pub struct TickLoop {
    config: Arc<NetConfig>,
    adapter: Arc<TransportAdapter>,
    replication: Arc<dyn Replication>,
    packets: Arc<PacketRegistry>,
    outgoing: Mutex<mpsc::UnboundedReceiver<OutgoingItem>>,
    received: mpsc::UnboundedSender<ReceivedPacket>,
}

impl TickLoop {
    pub fn new(
        config: Arc<NetConfig>,
        adapter: Arc<TransportAdapter>,
        replication: Arc<dyn Replication>,
        packets: Arc<PacketRegistry>,
        outgoing: mpsc::UnboundedReceiver<OutgoingItem>,
    ) -> (TickLoop, mpsc::UnboundedReceiver<ReceivedPacket>) {
        let (received, received_recv) = mpsc::unbounded_channel();
        let tick_loop = TickLoop {
            config,
            adapter,
            replication,
            packets,
            outgoing: Mutex::new(outgoing),
            received,
        };
        (tick_loop, received_recv)
    }

    /// drives ticks at the configured rate, for [crate::config::TickDriving::Automatic]
    pub async fn run(self: Arc<Self>) {
        info!("starting tick loop at {} updates per second", self.config.updates_per_second);
        let mut ticks = time::interval(self.config.tick_budget());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        let budget = self.config.tick_budget();
        let send_deadline = Instant::now() + budget.mul_f64(PHASE_SHARE);
        let receive_deadline = send_deadline + budget.mul_f64(PHASE_SHARE);

        self.send_phase(send_deadline)
            .instrument(span!(Level::TRACE, "send_phase"))
            .await;
        self.receive_phase(receive_deadline)
            .instrument(span!(Level::TRACE, "receive_phase"))
            .await;
    }

    async fn send_phase(&self, deadline: Instant) {
        let mut batcher = Batcher::new(&self.config);
        let mut outgoing = self.outgoing.lock().await;

        while Instant::now() < deadline {
            let item = match outgoing.try_recv() {
                Ok(item) => item,
                Err(_) => break,
            };
            for batch in self.append_item(&mut batcher, item) {
                self.send_batch(batch).await;
            }
        }
        drop(outgoing);

        for batch in batcher.drain() {
            self.send_batch(batch).await;
        }
    }

    fn append_item(&self, batcher: &mut Batcher, item: OutgoingItem) -> Vec<Batch> {
        let mut ready = Vec::new();
        match item {
            OutgoingItem::Packet { target, packet } => {
                if let Err(e) = run_hook("pre-send hook", || packet.on_pre_send()) {
                    warn!("dropping outgoing {:?}: {}", packet, e);
                    return ready;
                }
                let mut buf = BytesMut::new();
                if let Err(e) = run_hook("serialization", || encode_packet(packet.as_ref(), &mut buf)) {
                    warn!("dropping outgoing {:?}: {:#}", packet, e);
                    return ready;
                }

                for peer in self.resolve(target) {
                    ready.extend(batcher.append(&peer, packet.reliability(), RecordHint::Packet, &buf));
                }
            }
            OutgoingItem::Synced(id) => {
                let local_peer = self.adapter.local_peer();
                if let Some(prepared) = self.replication.prepare_send(id, &local_peer) {
                    let peers = self.resolve(prepared.target);
                    for (tier, diff) in &prepared.diffs {
                        for peer in &peers {
                            ready.extend(batcher.append(peer, *tier, RecordHint::SyncedObject, diff));
                        }
                    }
                }
            }
            OutgoingItem::SyncedDiff { tier, diff, targets } => {
                for peer in self.resolve(Target::Peers(targets)) {
                    ready.extend(batcher.append(&peer, tier, RecordHint::SyncedObject, &diff));
                }
            }
        }
        ready
    }

    /// the connected peers a target refers to; peers that are not connected are skipped
    fn resolve(&self, target: Target) -> Vec<Peer> {
        match target {
            Target::Peer(peer) => self.connected_only(vec![peer]),
            Target::Peers(peers) => self.connected_only(peers),
            Target::AllConnected => self.adapter.connected_peers(),
            Target::AllExcept(excluded) => self.adapter.connected_peers().into_iter()
                .filter(|p| *p != excluded)
                .collect(),
        }
    }

    fn connected_only(&self, peers: Vec<Peer>) -> Vec<Peer> {
        peers.into_iter()
            .filter(|p| {
                let connected = self.adapter.is_connected(p);
                if !connected {
                    trace!("skipping {:?}: not connected", p);
                }
                connected
            })
            .collect()
    }

    async fn send_batch(&self, batch: Batch) {
        trace!("sending {} bytes of {:?} records to {:?}", batch.data.len(), batch.tier, batch.peer);
        if let Err(e) = self.adapter.send(&batch.peer, batch.tier, &batch.data).await {
            debug!("could not send batch to {:?}: {}", batch.peer, e);
        }
    }

    async fn receive_phase(&self, deadline: Instant) {
        while Instant::now() < deadline {
            match self.adapter.try_next_datagram() {
                Some(datagram) => self.on_datagram(datagram),
                None => break,
            }
        }
    }

    /// Dispatches each record of a datagram. A failing record is dropped without affecting the
    ///  others.
    fn on_datagram(&self, datagram: InboundDatagram) {
        for record in RecordReader::new(&datagram.payload) {
            let result = match record.kind() {
                Some(RecordHint::Packet) => self.on_packet_record(&datagram.sender, record.payload),
                Some(RecordHint::SyncedObject) => self.replication.on_diff(&datagram.sender, datagram.tier, record.payload),
                _ => Err(anyhow!("unknown record hint {}", record.hint)),
            };
            if let Err(e) = result {
                warn!("dropping record from {:?}: {}", datagram.sender, e);
            }
        }
    }

    fn on_packet_record(&self, sender: &Peer, payload: &[u8]) -> anyhow::Result<()> {
        let (type_id, body) = split_packet_record(payload)?;
        if type_id >= FIRST_RESERVED_PACKET_TYPE {
            return self.replication.on_message(sender, type_id, body);
        }

        let packet = self.packets.decode(type_id, body)?;
        let context = PacketContext {
            sender: sender.clone(),
            role: self.adapter.role(),
        };
        run_hook("receive hook", || packet.on_received(&context))?;

        trace!("received {:?} from {:?}", packet, sender);
        let _ = self.received.send(ReceivedPacket { context, packet });
        Ok(())
    }
}
