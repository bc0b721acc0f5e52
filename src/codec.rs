//! The contract between application payload types and the wire. Every packet type knows how to
//!  serialize itself, and a [PacketRegistry] maps type ids to decoders so that received records
//!  can be turned back into typed packets.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;

use crate::peer::Peer;
use crate::transport::Role;
use crate::util::buf_ext::BufExt;

pub type PacketTypeId = u16;

/// type ids from here up are used by the replication protocol itself
pub const FIRST_RESERVED_PACKET_TYPE: PacketTypeId = 0xff00;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Reliability {
    /// ordered, acknowledged and retransmitted
    Reliable,
    /// best effort, latest wins
    Unreliable,
}

/// Who sent a received packet, and in which role we received it
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub sender: Peer,
    pub role: Role,
}

pub trait Packet: Debug + Send + Sync + 'static {
    fn packet_type(&self) -> PacketTypeId;

    fn reliability(&self) -> Reliability {
        Reliability::Reliable
    }

    /// Appends the packet body. An error drops the packet, so implementations should fail only
    ///  for values the wire format cannot carry.
    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Called by the tick loop right before the packet is serialized. An error drops the packet.
    fn on_pre_send(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a packet was decoded, before it is handed to the application. An error drops
    ///  the packet.
    fn on_received(&self, _context: &PacketContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Packet {
    pub fn downcast_ref<T: PacketType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

pub trait PacketType: Packet + Sized {
    const TYPE_ID: PacketTypeId;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self>;
}

type Decoder = fn(&mut &[u8]) -> anyhow::Result<Arc<dyn Packet>>;

fn decode<T: PacketType>(buf: &mut &[u8]) -> anyhow::Result<Arc<dyn Packet>> {
    let packet: Arc<dyn Packet> = Arc::new(T::deser(buf)?);
    Ok(packet)
}

struct RegisteredPacket {
    name: &'static str,
    decoder: Decoder,
}

/// Decoders for all application packet types, keyed by type id
#[derive(Default)]
pub struct PacketRegistry {
    packets: FxHashMap<PacketTypeId, RegisteredPacket>,
}
impl PacketRegistry {
    pub fn new() -> PacketRegistry {
        Default::default()
    }

    pub fn register<T: PacketType>(&mut self) -> anyhow::Result<()> {
        if T::TYPE_ID >= FIRST_RESERVED_PACKET_TYPE {
            bail!("packet type id {:#x} of {} is reserved", T::TYPE_ID, std::any::type_name::<T>());
        }
        if let Some(prev) = self.packets.get(&T::TYPE_ID) {
            bail!("packet type id {:#x} is already registered for {}", T::TYPE_ID, prev.name);
        }

        self.packets.insert(T::TYPE_ID, RegisteredPacket {
            name: std::any::type_name::<T>(),
            decoder: decode::<T>,
        });
        Ok(())
    }

    pub fn with<T: PacketType>(mut self) -> anyhow::Result<PacketRegistry> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn can_serialize(&self, type_id: PacketTypeId) -> bool {
        self.packets.contains_key(&type_id)
    }

    /// Decodes a packet body, which must be consumed completely
    pub fn decode(&self, type_id: PacketTypeId, mut body: &[u8]) -> anyhow::Result<Arc<dyn Packet>> {
        let registered = self.packets.get(&type_id)
            .ok_or_else(|| anyhow!("no packet type registered for id {:#x}", type_id))?;

        let packet = (registered.decoder)(&mut body)?;
        if !body.is_empty() {
            bail!("{} trailing bytes after {}", body.len(), registered.name);
        }
        Ok(packet)
    }
}

/// writes a packet record's payload: type id followed by the packet's own serialization
pub fn encode_packet(packet: &dyn Packet, buf: &mut BytesMut) -> anyhow::Result<()> {
    buf.put_u16(packet.packet_type());
    packet.ser(buf)
}

/// splits a packet record's payload into type id and body
pub fn split_packet_record(mut payload: &[u8]) -> anyhow::Result<(PacketTypeId, &[u8])> {
    let type_id = payload.try_u16()?;
    Ok((type_id, payload))
}
