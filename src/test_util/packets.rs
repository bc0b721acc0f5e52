use std::any::Any;

use anyhow::bail;
use bytes::{BufMut, BytesMut};

use crate::codec::{Packet, PacketContext, PacketType, PacketTypeId, Reliability};
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChatMessage {
    pub text: String,
}
impl Packet for ChatMessage {
    fn packet_type(&self) -> PacketTypeId {
        Self::TYPE_ID
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_string(&self.text)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for ChatMessage {
    const TYPE_ID: PacketTypeId = 1;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(ChatMessage { text: buf.try_string()? })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PositionUpdate {
    pub x: i32,
    pub y: i32,
}
impl Packet for PositionUpdate {
    fn packet_type(&self) -> PacketTypeId {
        Self::TYPE_ID
    }

    fn reliability(&self) -> Reliability {
        Reliability::Unreliable
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_i32(self.x);
        buf.put_i32(self.y);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for PositionUpdate {
    const TYPE_ID: PacketTypeId = 2;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        let x = buf.try_i32()?;
        let y = buf.try_i32()?;
        Ok(PositionUpdate { x, y })
    }
}

/// fails both its hooks, either with an error or by panicking
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FaultyPacket {
    pub panics: bool,
}
impl FaultyPacket {
    fn fail(&self) -> anyhow::Result<()> {
        if self.panics {
            panic!("faulty packet hook");
        }
        bail!("faulty packet hook")
    }
}
impl Packet for FaultyPacket {
    fn packet_type(&self) -> PacketTypeId {
        Self::TYPE_ID
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(self.panics as u8);
        Ok(())
    }

    fn on_pre_send(&self) -> anyhow::Result<()> {
        self.fail()
    }

    fn on_received(&self, _context: &PacketContext) -> anyhow::Result<()> {
        self.fail()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for FaultyPacket {
    const TYPE_ID: PacketTypeId = 3;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(FaultyPacket { panics: buf.try_u8()? != 0 })
    }
}
