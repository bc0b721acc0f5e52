use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::util::buf_ext::BufExt;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct FrameFlags: u8 {
        const RELIABLE      = 0b1000_0000;
        const ACK           = 0b0100_0000;
        const CONNECTION    = 0b0010_0000;
        const DISCONNECTION = 0b0001_0000;
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub sequence: u32,
}
impl Debug for FrameHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_ack() {
            "ACK"
        }
        else if self.flags.contains(FrameFlags::CONNECTION) {
            "CONN"
        }
        else if self.flags.contains(FrameFlags::DISCONNECTION) {
            "DISC"
        }
        else {
            "DATA"
        };
        let tier = if self.is_reliable() { "R" } else { "U" };
        write!(f, "FRAME{{{}{}#{}}}", kind, tier, self.sequence)
    }
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 5;

    pub fn new(flags: FrameFlags, sequence: u32) -> FrameHeader {
        FrameHeader { flags, sequence }
    }

    pub fn ack(sequence: u32) -> FrameHeader {
        FrameHeader::new(FrameFlags::ACK, sequence)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(FrameFlags::RELIABLE)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(FrameFlags::ACK)
    }

    /// control frames carry handshake / ping messages rather than application records
    pub fn is_control(&self) -> bool {
        self.flags.intersects(FrameFlags::CONNECTION | FrameFlags::DISCONNECTION)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.sequence);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let raw_flags = buf.try_u8()?;
        let flags = match FrameFlags::from_bits(raw_flags) {
            Some(flags) => flags,
            None => bail!("invalid frame flags {:08b}", raw_flags),
        };
        if flags.contains(FrameFlags::ACK) && flags.intersects(FrameFlags::CONNECTION | FrameFlags::DISCONNECTION) {
            bail!("ack frame with connection / disconnection flags {:08b}", raw_flags);
        }
        if flags.contains(FrameFlags::CONNECTION | FrameFlags::DISCONNECTION) {
            bail!("frame with both connection and disconnection flags");
        }
        let sequence = buf.try_u32()?;
        Ok(FrameHeader { flags, sequence })
    }
}
