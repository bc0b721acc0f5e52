//! Reliable packets the server sends to manage mirrors on subscribers. They use type ids from
//!  the reserved range, so they never collide with application packets.

use std::any::Any;

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Packet, PacketType, PacketTypeId, FIRST_RESERVED_PACKET_TYPE};
use crate::replication::{ObjectId, SyncedTypeId};
use crate::util::buf_ext::{BufExt, BufMutExt};

pub const SYNCED_OBJECT_CREATED: PacketTypeId = FIRST_RESERVED_PACKET_TYPE + 1;
pub const SYNCED_OBJECT_DESTROYED: PacketTypeId = FIRST_RESERVED_PACKET_TYPE + 2;
pub const SYNCED_OWNER_CHANGED: PacketTypeId = FIRST_RESERVED_PACKET_TYPE + 3;

/// Tells a new subscriber to create a mirror, with the object's complete current state
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncedObjectCreated {
    pub id: ObjectId,
    pub synced_type: SyncedTypeId,
    pub owner_guid: String,
    /// all properties, in diff format
    pub state: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncedObjectDestroyed {
    pub id: ObjectId,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncedOwnerChanged {
    pub id: ObjectId,
    pub owner_guid: String,
}

impl Packet for SyncedObjectCreated {
    fn packet_type(&self) -> PacketTypeId {
        SYNCED_OBJECT_CREATED
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u32(self.id.0);
        buf.put_u16(self.synced_type);
        buf.put_string(&self.owner_guid)?;
        buf.put_bytes_prefixed(&self.state)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for SyncedObjectCreated {
    const TYPE_ID: PacketTypeId = SYNCED_OBJECT_CREATED;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        let id = ObjectId(buf.try_u32()?);
        let synced_type = buf.try_u16()?;
        let owner_guid = buf.try_string()?;
        if owner_guid.is_empty() {
            bail!("synced object {:?} without owner", id);
        }
        let state = buf.try_bytes()?;
        Ok(SyncedObjectCreated { id, synced_type, owner_guid, state })
    }
}

impl Packet for SyncedObjectDestroyed {
    fn packet_type(&self) -> PacketTypeId {
        SYNCED_OBJECT_DESTROYED
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u32(self.id.0);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for SyncedObjectDestroyed {
    const TYPE_ID: PacketTypeId = SYNCED_OBJECT_DESTROYED;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(SyncedObjectDestroyed { id: ObjectId(buf.try_u32()?) })
    }
}

impl Packet for SyncedOwnerChanged {
    fn packet_type(&self) -> PacketTypeId {
        SYNCED_OWNER_CHANGED
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u32(self.id.0);
        buf.put_string(&self.owner_guid)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for SyncedOwnerChanged {
    const TYPE_ID: PacketTypeId = SYNCED_OWNER_CHANGED;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        let id = ObjectId(buf.try_u32()?);
        let owner_guid = buf.try_string()?;
        if owner_guid.is_empty() {
            bail!("owner change for {:?} without owner", id);
        }
        Ok(SyncedOwnerChanged { id, owner_guid })
    }
}

/// Decodes a replication message body, which must be consumed completely
pub fn decode_message<T: PacketType>(mut body: &[u8]) -> anyhow::Result<T> {
    let message = T::deser(&mut body)?;
    if !body.is_empty() {
        bail!("{} trailing bytes after {}", body.len(), std::any::type_name::<T>());
    }
    Ok(message)
}
