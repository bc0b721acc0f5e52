use anyhow::bail;
use bytes::{BufMut, BytesMut};

use crate::peer::Peer;
use crate::replication::synced::{PropertyMeta, SyncedObject};
use crate::replication::{PropertyId, SyncedTypeId};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// A single reliable property, plus counters for the lifecycle hooks
#[derive(Debug, Default)]
pub struct Counter {
    pub value: i32,
    pub created: u32,
    pub destroyed: u32,
    pub owner_changes: u32,
}
impl Counter {
    pub const VALUE: PropertyId = 0;
}
impl SyncedObject for Counter {
    const TYPE_ID: SyncedTypeId = 1;
    const PROPERTIES: &'static [PropertyMeta] = &[
        PropertyMeta::reliable(Counter::VALUE, "value"),
    ];

    fn write_property(&self, property: PropertyId, buf: &mut BytesMut) -> anyhow::Result<()> {
        match property {
            Self::VALUE => buf.put_i32(self.value),
            other => bail!("no property {}", other),
        }
        Ok(())
    }

    fn read_property(&mut self, property: PropertyId, buf: &mut &[u8]) -> anyhow::Result<()> {
        match property {
            Self::VALUE => self.value = buf.try_i32()?,
            other => bail!("no property {}", other),
        }
        Ok(())
    }

    fn on_created(&mut self) {
        self.created += 1;
    }

    fn on_destroyed(&mut self) {
        self.destroyed += 1;
    }

    fn on_owner_changed(&mut self, _owner: &Peer) {
        self.owner_changes += 1;
    }
}

/// A reliable name with unreliable coordinates; the rotation goes out with every unreliable diff
#[derive(Debug, Default)]
pub struct Transform {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}
impl Transform {
    pub const NAME: PropertyId = 0;
    pub const X: PropertyId = 1;
    pub const Y: PropertyId = 2;
    pub const ROTATION: PropertyId = 3;
}
impl SyncedObject for Transform {
    const TYPE_ID: SyncedTypeId = 2;
    const PROPERTIES: &'static [PropertyMeta] = &[
        PropertyMeta::reliable(Transform::NAME, "name"),
        PropertyMeta::unreliable(Transform::X, "x"),
        PropertyMeta::unreliable(Transform::Y, "y"),
        PropertyMeta::unreliable(Transform::ROTATION, "rotation").always(),
    ];

    fn write_property(&self, property: PropertyId, buf: &mut BytesMut) -> anyhow::Result<()> {
        match property {
            Self::NAME => buf.put_string(&self.name)?,
            Self::X => buf.put_f32(self.x),
            Self::Y => buf.put_f32(self.y),
            Self::ROTATION => buf.put_f32(self.rotation),
            other => bail!("no property {}", other),
        }
        Ok(())
    }

    fn read_property(&mut self, property: PropertyId, buf: &mut &[u8]) -> anyhow::Result<()> {
        match property {
            Self::NAME => self.name = buf.try_string()?,
            Self::X => self.x = buf.try_f32()?,
            Self::Y => self.y = buf.try_f32()?,
            Self::ROTATION => self.rotation = buf.try_f32()?,
            other => bail!("no property {}", other),
        }
        Ok(())
    }
}
