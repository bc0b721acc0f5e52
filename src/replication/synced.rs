use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context};
use arc_swap::ArcSwap;
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::codec::Reliability;
use crate::peer::Peer;
use crate::replication::{ObjectId, PropertyId, Scheduler, SyncedTypeId};
use crate::util::buf_ext::BufExt;

pub const MAX_PROPERTIES: usize = 64;

/// Static description of one synced property
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PropertyMeta {
    pub id: PropertyId,
    pub name: &'static str,
    pub tier: Reliability,
    /// included in every diff of its tier, whether it changed or not
    pub always_serialize: bool,
}
impl PropertyMeta {
    pub const fn reliable(id: PropertyId, name: &'static str) -> PropertyMeta {
        PropertyMeta { id, name, tier: Reliability::Reliable, always_serialize: false }
    }

    pub const fn unreliable(id: PropertyId, name: &'static str) -> PropertyMeta {
        PropertyMeta { id, name, tier: Reliability::Unreliable, always_serialize: false }
    }

    pub const fn always(self) -> PropertyMeta {
        PropertyMeta { always_serialize: true, ..self }
    }
}

/// An application type whose properties are replicated between peers.
///
/// Each property is identified by a [PropertyId] and listed in [SyncedObject::PROPERTIES]
///  together with its reliability tier. Property values are written and read individually,
///  so a diff carries only the properties that changed.
pub trait SyncedObject: Default + Send + 'static {
    const TYPE_ID: SyncedTypeId;
    const PROPERTIES: &'static [PropertyMeta];

    /// Appends a property value. An error drops the diff the property is part of.
    fn write_property(&self, property: PropertyId, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn read_property(&mut self, property: PropertyId, buf: &mut &[u8]) -> anyhow::Result<()>;

    fn on_created(&mut self) {}
    fn on_destroyed(&mut self) {}
    fn on_owner_changed(&mut self, _owner: &Peer) {}
}

pub(crate) fn validate_properties<T: SyncedObject>() -> anyhow::Result<()> {
    let mut seen = 0u64;
    for meta in T::PROPERTIES {
        if meta.id as usize >= MAX_PROPERTIES {
            bail!("property {} of {} has id {} which is out of range", meta.name, std::any::type_name::<T>(), meta.id);
        }
        if seen & (1 << meta.id) != 0 {
            bail!("duplicate property id {} in {}", meta.id, std::any::type_name::<T>());
        }
        seen |= 1 << meta.id;
    }
    Ok(())
}

fn meta_of<T: SyncedObject>(property: PropertyId) -> Option<&'static PropertyMeta> {
    T::PROPERTIES.iter().find(|m| m.id == property)
}

/// One bit per property id, separately for each tier
#[derive(Default)]
pub(crate) struct DirtyMasks {
    reliable: AtomicU64,
    unreliable: AtomicU64,
}
impl DirtyMasks {
    fn mask(&self, tier: Reliability) -> &AtomicU64 {
        match tier {
            Reliability::Reliable => &self.reliable,
            Reliability::Unreliable => &self.unreliable,
        }
    }

    pub fn mark(&self, tier: Reliability, property: PropertyId) {
        self.mask(tier).fetch_or(1 << property, Ordering::AcqRel);
    }

    pub fn get(&self, tier: Reliability) -> u64 {
        self.mask(tier).load(Ordering::Acquire)
    }

    pub fn clear(&self, tier: Reliability, bits: u64) {
        self.mask(tier).fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn clear_all(&self) {
        self.reliable.store(0, Ordering::Release);
        self.unreliable.store(0, Ordering::Release);
    }
}

/// The shared state behind a synced object: the application object itself, its owner and
///  its dirty masks
pub(crate) struct SyncedCell<T: SyncedObject> {
    id: ObjectId,
    object: Mutex<T>,
    owner: ArcSwap<Peer>,
    dirty: DirtyMasks,
    scheduler: Arc<Scheduler>,
}
impl<T: SyncedObject> SyncedCell<T> {
    pub fn new(id: ObjectId, object: T, owner: Peer, scheduler: Arc<Scheduler>) -> SyncedCell<T> {
        SyncedCell {
            id,
            object: Mutex::new(object),
            owner: ArcSwap::from_pointee(owner),
            dirty: DirtyMasks::default(),
            scheduler,
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // a panic in application code while holding the lock leaves the object usable
        self.object.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_props(&self, object: &T, props: &[&PropertyMeta], buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(props.len() as u8);
        for meta in props {
            buf.put_u8(meta.id);
            object.write_property(meta.id, buf)
                .with_context(|| format!("writing property {} of {:?}", meta.name, self.id))?;
        }
        Ok(())
    }
}

/// Type-erased access to a [SyncedCell], used by the replication engines
pub(crate) trait SyncedEntry: Send + Sync {
    fn id(&self) -> ObjectId;
    fn synced_type(&self) -> SyncedTypeId;
    fn owner(&self) -> Peer;
    fn set_owner(&self, owner: Peer);

    /// Writes the properties of the given tier that are dirty (or always serialized) and clears
    ///  their dirty bits. Returns false and writes nothing if there is nothing to send. The dirty
    ///  bits are cleared even if a property fails to serialize, and the caller discards `buf`.
    fn write_diff(&self, tier: Reliability, buf: &mut BytesMut) -> anyhow::Result<bool>;
    fn write_full_state(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
    fn apply_diff(&self, buf: &mut &[u8]) -> anyhow::Result<()>;
    fn clear_dirty(&self);

    fn on_created(&self);
    fn on_destroyed(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: SyncedObject> SyncedEntry for SyncedCell<T> {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn synced_type(&self) -> SyncedTypeId {
        T::TYPE_ID
    }

    fn owner(&self) -> Peer {
        Peer::clone(&self.owner.load())
    }

    fn set_owner(&self, owner: Peer) {
        let mut object = self.lock();
        self.owner.store(Arc::new(owner.clone()));
        object.on_owner_changed(&owner);
    }

    fn write_diff(&self, tier: Reliability, buf: &mut BytesMut) -> anyhow::Result<bool> {
        let object = self.lock();
        let dirty = self.dirty.get(tier);

        let props = T::PROPERTIES.iter()
            .filter(|m| m.tier == tier)
            .filter(|m| m.always_serialize || dirty & (1 << m.id) != 0)
            .collect::<Vec<_>>();
        if props.is_empty() {
            return Ok(false);
        }

        let written = self.write_props(&object, &props, buf);
        self.dirty.clear(tier, dirty);
        written.map(|_| true)
    }

    fn write_full_state(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let object = self.lock();
        let props = T::PROPERTIES.iter().collect::<Vec<_>>();
        self.write_props(&object, &props, buf)
    }

    fn apply_diff(&self, buf: &mut &[u8]) -> anyhow::Result<()> {
        let mut object = self.lock();
        let count = buf.try_u8()?;
        for _ in 0..count {
            let property = buf.try_u8()?;
            if meta_of::<T>(property).is_none() {
                bail!("{:?} has no property with id {}", self.id, property);
            }
            object.read_property(property, buf)?;
        }
        if !buf.is_empty() {
            warn!("{} trailing bytes after diff for {:?}", buf.len(), self.id);
        }
        Ok(())
    }

    fn clear_dirty(&self) {
        self.dirty.clear_all();
    }

    fn on_created(&self) {
        self.lock().on_created();
    }

    fn on_destroyed(&self) {
        self.lock().on_destroyed();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Application handle to a synced object.
///
/// Reading is plain access to the object. Changes go through [Synced::modify], which marks the
///  changed property dirty and schedules the object for the next tick.
pub struct Synced<T: SyncedObject> {
    cell: Arc<SyncedCell<T>>,
}
impl<T: SyncedObject> Clone for Synced<T> {
    fn clone(&self) -> Self {
        Synced { cell: self.cell.clone() }
    }
}
impl<T: SyncedObject> Debug for Synced<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SYNCED{{{}:{:?}@{:?}}}", std::any::type_name::<T>(), self.cell.id, self.cell.owner())
    }
}

impl<T: SyncedObject> Synced<T> {
    pub(crate) fn from_cell(cell: Arc<SyncedCell<T>>) -> Synced<T> {
        Synced { cell }
    }

    pub(crate) fn from_entry(entry: Arc<dyn SyncedEntry>) -> Option<Synced<T>> {
        entry.into_any()
            .downcast::<SyncedCell<T>>()
            .ok()
            .map(Synced::from_cell)
    }

    pub fn id(&self) -> ObjectId {
        self.cell.id
    }

    pub fn owner(&self) -> Peer {
        self.cell.owner()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&*self.cell.lock())
    }

    /// Changes a property and marks it dirty. Modifying a property that has no metadata is a
    ///  usage error.
    pub fn modify<R>(&self, property: PropertyId, f: impl FnOnce(&mut T) -> R) -> anyhow::Result<R> {
        let meta = meta_of::<T>(property)
            .ok_or_else(|| anyhow!("{} has no property with id {}", std::any::type_name::<T>(), property))?;

        let result = {
            let mut object = self.cell.lock();
            let result = f(&mut *object);
            self.cell.dirty.mark(meta.tier, property);
            result
        };
        debug!("{:?}: property {} modified", self.cell.id, meta.name);
        self.cell.scheduler.schedule(self.cell.id);
        Ok(result)
    }

    /// Schedules the object so that properties flagged as always serialized go out with the next
    ///  tick even if nothing changed
    pub fn touch(&self) {
        self.cell.scheduler.schedule(self.cell.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::synced::{Counter, Transform};
    use crate::tick::{OutgoingItem, OutgoingQueue};
    use rstest::rstest;

    fn cell<T: SyncedObject>(object: T) -> (Arc<SyncedCell<T>>, tokio::sync::mpsc::UnboundedReceiver<OutgoingItem>) {
        let (outgoing, recv) = OutgoingQueue::new();
        let scheduler = Arc::new(Scheduler::new(outgoing));
        let cell = Arc::new(SyncedCell::new(ObjectId(7), object, Peer::unaddressed("owner"), scheduler));
        (cell, recv)
    }

    #[test]
    fn test_modify_marks_dirty_and_schedules_once() {
        let (cell, mut recv) = cell(Counter::default());
        let synced = Synced::from_cell(cell.clone());

        synced.modify(Counter::VALUE, |c| c.value = 3).unwrap();
        synced.modify(Counter::VALUE, |c| c.value += 1).unwrap();

        assert!(matches!(recv.try_recv(), Ok(OutgoingItem::Synced(ObjectId(7)))));
        assert!(recv.try_recv().is_err());
        assert_eq!(cell.dirty.get(Reliability::Reliable), 1 << Counter::VALUE);
        assert_eq!(cell.dirty.get(Reliability::Unreliable), 0);
        assert_eq!(synced.read(|c| c.value), 4);
    }

    #[test]
    fn test_modify_unknown_property() {
        let (cell, mut recv) = cell(Counter::default());
        let synced = Synced::from_cell(cell);

        assert!(synced.modify(17, |c| c.value = 3).is_err());
        assert!(recv.try_recv().is_err());
        assert_eq!(synced.read(|c| c.value), 0);
    }

    #[test]
    fn test_write_diff_clears_only_its_tier() {
        let (cell, _recv) = cell(Transform::default());
        let synced = Synced::from_cell(cell.clone());

        synced.modify(Transform::NAME, |t| t.name = "box".to_string()).unwrap();
        synced.modify(Transform::X, |t| t.x = 1.5).unwrap();

        let mut buf = BytesMut::new();
        assert!(cell.write_diff(Reliability::Unreliable, &mut buf).unwrap());
        assert_eq!(cell.dirty.get(Reliability::Unreliable), 0);
        assert_eq!(cell.dirty.get(Reliability::Reliable), 1 << Transform::NAME);

        let mut buf = BytesMut::new();
        assert!(cell.write_diff(Reliability::Reliable, &mut buf).unwrap());
        assert_eq!(cell.dirty.get(Reliability::Reliable), 0);

        let mut buf = BytesMut::new();
        assert!(!cell.write_diff(Reliability::Reliable, &mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_diff_with_oversized_property() {
        let (cell, _recv) = cell(Transform::default());
        let synced = Synced::from_cell(cell.clone());
        synced.modify(Transform::NAME, |t| t.name = "x".repeat(70_000)).unwrap();

        let mut buf = BytesMut::new();
        assert!(cell.write_diff(Reliability::Reliable, &mut buf).is_err());
        assert_eq!(cell.dirty.get(Reliability::Reliable), 0);

        synced.modify(Transform::NAME, |t| t.name = "box".to_string()).unwrap();
        let mut buf = BytesMut::new();
        assert!(cell.write_diff(Reliability::Reliable, &mut buf).unwrap());
    }

    #[rstest]
    #[case::nothing_dirty(false, false, 1)]
    #[case::x_dirty(true, false, 2)]
    #[case::both_dirty(true, true, 3)]
    fn test_always_serialized_property(#[case] x_dirty: bool, #[case] y_dirty: bool, #[case] expected_count: u8) {
        let (cell, _recv) = cell(Transform::default());
        let synced = Synced::from_cell(cell.clone());
        if x_dirty {
            synced.modify(Transform::X, |t| t.x = 1.0).unwrap();
        }
        if y_dirty {
            synced.modify(Transform::Y, |t| t.y = 2.0).unwrap();
        }

        let mut buf = BytesMut::new();
        assert!(cell.write_diff(Reliability::Unreliable, &mut buf).unwrap());
        assert_eq!(buf[0], expected_count);
    }

    #[test]
    fn test_diff_applies_to_mirror() {
        let (source, _recv) = cell(Transform::default());
        let (mirror, _recv2) = cell(Transform::default());
        let synced = Synced::from_cell(source.clone());
        synced.modify(Transform::NAME, |t| t.name = "crate".to_string()).unwrap();
        synced.modify(Transform::Y, |t| t.y = -4.0).unwrap();

        for tier in [Reliability::Reliable, Reliability::Unreliable] {
            let mut buf = BytesMut::new();
            assert!(source.write_diff(tier, &mut buf).unwrap());
            mirror.apply_diff(&mut buf.as_ref()).unwrap();
        }

        let mirror = Synced::from_cell(mirror);
        assert_eq!(mirror.read(|t| t.name.clone()), "crate");
        assert_eq!(mirror.read(|t| t.y), -4.0);
        assert_eq!(mirror.read(|t| t.x), 0.0);
    }

    #[test]
    fn test_full_state() {
        let (source, _recv) = cell(Counter { value: 12, ..Counter::default() });
        let (mirror, _recv2) = cell(Counter::default());

        let mut buf = BytesMut::new();
        source.write_full_state(&mut buf).unwrap();
        mirror.apply_diff(&mut buf.as_ref()).unwrap();

        assert_eq!(Synced::from_cell(mirror).read(|c| c.value), 12);
        assert_eq!(source.dirty.get(Reliability::Reliable), 0);
    }

    #[rstest]
    #[case::unknown_property(vec![1, 9, 0, 0, 0, 1])]
    #[case::truncated_value(vec![1, 0, 0, 0])]
    #[case::missing_property(vec![2, 0, 0, 0, 0, 1])]
    #[case::empty(vec![])]
    fn test_apply_malformed_diff(#[case] diff: Vec<u8>) {
        let (mirror, _recv) = cell(Counter::default());
        assert!(mirror.apply_diff(&mut diff.as_slice()).is_err());
    }

    #[test]
    fn test_set_owner_calls_hook() {
        let (cell, _recv) = cell(Counter::default());
        cell.set_owner(Peer::unaddressed("new-owner"));

        assert_eq!(cell.owner().guid(), "new-owner");
        assert_eq!(Synced::from_cell(cell).read(|c| c.owner_changes), 1);
    }

    #[test]
    fn test_downcast_entry() {
        let (cell, _recv) = cell(Counter::default());
        let entry: Arc<dyn SyncedEntry> = cell;

        assert!(Synced::<Transform>::from_entry(entry.clone()).is_none());
        assert!(Synced::<Counter>::from_entry(entry).is_some());
    }

    #[test]
    fn test_validate_properties() {
        assert!(validate_properties::<Counter>().is_ok());
        assert!(validate_properties::<Transform>().is_ok());
    }
}
