use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::peer::Peer;
use crate::replication::synced::{validate_properties, SyncedCell, SyncedEntry, SyncedObject};
use crate::replication::{ObjectId, Scheduler, SyncedTypeId};

type Factory = fn(ObjectId, Peer, Arc<Scheduler>) -> Arc<dyn SyncedEntry>;

fn create_default<T: SyncedObject>(id: ObjectId, owner: Peer, scheduler: Arc<Scheduler>) -> Arc<dyn SyncedEntry> {
    Arc::new(SyncedCell::new(id, T::default(), owner, scheduler))
}

struct RegisteredType {
    name: &'static str,
    factory: Factory,
}

/// The synced object types a client can mirror, keyed by their type id
#[derive(Default)]
pub struct SyncedRegistry {
    types: FxHashMap<SyncedTypeId, RegisteredType>,
}
impl SyncedRegistry {
    pub fn new() -> SyncedRegistry {
        Default::default()
    }

    pub fn register<T: SyncedObject>(&mut self) -> anyhow::Result<()> {
        validate_properties::<T>()?;
        if let Some(prev) = self.types.get(&T::TYPE_ID) {
            bail!("synced type id {} is already registered for {}", T::TYPE_ID, prev.name);
        }
        self.types.insert(T::TYPE_ID, RegisteredType {
            name: std::any::type_name::<T>(),
            factory: create_default::<T>,
        });
        Ok(())
    }

    pub fn with<T: SyncedObject>(mut self) -> anyhow::Result<SyncedRegistry> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn is_registered(&self, synced_type: SyncedTypeId) -> bool {
        self.types.contains_key(&synced_type)
    }

    pub(crate) fn instantiate(&self, synced_type: SyncedTypeId, id: ObjectId, owner: Peer, scheduler: Arc<Scheduler>) -> anyhow::Result<Arc<dyn SyncedEntry>> {
        match self.types.get(&synced_type) {
            Some(registered) => Ok((registered.factory)(id, owner, scheduler)),
            None => bail!("no synced type registered for id {}", synced_type),
        }
    }
}
