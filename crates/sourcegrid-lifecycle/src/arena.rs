//! The instance arena.
//!
//! Instance records keyed by `(identity, ordinal)`, persisted in the state
//! store's instance table. Only the lifecycle controller writes through
//! this type; everything else reads.

use sourcegrid_state::{
    DefinitionId, InstanceKey, InstanceRecord, StateResult, StateStore, epoch_secs,
};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Clone)]
pub struct InstanceArena {
    store: StateStore,
}

impl InstanceArena {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// All records of a definition, ordinal ascending.
    pub fn records(&self, id: &DefinitionId) -> StateResult<Vec<InstanceRecord>> {
        self.store.list_instances(id)
    }

    /// Every record of every definition.
    pub fn all(&self) -> StateResult<Vec<InstanceRecord>> {
        self.store.list_all_instances()
    }

    pub fn get(&self, key: &InstanceKey) -> StateResult<Option<InstanceRecord>> {
        self.store.get_instance(key)
    }

    pub(crate) fn require(&self, key: &InstanceKey) -> LifecycleResult<InstanceRecord> {
        self.get(key)?
            .ok_or_else(|| LifecycleError::InstanceNotFound(key.clone()))
    }

    /// Persist a record, stamping `updated_at`.
    pub(crate) fn save(&self, record: &mut InstanceRecord) -> StateResult<()> {
        record.updated_at = epoch_secs();
        self.store.put_instance(record)
    }

    pub(crate) fn remove(&self, key: &InstanceKey) -> StateResult<bool> {
        self.store.delete_instance(key)
    }
}
