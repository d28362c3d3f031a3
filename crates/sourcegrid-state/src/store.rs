//! StateStore: redb-backed persistence for SourceGrid.
//!
//! Holds connector definitions (with optimistic versioning), the instance
//! record arena, and the worker node table. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Every operation runs in a single redb transaction, so operations on one
//! identity are atomic. There are no cross-identity transactions.

use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Number of keys a [`DefinitionCursor`] reads per transaction.
const LIST_PAGE_SIZE: usize = 64;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Register a new definition. Its version is set to 1.
    ///
    /// Fails with `AlreadyExists` if the identity is already stored.
    pub fn insert_definition(&self, def: &ConnectorDefinition) -> StateResult<ConnectorDefinition> {
        let key = def.table_key();
        let now = epoch_secs();
        let mut stored = def.clone();
        stored.version = 1;
        stored.created_at = now;
        stored.updated_at = now;
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "definition registered");
        Ok(stored)
    }

    /// Replace a definition if its stored version equals `expected_version`.
    ///
    /// Writes version `expected_version + 1` and returns the stored value.
    pub fn update_definition(
        &self,
        def: &ConnectorDefinition,
        expected_version: u64,
    ) -> StateResult<ConnectorDefinition> {
        let key = def.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            let current: ConnectorDefinition = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(key)),
            };
            if current.version != expected_version {
                return Err(StateError::VersionConflict {
                    key,
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let mut next = def.clone();
            next.version = current.version + 1;
            next.created_at = current.created_at;
            next.updated_at = epoch_secs();
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = stored.version, "definition updated");
        Ok(stored)
    }

    /// Get a definition by identity.
    pub fn get_definition(&self, id: &DefinitionId) -> StateResult<ConnectorDefinition> {
        let key = id.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(key)),
        }
    }

    /// Delete a definition.
    ///
    /// Fails with `Conflict` while any instance record of the identity
    /// remains; the check and the removal share one write transaction.
    pub fn delete_definition(&self, id: &DefinitionId) -> StateResult<()> {
        let key = id.table_key();
        let prefix = InstanceKey::definition_prefix(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut range = instances
                .range::<&str>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .map_err(map_err!(Read))?;
            if let Some(entry) = range.next() {
                let (child, _) = entry.map_err(map_err!(Read))?;
                if child.value().starts_with(&prefix) {
                    return Err(StateError::Conflict(format!(
                        "{key} still has instance records"
                    )));
                }
            }

            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            let existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            if !existed {
                return Err(StateError::NotFound(key));
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "definition deleted");
        Ok(())
    }

    /// Lazily list definition identities in a tenant/namespace.
    pub fn list_definitions(&self, tenant: &str, namespace: &str) -> DefinitionCursor {
        DefinitionCursor::new(self.clone(), DefinitionId::namespace_prefix(tenant, namespace))
    }

    /// Lazily list every definition identity in the store.
    pub fn list_all_definitions(&self) -> DefinitionCursor {
        DefinitionCursor::new(self.clone(), String::new())
    }

    /// Read up to `limit` definition keys after `after` that start with `prefix`.
    fn definition_keys_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(prefix),
        };
        let mut keys = Vec::with_capacity(limit);
        for entry in table
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
            if keys.len() >= limit {
                break;
            }
        }
        Ok(keys)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance record by key.
    pub fn get_instance(&self, key: &InstanceKey) -> StateResult<Option<InstanceRecord>> {
        let key = key.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List the instance records of a definition, ordered by ordinal.
    pub fn list_instances(&self, id: &DefinitionId) -> StateResult<Vec<InstanceRecord>> {
        let prefix = InstanceKey::definition_prefix(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range::<&str>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List every instance record in the store.
    pub fn list_all_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, key: &InstanceKey) -> StateResult<bool> {
        let key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a worker node.
    pub fn put_node(&self, node: &WorkerNode) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a worker node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<WorkerNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: WorkerNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all worker nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<WorkerNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: WorkerNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a worker node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

/// Lazy, restartable listing of definition identities.
///
/// Reads keys in pages, each in its own read transaction, resuming after the
/// last key it returned. Definitions added or removed between pages may or
/// may not be observed.
#[derive(Clone)]
pub struct DefinitionCursor {
    store: StateStore,
    prefix: String,
    resume_after: Option<String>,
    buffer: VecDeque<String>,
    page_size: usize,
    exhausted: bool,
}

impl DefinitionCursor {
    fn new(store: StateStore, prefix: String) -> Self {
        Self {
            store,
            prefix,
            resume_after: None,
            buffer: VecDeque::new(),
            page_size: LIST_PAGE_SIZE,
            exhausted: false,
        }
    }

    /// Override how many keys are read per transaction.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewind to the beginning of the listing.
    pub fn restart(&mut self) {
        self.resume_after = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> StateResult<()> {
        let keys = self.store.definition_keys_page(
            &self.prefix,
            self.resume_after.as_deref(),
            self.page_size,
        )?;
        if keys.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = keys.last() {
            self.resume_after = Some(last.clone());
        }
        self.buffer.extend(keys);
        Ok(())
    }
}

impl Iterator for DefinitionCursor {
    type Item = StateResult<DefinitionId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let key = self.buffer.pop_front()?;
        Some(
            DefinitionId::from_table_key(&key)
                .ok_or_else(|| StateError::Deserialize(format!("malformed definition key {key}"))),
        )
    }
}
