//! Per-identity mutual exclusion.
//!
//! Every mutating operation on a definition holds its [`IdentityGuard`].
//! Guards on different identities never contend. The guard is `Clone` so
//! spawned command tasks can keep the identity locked until their outcome
//! is recorded; the lock is released when the last clone drops.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use sourcegrid_state::DefinitionId;

type Slots = HashMap<DefinitionId, Arc<tokio::sync::Mutex<()>>>;

/// Named locks keyed by definition identity.
#[derive(Clone, Default)]
pub struct IdentityLocks {
    slots: Arc<Mutex<Slots>>,
}

struct Held {
    id: DefinitionId,
    slots: Arc<Mutex<Slots>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Held {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        // Map entry plus the mutex Arc inside our own guard: no one else is waiting.
        if slots.get(&self.id).is_some_and(|m| Arc::strong_count(m) == 2) {
            slots.remove(&self.id);
        }
        self.guard.take();
    }
}

/// Proof that the holder has exclusive access to one identity.
#[derive(Clone)]
pub struct IdentityGuard {
    held: Arc<Held>,
}

impl IdentityGuard {
    pub fn id(&self) -> &DefinitionId {
        &self.held.id
    }
}

impl fmt::Debug for IdentityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityGuard").field("id", &self.held.id).finish()
    }
}

fn lock_slots(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &DefinitionId) -> Arc<tokio::sync::Mutex<()>> {
        lock_slots(&self.slots)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &DefinitionId) -> IdentityGuard {
        let guard = self.slot(id).lock_owned().await;
        self.wrap(id, guard)
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self, id: &DefinitionId) -> Option<IdentityGuard> {
        let slot = self.slot(id);
        match slot.try_lock_owned() {
            Ok(guard) => Some(self.wrap(id, guard)),
            Err(_) => None,
        }
    }

    fn wrap(&self, id: &DefinitionId, guard: OwnedMutexGuard<()>) -> IdentityGuard {
        IdentityGuard {
            held: Arc::new(Held {
                id: id.clone(),
                slots: self.slots.clone(),
                guard: Some(guard),
            }),
        }
    }

    /// Number of identities with a live lock entry.
    pub fn tracked(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}
