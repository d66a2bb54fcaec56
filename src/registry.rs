//! Concurrent map of cached machines.
//!
//! Entries are individually locked: work on different machines runs in
//! parallel, work on one machine is serialised. The outer map lock is only
//! ever held to locate an entry, never across a caller's operation, so a
//! slow refresh of one machine cannot stall the fleet.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::Error;
use crate::machine::{Machine, MachineId, Role};

#[derive(Debug, Default)]
pub struct Registry {
    machines: RwLock<HashMap<MachineId, Arc<Mutex<Machine>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a machine that must not be cached yet.
    pub async fn insert_new(&self, machine: Machine) -> Result<(), Error> {
        let id = machine.id.clone();
        let mut machines = self.machines.write().await;
        if machines.contains_key(&id) {
            return Err(Error::MachineAlreadyCached(id));
        }
        machines.insert(id, Arc::new(Mutex::new(machine)));
        Ok(())
    }

    async fn entry(&self, id: &MachineId) -> Result<Arc<Mutex<Machine>>, Error> {
        self.machines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MachineNotCached(id.clone()))
    }

    /// Takes the per-entry lock for a modify-in-place transaction.
    ///
    /// The guard may be held across storage and pub/sub calls; only this
    /// machine is blocked meanwhile. Callers stage fallible work first and
    /// write machine fields last, so dropping the guard on an error path
    /// leaves the entry unmodified.
    pub async fn lock(&self, id: &MachineId) -> Result<OwnedMutexGuard<Machine>, Error> {
        let entry = self.entry(id).await?;
        Ok(entry.lock_owned().await)
    }

    /// Runs a read-only closure under the entry lock.
    pub async fn with<R>(
        &self,
        id: &MachineId,
        f: impl FnOnce(&Machine) -> R,
    ) -> Result<R, Error> {
        let machine = self.lock(id).await?;
        Ok(f(&machine))
    }

    pub async fn contains(&self, id: &MachineId) -> bool {
        self.machines.read().await.contains_key(id)
    }

    /// Snapshot of the cached ids. Values read afterwards may already be
    /// newer; the poller tolerates that.
    pub async fn ids(&self) -> Vec<MachineId> {
        self.machines.read().await.keys().cloned().collect()
    }

    /// The `(id, role)` projection persisted to the follow file.
    pub async fn roles(&self) -> BTreeMap<String, Role> {
        let entries: Vec<_> = {
            let machines = self.machines.read().await;
            machines
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };
        let mut roles = BTreeMap::new();
        for (id, entry) in entries {
            let machine = entry.lock().await;
            roles.insert(id.as_str().to_string(), machine.role);
        }
        roles
    }
}
