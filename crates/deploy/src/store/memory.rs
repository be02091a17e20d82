//! In-process state store.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{DeploymentRecord, NetworkId, PendingDeployment, StateStore, StoreError};

type Key = (NetworkId, String);

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<Key, DeploymentRecord>,
    pending: BTreeMap<Key, PendingDeployment>,
}

/// A [`StateStore`] that lives for the duration of the process.
///
/// Shared between concurrent orchestrator runs through an `Arc`; a single mutex makes every
/// operation atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(network: &NetworkId, contract: &str) -> Key {
    (network.clone(), contract.to_string())
}

impl StateStore for MemoryStore {
    fn get(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.lock().records.get(&key(network, contract)).cloned())
    }

    fn put(&self, record: DeploymentRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state
            .records
            .entry(key(&record.network_id, &record.contract_name))
        {
            Entry::Occupied(_) => Err(StoreError::DuplicateRecord {
                network: record.network_id,
                contract: record.contract_name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn list(&self, network: &NetworkId) -> Result<Vec<DeploymentRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .iter()
            .filter(|((net, _), _)| net == network)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn pending(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<PendingDeployment>, StoreError> {
        Ok(self.lock().pending.get(&key(network, contract)).cloned())
    }

    fn list_pending(&self, network: &NetworkId) -> Result<Vec<PendingDeployment>, StoreError> {
        Ok(self
            .lock()
            .pending
            .iter()
            .filter(|((net, _), _)| net == network)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn put_pending(&self, entry: PendingDeployment) -> Result<(), StoreError> {
        let key = key(&entry.network_id, &entry.contract_name);
        self.lock().pending.insert(key, entry);
        Ok(())
    }

    fn clear_pending(&self, network: &NetworkId, contract: &str) -> Result<bool, StoreError> {
        Ok(self.lock().pending.remove(&key(network, contract)).is_some())
    }
}
