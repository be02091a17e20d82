//! File-backed state store.
//!
//! Each network gets one JSON document, `<root>/<network>.json`, holding its records and its
//! pending-transaction journal. Every access takes an advisory lock on `<root>/<network>.lock`
//! (shared for reads, exclusive for read-modify-write), so concurrent processes deploying to
//! the same network serialize on the document. Writes go to a temporary file that is renamed
//! over the document, so a crash never leaves a truncated document behind.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{DeploymentRecord, NetworkId, PendingDeployment, StateStore, StoreError};

/// On-disk layout of one network's state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkDocument {
    #[serde(default)]
    records: BTreeMap<String, DeploymentRecord>,
    #[serde(default)]
    pending: BTreeMap<String, PendingDeployment>,
}

/// A [`StateStore`] persisted under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| {
            format!("Failed to create state directory {}", root.display())
        })?;
        tracing::debug!(root = %root.display(), "Opened deployment state store");
        Ok(Self { root })
    }

    fn document_path(&self, network: &NetworkId) -> Result<PathBuf, StoreError> {
        validate_network(network)?;
        Ok(self.root.join(format!("{network}.json")))
    }

    fn lock(&self, network: &NetworkId, exclusive: bool) -> Result<File, StoreError> {
        validate_network(network)?;
        let path = self.root.join(format!("{network}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.with_context(|| format!("Failed to lock {}", path.display()))?;

        // The lock is released when the file is closed.
        Ok(file)
    }

    fn read(&self, network: &NetworkId) -> Result<NetworkDocument, StoreError> {
        let _lock = self.lock(network, false)?;
        Ok(read_document(&self.document_path(network)?)?)
    }

    /// Apply `f` to the network document under the exclusive lock and persist the result.
    /// Nothing is written when `f` fails.
    fn update<T>(
        &self,
        network: &NetworkId,
        f: impl FnOnce(&mut NetworkDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock(network, true)?;
        let path = self.document_path(network)?;

        let mut document = read_document(&path)?;
        let value = f(&mut document)?;
        write_document(&path, &document)?;

        Ok(value)
    }
}

fn validate_network(network: &NetworkId) -> Result<(), StoreError> {
    let valid = !network.is_empty()
        && network != &NetworkId::new(".")
        && network != &NetworkId::new("..")
        && network
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidNetwork(network.to_string()))
    }
}

fn read_document(path: &Path) -> anyhow::Result<NetworkDocument> {
    if !path.exists() {
        return Ok(NetworkDocument::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read deployment state from {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse deployment state in {}", path.display()))
}

fn write_document(path: &Path, document: &NetworkDocument) -> anyhow::Result<()> {
    let json =
        serde_json::to_string_pretty(document).context("Failed to serialize deployment state")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

impl StateStore for FileStore {
    fn get(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.read(network)?.records.remove(contract))
    }

    fn put(&self, record: DeploymentRecord) -> Result<(), StoreError> {
        let network = record.network_id.clone();
        self.update(&network, |document| {
            match document.records.entry(record.contract_name.clone()) {
                Entry::Occupied(_) => Err(StoreError::DuplicateRecord {
                    network: record.network_id,
                    contract: record.contract_name,
                }),
                Entry::Vacant(slot) => {
                    tracing::debug!(
                        contract = %record.contract_name,
                        network = %record.network_id,
                        address = %record.address,
                        "Writing deployment record"
                    );
                    slot.insert(record);
                    Ok(())
                }
            }
        })
    }

    fn list(&self, network: &NetworkId) -> Result<Vec<DeploymentRecord>, StoreError> {
        Ok(self.read(network)?.records.into_values().collect())
    }

    fn pending(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<PendingDeployment>, StoreError> {
        Ok(self.read(network)?.pending.remove(contract))
    }

    fn list_pending(&self, network: &NetworkId) -> Result<Vec<PendingDeployment>, StoreError> {
        Ok(self.read(network)?.pending.into_values().collect())
    }

    fn put_pending(&self, entry: PendingDeployment) -> Result<(), StoreError> {
        let network = entry.network_id.clone();
        self.update(&network, |document| {
            document.pending.insert(entry.contract_name.clone(), entry);
            Ok(())
        })
    }

    fn clear_pending(&self, network: &NetworkId, contract: &str) -> Result<bool, StoreError> {
        self.update(network, |document| {
            Ok(document.pending.remove(contract).is_some())
        })
    }
}
