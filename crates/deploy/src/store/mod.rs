//! Deployment state store.
//!
//! Persists, per network, which contracts were deployed where. A record is written once and
//! never replaced: redeploying a contract means giving it a new name. The store also keeps a
//! write-ahead journal of deployments that are about to be, or have been, broadcast but are
//! not yet recorded, so that an interrupted run can be reconciled against the chain instead of
//! deploying a duplicate.

use std::sync::Arc;

use alloy_core::primitives::{Address, B256};
use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

use crate::{contract::ResolvedArg, submitter::DeploymentRequest, waiter::Confirmation};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Identifier of the network a deployment targets (e.g. `sepolia`, `local-anvil`).
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Deref,
    Display,
    From,
)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NetworkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A confirmed deployment of one contract on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub contract_name: String,
    pub network_id: NetworkId,
    pub address: Address,
    /// Creation transaction, unknown when the contract was adopted from its code alone.
    #[serde(default)]
    pub tx_hash: Option<B256>,
    /// Block the creation transaction was included in, or the block the code was first seen
    /// at when the transaction is unknown.
    pub confirmed_at_block: u64,
    /// Constructor arguments as sent on-chain.
    #[serde(default)]
    pub constructor_args: Vec<ResolvedArg>,
    /// Unix timestamp (seconds) at which the record was written.
    pub deployed_at: i64,
}

impl DeploymentRecord {
    pub fn new(
        network_id: &NetworkId,
        request: &DeploymentRequest,
        confirmation: &Confirmation,
    ) -> Self {
        Self {
            contract_name: request.contract_name.clone(),
            network_id: network_id.clone(),
            address: confirmation.address,
            tx_hash: confirmation.tx_hash,
            confirmed_at_block: confirmation.confirmed_at_block,
            constructor_args: request.args.clone(),
            deployed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A deployment that is about to be, or has been, broadcast but is not yet recorded.
///
/// The entry is written before the transaction is sent. Pinning `sender` and `nonce` fixes the
/// address the contract lands at, so the chain can be checked for it even when the transaction
/// hash never made it into the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeployment {
    pub contract_name: String,
    pub network_id: NetworkId,
    pub sender: Address,
    pub nonce: u64,
    /// `sender.create(nonce)`.
    pub expected_address: Address,
    /// Set once the node accepted the transaction.
    #[serde(default)]
    pub tx_hash: Option<B256>,
    /// Fingerprint of the init code, see [`DeploymentRequest::init_code_hash`].
    pub init_code_hash: String,
    pub constructor_args: Vec<ResolvedArg>,
    pub submitted_at: i64,
}

impl PendingDeployment {
    pub fn new(
        network_id: &NetworkId,
        request: &DeploymentRequest,
        sender: Address,
        nonce: u64,
    ) -> Self {
        Self {
            contract_name: request.contract_name.clone(),
            network_id: network_id.clone(),
            sender,
            nonce,
            expected_address: sender.create(nonce),
            tx_hash: None,
            init_code_hash: request.init_code_hash(),
            constructor_args: request.args.clone(),
            submitted_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The same entry once the node returned a transaction hash.
    pub fn broadcast(self, tx_hash: B256) -> Self {
        Self {
            tx_hash: Some(tx_hash),
            ..self
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record already exists for this key; records are never overwritten.
    #[error("`{contract}` already has a deployment record on network `{network}`")]
    DuplicateRecord { network: NetworkId, contract: String },
    #[error("invalid network identifier `{0}`: only ASCII letters, digits, `.`, `-` and `_` are allowed")]
    InvalidNetwork(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DuplicateRecord { .. } => 6,
            Self::InvalidNetwork(_) | Self::Backend(_) => 1,
        }
    }
}

/// Storage for deployment records and the pending-transaction journal, keyed by
/// `(network, contract name)`.
pub trait StateStore: Send + Sync {
    fn get(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Insert a record. Fails with [`StoreError::DuplicateRecord`] if one exists for the key;
    /// the check and the write happen atomically.
    fn put(&self, record: DeploymentRecord) -> Result<(), StoreError>;

    /// All records of a network, ordered by contract name.
    fn list(&self, network: &NetworkId) -> Result<Vec<DeploymentRecord>, StoreError>;

    fn pending(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<PendingDeployment>, StoreError>;

    /// All journal entries of a network, ordered by contract name.
    fn list_pending(&self, network: &NetworkId) -> Result<Vec<PendingDeployment>, StoreError>;

    /// Journal a deployment, replacing any previous entry for the key.
    fn put_pending(&self, entry: PendingDeployment) -> Result<(), StoreError>;

    /// Remove a journal entry. Returns whether one existed.
    fn clear_pending(&self, network: &NetworkId, contract: &str) -> Result<bool, StoreError>;
}

impl<T: StateStore> StateStore for Arc<T> {
    fn get(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        (**self).get(network, contract)
    }

    fn put(&self, record: DeploymentRecord) -> Result<(), StoreError> {
        (**self).put(record)
    }

    fn list(&self, network: &NetworkId) -> Result<Vec<DeploymentRecord>, StoreError> {
        (**self).list(network)
    }

    fn pending(
        &self,
        network: &NetworkId,
        contract: &str,
    ) -> Result<Option<PendingDeployment>, StoreError> {
        (**self).pending(network, contract)
    }

    fn list_pending(&self, network: &NetworkId) -> Result<Vec<PendingDeployment>, StoreError> {
        (**self).list_pending(network)
    }

    fn put_pending(&self, entry: PendingDeployment) -> Result<(), StoreError> {
        (**self).put_pending(entry)
    }

    fn clear_pending(&self, network: &NetworkId, contract: &str) -> Result<bool, StoreError> {
        (**self).clear_pending(network, contract)
    }
}
