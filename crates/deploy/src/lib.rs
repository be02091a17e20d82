//! plinth-deploy - Dependency-ordered smart contract deployment.
//!
//! This crate builds a deployment plan from declared contracts and their constructor
//! references, then deploys it idempotently: contracts already recorded for a network are
//! reused, and transactions broadcast by an interrupted run are reconciled instead of sent
//! again.

pub mod artifact;
pub mod chain;
pub mod config;
pub mod contract;
pub mod orchestrator;
pub mod plan;
pub mod rpc;
pub mod store;
pub mod submitter;
pub mod waiter;

pub use chain::{BlockTag, ChainReader, RpcChainReader, TransactionReceipt};
pub use config::{ContractEntry, MANIFEST_FILENAME, Manifest, NetworkConfig};
pub use contract::{ConstructorArg, ContractSpec, ResolvedArg};
pub use orchestrator::{
    ContractOutcome, DeployError, DeployOptions, DeploymentFailure, DeploymentReport,
    FailureCause, Orchestrator, Outcome, ProgressEvent, ProgressStatus,
};
pub use plan::{DeploymentPlan, PlanError, build_plan};
pub use store::{
    DeploymentRecord, FileStore, MemoryStore, NetworkId, PendingDeployment, StateStore,
    StoreError,
};
pub use submitter::{
    DeploymentRequest, PendingTransaction, RpcSubmitter, SubmissionRejected, TransactionSubmitter,
};
pub use waiter::{Confirmation, ConfirmationWaiter, WaitError};
