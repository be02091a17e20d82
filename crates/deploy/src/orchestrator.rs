//! Deployment orchestrator.
//!
//! Walks a [`DeploymentPlan`] in order. For every contract it reuses an existing record,
//! reconciles a journaled deployment from an interrupted run, or submits a fresh one, then
//! waits for confirmation and records the result. The first failure stops the run; running
//! again resumes from the contract that failed.
//!
//! A deployment is journaled with its sender and nonce *before* it is sent. Whatever happens
//! after that (a crash, a lost response, a failed journal update), the next run knows the
//! address the contract would land at and checks the chain before sending anything again.

use std::{collections::BTreeMap, fmt, time::Duration};

use alloy_core::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    chain::{BlockTag, ChainReader},
    contract::{ConstructorArg, ContractSpec, ResolvedArg},
    plan::DeploymentPlan,
    store::{DeploymentRecord, NetworkId, PendingDeployment, StateStore, StoreError},
    submitter::{DeploymentRequest, PendingTransaction, SubmissionRejected, TransactionSubmitter},
    waiter::{ConfirmationWaiter, WaitError},
};

/// Default number of blocks required on top of the inclusion block.
pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 1;
/// Default bound on the wait for a single deployment.
pub const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 120_000;
/// Default delay between receipt polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Tunables of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployOptions {
    pub confirmation_depth: u64,
    pub confirmation_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl DeployOptions {
    pub fn waiter(&self) -> ConfirmationWaiter {
        ConfirmationWaiter::new(
            self.confirmation_depth,
            Duration::from_millis(self.confirmation_timeout_ms),
            Duration::from_millis(self.poll_interval_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    AlreadyDeployed,
    /// A journaled deployment from an earlier run is being checked.
    Reconciling,
    Submitted,
    Confirmed,
    Failed,
}

/// Reported to the progress callback as each contract moves through the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub name: String,
    pub status: ProgressStatus,
    pub tx_hash: Option<B256>,
    pub address: Option<Address>,
}

/// How a contract's address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// A record already existed; nothing was sent.
    AlreadyDeployed,
    /// Submitted and confirmed during this run.
    Deployed,
    /// A deployment journaled by an earlier run was adopted.
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractOutcome {
    pub name: String,
    pub address: Address,
    pub tx_hash: Option<B256>,
    pub confirmed_at_block: u64,
    pub outcome: Outcome,
}

impl ContractOutcome {
    fn from_record(record: &DeploymentRecord, outcome: Outcome) -> Self {
        Self {
            name: record.contract_name.clone(),
            address: record.address,
            tx_hash: record.tx_hash,
            confirmed_at_block: record.confirmed_at_block,
            outcome,
        }
    }
}

/// Per-contract results of a run, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    pub contracts: Vec<ContractOutcome>,
}

impl DeploymentReport {
    /// Contract name to deployed address.
    pub fn addresses(&self) -> BTreeMap<String, Address> {
        self.contracts
            .iter()
            .map(|c| (c.name.clone(), c.address))
            .collect()
    }

    pub fn address(&self, name: &str) -> Option<Address> {
        self.contracts
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.address)
    }

    /// Number of contracts this run actually deployed.
    pub fn submitted(&self) -> usize {
        self.contracts
            .iter()
            .filter(|c| c.outcome == Outcome::Deployed)
            .count()
    }
}

/// Why a single contract could not be deployed.
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    #[error(transparent)]
    SubmissionRejected(#[from] SubmissionRejected),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("constructor arguments cannot be encoded: {0}")]
    InvalidArguments(String),
    /// A journaled deployment that may still land cannot be adopted for the current manifest.
    #[error(
        "journaled deployment of `{contract}` cannot be adopted: {reason}; \
         review it and run `plinth forget-pending {contract}` before redeploying"
    )]
    ReconciliationConflict { contract: String, reason: String },
    #[error("failed to read chain state: {0}")]
    ChainRead(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("`{contract}` references `{dependency}`, which is neither in the plan nor recorded")]
    UnresolvedDependency { contract: String, dependency: String },
    #[error("failed to deploy `{contract}` with arguments [{}]: {cause}", join_args(.args))]
    DeploymentFailed {
        contract: String,
        args: Vec<ResolvedArg>,
        cause: FailureCause,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeployError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::UnresolvedDependency { .. } => 3,
            Self::DeploymentFailed {
                cause: FailureCause::Wait(err),
                ..
            } if err.is_timeout() => 5,
            Self::DeploymentFailed { .. } => 4,
            Self::Store(err) => err.exit_code(),
        }
    }
}

fn join_args(args: &[ResolvedArg]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A run that stopped early, with the contracts it completed before stopping.
#[derive(Debug)]
pub struct DeploymentFailure {
    pub report: DeploymentReport,
    pub error: DeployError,
}

impl DeploymentFailure {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

impl fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deployment stopped after {} completed contract(s)",
            self.report.contracts.len()
        )
    }
}

impl std::error::Error for DeploymentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

type ProgressFn = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Deploys plans against one chain and one state store.
pub struct Orchestrator<S, C, St> {
    submitter: S,
    chain: C,
    store: St,
    waiter: ConfirmationWaiter,
    progress: Option<ProgressFn>,
}

impl<S, C, St> Orchestrator<S, C, St>
where
    S: TransactionSubmitter,
    C: ChainReader,
    St: StateStore,
{
    pub fn new(submitter: S, chain: C, store: St, options: &DeployOptions) -> Self {
        Self {
            submitter,
            chain,
            store,
            waiter: options.waiter(),
            progress: None,
        }
    }

    /// Invoke `callback` every time a contract changes status.
    pub fn with_progress(
        mut self,
        callback: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Deploy every contract of `plan` that has no record on `network` yet.
    pub async fn deploy(
        &self,
        plan: &DeploymentPlan,
        network: &NetworkId,
    ) -> Result<DeploymentReport, DeploymentFailure> {
        tracing::info!(network = %network, contracts = plan.len(), "Starting deployment");

        let mut report = DeploymentReport::default();
        let mut addresses = BTreeMap::new();

        for spec in plan.iter() {
            match self.deploy_one(spec, network, &addresses).await {
                Ok(outcome) => {
                    addresses.insert(outcome.name.clone(), outcome.address);
                    report.contracts.push(outcome);
                }
                Err(error) => {
                    tracing::error!(
                        contract = %spec.name,
                        network = %network,
                        error = %error,
                        "Deployment failed"
                    );
                    self.emit(&spec.name, ProgressStatus::Failed, None, None);
                    return Err(DeploymentFailure { report, error });
                }
            }
        }

        tracing::info!(
            network = %network,
            submitted = report.submitted(),
            total = report.contracts.len(),
            "Deployment complete"
        );
        Ok(report)
    }

    async fn deploy_one(
        &self,
        spec: &ContractSpec,
        network: &NetworkId,
        addresses: &BTreeMap<String, Address>,
    ) -> Result<ContractOutcome, DeployError> {
        if let Some(record) = self.store.get(network, &spec.name)? {
            tracing::info!(
                contract = %spec.name,
                address = %record.address,
                "Already deployed, reusing recorded address"
            );
            // A journal entry left behind by a run that recorded but failed to clean up.
            if self.store.pending(network, &spec.name)?.is_some() {
                self.store.clear_pending(network, &spec.name)?;
                tracing::debug!(contract = %spec.name, "Cleared stale journal entry");
            }
            self.emit(
                &spec.name,
                ProgressStatus::AlreadyDeployed,
                record.tx_hash,
                Some(record.address),
            );
            return Ok(ContractOutcome::from_record(&record, Outcome::AlreadyDeployed));
        }

        let args = self.resolve_args(spec, network, addresses)?;
        let failed = |cause: FailureCause| DeployError::DeploymentFailed {
            contract: spec.name.clone(),
            args: args.clone(),
            cause,
        };
        let step_failed = |err: StepError| match err {
            StepError::Failed(cause) => failed(cause),
            StepError::Store(err) => DeployError::Store(err),
        };

        let request = DeploymentRequest::new(&spec.name, spec.bytecode.clone(), args.clone())
            .map_err(|reason| failed(FailureCause::InvalidArguments(reason)))?;

        // The journal entry stays in place on failure so the next run can reconcile it.
        let (confirmation, outcome) = match self
            .reconcile(network, &request)
            .await
            .map_err(step_failed)?
        {
            Resolution::Adopt(pending) => (
                self.waiter.wait(&self.chain, &pending).await,
                Outcome::Reconciled,
            ),
            Resolution::AdoptAt(address) => (
                self.waiter.wait_for_code(&self.chain, address).await,
                Outcome::Reconciled,
            ),
            Resolution::Submit(pinned) => {
                let pending = self
                    .submit(network, &request, pinned)
                    .await
                    .map_err(step_failed)?;
                (
                    self.waiter.wait(&self.chain, &pending).await,
                    Outcome::Deployed,
                )
            }
        };

        let confirmation = confirmation.map_err(|err| {
            if outcome == Outcome::Reconciled && err.is_timeout() {
                tracing::warn!(
                    contract = %spec.name,
                    "Journaled deployment is still unconfirmed. The next run checks it again; \
                     to abandon it, run `plinth forget-pending {}`",
                    spec.name
                );
            }
            failed(err.into())
        })?;

        let record = DeploymentRecord::new(network, &request, &confirmation);
        self.store.put(record.clone())?;
        self.store.clear_pending(network, &spec.name)?;

        tracing::info!(
            contract = %spec.name,
            address = %record.address,
            tx_hash = ?record.tx_hash,
            block = record.confirmed_at_block,
            "Contract deployed"
        );
        self.emit(
            &spec.name,
            ProgressStatus::Confirmed,
            record.tx_hash,
            Some(record.address),
        );

        Ok(ContractOutcome::from_record(&record, outcome))
    }

    /// Replace references by addresses, looking first at this run and then at the store.
    fn resolve_args(
        &self,
        spec: &ContractSpec,
        network: &NetworkId,
        addresses: &BTreeMap<String, Address>,
    ) -> Result<Vec<ResolvedArg>, DeployError> {
        spec.args
            .iter()
            .map(|arg| match arg {
                ConstructorArg::Literal { ty, value } => Ok(ResolvedArg::new(ty, value)),
                ConstructorArg::Ref { contract } => {
                    if let Some(address) = addresses.get(contract) {
                        return Ok(ResolvedArg::address(*address));
                    }
                    match self.store.get(network, contract)? {
                        Some(record) => Ok(ResolvedArg::address(record.address)),
                        None => Err(DeployError::UnresolvedDependency {
                            contract: spec.name.clone(),
                            dependency: contract.clone(),
                        }),
                    }
                }
            })
            .collect()
    }

    /// Decide what to do about a deployment an earlier run journaled for this contract.
    ///
    /// The chain is checked before anything is sent again: the journaled transaction's receipt,
    /// code at the address the pinned nonce creates, and whether that nonce was used or is
    /// still queued.
    async fn reconcile(
        &self,
        network: &NetworkId,
        request: &DeploymentRequest,
    ) -> Result<Resolution, StepError> {
        let Some(entry) = self.store.pending(network, &request.contract_name)? else {
            return Ok(Resolution::Submit(None));
        };

        tracing::info!(
            contract = %entry.contract_name,
            tx_hash = ?entry.tx_hash,
            nonce = entry.nonce,
            expected_address = %entry.expected_address,
            "Found journaled deployment, reconciling"
        );
        self.emit(
            &entry.contract_name,
            ProgressStatus::Reconciling,
            entry.tx_hash,
            None,
        );

        if let Some(tx_hash) = entry.tx_hash {
            match self
                .chain
                .transaction_receipt(tx_hash)
                .await
                .map_err(chain_read)?
            {
                Some(receipt) if !receipt.succeeded() => {
                    tracing::warn!(
                        contract = %entry.contract_name,
                        tx_hash = %tx_hash,
                        "Journaled transaction reverted, submitting again"
                    );
                    self.store.clear_pending(network, &entry.contract_name)?;
                    return Ok(Resolution::Submit(None));
                }
                Some(_) => {
                    ensure_matches(&entry, request)?;
                    return Ok(Resolution::Adopt(PendingTransaction { tx_hash }));
                }
                None => {}
            }
        }

        // Read the mined nonce before the code: code seen after the nonce moved is ours.
        let mined = self
            .chain
            .transaction_count(entry.sender, BlockTag::Latest)
            .await
            .map_err(chain_read)?;

        if self
            .chain
            .has_code(entry.expected_address)
            .await
            .map_err(chain_read)?
        {
            ensure_matches(&entry, request)?;
            tracing::info!(
                contract = %entry.contract_name,
                address = %entry.expected_address,
                "Journaled deployment found on chain, adopting it"
            );
            return Ok(Resolution::AdoptAt(entry.expected_address));
        }

        if mined > entry.nonce {
            tracing::warn!(
                contract = %entry.contract_name,
                nonce = entry.nonce,
                "Journaled nonce was used without creating the contract, submitting again"
            );
            self.store.clear_pending(network, &entry.contract_name)?;
            return Ok(Resolution::Submit(None));
        }

        let queued = self
            .chain
            .transaction_count(entry.sender, BlockTag::Pending)
            .await
            .map_err(chain_read)?;

        if queued > entry.nonce {
            ensure_matches(&entry, request)?;
            return Ok(match entry.tx_hash {
                Some(tx_hash) => Resolution::Adopt(PendingTransaction { tx_hash }),
                None => Resolution::AdoptAt(entry.expected_address),
            });
        }

        // Nothing holds the journaled nonce: the transaction never reached the node or was
        // dropped from its mempool.
        if queued == entry.nonce && entry.sender == self.submitter.sender() {
            tracing::warn!(
                contract = %entry.contract_name,
                nonce = entry.nonce,
                "Journaled deployment is neither mined nor queued, sending it again at the same nonce"
            );
            Ok(Resolution::Submit(Some(entry.nonce)))
        } else {
            tracing::warn!(
                contract = %entry.contract_name,
                nonce = entry.nonce,
                next_nonce = queued,
                "Journaled deployment no longer applies to the sender, submitting afresh"
            );
            self.store.clear_pending(network, &entry.contract_name)?;
            Ok(Resolution::Submit(None))
        }
    }

    /// Journal the deployment, then send it.
    ///
    /// `pinned` reuses the nonce of a journaled deployment that never reached the chain;
    /// otherwise the sender's next pending nonce is used.
    async fn submit(
        &self,
        network: &NetworkId,
        request: &DeploymentRequest,
        pinned: Option<u64>,
    ) -> Result<PendingTransaction, StepError> {
        let sender = self.submitter.sender();
        let nonce = match pinned {
            Some(nonce) => nonce,
            None => self
                .chain
                .transaction_count(sender, BlockTag::Pending)
                .await
                .map_err(chain_read)?,
        };

        let intent = PendingDeployment::new(network, request, sender, nonce);
        self.store.put_pending(intent.clone())?;

        tracing::info!(
            contract = %request.contract_name,
            args = %join_args(&request.args),
            nonce,
            expected_address = %intent.expected_address,
            "Submitting deployment"
        );
        // A rejection leaves the intent journaled: the node may have accepted the transaction
        // before the error reached us.
        let pending = self
            .submitter
            .submit(request, nonce)
            .await
            .map_err(FailureCause::from)?;
        self.store.put_pending(intent.broadcast(pending.tx_hash))?;

        self.emit(
            &request.contract_name,
            ProgressStatus::Submitted,
            Some(pending.tx_hash),
            None,
        );
        Ok(pending)
    }

    fn emit(
        &self,
        name: &str,
        status: ProgressStatus,
        tx_hash: Option<B256>,
        address: Option<Address>,
    ) {
        if let Some(progress) = &self.progress {
            progress(&ProgressEvent {
                name: name.to_string(),
                status,
                tx_hash,
                address,
            });
        }
    }
}

/// What reconciliation decided for a contract.
#[derive(Debug)]
enum Resolution {
    /// Wait for a known transaction.
    Adopt(PendingTransaction),
    /// Wait for code at the journaled address; the transaction hash is unknown or stale.
    AdoptAt(Address),
    /// Send the deployment, at the given nonce if one is pinned.
    Submit(Option<u64>),
}

#[derive(Debug, derive_more::From)]
enum StepError {
    Failed(FailureCause),
    Store(StoreError),
}

fn chain_read(err: anyhow::Error) -> StepError {
    StepError::Failed(FailureCause::ChainRead(format!("{err:#}")))
}

/// Adopting a journaled deployment is only safe when it carries the init code the manifest
/// asks for now.
fn ensure_matches(
    entry: &PendingDeployment,
    request: &DeploymentRequest,
) -> Result<(), StepError> {
    if entry.init_code_hash == request.init_code_hash() {
        return Ok(());
    }
    Err(StepError::Failed(FailureCause::ReconciliationConflict {
        contract: entry.contract_name.clone(),
        reason: match entry.tx_hash {
            Some(tx_hash) => format!("transaction {tx_hash} was built from different init code"),
            None => format!(
                "the deployment at nonce {} was built from different init code",
                entry.nonce
            ),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options: DeployOptions = toml::from_str("").unwrap();
        assert_eq!(options, DeployOptions::default());
        assert_eq!(options.waiter().depth(), 1);

        let options: DeployOptions = toml::from_str("confirmation_depth = 3").unwrap();
        assert_eq!(options.confirmation_depth, 3);
        assert_eq!(options.confirmation_timeout_ms, 120_000);
    }

    #[test]
    fn test_exit_codes() {
        let timeout = DeployError::DeploymentFailed {
            contract: "Vesting".into(),
            args: vec![],
            cause: WaitError::ConfirmationTimeout {
                tx_hash: B256::ZERO,
                waited: Duration::from_secs(1),
                last_error: Some("connection refused".into()),
            }
            .into(),
        };
        let not_observed = DeployError::DeploymentFailed {
            contract: "Vesting".into(),
            args: vec![],
            cause: WaitError::ContractNotObserved {
                address: Address::ZERO,
                waited: Duration::from_secs(1),
                last_error: None,
            }
            .into(),
        };
        let conflict = DeployError::DeploymentFailed {
            contract: "Vesting".into(),
            args: vec![],
            cause: FailureCause::ReconciliationConflict {
                contract: "Vesting".into(),
                reason: "transaction 0x01 was built from different init code".into(),
            },
        };
        let reverted = DeployError::DeploymentFailed {
            contract: "Vesting".into(),
            args: vec![],
            cause: WaitError::TransactionReverted {
                tx_hash: B256::ZERO,
                block: 4,
            }
            .into(),
        };
        let unresolved = DeployError::UnresolvedDependency {
            contract: "Vesting".into(),
            dependency: "Token".into(),
        };
        let duplicate = DeployError::from(StoreError::DuplicateRecord {
            network: NetworkId::new("sepolia"),
            contract: "Token".into(),
        });

        assert_eq!(timeout.exit_code(), 5);
        assert!(timeout.to_string().contains("last chain error: connection refused"));
        assert_eq!(not_observed.exit_code(), 5);
        assert_eq!(conflict.exit_code(), 4);
        assert!(conflict.to_string().contains("plinth forget-pending Vesting"));
        assert_eq!(reverted.exit_code(), 4);
        assert_eq!(unresolved.exit_code(), 3);
        assert_eq!(duplicate.exit_code(), 6);
    }

    #[test]
    fn test_failure_names_contract_and_arguments() {
        let err = DeployError::DeploymentFailed {
            contract: "Vesting".into(),
            args: vec![
                ResolvedArg::address(Address::with_last_byte(0xaa)),
                ResolvedArg::new("uint64", "3600"),
            ],
            cause: SubmissionRejected {
                reason: "insufficient funds".into(),
            }
            .into(),
        };

        let message = err.to_string();
        assert!(message.contains("`Vesting`"));
        assert!(message.contains("uint64 3600"));
        assert!(message.contains("insufficient funds"));
    }

    #[test]
    fn test_report_counts_only_fresh_deployments() {
        let outcome = |name: &str, byte: u8, outcome| ContractOutcome {
            name: name.into(),
            address: Address::with_last_byte(byte),
            tx_hash: Some(B256::with_last_byte(byte)),
            confirmed_at_block: 1,
            outcome,
        };
        let report = DeploymentReport {
            contracts: vec![
                outcome("Token", 1, Outcome::AlreadyDeployed),
                outcome("Vesting", 2, Outcome::Deployed),
                outcome("Treasury", 3, Outcome::Reconciled),
            ],
        };

        assert_eq!(report.submitted(), 1);
        assert_eq!(report.address("Vesting"), Some(Address::with_last_byte(2)));
        assert_eq!(report.addresses().len(), 3);
        assert_eq!(Outcome::AlreadyDeployed.to_string(), "already-deployed");
    }
}
