//! Transaction submission.
//!
//! Signing belongs to whatever sits behind [`TransactionSubmitter`]. The orchestrator picks
//! the nonce so a journaled deployment maps to exactly one creation address.

use std::{future::Future, sync::Arc};

use alloy_core::primitives::{Address, B256, Bytes};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    contract::{ResolvedArg, encode_init_code},
    rpc,
};

/// Everything needed to broadcast the creation of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub contract_name: String,
    pub bytecode: Bytes,
    pub args: Vec<ResolvedArg>,
    /// `bytecode` followed by the ABI-encoded `args`.
    pub init_code: Bytes,
}

impl DeploymentRequest {
    pub fn new(
        contract_name: impl Into<String>,
        bytecode: Bytes,
        args: Vec<ResolvedArg>,
    ) -> Result<Self, String> {
        let init_code = encode_init_code(&bytecode, &args)?;
        Ok(Self {
            contract_name: contract_name.into(),
            bytecode,
            args,
            init_code,
        })
    }

    /// Hex SHA-256 of the init code, used to match journaled transactions to this request.
    pub fn init_code_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.init_code);
        hex::encode(hasher.finalize())
    }
}

/// Handle to a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransaction {
    pub tx_hash: B256,
}

/// The network or signer refused the transaction (insufficient funds, nonce conflict, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("submission rejected: {reason}")]
pub struct SubmissionRejected {
    pub reason: String,
}

/// Broadcasts deployment transactions.
pub trait TransactionSubmitter: Send + Sync {
    /// Account the transactions are sent from.
    fn sender(&self) -> Address;

    /// Broadcast `request` as a contract creation with exactly `nonce`.
    fn submit(
        &self,
        request: &DeploymentRequest,
        nonce: u64,
    ) -> impl Future<Output = Result<PendingTransaction, SubmissionRejected>> + Send;
}

impl<T: TransactionSubmitter> TransactionSubmitter for Arc<T> {
    fn sender(&self) -> Address {
        (**self).sender()
    }

    fn submit(
        &self,
        request: &DeploymentRequest,
        nonce: u64,
    ) -> impl Future<Output = Result<PendingTransaction, SubmissionRejected>> + Send {
        (**self).submit(request, nonce)
    }
}

/// Submits through `eth_sendTransaction`, letting the node sign with an account it manages
/// (an anvil dev account, a clef-backed geth, ...).
#[derive(Debug, Clone)]
pub struct RpcSubmitter {
    client: reqwest::Client,
    url: Url,
    from: Address,
    gas_limit: Option<u64>,
}

impl RpcSubmitter {
    pub fn new(url: Url, from: Address) -> anyhow::Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url,
            from,
            gas_limit: None,
        })
    }

    /// Send an explicit gas limit instead of letting the node estimate one.
    pub fn gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }
}

impl TransactionSubmitter for RpcSubmitter {
    fn sender(&self) -> Address {
        self.from
    }

    async fn submit(
        &self,
        request: &DeploymentRequest,
        nonce: u64,
    ) -> Result<PendingTransaction, SubmissionRejected> {
        let mut tx = serde_json::json!({
            "from": self.from,
            "data": request.init_code,
            "nonce": format!("0x{nonce:x}"),
        });
        if let Some(gas_limit) = self.gas_limit {
            tx["gas"] = serde_json::json!(format!("0x{gas_limit:x}"));
        }

        let tx_hash: B256 = rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_sendTransaction",
            vec![tx],
        )
        .await
        .map_err(|e| SubmissionRejected {
            reason: format!("{e:#}"),
        })?;

        tracing::debug!(
            contract = %request.contract_name,
            tx_hash = %tx_hash,
            nonce,
            init_code_len = request.init_code.len(),
            "Deployment transaction sent"
        );

        Ok(PendingTransaction { tx_hash })
    }
}
