//! Read access to chain state, used to wait for and reconcile deployments.

use std::{future::Future, sync::Arc};

use alloy_core::primitives::{Address, B256, Bytes};
use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::rpc;

/// The parts of a transaction receipt the orchestrator relies on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "rpc::deserialize_u64_from_hex")]
    pub block_number: u64,
    /// `1` on success, `0` when execution reverted.
    #[serde(deserialize_with = "rpc::deserialize_u64_from_hex")]
    pub status: u64,
    /// Set for contract-creation transactions.
    #[serde(default)]
    pub contract_address: Option<Address>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// Block a nonce is read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BlockTag {
    /// Mined transactions only.
    Latest,
    /// Mined transactions plus those sitting in the node's mempool.
    Pending,
}

/// Chain queries consumed by the confirmation waiter and by reconciliation.
pub trait ChainReader: Send + Sync {
    /// The receipt of a mined transaction, or `None` while it is unknown or still pending.
    fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = anyhow::Result<Option<TransactionReceipt>>> + Send;

    /// The current head block number.
    fn block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// Number of transactions sent by `address` as of `tag`, i.e. its next nonce.
    fn transaction_count(
        &self,
        address: Address,
        tag: BlockTag,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// Whether runtime code is deployed at `address` in the latest block.
    fn has_code(&self, address: Address) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

impl<T: ChainReader> ChainReader for Arc<T> {
    fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = anyhow::Result<Option<TransactionReceipt>>> + Send {
        (**self).transaction_receipt(tx_hash)
    }

    fn block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send {
        (**self).block_number()
    }

    fn transaction_count(
        &self,
        address: Address,
        tag: BlockTag,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send {
        (**self).transaction_count(address, tag)
    }

    fn has_code(&self, address: Address) -> impl Future<Output = anyhow::Result<bool>> + Send {
        (**self).has_code(address)
    }
}

/// [`ChainReader`] over an Ethereum JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcChainReader {
    client: reqwest::Client,
    url: Url,
}

impl RpcChainReader {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url,
        })
    }
}

impl ChainReader for RpcChainReader {
    async fn transaction_receipt(&self, tx_hash: B256) -> anyhow::Result<Option<TransactionReceipt>> {
        rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_getTransactionReceipt",
            vec![serde_json::json!(tx_hash)],
        )
        .await
        .with_context(|| format!("Failed to fetch receipt of {tx_hash}"))
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        let head: String =
            rpc::json_rpc_call(&self.client, self.url.as_str(), "eth_blockNumber", vec![])
                .await?;
        rpc::parse_quantity(&head)
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> anyhow::Result<u64> {
        let count: String = rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_getTransactionCount",
            vec![serde_json::json!(address), serde_json::json!(tag.to_string())],
        )
        .await
        .with_context(|| format!("Failed to fetch the {tag} nonce of {address}"))?;
        rpc::parse_quantity(&count)
    }

    async fn has_code(&self, address: Address) -> anyhow::Result<bool> {
        let code: Bytes = rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_getCode",
            vec![serde_json::json!(address), serde_json::json!("latest")],
        )
        .await
        .with_context(|| format!("Failed to fetch code at {address}"))?;
        Ok(!code.is_empty())
    }
}
