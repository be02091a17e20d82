//! Confirmation waiter.
//!
//! Polls the chain until a deployment is buried under the configured number of blocks, then
//! yields the created contract's address.

use std::{future::Future, sync::OnceLock, time::Duration};

use alloy_core::primitives::{Address, B256};
use backon::{ConstantBuilder, Retryable};

use crate::{chain::ChainReader, submitter::PendingTransaction};

/// A confirmed contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub address: Address,
    /// `None` when the contract was confirmed from its code alone.
    pub tx_hash: Option<B256>,
    /// Block the transaction was included in, or the head at which the code was first seen.
    pub confirmed_at_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error(
        "transaction {tx_hash} was not confirmed within {waited:?}{}",
        chain_error_suffix(.last_error)
    )]
    ConfirmationTimeout {
        tx_hash: B256,
        waited: Duration,
        /// Most recent failed chain read, if the chain was unreachable when the wait ended.
        last_error: Option<String>,
    },
    #[error(
        "no contract code observed at {address} within {waited:?}{}",
        chain_error_suffix(.last_error)
    )]
    ContractNotObserved {
        address: Address,
        waited: Duration,
        last_error: Option<String>,
    },
    #[error("transaction {tx_hash} reverted in block {block}")]
    TransactionReverted { tx_hash: B256, block: u64 },
    #[error("transaction {tx_hash} succeeded but its receipt has no contract address")]
    MissingContractAddress { tx_hash: B256 },
}

impl WaitError {
    /// Whether the wait ran out of time rather than observing a definitive failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConfirmationTimeout { .. } | Self::ContractNotObserved { .. }
        )
    }
}

fn chain_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|error| format!(" (last chain error: {error})"))
        .unwrap_or_default()
}

/// Outcome of a single poll that did not produce a confirmation.
#[derive(Debug)]
enum PollError {
    /// No receipt or no code yet.
    NotIncluded,
    /// Included, but not deep enough.
    Shallow { confirmations: u64 },
    /// The chain could not be read; tried again on the next poll.
    Chain(anyhow::Error),
    Fatal(WaitError),
}

impl PollError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Why polling stopped without a confirmation.
enum Stopped {
    Fatal(WaitError),
    TimedOut { last_error: Option<String> },
}

/// Waits for deployment transactions to reach a confirmation depth.
///
/// Confirmations count the blocks built on top of the inclusion block, so a depth of 1 waits
/// for one block beyond inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationWaiter {
    depth: u64,
    timeout: Duration,
    poll_interval: Duration,
}

impl ConfirmationWaiter {
    pub fn new(depth: u64, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            depth: depth.max(1),
            timeout,
            poll_interval,
        }
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Wait until `pending` is confirmed, reverted, or the timeout elapses.
    pub async fn wait<R: ChainReader>(
        &self,
        reader: &R,
        pending: &PendingTransaction,
    ) -> Result<Confirmation, WaitError> {
        let tx_hash = pending.tx_hash;
        let subject = tx_hash.to_string();

        self.poll_until(&subject, || self.poll_receipt(reader, tx_hash))
            .await
            .map_err(|stopped| match stopped {
                Stopped::Fatal(err) => err,
                Stopped::TimedOut { last_error } => WaitError::ConfirmationTimeout {
                    tx_hash,
                    waited: self.timeout,
                    last_error,
                },
            })
    }

    /// Wait until code at `address` is buried under the confirmation depth.
    ///
    /// Used when the creation transaction is unknown. Depth is counted from the head at which
    /// the code was first seen, which is never earlier than the real inclusion block.
    pub async fn wait_for_code<R: ChainReader>(
        &self,
        reader: &R,
        address: Address,
    ) -> Result<Confirmation, WaitError> {
        let first_seen = OnceLock::new();
        let subject = address.to_string();

        self.poll_until(&subject, || self.poll_code(reader, address, &first_seen))
            .await
            .map_err(|stopped| match stopped {
                Stopped::Fatal(err) => err,
                Stopped::TimedOut { last_error } => WaitError::ContractNotObserved {
                    address,
                    waited: self.timeout,
                    last_error,
                },
            })
    }

    /// Retry `poll` at the configured interval until it confirms, fails fatally, or the
    /// timeout elapses. The last chain read error is kept for the timeout report.
    async fn poll_until<F, Fut>(&self, subject: &str, poll: F) -> Result<Confirmation, Stopped>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Confirmation, PollError>>,
    {
        let backoff = ConstantBuilder::default()
            .with_delay(self.poll_interval)
            .with_max_times(usize::MAX);
        let mut last_error: Option<String> = None;

        let polling = poll
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(PollError::is_retryable)
            .notify(|err: &PollError, _| match err {
                PollError::Chain(e) => {
                    let message = format!("{e:#}");
                    if last_error.as_deref() == Some(message.as_str()) {
                        tracing::debug!(subject, error = %message, "Chain read failed again, retrying...");
                    } else {
                        tracing::warn!(subject, error = %message, "Chain read failed, retrying...");
                    }
                    last_error = Some(message);
                }
                PollError::Shallow { confirmations } => {
                    last_error = None;
                    tracing::trace!(
                        subject,
                        confirmations,
                        required = self.depth,
                        "Waiting for more confirmations"
                    );
                }
                PollError::NotIncluded => last_error = None,
                PollError::Fatal(_) => {}
            });

        let outcome = tokio::time::timeout(self.timeout, polling).await;
        match outcome {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(PollError::Fatal(err))) => Err(Stopped::Fatal(err)),
            Ok(Err(_)) | Err(_) => Err(Stopped::TimedOut { last_error }),
        }
    }

    async fn poll_receipt<R: ChainReader>(
        &self,
        reader: &R,
        tx_hash: B256,
    ) -> Result<Confirmation, PollError> {
        let receipt = reader
            .transaction_receipt(tx_hash)
            .await
            .map_err(PollError::Chain)?
            .ok_or(PollError::NotIncluded)?;

        if !receipt.succeeded() {
            return Err(PollError::Fatal(WaitError::TransactionReverted {
                tx_hash,
                block: receipt.block_number,
            }));
        }

        let head = reader.block_number().await.map_err(PollError::Chain)?;
        let confirmations = head.saturating_sub(receipt.block_number);
        if confirmations < self.depth {
            return Err(PollError::Shallow { confirmations });
        }

        let address = receipt
            .contract_address
            .ok_or(PollError::Fatal(WaitError::MissingContractAddress { tx_hash }))?;

        Ok(Confirmation {
            address,
            tx_hash: Some(tx_hash),
            confirmed_at_block: receipt.block_number,
        })
    }

    async fn poll_code<R: ChainReader>(
        &self,
        reader: &R,
        address: Address,
        first_seen: &OnceLock<u64>,
    ) -> Result<Confirmation, PollError> {
        if !reader.has_code(address).await.map_err(PollError::Chain)? {
            return Err(PollError::NotIncluded);
        }

        let head = reader.block_number().await.map_err(PollError::Chain)?;
        let seen_at = *first_seen.get_or_init(|| head);
        let confirmations = head.saturating_sub(seen_at);
        if confirmations < self.depth {
            return Err(PollError::Shallow { confirmations });
        }

        Ok(Confirmation {
            address,
            tx_hash: None,
            confirmed_at_block: seen_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::chain::TransactionReceipt;

    /// A chain that mines one block per `block_number` call.
    struct ScriptedChain {
        head: AtomicU64,
        receipt: Mutex<Option<TransactionReceipt>>,
        /// Address whose code reads as deployed.
        code_at: Option<Address>,
        /// Number of receipt or code queries that fail before the chain starts answering.
        failures: AtomicUsize,
    }

    impl ScriptedChain {
        fn new(receipt: Option<TransactionReceipt>) -> Self {
            Self {
                head: AtomicU64::new(10),
                receipt: Mutex::new(receipt),
                code_at: None,
                failures: AtomicUsize::new(0),
            }
        }

        fn with_code(address: Address) -> Self {
            Self {
                code_at: Some(address),
                ..Self::new(None)
            }
        }

        fn read(&self) -> anyhow::Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    impl ChainReader for ScriptedChain {
        async fn transaction_receipt(
            &self,
            _tx_hash: B256,
        ) -> anyhow::Result<Option<TransactionReceipt>> {
            self.read()?;
            Ok(self.receipt.lock().unwrap().clone())
        }

        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(self.head.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn transaction_count(
            &self,
            _address: Address,
            _tag: crate::chain::BlockTag,
        ) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn has_code(&self, address: Address) -> anyhow::Result<bool> {
            self.read()?;
            Ok(self.code_at == Some(address))
        }
    }

    fn receipt(status: u64, address: Option<Address>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: B256::with_last_byte(1),
            block_number: 10,
            status,
            contract_address: address,
        }
    }

    fn waiter(depth: u64) -> ConfirmationWaiter {
        ConfirmationWaiter::new(depth, Duration::from_millis(500), Duration::from_millis(5))
    }

    fn pending() -> PendingTransaction {
        PendingTransaction {
            tx_hash: B256::with_last_byte(1),
        }
    }

    #[tokio::test]
    async fn test_confirms_after_depth() {
        let address = Address::with_last_byte(0xaa);
        let chain = ScriptedChain::new(Some(receipt(1, Some(address))));

        let confirmation = waiter(3).wait(&chain, &pending()).await.unwrap();

        assert_eq!(confirmation.address, address);
        assert_eq!(confirmation.tx_hash, Some(B256::with_last_byte(1)));
        assert_eq!(confirmation.confirmed_at_block, 10);
        assert!(chain.head.load(Ordering::SeqCst) >= 13);
    }

    #[tokio::test]
    async fn test_reverted_fails_fast() {
        let chain = ScriptedChain::new(Some(receipt(0, None)));

        let err = waiter(1).wait(&chain, &pending()).await.unwrap_err();

        assert_eq!(
            err,
            WaitError::TransactionReverted {
                tx_hash: B256::with_last_byte(1),
                block: 10,
            }
        );
    }

    #[tokio::test]
    async fn test_times_out_without_receipt() {
        let chain = ScriptedChain::new(None);
        let waiter =
            ConfirmationWaiter::new(1, Duration::from_millis(50), Duration::from_millis(5));

        let err = waiter.wait(&chain, &pending()).await.unwrap_err();

        assert!(matches!(
            err,
            WaitError::ConfirmationTimeout {
                last_error: None,
                ..
            }
        ));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unreachable_chain_is_reported_on_timeout() {
        let chain = ScriptedChain::new(None);
        chain.failures.store(usize::MAX, Ordering::SeqCst);
        let waiter =
            ConfirmationWaiter::new(1, Duration::from_millis(50), Duration::from_millis(5));

        let err = waiter.wait(&chain, &pending()).await.unwrap_err();

        let WaitError::ConfirmationTimeout { ref last_error, .. } = err else {
            panic!("expected a timeout, got {err:?}");
        };
        assert_eq!(last_error.as_deref(), Some("connection refused"));
        assert!(err.to_string().contains("last chain error: connection refused"));
    }

    #[tokio::test]
    async fn test_confirms_code_after_depth() {
        let address = Address::with_last_byte(0xcc);
        let chain = ScriptedChain::with_code(address);

        let confirmation = waiter(2).wait_for_code(&chain, address).await.unwrap();

        assert_eq!(confirmation.address, address);
        assert_eq!(confirmation.tx_hash, None);
        // First seen at head 11, confirmed once the head reached 13.
        assert_eq!(confirmation.confirmed_at_block, 11);
        assert!(chain.head.load(Ordering::SeqCst) >= 13);
    }

    #[tokio::test]
    async fn test_code_never_observed_times_out() {
        let chain = ScriptedChain::with_code(Address::with_last_byte(0xcc));
        chain.failures.store(usize::MAX, Ordering::SeqCst);
        let waiter =
            ConfirmationWaiter::new(1, Duration::from_millis(50), Duration::from_millis(5));

        let err = waiter
            .wait_for_code(&chain, Address::with_last_byte(0xdd))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WaitError::ContractNotObserved { ref last_error, .. } if last_error.is_some()
        ));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_missing_contract_address() {
        let chain = ScriptedChain::new(Some(receipt(1, None)));

        let err = waiter(1).wait(&chain, &pending()).await.unwrap_err();

        assert!(matches!(err, WaitError::MissingContractAddress { .. }));
    }

    #[tokio::test]
    async fn test_transient_read_errors_are_retried() {
        let address = Address::with_last_byte(0xbb);
        let chain = ScriptedChain::new(Some(receipt(1, Some(address))));
        chain.failures.store(3, Ordering::SeqCst);

        let confirmation = waiter(1).wait(&chain, &pending()).await.unwrap();

        assert_eq!(confirmation.address, address);
    }

    #[test]
    fn test_depth_is_at_least_one() {
        let waiter = ConfirmationWaiter::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(waiter.depth(), 1);
    }
}
