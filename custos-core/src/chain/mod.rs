//! On-chain access: deposit scans, custodial balance reads, and settlement
//! submission through the custodial vault contract.

mod evm;
mod explorer;

pub use evm::EvmChainClient;
pub use explorer::ExplorerClient;

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::config::{ChainEndpoints, ChainFamily};
use crate::entities::ChainName;

/// A token transfer observed on chain, normalized to lowercase hex strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount_wei: U256,
    pub block_number: u64,
}

/// Receipt of a payout transaction accepted by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx_hash: String,
    pub nonce: u64,
}

/// Confirmation state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed { block_number: u64 },
    Failed,
    /// No receipt yet. The transaction may still land.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no endpoint configured for chain '{0}'")]
    UnsupportedChain(String),
    #[error("custodial contract holds {available} wei, payout needs {required} wei")]
    InsufficientContractBalance { available: U256, required: U256 },
    #[error("nonce rejected by node: {0}")]
    Nonce(String),
    #[error("submission timed out: {0}")]
    Timeout(String),
    #[error("transaction {0} reverted on chain")]
    Reverted(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("chain configuration error: {0}")]
    Config(String),
}

impl ChainError {
    /// Whether a payout submission that failed with this error may be retried
    /// with a refreshed nonce without risking a duplicate payout.
    pub fn is_retryable_submit(&self) -> bool {
        matches!(self, Self::Nonce(_) | Self::Timeout(_))
    }
}

/// Node-side chain operations used by the deposit watcher and the settlement
/// engine. One client per configured chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block height of the chain head.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// ERC-20 `Transfer` events into `recipient` within the inclusive block
    /// range, via node log queries.
    async fn transfers_to(
        &self,
        token_address: &str,
        recipient: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError>;

    /// Same query answered by the block explorer API instead of the node.
    /// Used when the node scan yields nothing or errors.
    async fn explorer_transfers_to(
        &self,
        token_address: &str,
        recipient: &str,
        from_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError>;

    /// Token balance held by `holder` (the custodial contract, in practice).
    async fn contract_balance(&self, token_address: &str, holder: &str)
    -> Result<U256, ChainError>;

    /// Next nonce for the operator key, counting mempool transactions.
    async fn pending_nonce(&self) -> Result<u64, ChainError>;

    /// Submit a release payout through the custodial vault.
    async fn submit_release(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError>;

    /// Submit a refund payout through the custodial vault.
    async fn submit_refund(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError>;

    /// Receipt lookup for a previously submitted transaction.
    async fn tx_status(&self, tx_hash: &str) -> Result<TxStatus, ChainError>;
}

/// Maps chain names to their clients. On-chain operations are available for
/// EVM-family endpoints; base58-family chains participate in address
/// validation only.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: HashMap<ChainName, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn from_endpoints(endpoints: &ChainEndpoints) -> Result<Self, ChainError> {
        let mut clients = HashMap::new();
        for endpoint in endpoints.iter() {
            if endpoint.family == ChainFamily::Evm {
                let client = EvmChainClient::new(endpoint.clone())?;
                clients.insert(
                    endpoint.name.clone(),
                    Arc::new(client) as Arc<dyn ChainClient>,
                );
            }
        }
        Ok(Self { clients })
    }

    /// Test constructor: install an arbitrary client under a chain name.
    pub fn with_client(mut self, chain: ChainName, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(chain, client);
        self
    }

    pub fn client(&self, chain: &ChainName) -> Result<Arc<dyn ChainClient>, ChainError> {
        self.clients
            .get(chain)
            .cloned()
            .ok_or_else(|| ChainError::UnsupportedChain(chain.as_str().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_and_timeout_submissions_are_retryable() {
        assert!(ChainError::Nonce("nonce too low".into()).is_retryable_submit());
        assert!(ChainError::Timeout("deadline exceeded".into()).is_retryable_submit());
        assert!(!ChainError::Rpc("connection refused".into()).is_retryable_submit());
        assert!(
            !ChainError::InsufficientContractBalance {
                available: U256::from(1u64),
                required: U256::from(2u64),
            }
            .is_retryable_submit()
        );
    }

    #[test]
    fn registry_rejects_unknown_chain() {
        let registry = ChainRegistry::default();
        let err = registry.client(&ChainName::new("bsc"));
        assert!(matches!(err, Err(ChainError::UnsupportedChain(name)) if name == "bsc"));
    }
}
