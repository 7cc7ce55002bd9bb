//! EVM chain client built on alloy. Read paths use a plain HTTP provider;
//! payout submissions attach the per-chain operator wallet.

use std::str::FromStr;

use alloy_primitives::{Address, B256, U256};
use alloy_provider::network::EthereumWallet;
use alloy_provider::{Provider, ProviderBuilder};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::sol;

use crate::config::ChainEndpoint;

use super::{ChainClient, ChainError, ExplorerClient, SubmittedTx, TransferRecord, TxStatus};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IErc20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    contract ICustodialVault {
        function release(address token, address to, uint256 amount) external;
        function refund(address token, address to, uint256 amount) external;
    }
}

pub struct EvmChainClient {
    endpoint: ChainEndpoint,
    signer: PrivateKeySigner,
    explorer: Option<ExplorerClient>,
}

impl EvmChainClient {
    pub fn new(endpoint: ChainEndpoint) -> Result<Self, ChainError> {
        let signer = PrivateKeySigner::from_str(&endpoint.signer_key)
            .map_err(|e| ChainError::Config(format!("bad signer key for {}: {e}", endpoint.name)))?
            .with_chain_id(Some(endpoint.chain_id));
        let explorer = endpoint.explorer_url.clone().map(|url| {
            ExplorerClient::new(url, endpoint.explorer_api_key.clone(), endpoint.chain_id)
        });
        Ok(Self {
            endpoint,
            signer,
            explorer,
        })
    }

    fn read_provider(&self) -> impl Provider {
        ProviderBuilder::new().connect_http(self.endpoint.rpc_url.clone())
    }

    fn write_provider(&self) -> impl Provider {
        ProviderBuilder::new()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .connect_http(self.endpoint.rpc_url.clone())
    }
}

fn parse_address(value: &str) -> Result<Address, ChainError> {
    Address::from_str(value).map_err(|e| ChainError::Config(format!("bad address {value}: {e}")))
}

fn rpc_err(e: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(e.to_string())
}

/// Sorts node-side submission failures into the retryable buckets. Node error
/// strings are not standardized, so this matches the common geth/erigon
/// phrasings.
fn classify_send_error(e: impl std::fmt::Display) -> ChainError {
    let message = e.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("nonce too low")
        || lowered.contains("nonce too high")
        || lowered.contains("already known")
        || lowered.contains("replacement transaction underpriced")
    {
        ChainError::Nonce(message)
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        ChainError::Timeout(message)
    } else {
        ChainError::Rpc(message)
    }
}

#[async_trait::async_trait]
impl ChainClient for EvmChainClient {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.read_provider()
            .get_block_number()
            .await
            .map_err(rpc_err)
    }

    async fn transfers_to(
        &self,
        token_address: &str,
        recipient: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError> {
        let provider = self.read_provider();
        let token = IErc20::new(parse_address(token_address)?, provider);
        let recipient = parse_address(recipient)?;

        let logs = token
            .Transfer_filter()
            .topic2(recipient.into_word())
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(rpc_err)?;

        let mut records = Vec::with_capacity(logs.len());
        for (transfer, log) in logs {
            // Pending logs carry no receipt coordinates; skip until mined.
            let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number)
            else {
                continue;
            };
            records.push(TransferRecord {
                tx_hash: format!("{tx_hash:?}"),
                from: format!("{:?}", transfer.from),
                to: format!("{:?}", transfer.to),
                amount_wei: transfer.value,
                block_number,
            });
        }
        Ok(records)
    }

    async fn explorer_transfers_to(
        &self,
        token_address: &str,
        recipient: &str,
        from_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError> {
        match &self.explorer {
            Some(explorer) => {
                explorer
                    .token_transfers(token_address, recipient, from_block)
                    .await
            }
            None => Err(ChainError::Config(format!(
                "no explorer endpoint configured for {}",
                self.endpoint.name
            ))),
        }
    }

    async fn contract_balance(
        &self,
        token_address: &str,
        holder: &str,
    ) -> Result<U256, ChainError> {
        let provider = self.read_provider();
        let token = IErc20::new(parse_address(token_address)?, provider);
        token
            .balanceOf(parse_address(holder)?)
            .call()
            .await
            .map_err(rpc_err)
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.read_provider()
            .get_transaction_count(self.signer.address())
            .pending()
            .await
            .map_err(rpc_err)
    }

    async fn submit_release(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        let provider = self.write_provider();
        let vault = ICustodialVault::new(parse_address(contract)?, provider);
        let pending = vault
            .release(
                parse_address(token_address)?,
                parse_address(recipient)?,
                amount_wei,
            )
            .nonce(nonce)
            .send()
            .await
            .map_err(classify_send_error)?;
        Ok(SubmittedTx {
            tx_hash: format!("{:?}", pending.tx_hash()),
            nonce,
        })
    }

    async fn submit_refund(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        let provider = self.write_provider();
        let vault = ICustodialVault::new(parse_address(contract)?, provider);
        let pending = vault
            .refund(
                parse_address(token_address)?,
                parse_address(recipient)?,
                amount_wei,
            )
            .nonce(nonce)
            .send()
            .await
            .map_err(classify_send_error)?;
        Ok(SubmittedTx {
            tx_hash: format!("{:?}", pending.tx_hash()),
            nonce,
        })
    }

    async fn tx_status(&self, tx_hash: &str) -> Result<TxStatus, ChainError> {
        let hash = B256::from_str(tx_hash)
            .map_err(|e| ChainError::Config(format!("bad tx hash {tx_hash}: {e}")))?;
        let receipt = self
            .read_provider()
            .get_transaction_receipt(hash)
            .await
            .map_err(rpc_err)?;
        match receipt {
            Some(receipt) if receipt.status() => Ok(TxStatus::Confirmed {
                block_number: receipt.block_number.unwrap_or_default(),
            }),
            Some(_) => Ok(TxStatus::Failed),
            None => Ok(TxStatus::Unknown),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn send_errors_are_classified_by_node_phrasing() {
        assert!(matches!(
            classify_send_error("nonce too low: next nonce 42, tx nonce 41"),
            ChainError::Nonce(_)
        ));
        assert!(matches!(
            classify_send_error("already known"),
            ChainError::Nonce(_)
        ));
        assert!(matches!(
            classify_send_error("request timed out after 30s"),
            ChainError::Timeout(_)
        ));
        assert!(matches!(
            classify_send_error("execution reverted"),
            ChainError::Rpc(_)
        ));
    }

    #[test]
    fn bad_signer_key_is_a_config_error() {
        let endpoint = ChainEndpoint {
            name: crate::entities::ChainName::new("bsc"),
            family: crate::config::ChainFamily::Evm,
            rpc_url: "https://bsc.example.org/rpc".parse().unwrap(),
            chain_id: 56,
            explorer_url: None,
            explorer_api_key: None,
            signer_key: "not-a-key".to_owned(),
        };
        assert!(matches!(
            EvmChainClient::new(endpoint),
            Err(ChainError::Config(_))
        ));
    }
}
