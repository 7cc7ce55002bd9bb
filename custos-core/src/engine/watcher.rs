//! Deposit watcher: scans the chain for transfers into the trade's deposit
//! address and credits them exactly once.
//!
//! The node's transfer logs are the primary source. When a scan comes back
//! empty or errors, the block explorer API answers the same question; the
//! per-trade seen-hash set makes the overlap between the two sources safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::U256;
use rust_decimal::Decimal;

use crate::chain::ChainRegistry;
use crate::config::SharedConfig;
use crate::entities::{Trade, TradeStatus};
use crate::store::TradeStore;
use crate::utils::units::{DUST_EPSILON, wei_to_decimal};

use super::EngineError;

/// Outcome of one deposit check.
#[derive(Debug, Clone, PartialEq)]
pub enum DepositCheck {
    /// New transfers were credited. `full` means the accumulated balance now
    /// covers the agreed quantity (within the dust epsilon).
    Credited {
        trade: Box<Trade>,
        amount: Decimal,
        full: bool,
    },
    NoNewDeposit {
        scanned_to: u64,
    },
}

pub struct DepositWatcher<S> {
    store: Arc<S>,
    chains: ChainRegistry,
    config: SharedConfig,
}

impl<S> DepositWatcher<S>
where
    S: TradeStore,
{
    pub fn new(store: Arc<S>, chains: ChainRegistry, config: SharedConfig) -> Self {
        Self {
            store,
            chains,
            config,
        }
    }

    /// Scan the next block window for deposits and credit anything new.
    ///
    /// At most `deposit_chunk` blocks are covered per call; repeated checks
    /// walk the cursor up to the chain head. Re-running the check against
    /// the same window is harmless: every transfer is keyed by transaction
    /// hash and credited at most once.
    pub async fn check(&self, trade: &Trade) -> Result<DepositCheck, EngineError> {
        let terms = trade
            .terms
            .as_ref()
            .ok_or_else(|| EngineError::validation("trade terms are not set"))?;
        let deposit_address = trade
            .deposit_address
            .as_deref()
            .ok_or_else(|| EngineError::validation("no deposit address assigned"))?;
        let entry = self
            .config
            .contracts
            .resolve(&terms.token, &terms.chain, trade.venue_id)
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "no custodial contract for {} on {}",
                    terms.token, terms.chain
                ))
            })?;
        let client = self.chains.client(&terms.chain)?;

        let head = client.head_block().await?;
        let from = trade.last_checked_block + 1;
        if from > head {
            return Ok(DepositCheck::NoNewDeposit {
                scanned_to: trade.last_checked_block,
            });
        }
        let chunk = self.config.escrow.deposit_chunk.max(1);
        let to = head.min(from.saturating_add(chunk - 1));

        let records = match client
            .transfers_to(&entry.token_address, deposit_address, from, to)
            .await
        {
            Ok(records) if !records.is_empty() => records,
            primary => {
                if let Err(err) = &primary {
                    tracing::warn!(
                        trade = %trade.trade_id,
                        error = %err,
                        "node transfer scan failed, falling back to explorer"
                    );
                }
                match client
                    .explorer_transfers_to(&entry.token_address, deposit_address, from)
                    .await
                {
                    // The explorer scans to its own head; stay within this
                    // check's window so the cursor semantics hold.
                    Ok(fallback) => fallback
                        .into_iter()
                        .filter(|r| r.block_number <= to)
                        .collect(),
                    Err(fallback_err) => match primary {
                        Ok(_) => {
                            tracing::debug!(
                                trade = %trade.trade_id,
                                error = %fallback_err,
                                "explorer fallback unavailable"
                            );
                            Vec::new()
                        }
                        // Both sources failed: bail without advancing the
                        // cursor, nothing was observed.
                        Err(err) => return Err(err.into()),
                    },
                }
            }
        };

        // One credit per transaction hash. A transaction carrying several
        // transfer logs into the address is summed before crediting.
        let mut fresh: BTreeMap<String, U256> = BTreeMap::new();
        for record in records {
            if !record.to.eq_ignore_ascii_case(deposit_address) || record.amount_wei.is_zero() {
                continue;
            }
            let hash = record.tx_hash.to_ascii_lowercase();
            if trade.seen_deposit_hashes.contains(&hash) {
                continue;
            }
            *fresh.entry(hash).or_default() += record.amount_wei;
        }

        if fresh.is_empty() {
            self.store.advance_scan_cursor(trade.trade_id, to).await?;
            return Ok(DepositCheck::NoNewDeposit { scanned_to: to });
        }

        let hashes: Vec<String> = fresh.keys().cloned().collect();
        let total_wei = fresh
            .values()
            .fold(U256::ZERO, |acc, amount| acc.saturating_add(*amount));
        let amount = wei_to_decimal(total_wei, entry.decimals)?;

        let credited = self
            .store
            .credit_deposit(
                trade.trade_id,
                &hashes,
                amount,
                total_wei,
                to,
                &[TradeStatus::AwaitingDeposit, TradeStatus::Deposited],
            )
            .await?;

        match credited {
            Some(updated) => {
                tracing::info!(
                    trade = %trade.trade_id,
                    %amount,
                    total = %updated.balance,
                    transfers = hashes.len(),
                    "deposit credited"
                );
                let full = updated.balance + DUST_EPSILON >= terms.quantity;
                Ok(DepositCheck::Credited {
                    trade: Box::new(updated),
                    amount,
                    full,
                })
            }
            // A concurrent check credited these transfers first.
            None => Ok(DepositCheck::NoNewDeposit {
                scanned_to: trade.last_checked_block,
            }),
        }
    }
}
