//! The fund movement engine: validated, wei-exact, at-most-once payouts
//! through the custodial contract.
//!
//! One settlement per trade runs at a time (an in-process gate rejects the
//! second caller), and every submitted transaction is parked on the trade as
//! a verification marker before its receipt is awaited, so a crash mid-poll
//! can always be reconciled later instead of resubmitted.

use std::sync::Arc;

use alloy_primitives::U256;
use dashmap::DashSet;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::chain::{ChainClient, ChainError, ChainRegistry, SubmittedTx, TxStatus};
use crate::config::{ContractEntry, SharedConfig};
use crate::entities::{PendingSettlement, SettlementKind, Trade, TradeStatus};
use crate::events::NotificationEvent;
use crate::store::{SettlementUpdate, TradeStore};
use crate::utils::units::{DUST_EPSILON, decimal_to_wei, fee_amount, proportional_wei};

use super::EngineError;

/// A finalized settlement, as applied to the trade record.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub trade: Trade,
    pub kind: SettlementKind,
    /// Human-unit amount paid out.
    pub amount: Decimal,
    pub amount_wei: U256,
    /// Reported service fee. Never deducted from the payout.
    pub fee: Decimal,
    pub tx_hash: String,
    /// Balance left on the trade after this settlement.
    pub remaining: Decimal,
    /// Whether this payout drained the trade (now terminal).
    pub exhausted: bool,
}

impl SettlementOutcome {
    /// The venue broadcast this settlement produces, if the trade has a venue
    /// bound. Both confirmation paths (the engine's own receipt poll and the
    /// reconciler) emit through this so the wording and idempotency keys
    /// stay identical.
    pub fn notification(&self) -> Option<NotificationEvent> {
        let venue = self.trade.venue_id?;
        let trade_id = self.trade.trade_id;
        Some(if self.exhausted {
            match self.kind {
                SettlementKind::Release => NotificationEvent::TradeCompleted {
                    trade_id,
                    venue,
                    amount: self.amount,
                    fee: self.fee,
                    tx_hash: self.tx_hash.clone(),
                },
                SettlementKind::Refund => NotificationEvent::TradeRefunded {
                    trade_id,
                    venue,
                    amount: self.amount,
                    tx_hash: self.tx_hash.clone(),
                },
            }
        } else {
            NotificationEvent::PartialSettled {
                trade_id,
                venue,
                kind: self.kind,
                amount: self.amount,
                remaining: self.remaining,
                tx_hash: self.tx_hash.clone(),
            }
        })
    }
}

pub struct SettlementEngine<S> {
    store: Arc<S>,
    chains: ChainRegistry,
    config: SharedConfig,
    in_flight: Arc<DashSet<Uuid>>,
}

impl<S> Clone for SettlementEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chains: self.chains.clone(),
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// Releases the in-flight slot on every exit path.
struct InFlightGuard {
    set: Arc<DashSet<Uuid>>,
    trade_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.trade_id);
    }
}

impl<S> SettlementEngine<S>
where
    S: TradeStore,
{
    pub fn new(store: Arc<S>, chains: ChainRegistry, config: SharedConfig) -> Self {
        Self {
            store,
            chains,
            config,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Execute a settlement against the given trade snapshot.
    ///
    /// `amount` of `None` settles the full balance. A partial amount within
    /// [`DUST_EPSILON`] of the balance is promoted to a full settlement so no
    /// dust is stranded. The integer payout amount is the stored wei balance
    /// verbatim for full settlements and an integer-proportional share for
    /// partials; decimal-derived conversion is only used for records without
    /// a wei balance.
    pub async fn execute(
        &self,
        trade: &Trade,
        kind: SettlementKind,
        amount: Option<Decimal>,
    ) -> Result<SettlementOutcome, EngineError> {
        let terms = trade
            .terms
            .as_ref()
            .ok_or_else(|| EngineError::validation("trade terms are not set"))?;
        let recipient = trade.payout_address(kind).ok_or_else(|| {
            EngineError::validation(format!(
                "{} payout address is not set",
                kind.payout_role().as_str()
            ))
        })?;
        if trade.balance <= Decimal::ZERO {
            return Err(EngineError::validation("no held balance to settle"));
        }
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

        let requested = amount.unwrap_or(trade.balance);
        if requested <= Decimal::ZERO {
            return Err(EngineError::validation("settlement amount must be positive"));
        }
        if requested > trade.balance + DUST_EPSILON {
            return Err(EngineError::validation(format!(
                "requested {requested} exceeds held balance {}",
                trade.balance
            )));
        }
        let exhausts = trade.balance - requested <= DUST_EPSILON;

        let amount_wei = match (exhausts, trade.balance_wei) {
            (true, Some(wei)) => wei,
            (true, None) => decimal_to_wei(trade.balance, entry.decimals)?,
            (false, Some(wei)) => proportional_wei(wei, requested, trade.balance)?,
            (false, None) => decimal_to_wei(requested, entry.decimals)?,
        };
        if amount_wei.is_zero() {
            return Err(EngineError::validation(
                "settlement amount rounds to zero integer units",
            ));
        }

        if !self.in_flight.insert(trade.trade_id) {
            return Err(EngineError::SettlementInFlight(trade.trade_id));
        }
        let _guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            trade_id: trade.trade_id,
        };

        let client = self.chains.client(&terms.chain)?;
        let available = client
            .contract_balance(&entry.token_address, &entry.custodial_address)
            .await?;
        if available < amount_wei {
            return Err(ChainError::InsufficientContractBalance {
                available,
                required: amount_wei,
            }
            .into());
        }

        let nonce = client.pending_nonce().await?;
        let submitted = match self
            .submit(client.as_ref(), kind, entry, recipient, amount_wei, nonce)
            .await
        {
            Ok(tx) => tx,
            Err(err) if err.is_retryable_submit() => {
                tracing::warn!(
                    trade = %trade.trade_id,
                    error = %err,
                    "payout submission bounced, retrying with a fresh nonce"
                );
                let nonce = client.pending_nonce().await?;
                self.submit(client.as_ref(), kind, entry, recipient, amount_wei, nonce)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            trade = %trade.trade_id,
            kind = kind.as_str(),
            amount = %requested,
            tx_hash = %submitted.tx_hash,
            nonce = submitted.nonce,
            "settlement submitted"
        );

        // Park the marker before waiting: if this process dies mid-poll the
        // reconciler picks the transaction up instead of anyone resubmitting.
        let pending = PendingSettlement {
            kind,
            tx_hash: submitted.tx_hash.clone(),
            amount: requested,
            amount_wei,
            exhausts_balance: exhausts,
            submitted_at: OffsetDateTime::now_utc(),
        };
        self.store
            .record_verification(trade.trade_id, &pending, &TradeStatus::FUNDED)
            .await?;

        let attempts = self.config.escrow.confirm_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.escrow.confirm_poll).await;
            match client.tx_status(&pending.tx_hash).await {
                Ok(TxStatus::Confirmed { block_number }) => {
                    tracing::info!(
                        trade = %trade.trade_id,
                        tx_hash = %pending.tx_hash,
                        block_number,
                        "settlement confirmed"
                    );
                    return self.finalize_confirmed(trade.trade_id, &pending).await;
                }
                Ok(TxStatus::Failed) => {
                    tracing::warn!(
                        trade = %trade.trade_id,
                        tx_hash = %pending.tx_hash,
                        "settlement reverted on chain"
                    );
                    self.store.clear_verification(trade.trade_id).await?;
                    return Err(ChainError::Reverted(pending.tx_hash.clone()).into());
                }
                Ok(TxStatus::Unknown) => {
                    tracing::debug!(
                        trade = %trade.trade_id,
                        attempt,
                        "no receipt yet"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        trade = %trade.trade_id,
                        attempt,
                        error = %err,
                        "receipt lookup failed"
                    );
                }
            }
        }

        Err(EngineError::VerificationTimeout {
            tx_hash: pending.tx_hash.clone(),
            attempts,
        })
    }

    /// Write a confirmed settlement back to the trade. Also the reconciler's
    /// finalization path; the store rejects the second finalization of the
    /// same transaction.
    pub(super) async fn finalize_confirmed(
        &self,
        trade_id: Uuid,
        pending: &PendingSettlement,
    ) -> Result<SettlementOutcome, EngineError> {
        let recycle_after = pending
            .exhausts_balance
            .then(|| OffsetDateTime::now_utc() + self.config.escrow.recycle_grace);
        let update = SettlementUpdate {
            kind: pending.kind,
            amount: pending.amount,
            amount_wei: pending.amount_wei,
            tx_hash: pending.tx_hash.clone(),
            exhausts_balance: pending.exhausts_balance,
            recycle_after,
        };
        let updated = self
            .store
            .apply_settlement(trade_id, &update, &TradeStatus::FUNDED)
            .await?;
        let fee = fee_amount(pending.amount, self.config.escrow.fee_percent);
        Ok(SettlementOutcome {
            kind: pending.kind,
            amount: pending.amount,
            amount_wei: pending.amount_wei,
            fee,
            tx_hash: pending.tx_hash.clone(),
            remaining: updated.balance,
            exhausted: pending.exhausts_balance,
            trade: updated,
        })
    }

    async fn submit(
        &self,
        client: &dyn ChainClient,
        kind: SettlementKind,
        entry: &ContractEntry,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        match kind {
            SettlementKind::Release => {
                client
                    .submit_release(
                        &entry.custodial_address,
                        &entry.token_address,
                        recipient,
                        amount_wei,
                        nonce,
                    )
                    .await
            }
            SettlementKind::Refund => {
                client
                    .submit_refund(
                        &entry.custodial_address,
                        &entry.token_address,
                        recipient,
                        amount_wei,
                        nonce,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::ChainName;
    use crate::testkit::{
        BUYER_ADDRESS, MemoryStore, ScriptedChain, TEST_CHAIN, funded_trade, test_config,
    };
    use rust_decimal_macros::dec;

    fn engine(
        chain: Arc<ScriptedChain>,
    ) -> (SettlementEngine<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry =
            ChainRegistry::default().with_client(ChainName::new(TEST_CHAIN), chain);
        let engine = SettlementEngine::new(Arc::clone(&store), registry, test_config());
        (engine, store)
    }

    fn wei(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[tokio::test(start_paused = true)]
    async fn full_release_pays_the_stored_wei_verbatim() {
        let chain = Arc::new(ScriptedChain::new());
        // A wei balance the decimal mirror cannot reproduce exactly.
        let exact = wei(1000) + U256::from(7u64);
        let (engine, store) = engine(Arc::clone(&chain));
        let mut trade = funded_trade(10, 20, dec!(1000));
        trade.balance_wei = Some(exact);
        store.insert(&trade).await.unwrap();

        let outcome = engine
            .execute(&trade, SettlementKind::Release, None)
            .await
            .unwrap();

        assert_eq!(outcome.amount_wei, exact);
        assert!(outcome.exhausted);
        assert_eq!(outcome.remaining, Decimal::ZERO);
        assert_eq!(outcome.trade.status, TradeStatus::Completed);
        assert_eq!(outcome.trade.balance_wei, Some(U256::ZERO));
        assert!(outcome.trade.recycle_after.is_some());
        assert!(outcome.trade.pending_verification.is_none());

        let submissions = chain.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].amount_wei, exact);
        assert_eq!(submissions[0].recipient, BUYER_ADDRESS);
        assert_eq!(submissions[0].kind, SettlementKind::Release);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_release_is_proportional_and_keeps_the_trade_live() {
        let chain = Arc::new(ScriptedChain::new());
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let outcome = engine
            .execute(&trade, SettlementKind::Release, Some(dec!(400)))
            .await
            .unwrap();

        assert_eq!(outcome.amount_wei, wei(400));
        assert!(!outcome.exhausted);
        assert_eq!(outcome.remaining, dec!(600));
        assert_eq!(outcome.trade.status, TradeStatus::ReadyToRelease);
        assert_eq!(outcome.trade.balance_wei, Some(wei(600)));
        // A changed stake needs fresh approvals.
        assert!(outcome.trade.release_approvals.is_empty());
        assert!(outcome.trade.refund_approvals.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_within_epsilon_of_balance_settles_in_full() {
        let chain = Arc::new(ScriptedChain::new());
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let outcome = engine
            .execute(&trade, SettlementKind::Release, Some(dec!(999.999999)))
            .await
            .unwrap();

        assert!(outcome.exhausted);
        assert_eq!(outcome.amount_wei, wei(1000));
        assert_eq!(outcome.trade.status, TradeStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_settlements_submit_exactly_once() {
        let chain = Arc::new(ScriptedChain::new());
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let (first, second) = tokio::join!(
            engine.execute(&trade, SettlementKind::Release, None),
            engine.execute(&trade, SettlementKind::Release, None),
        );

        let in_flight_rejections = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(EngineError::SettlementInFlight(_))))
            .count();
        assert_eq!(in_flight_rejections, 1);
        assert_eq!(chain.submissions().len(), 1);
        assert!(first.is_ok() || second.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn refund_pays_the_seller() {
        let chain = Arc::new(ScriptedChain::new());
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(500));
        store.insert(&trade).await.unwrap();

        let outcome = engine
            .execute(&trade, SettlementKind::Refund, None)
            .await
            .unwrap();

        assert_eq!(outcome.trade.status, TradeStatus::Refunded);
        assert_eq!(
            chain.submissions()[0].recipient,
            trade.seller_address.unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_contract_balance_blocks_submission() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_contract_balance(wei(10));
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let err = engine
            .execute(&trade, SettlementKind::Release, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Chain(ChainError::InsufficientContractBalance { .. })
        ));
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_bounce_is_retried_once_with_a_fresh_nonce() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_pending_nonce(7);
        chain.queue_submit_failure(ChainError::Nonce("nonce too low".into()));
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let outcome = engine
            .execute(&trade, SettlementKind::Release, None)
            .await
            .unwrap();
        assert!(outcome.exhausted);
        assert_eq!(chain.submit_attempts(), 2);
        assert_eq!(chain.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_payout_parks_a_verification_marker() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_default_status(TxStatus::Unknown);
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let err = engine
            .execute(&trade, SettlementKind::Release, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VerificationTimeout { .. }));

        let parked = store.fetch(trade.trade_id).await.unwrap();
        let pending = parked.pending_verification.unwrap();
        assert_eq!(pending.kind, SettlementKind::Release);
        assert!(pending.exhausts_balance);
        // Nothing was applied: the balance still stands.
        assert_eq!(parked.balance, dec!(1000));
        assert_eq!(parked.status, TradeStatus::ReadyToRelease);
    }

    #[tokio::test(start_paused = true)]
    async fn reverted_payout_clears_the_marker_and_keeps_funds() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_default_status(TxStatus::Failed);
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(1000));
        store.insert(&trade).await.unwrap();

        let err = engine
            .execute(&trade, SettlementKind::Release, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Chain(ChainError::Reverted(_))));

        let after = store.fetch(trade.trade_id).await.unwrap();
        assert!(after.pending_verification.is_none());
        assert_eq!(after.balance, dec!(1000));
        assert_eq!(after.status, TradeStatus::ReadyToRelease);
    }

    #[tokio::test(start_paused = true)]
    async fn over_balance_request_is_rejected_before_any_chain_call() {
        let chain = Arc::new(ScriptedChain::new());
        let (engine, store) = engine(Arc::clone(&chain));
        let trade = funded_trade(10, 20, dec!(100));
        store.insert(&trade).await.unwrap();

        let err = engine
            .execute(&trade, SettlementKind::Release, Some(dec!(100.5)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(chain.submissions().is_empty());
    }
}
