//! Settlement reconciler.
//!
//! The reconciler owns every payout whose receipt outlived the engine's
//! polling budget (or the process itself): it sweeps trades carrying a
//! parked verification marker, re-checks the transaction on chain, and
//! either finalizes, drops the marker, or leaves it for the next pass.
//! Finalization is keyed to the marker's transaction hash in the store, so
//! racing the engine's own receipt poll is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainRegistry, TxStatus};
use crate::entities::Trade;
use crate::events::{NotificationSender, TimerKind};
use crate::store::{StoreError, TradeStore};

use super::scheduler::Scheduler;
use super::settlement::SettlementEngine;
use super::EngineError;

/// Reconciler finalizes parked settlements once their receipts appear.
pub struct Reconciler<S> {
    store: Arc<S>,
    settlements: SettlementEngine<S>,
    chains: ChainRegistry,
    notifications: NotificationSender,
    timers: Scheduler,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S> Reconciler<S>
where
    S: TradeStore,
{
    pub fn new(
        store: Arc<S>,
        settlements: SettlementEngine<S>,
        chains: ChainRegistry,
        notifications: NotificationSender,
        timers: Scheduler,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            settlements,
            chains,
            notifications,
            timers,
            interval,
            shutdown_rx,
        }
    }

    /// Run the reconciler until shutdown.
    pub async fn run(mut self) {
        info!("Reconciler started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Reconciler received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Reconciler shutdown complete");
    }

    /// One pass over all parked settlements.
    async fn sweep(&self) {
        let parked = match self.store.pending_verifications().await {
            Ok(trades) => trades,
            Err(err) => {
                error!(error = %err, "pending verification scan failed");
                return;
            }
        };
        for trade in parked {
            if let Err(err) = self.reconcile(&trade).await {
                warn!(
                    trade = %trade.trade_id,
                    error = %err,
                    "reconciliation failed, will retry next sweep"
                );
            }
        }
    }

    /// Resolve one parked settlement.
    async fn reconcile(&self, trade: &Trade) -> Result<(), EngineError> {
        let Some(pending) = trade.pending_verification.as_ref() else {
            return Ok(());
        };
        let Some(terms) = trade.terms.as_ref() else {
            warn!(trade = %trade.trade_id, "parked settlement on a trade without terms, skipping");
            return Ok(());
        };

        let client = self.chains.client(&terms.chain)?;
        match client.tx_status(&pending.tx_hash).await {
            Ok(TxStatus::Confirmed { block_number }) => {
                info!(
                    trade = %trade.trade_id,
                    tx_hash = %pending.tx_hash,
                    block_number,
                    "parked settlement confirmed"
                );
                match self
                    .settlements
                    .finalize_confirmed(trade.trade_id, pending)
                    .await
                {
                    Ok(outcome) => {
                        if let Some(event) = outcome.notification() {
                            if self.notifications.send(event).await.is_err() {
                                warn!("notification channel closed, dropping event");
                            }
                        }
                        if let (true, Some(recycle_at)) =
                            (outcome.exhausted, outcome.trade.recycle_after)
                        {
                            self.timers.schedule(
                                outcome.trade.trade_id,
                                TimerKind::Recycle,
                                recycle_at,
                            );
                        }
                    }
                    // The engine's own receipt poll finalized first.
                    Err(EngineError::Store(StoreError::Conflict(_))) => {
                        debug!(
                            trade = %trade.trade_id,
                            tx_hash = %pending.tx_hash,
                            "already finalized elsewhere"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(TxStatus::Failed) => {
                warn!(
                    trade = %trade.trade_id,
                    tx_hash = %pending.tx_hash,
                    "parked settlement reverted on chain, dropping marker"
                );
                self.store.clear_verification(trade.trade_id).await?;
            }
            Ok(TxStatus::Unknown) => {
                debug!(
                    trade = %trade.trade_id,
                    tx_hash = %pending.tx_hash,
                    "still no receipt"
                );
            }
            Err(err) => {
                warn!(
                    trade = %trade.trade_id,
                    tx_hash = %pending.tx_hash,
                    error = %err,
                    "receipt lookup failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::{
        ChainName, PendingSettlement, SettlementKind, TradeStatus, VenueId,
    };
    use crate::events::{NotificationEvent, NotificationReceiver, notification_channel};
    use crate::store::TradeStore;
    use crate::testkit::{MemoryStore, ScriptedChain, TEST_CHAIN, funded_trade, test_config};
    use crate::utils::units::decimal_to_wei;
    use alloy_primitives::U256;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;
    use uuid::Uuid;

    struct Fixture {
        reconciler: Reconciler<MemoryStore>,
        store: Arc<MemoryStore>,
        chain: Arc<ScriptedChain>,
        events: NotificationReceiver,
        _timers_rx: crate::events::TimerReceiver,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(ScriptedChain::new());
        let chains =
            ChainRegistry::default().with_client(ChainName::new(TEST_CHAIN), chain.clone());
        let settlements =
            SettlementEngine::new(Arc::clone(&store), chains.clone(), test_config());
        let (tx, events) = notification_channel();
        let (timer_tx, _timers_rx) = crate::events::timer_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            settlements,
            chains,
            tx,
            Scheduler::new(timer_tx),
            Duration::from_secs(30),
            shutdown_rx,
        );
        Fixture {
            reconciler,
            store,
            chain,
            events,
            _timers_rx,
            _shutdown_tx,
        }
    }

    async fn park(
        store: &MemoryStore,
        balance: Decimal,
        exhausts: bool,
        payout: Decimal,
    ) -> (Uuid, PendingSettlement) {
        let trade = funded_trade(10, 20, balance);
        store.insert(&trade).await.unwrap();
        let pending = PendingSettlement {
            kind: SettlementKind::Release,
            tx_hash: "0xparked1".into(),
            amount: payout,
            amount_wei: decimal_to_wei(payout, 18).unwrap(),
            exhausts_balance: exhausts,
            submitted_at: OffsetDateTime::now_utc(),
        };
        store
            .record_verification(trade.trade_id, &pending, &TradeStatus::FUNDED)
            .await
            .unwrap();
        (trade.trade_id, pending)
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_marker_is_finalized_and_broadcast() {
        let mut fx = fixture();
        let (trade_id, _) = park(&fx.store, dec!(1000), true, dec!(1000)).await;
        fx.chain
            .set_tx_status("0xparked1", TxStatus::Confirmed { block_number: 42 });

        fx.reconciler.sweep().await;

        let after = fx.store.fetch(trade_id).await.unwrap();
        assert_eq!(after.status, TradeStatus::Completed);
        assert_eq!(after.balance, Decimal::ZERO);
        assert_eq!(after.release_tx_hash.as_deref(), Some("0xparked1"));
        assert!(after.pending_verification.is_none());
        assert!(after.recycle_after.is_some());

        match fx.events.try_recv().unwrap() {
            NotificationEvent::TradeCompleted {
                trade_id: id,
                venue,
                amount,
                tx_hash,
                ..
            } => {
                assert_eq!(id, trade_id);
                assert_eq!(venue, VenueId(-1));
                assert_eq!(amount, dec!(1000));
                assert_eq!(tx_hash, "0xparked1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_marker_finalizes_and_keeps_the_trade_live() {
        let mut fx = fixture();
        let (trade_id, _) = park(&fx.store, dec!(1000), false, dec!(400)).await;

        // Default scripted status is already confirmed.
        fx.reconciler.sweep().await;

        let after = fx.store.fetch(trade_id).await.unwrap();
        assert_eq!(after.status, TradeStatus::ReadyToRelease);
        assert_eq!(after.balance, dec!(600));
        assert_eq!(after.balance_wei, Some(decimal_to_wei(dec!(600), 18).unwrap()));

        match fx.events.try_recv().unwrap() {
            NotificationEvent::PartialSettled {
                kind,
                amount,
                remaining,
                ..
            } => {
                assert_eq!(kind, SettlementKind::Release);
                assert_eq!(amount, dec!(400));
                assert_eq!(remaining, dec!(600));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reverted_marker_is_dropped_and_funds_stay() {
        let mut fx = fixture();
        let (trade_id, _) = park(&fx.store, dec!(1000), true, dec!(1000)).await;
        fx.chain.set_tx_status("0xparked1", TxStatus::Failed);

        fx.reconciler.sweep().await;

        let after = fx.store.fetch(trade_id).await.unwrap();
        assert!(after.pending_verification.is_none());
        assert_eq!(after.balance, dec!(1000));
        assert_eq!(after.status, TradeStatus::ReadyToRelease);
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_receipt_is_left_for_the_next_sweep() {
        let mut fx = fixture();
        let (trade_id, _) = park(&fx.store, dec!(1000), true, dec!(1000)).await;
        fx.chain.set_tx_status("0xparked1", TxStatus::Unknown);

        fx.reconciler.sweep().await;

        let after = fx.store.fetch(trade_id).await.unwrap();
        assert!(after.pending_verification.is_some());
        assert_eq!(after.balance, dec!(1000));
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_finalization_race_is_benign() {
        let mut fx = fixture();
        let (trade_id, pending) = park(&fx.store, dec!(1000), true, dec!(1000)).await;

        // Snapshot the parked trade, then let the engine's own poll win.
        let snapshot = fx.store.pending_verifications().await.unwrap();
        fx.reconciler
            .settlements
            .finalize_confirmed(trade_id, &pending)
            .await
            .unwrap();

        fx.reconciler.reconcile(&snapshot[0]).await.unwrap();

        let after = fx.store.fetch(trade_id).await.unwrap();
        assert_eq!(after.status, TradeStatus::Completed);
        assert_eq!(after.balance_wei, Some(U256::ZERO));
        // The reconciler emitted nothing on top of the winner's broadcast.
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_sweeps_on_the_interval_and_stops_on_shutdown() {
        let fx = fixture();
        let (trade_id, _) = park(&fx.store, dec!(1000), true, dec!(1000)).await;
        let store = Arc::clone(&fx.store);
        let shutdown_tx = fx._shutdown_tx;

        let handle = tokio::spawn(fx.reconciler.run());
        tokio::time::sleep(Duration::from_secs(31)).await;

        let after = store.fetch(trade_id).await.unwrap();
        assert_eq!(after.status, TradeStatus::Completed);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
