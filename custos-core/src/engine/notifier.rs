//! Venue notification delivery.
//!
//! The notifier sits downstream of every settlement and deposit: it drains
//! the notification channel and posts into the trade's venue through the
//! gateway. Delivery is strictly best-effort. A failed send is logged and
//! dropped, never bubbled back into the flow that produced it. The three
//! broadcast variants additionally race through the store's idempotency
//! flags first, so a redelivered event (engine and reconciler both
//! finalizing, a crash between send and ack) posts at most once.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::entities::{BroadcastEffect, SettlementKind};
use crate::events::{NotificationEvent, NotificationReceiver};
use crate::messaging::{VenueGateway, with_retry};
use crate::store::TradeStore;

/// Notifier posts engine events into their venues.
pub struct Notifier<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    events_rx: NotificationReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, G> Notifier<S, G>
where
    S: TradeStore,
    G: VenueGateway,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        events_rx: NotificationReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            gateway,
            events_rx,
            shutdown_rx,
        }
    }

    /// Run the notifier until shutdown.
    pub async fn run(mut self) {
        info!("Notifier started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Notifier received shutdown signal");
                        break;
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    debug!(event = ?event, "Received NotificationEvent");
                    self.deliver(event).await;
                }

                else => {
                    info!("notification channel closed");
                    break;
                }
            }
        }

        info!("Notifier shutdown complete");
    }

    /// Deliver one event. Never returns an error; everything that can go
    /// wrong ends in a log line.
    async fn deliver(&self, event: NotificationEvent) {
        let Some(venue) = event.venue() else {
            debug!(trade = %event.trade_id(), "event has no venue, nothing to post");
            return;
        };

        if let Some((effect, tx_hash)) = broadcast_gate(&event) {
            match self
                .store
                .try_mark_effect(event.trade_id(), effect, tx_hash)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        trade = %event.trade_id(),
                        effect = ?effect,
                        "broadcast already sent, skipping"
                    );
                    return;
                }
                Err(err) => {
                    warn!(
                        trade = %event.trade_id(),
                        effect = ?effect,
                        error = %err,
                        "broadcast flag check failed, skipping to stay at-most-once"
                    );
                    return;
                }
            }
        }

        let text = render(&event);
        if let Err(err) = with_retry(|| self.gateway.send_message(venue, &text)).await {
            warn!(
                trade = %event.trade_id(),
                venue = %venue,
                error = %err,
                "notification delivery failed"
            );
        }
    }
}

/// The idempotency flag (and the tx hash it is keyed to) guarding this
/// event, if any.
fn broadcast_gate(event: &NotificationEvent) -> Option<(BroadcastEffect, Option<&str>)> {
    match event {
        NotificationEvent::TradeCompleted { tx_hash, .. } => {
            Some((BroadcastEffect::Completed, Some(tx_hash)))
        }
        NotificationEvent::TradeRefunded { tx_hash, .. } => {
            Some((BroadcastEffect::Refunded, Some(tx_hash)))
        }
        NotificationEvent::PartialDeposit { .. } => Some((BroadcastEffect::PartialDeposit, None)),
        _ => None,
    }
}

fn render(event: &NotificationEvent) -> String {
    match event {
        NotificationEvent::DepositConfirmed { amount, total, .. } => {
            format!("Deposit confirmed: {amount}. Escrow now holds {total}.")
        }
        NotificationEvent::PartialDeposit {
            total, expected, ..
        } => {
            format!("Deposit received: {total} of the agreed {expected}. Waiting for the rest.")
        }
        NotificationEvent::TradeCompleted {
            amount,
            fee,
            tx_hash,
            ..
        } => {
            format!("Trade complete. Released {amount} to the buyer (fee {fee}). Tx: {tx_hash}")
        }
        NotificationEvent::TradeRefunded {
            amount, tx_hash, ..
        } => {
            format!("Trade refunded. Returned {amount} to the seller. Tx: {tx_hash}")
        }
        NotificationEvent::PartialSettled {
            kind,
            amount,
            remaining,
            tx_hash,
            ..
        } => {
            let direction = match kind {
                SettlementKind::Release => "released to the buyer",
                SettlementKind::Refund => "returned to the seller",
            };
            format!("Partial settlement: {amount} {direction}, {remaining} still in escrow. Tx: {tx_hash}")
        }
        NotificationEvent::TradeExpired { .. } => {
            "Trade expired before both parties joined. This room is being recycled.".to_owned()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::VenueId;
    use crate::events::notification_channel;
    use crate::messaging::GatewayError;
    use crate::testkit::{MemoryStore, RecordingGateway, funded_trade};
    use rust_decimal_macros::dec;

    struct Fixture {
        notifier: Notifier<MemoryStore, RecordingGateway>,
        store: Arc<MemoryStore>,
        gateway: Arc<RecordingGateway>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> (Fixture, crate::events::NotificationSender) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let (tx, events_rx) = notification_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier = Notifier::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            events_rx,
            shutdown_rx,
        );
        (
            Fixture {
                notifier,
                store,
                gateway,
                _shutdown_tx,
            },
            tx,
        )
    }

    /// A completed trade whose release hash matches the broadcast we are
    /// about to deliver.
    async fn completed_trade(store: &MemoryStore, tx_hash: &str) -> uuid::Uuid {
        let mut trade = funded_trade(10, 20, dec!(1000));
        trade.release_tx_hash = Some(tx_hash.to_owned());
        store.insert(&trade).await.unwrap();
        trade.trade_id
    }

    fn completed_event(trade_id: uuid::Uuid, tx_hash: &str) -> NotificationEvent {
        NotificationEvent::TradeCompleted {
            trade_id,
            venue: VenueId(-1),
            amount: dec!(1000),
            fee: dec!(0),
            tx_hash: tx_hash.to_owned(),
        }
    }

    #[tokio::test]
    async fn completed_broadcast_is_posted_exactly_once() {
        let (fx, _tx) = fixture();
        let trade_id = completed_trade(&fx.store, "0xdone").await;

        fx.notifier.deliver(completed_event(trade_id, "0xdone")).await;
        fx.notifier.deliver(completed_event(trade_id, "0xdone")).await;

        let texts = fx.gateway.sent_texts(VenueId(-1));
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("0xdone"));
    }

    #[tokio::test]
    async fn partial_deposit_notice_is_sent_at_most_once_per_trade() {
        let (fx, _tx) = fixture();
        let trade = funded_trade(10, 20, dec!(400));
        fx.store.insert(&trade).await.unwrap();
        let event = NotificationEvent::PartialDeposit {
            trade_id: trade.trade_id,
            venue: VenueId(-1),
            total: dec!(400),
            expected: dec!(1000),
        };

        fx.notifier.deliver(event.clone()).await;
        fx.notifier.deliver(event).await;

        assert_eq!(fx.gateway.sent_texts(VenueId(-1)).len(), 1);
    }

    #[tokio::test]
    async fn deposit_confirmations_are_not_deduplicated() {
        let (fx, _tx) = fixture();
        let trade = funded_trade(10, 20, dec!(1000));
        fx.store.insert(&trade).await.unwrap();
        let event = NotificationEvent::DepositConfirmed {
            trade_id: trade.trade_id,
            venue: VenueId(-1),
            amount: dec!(500),
            total: dec!(1000),
        };

        fx.notifier.deliver(event.clone()).await;
        fx.notifier.deliver(event).await;

        assert_eq!(fx.gateway.sent_texts(VenueId(-1)).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_is_swallowed_but_consumes_the_flag() {
        let (fx, _tx) = fixture();
        let trade_id = completed_trade(&fx.store, "0xdone").await;
        for _ in 0..crate::messaging::MAX_GATEWAY_ATTEMPTS {
            fx.gateway
                .queue_failure("send_message", GatewayError::Transport("down".into()));
        }

        fx.notifier.deliver(completed_event(trade_id, "0xdone")).await;

        assert!(fx.gateway.sent_texts(VenueId(-1)).is_empty());
        // The flag was consumed; a replay does not post either.
        fx.notifier.deliver(completed_event(trade_id, "0xdone")).await;
        assert!(fx.gateway.sent_texts(VenueId(-1)).is_empty());
    }

    #[tokio::test]
    async fn expiry_without_a_venue_is_dropped_quietly() {
        let (fx, _tx) = fixture();
        fx.notifier
            .deliver(NotificationEvent::TradeExpired {
                trade_id: uuid::Uuid::now_v7(),
                venue: None,
            })
            .await;
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn run_loop_drains_the_channel_and_stops_on_shutdown() {
        let (fx, tx) = fixture();
        let trade = funded_trade(10, 20, dec!(1000));
        fx.store.insert(&trade).await.unwrap();
        let gateway = Arc::clone(&fx.gateway);
        let shutdown_tx = fx._shutdown_tx;

        let handle = tokio::spawn(fx.notifier.run());
        tx.send(NotificationEvent::DepositConfirmed {
            trade_id: trade.trade_id,
            venue: VenueId(-1),
            amount: dec!(1000),
            total: dec!(1000),
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(gateway.sent_texts(VenueId(-1)).len(), 1);
    }
}
