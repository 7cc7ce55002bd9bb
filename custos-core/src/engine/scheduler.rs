//! In-process deadline timers.
//!
//! The scheduler arms one cancellable timer per (trade, kind). A fire pushes
//! [`TimerFired`] onto the timer channel, where [`TimerDispatch`] resolves it
//! against the stored record. Timers are an acceleration, not the source of
//! truth: every deadline also lives on the trade row (`join_deadline`,
//! `recycle_after`) and the deadline sweeper picks up whatever a restart or a
//! full channel lost. A stale fire is harmless for the same reason; the
//! dispatch path re-checks the persisted deadline before acting.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{TimerFired, TimerKind, TimerReceiver, TimerSender};
use crate::messaging::VenueGateway;
use crate::store::{TradeStore, VenueStore};

use super::flow::TradeFlow;

/// Scheduler owns the per-trade deadline timers.
#[derive(Clone)]
pub struct Scheduler {
    timers: Arc<DashMap<(Uuid, TimerKind), JoinHandle<()>>>,
    fired_tx: TimerSender,
}

impl Scheduler {
    pub fn new(fired_tx: TimerSender) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            fired_tx,
        }
    }

    /// Arm (or re-arm) the timer for this (trade, kind). A deadline already
    /// in the past fires on the next tick.
    pub fn schedule(&self, trade_id: Uuid, kind: TimerKind, fire_at: OffsetDateTime) {
        let delay = Duration::try_from(fire_at - OffsetDateTime::now_utc())
            .unwrap_or(Duration::ZERO);
        debug!(trade = %trade_id, ?kind, delay_s = delay.as_secs(), "timer armed");

        let timers = Arc::clone(&self.timers);
        let fired_tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove(&(trade_id, kind));
            if fired_tx.send(TimerFired { trade_id, kind }).await.is_err() {
                warn!(trade = %trade_id, ?kind, "timer channel closed, fire dropped");
            }
        });
        if let Some(previous) = self.timers.insert((trade_id, kind), handle) {
            previous.abort();
        }
    }

    /// Disarm one timer. Cancelling a timer that already fired (or was never
    /// armed) is a no-op.
    pub fn cancel(&self, trade_id: Uuid, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&(trade_id, kind)) {
            handle.abort();
            debug!(trade = %trade_id, ?kind, "timer cancelled");
        }
    }

    /// Disarm every timer for a trade (teardown paths).
    pub fn cancel_all(&self, trade_id: Uuid) {
        for kind in [TimerKind::JoinTimeout, TimerKind::Recycle] {
            self.cancel(trade_id, kind);
        }
    }

    pub fn is_armed(&self, trade_id: Uuid, kind: TimerKind) -> bool {
        self.timers.contains_key(&(trade_id, kind))
    }
}

/// TimerDispatch drains the timer channel and applies each fire to the flow.
pub struct TimerDispatch<S, G> {
    flow: Arc<TradeFlow<S, G>>,
    timers_rx: TimerReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, G> TimerDispatch<S, G>
where
    S: TradeStore + VenueStore,
    G: VenueGateway,
{
    pub fn new(
        flow: Arc<TradeFlow<S, G>>,
        timers_rx: TimerReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            flow,
            timers_rx,
            shutdown_rx,
        }
    }

    /// Run the dispatcher until shutdown.
    pub async fn run(mut self) {
        info!("TimerDispatch started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("TimerDispatch received shutdown signal");
                        break;
                    }
                }

                Some(fired) = self.timers_rx.recv() => {
                    if let Err(err) = self.dispatch(fired).await {
                        warn!(
                            trade = %fired.trade_id,
                            kind = ?fired.kind,
                            error = %err,
                            "timer fire failed, the sweeper will retry"
                        );
                    }
                }

                else => {
                    info!("timer channel closed");
                    break;
                }
            }
        }

        info!("TimerDispatch shutdown complete");
    }

    async fn dispatch(&self, fired: TimerFired) -> Result<(), super::EngineError> {
        let acted = match fired.kind {
            TimerKind::JoinTimeout => self.flow.expire_if_due(fired.trade_id).await?,
            TimerKind::Recycle => self.flow.recycle_if_due(fired.trade_id).await?,
        };
        if !acted {
            debug!(
                trade = %fired.trade_id,
                kind = ?fired.kind,
                "timer fire was stale, nothing to do"
            );
        }
        Ok(())
    }
}
