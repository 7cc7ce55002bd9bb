//! Deadline sweeper.
//!
//! The scheduler's in-process timers die with the process; the deadlines
//! themselves live on the trade rows (`join_deadline`, `recycle_after`).
//! This processor polls the store on a fixed interval and lets [`TradeFlow`]
//! act on whatever is due, so a restart only delays a deadline by one sweep.
//! The conditional deletes and writes underneath make a sweep racing a live
//! timer safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::messaging::VenueGateway;
use crate::store::{TradeStore, VenueStore};

use super::flow::TradeFlow;

/// DeadlineSweeper expires overdue drafts and recycles settled venues.
pub struct DeadlineSweeper<S, G> {
    flow: Arc<TradeFlow<S, G>>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, G> DeadlineSweeper<S, G>
where
    S: TradeStore + VenueStore,
    G: VenueGateway,
{
    pub fn new(
        flow: Arc<TradeFlow<S, G>>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            flow,
            interval,
            shutdown_rx,
        }
    }

    /// Run the sweeper until shutdown.
    pub async fn run(mut self) {
        info!("DeadlineSweeper started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("DeadlineSweeper received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("DeadlineSweeper shutdown complete");
    }

    /// One pass over both deadline kinds.
    async fn sweep(&self) {
        match self.flow.expire_due_drafts().await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "expired overdue drafts"),
            Err(err) => warn!(error = %err, "draft expiry sweep failed"),
        }
        match self.flow.recycle_due_trades().await {
            Ok(0) => {}
            Ok(recycled) => info!(recycled, "recycled settled venues"),
            Err(err) => warn!(error = %err, "venue recycle sweep failed"),
        }
    }
}
