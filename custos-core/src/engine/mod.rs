//! The orchestration engine: trade lifecycle, deposit watching, settlement
//! execution, venue pooling, and the background sweeps.

mod authz;
mod flow;
mod notifier;
mod reconciler;
mod scheduler;
mod settlement;
mod sweeper;
mod venues;
mod watcher;

pub use authz::{AccessRule, Actor, AuthorizationPolicy};
pub use flow::{ApprovalOutcome, JoinOutcome, TradeFlow};
pub use notifier::Notifier;
pub use reconciler::Reconciler;
pub use scheduler::{Scheduler, TimerDispatch};
pub use settlement::{SettlementEngine, SettlementOutcome};
pub use sweeper::DeadlineSweeper;
pub use venues::VenuePool;
pub use watcher::{DepositCheck, DepositWatcher};

use uuid::Uuid;

use crate::chain::ChainError;
use crate::messaging::GatewayError;
use crate::store::StoreError;
use crate::utils::units::UnitsError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request contradicts the trade's current state or terms.
    #[error("{0}")]
    Validation(String),
    #[error("not allowed: {0}")]
    Authorization(&'static str),
    #[error("no venue available for a new trade")]
    NoVenueAvailable,
    /// A settlement for this trade is mid-submission elsewhere; the caller's
    /// approval is recorded and nothing else needs to happen.
    #[error("settlement already in flight for trade {0}")]
    SettlementInFlight(Uuid),
    /// The payout was submitted but no receipt appeared within the polling
    /// budget. The trade keeps a verification marker; the reconciler owns it
    /// from here.
    #[error("transaction {tx_hash} unconfirmed after {attempts} receipt checks")]
    VerificationTimeout { tx_hash: String, attempts: u32 },
    #[error(transparent)]
    Units(#[from] UnitsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl EngineError {
    fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
