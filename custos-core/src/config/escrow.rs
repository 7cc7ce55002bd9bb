//! Engine timing and economics knobs.

use std::time::Duration;

use rust_decimal::Decimal;

/// Validated escrow engine configuration. Defaults match the values the
/// service has historically run with.
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Service fee, percent. Reported in settlement summaries; never alters
    /// the transferred amount.
    pub fee_percent: Decimal,
    /// How long a draft may wait for its second participant.
    pub join_timeout: Duration,
    /// Grace period between a terminal settlement and automatic venue
    /// recycling, so final messages can be read.
    pub recycle_grace: Duration,
    /// Interval of the deadline/reconciliation sweeps.
    pub sweep_interval: Duration,
    /// Maximum block span per transfer-log query.
    pub deposit_chunk: u64,
    /// Confirmation polling: attempts x interval per submitted settlement.
    pub confirm_attempts: u32,
    pub confirm_poll: Duration,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            fee_percent: Decimal::ZERO,
            join_timeout: Duration::from_secs(10 * 60),
            recycle_grace: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            deposit_chunk: 500,
            confirm_attempts: 3,
            confirm_poll: Duration::from_secs(60),
        }
    }
}
