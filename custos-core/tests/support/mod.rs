//! Shared harness for the integration suites: a fully wired trade engine
//! over the in-memory store, the scripted chain node and the recording
//! venue gateway.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use rust_decimal_macros::dec;

use custos_core::chain::ChainRegistry;
use custos_core::config::EscrowConfig;
use custos_core::engine::{Actor, JoinOutcome, Scheduler, TradeFlow};
use custos_core::entities::{ChainName, Terms, TokenSymbol, Trade, TradeRole, UserId, VenueId};
use custos_core::events::{
    NotificationReceiver, TimerReceiver, notification_channel, timer_channel,
};
use custos_core::testkit::{
    BUYER_ADDRESS, MemoryStore, RecordingGateway, SELLER_ADDRESS, ScriptedChain, TEST_CHAIN,
    test_config_with_escrow,
};

/// The two trade parties, and the admin id the testkit config grants.
pub const BUYER: i64 = 10;
pub const SELLER: i64 = 20;
pub const ADMIN: i64 = 900;

pub struct EngineHarness {
    pub flow: TradeFlow<MemoryStore, RecordingGateway>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<RecordingGateway>,
    pub chain: Arc<ScriptedChain>,
    pub events: NotificationReceiver,
    pub timers: Scheduler,
    _timers_rx: TimerReceiver,
}

impl EngineHarness {
    /// Harness with a zero recycle grace, so terminal trades may be
    /// recycled without waiting.
    pub async fn new() -> Self {
        Self::with_escrow(EscrowConfig {
            recycle_grace: Duration::ZERO,
            ..EscrowConfig::default()
        })
        .await
    }

    pub async fn with_escrow(escrow: EscrowConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(100);
        let registry =
            ChainRegistry::default().with_client(ChainName::new(TEST_CHAIN), chain.clone());
        let (tx, events) = notification_channel();
        let (timer_tx, _timers_rx) = timer_channel();
        let timers = Scheduler::new(timer_tx);
        let flow = TradeFlow::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            registry,
            test_config_with_escrow(escrow),
            tx,
            timers.clone(),
        );
        flow.provision_venues(&[VenueId(-1), VenueId(-2)])
            .await
            .expect("provision venue roster");
        Self {
            flow,
            store,
            gateway,
            chain,
            events,
            timers,
            _timers_rx,
        }
    }

    /// Walk a fresh trade to `AwaitingDeposit`: open, both parties join,
    /// claim roles, agree terms, set payout addresses, confirm.
    pub async fn open_to_awaiting_deposit(&self) -> Trade {
        let (trade, venue) = self
            .flow
            .open_trade(actor(BUYER))
            .await
            .expect("open trade");
        self.flow
            .record_join(venue.venue_id, actor(BUYER))
            .await
            .expect("buyer join");
        let joined = self
            .flow
            .record_join(venue.venue_id, actor(SELLER))
            .await
            .expect("seller join");
        assert!(matches!(
            joined,
            JoinOutcome::Approved {
                quorum_reached: true,
                ..
            }
        ));

        self.flow
            .claim_role(trade.trade_id, actor(BUYER), TradeRole::Buyer)
            .await
            .expect("buyer role");
        self.flow
            .claim_role(trade.trade_id, actor(SELLER), TradeRole::Seller)
            .await
            .expect("seller role");
        self.flow
            .set_terms(trade.trade_id, actor(BUYER), usdt_terms())
            .await
            .expect("terms");
        self.flow
            .set_address(trade.trade_id, actor(BUYER), BUYER_ADDRESS.into())
            .await
            .expect("buyer address");
        self.flow
            .set_address(trade.trade_id, actor(SELLER), SELLER_ADDRESS.into())
            .await
            .expect("seller address");
        self.flow
            .confirm_details(trade.trade_id, actor(BUYER))
            .await
            .expect("confirm details")
    }
}

pub fn actor(id: i64) -> Actor {
    Actor::new(UserId(id), None)
}

/// 1000 USDT on the scripted chain, paid over SEPA at a 0.98 rate.
pub fn usdt_terms() -> Terms {
    Terms {
        token: TokenSymbol::new("USDT"),
        chain: ChainName::new(TEST_CHAIN),
        quantity: dec!(1000),
        rate: dec!(0.98),
        payment_method: "SEPA".into(),
    }
}

/// Whole tokens in 18-decimal integer units.
pub fn wei(units: u64) -> U256 {
    U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
}
