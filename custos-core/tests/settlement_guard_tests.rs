//! Fund-movement guard rails: who may force a settlement, and which
//! amounts are allowed to reach the chain at all.

mod support;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use custos_core::engine::{ApprovalOutcome, EngineError};
use custos_core::entities::{SettlementKind, TradeStatus};
use custos_core::store::TradeStore;
use custos_core::testkit::{BUYER_ADDRESS, SELLER_ADDRESS, funded_trade};

use support::{ADMIN, BUYER, EngineHarness, SELLER, actor, wei};

#[tokio::test]
async fn non_positive_amounts_are_rejected_before_any_chain_call() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(1000));
    fx.store.insert(&trade).await.unwrap();

    for amount in [dec!(0), dec!(-25)] {
        let err = fx
            .flow
            .stage_partial(trade.trade_id, actor(SELLER), amount)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
    let err = fx
        .flow
        .force_release(trade.trade_id, actor(ADMIN), Some(Decimal::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(fx.chain.submit_attempts(), 0);
}

#[tokio::test]
async fn refund_exceeding_the_balance_never_reaches_the_chain() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(50));
    fx.store.insert(&trade).await.unwrap();

    let err = fx
        .flow
        .force_refund(trade.trade_id, actor(ADMIN), Some(dec!(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(fx.chain.submit_attempts(), 0);

    let untouched = fx.store.fetch(trade.trade_id).await.unwrap();
    assert_eq!(untouched.balance, dec!(50));
    assert_eq!(untouched.status, TradeStatus::ReadyToRelease);
}

#[tokio::test(start_paused = true)]
async fn only_admins_may_force_settlements() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(500));
    fx.store.insert(&trade).await.unwrap();

    for party in [BUYER, SELLER] {
        let err = fx
            .flow
            .force_release(trade.trade_id, actor(party), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
    }
    assert!(fx.chain.submissions().is_empty());

    let outcome = fx
        .flow
        .force_release(trade.trade_id, actor(ADMIN), None)
        .await
        .unwrap();
    assert!(outcome.exhausted);
    assert_eq!(outcome.trade.status, TradeStatus::Completed);
    assert_eq!(fx.chain.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dispute_resolution_may_split_across_both_sides() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(500));
    fx.store.insert(&trade).await.unwrap();

    fx.flow
        .open_dispute(trade.trade_id, actor(SELLER))
        .await
        .unwrap();

    // Part of the pot goes back to the seller; the dispute stays open.
    let refunded = fx
        .flow
        .force_refund(trade.trade_id, actor(ADMIN), Some(dec!(200)))
        .await
        .unwrap();
    assert!(!refunded.exhausted);
    assert_eq!(refunded.remaining, dec!(300));
    assert_eq!(refunded.trade.status, TradeStatus::Disputed);

    // The rest goes to the buyer and closes the trade out.
    let released = fx
        .flow
        .force_release(trade.trade_id, actor(ADMIN), None)
        .await
        .unwrap();
    assert!(released.exhausted);
    assert_eq!(released.trade.status, TradeStatus::Completed);
    assert_eq!(released.trade.balance, Decimal::ZERO);

    let submissions = fx.chain.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].kind, SettlementKind::Refund);
    assert_eq!(submissions[0].recipient, SELLER_ADDRESS);
    assert_eq!(submissions[0].amount_wei, wei(200));
    assert_eq!(submissions[1].kind, SettlementKind::Release);
    assert_eq!(submissions[1].recipient, BUYER_ADDRESS);
    assert_eq!(submissions[1].amount_wei, wei(300));
}

#[tokio::test(start_paused = true)]
async fn staging_a_partial_resets_standing_approvals() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(1000));
    fx.store.insert(&trade).await.unwrap();

    fx.flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    let staged = fx
        .flow
        .stage_partial(trade.trade_id, actor(SELLER), dec!(250))
        .await
        .unwrap();
    assert!(staged.release_approvals.is_empty());
    assert!(staged.refund_approvals.is_empty());
    assert_eq!(staged.pending_amount, Some(dec!(250)));

    // The earlier approval no longer counts toward the quorum.
    let after = fx
        .flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    assert!(matches!(after, ApprovalOutcome::Pending { .. }));
    let settled = fx
        .flow
        .approve_release(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let ApprovalOutcome::Settled(outcome) = settled else {
        panic!("expected the staged amount to settle");
    };
    assert_eq!(outcome.amount, dec!(250));
    assert_eq!(outcome.remaining, dec!(750));
    assert!(!outcome.exhausted);
}
