//! End-to-end engine scenarios: the full escrow walk, chunked and replayed
//! deposits, and the approval quorum under staged partial settlements.

mod support;

use alloy_primitives::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use custos_core::chain::ChainError;
use custos_core::engine::{ApprovalOutcome, DepositCheck};
use custos_core::entities::{SettlementKind, TradeStatus, UserId, VenueStatus};
use custos_core::events::{NotificationEvent, TimerKind};
use custos_core::store::{TradeStore, VenueStore};
use custos_core::testkit::{BUYER_ADDRESS, DEPOSIT_ADDRESS, GatewayCall, funded_trade, transfer};

use support::{BUYER, EngineHarness, SELLER, actor, wei};

#[tokio::test(start_paused = true)]
async fn full_escrow_round_trip_from_open_to_recycled_venue() {
    let mut fx = EngineHarness::new().await;
    let trade = fx.open_to_awaiting_deposit().await;
    let venue_id = trade.venue_id.unwrap();
    assert_eq!(trade.status, TradeStatus::AwaitingDeposit);
    assert_eq!(trade.last_checked_block, 100);
    let invite_before = fx
        .store
        .fetch_venue(venue_id)
        .await
        .unwrap()
        .invite_credential
        .unwrap();

    // The buyer funds the deposit address on chain.
    fx.chain
        .push_transfer(transfer("0xf00d", DEPOSIT_ADDRESS, wei(1000), 150));
    fx.chain.set_head(200);
    let check = fx
        .flow
        .check_deposit(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let DepositCheck::Credited {
        trade: funded,
        amount,
        full,
    } = check
    else {
        panic!("expected the deposit to credit");
    };
    assert!(full);
    assert_eq!(amount, dec!(1000));
    assert_eq!(funded.status, TradeStatus::Deposited);
    assert_eq!(funded.balance_wei, Some(wei(1000)));

    // Fiat leg.
    fx.flow
        .mark_fiat_sent(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    fx.flow
        .confirm_fiat_received(trade.trade_id, actor(SELLER))
        .await
        .unwrap();

    // Both parties sign off; the payout is submitted exactly once.
    let first = fx
        .flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    assert!(matches!(first, ApprovalOutcome::Pending { .. }));
    let second = fx
        .flow
        .approve_release(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let ApprovalOutcome::Settled(outcome) = second else {
        panic!("expected the second approval to settle");
    };
    assert!(outcome.exhausted);
    assert_eq!(outcome.amount_wei, wei(1000));
    assert_eq!(outcome.trade.status, TradeStatus::Completed);

    let submissions = fx.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, SettlementKind::Release);
    assert_eq!(submissions[0].recipient, BUYER_ADDRESS);
    assert_eq!(submissions[0].amount_wei, wei(1000));

    let mut saw_confirmed = false;
    let mut saw_completed = false;
    while let Ok(event) = fx.events.try_recv() {
        match event {
            NotificationEvent::DepositConfirmed { .. } => saw_confirmed = true,
            NotificationEvent::TradeCompleted { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_confirmed);
    assert!(saw_completed);

    // Either party may hand the venue back before the grace timer fires.
    assert!(fx.timers.is_armed(trade.trade_id, TimerKind::Recycle));
    fx.flow
        .recycle_trade(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    assert!(!fx.timers.is_armed(trade.trade_id, TimerKind::Recycle));

    let venue = fx.store.fetch_venue(venue_id).await.unwrap();
    assert_eq!(venue.status, VenueStatus::Available);
    assert!(venue.assigned_trade.is_none());
    assert_ne!(venue.invite_credential.unwrap(), invite_before);
    let calls = fx.gateway.calls();
    for user in [BUYER, SELLER] {
        assert!(calls.contains(&GatewayCall::RemoveMember {
            venue: venue_id,
            user: UserId(user),
        }));
    }
}

#[tokio::test]
async fn deposit_arriving_in_chunks_reaches_full_only_at_quantity() {
    let mut fx = EngineHarness::new().await;
    let trade = fx.open_to_awaiting_deposit().await;

    fx.chain
        .push_transfer(transfer("0xc1aa", DEPOSIT_ADDRESS, wei(400), 110));
    fx.chain.set_head(120);
    let first = fx
        .flow
        .check_deposit(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    let DepositCheck::Credited {
        trade: after_first,
        amount,
        full,
    } = first
    else {
        panic!("expected the first chunk to credit");
    };
    assert_eq!(amount, dec!(400));
    assert!(!full);
    assert_eq!(after_first.status, TradeStatus::Deposited);
    assert_eq!(after_first.balance, dec!(400));

    fx.chain
        .push_transfer(transfer("0xc1bb", DEPOSIT_ADDRESS, wei(600), 130));
    fx.chain.set_head(140);
    let second = fx
        .flow
        .check_deposit(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let DepositCheck::Credited {
        trade: after_second,
        amount,
        full,
    } = second
    else {
        panic!("expected the second chunk to credit");
    };
    assert_eq!(amount, dec!(600));
    assert!(full);
    assert_eq!(after_second.balance, dec!(1000));
    assert_eq!(after_second.balance_wei, Some(wei(1000)));
    assert_eq!(after_second.seen_deposit_hashes.len(), 2);

    let mut saw_partial = false;
    let mut saw_confirmed = false;
    while let Ok(event) = fx.events.try_recv() {
        match event {
            NotificationEvent::PartialDeposit { total, .. } => {
                saw_partial = true;
                assert_eq!(total, dec!(400));
            }
            NotificationEvent::DepositConfirmed { total, .. } => {
                saw_confirmed = true;
                assert_eq!(total, dec!(1000));
            }
            _ => {}
        }
    }
    assert!(saw_partial);
    assert!(saw_confirmed);
}

#[tokio::test]
async fn rescanning_a_credited_window_never_double_counts() {
    let fx = EngineHarness::new().await;
    let trade = fx.open_to_awaiting_deposit().await;

    fx.chain
        .push_transfer(transfer("0xd0d0", DEPOSIT_ADDRESS, wei(1000), 150));
    fx.chain.set_head(200);
    let first = fx
        .flow
        .check_deposit(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    assert!(matches!(first, DepositCheck::Credited { .. }));

    // Rewind the cursor as an operator would after a reorg. The node errors
    // and the explorer re-serves the very same transfer, differently cased.
    let mut rewound = fx.store.fetch(trade.trade_id).await.unwrap();
    rewound.last_checked_block = 100;
    fx.store.persist(&rewound, &[]).await.unwrap();
    fx.chain
        .queue_scan_failure(ChainError::Rpc("node restarting".into()));
    fx.chain
        .push_explorer_transfer(transfer("0xD0D0", DEPOSIT_ADDRESS, wei(1000), 150));

    let second = fx
        .flow
        .check_deposit(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    assert_eq!(second, DepositCheck::NoNewDeposit { scanned_to: 200 });

    let unchanged = fx.store.fetch(trade.trade_id).await.unwrap();
    assert_eq!(unchanged.balance, dec!(1000));
    assert_eq!(unchanged.balance_wei, Some(wei(1000)));
    assert_eq!(unchanged.seen_deposit_hashes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_approval_by_the_same_user_stays_pending() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(1000));
    fx.store.insert(&trade).await.unwrap();

    let first = fx
        .flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    let ApprovalOutcome::Pending { trade: after_first } = first else {
        panic!("expected the first approval to stay pending");
    };
    assert_eq!(after_first.release_approvals.len(), 1);

    let repeat = fx
        .flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    let ApprovalOutcome::Pending {
        trade: after_repeat,
    } = repeat
    else {
        panic!("expected the repeat approval to stay pending");
    };
    assert_eq!(after_repeat.release_approvals.len(), 1);
    assert!(fx.chain.submissions().is_empty());

    // The counterparty's approval is the one that completes the quorum.
    let settled = fx
        .flow
        .approve_release(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    assert!(matches!(settled, ApprovalOutcome::Settled(_)));
    assert_eq!(fx.chain.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn staged_partial_then_remainder_zeroes_the_trade() {
    let fx = EngineHarness::new().await;
    let trade = funded_trade(BUYER, SELLER, dec!(1000));
    fx.store.insert(&trade).await.unwrap();

    fx.flow
        .stage_partial(trade.trade_id, actor(SELLER), dec!(400))
        .await
        .unwrap();
    let first = fx
        .flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    assert!(matches!(first, ApprovalOutcome::Pending { .. }));
    let second = fx
        .flow
        .approve_release(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let ApprovalOutcome::Settled(partial) = second else {
        panic!("expected the staged amount to settle");
    };
    assert!(!partial.exhausted);
    assert_eq!(partial.amount_wei, wei(400));
    assert_eq!(partial.remaining, dec!(600));
    assert_eq!(partial.trade.status, TradeStatus::ReadyToRelease);
    assert!(partial.trade.release_approvals.is_empty());
    assert!(partial.trade.pending_amount.is_none());

    // The remainder pays out with the stored wei balance verbatim.
    fx.flow
        .approve_release(trade.trade_id, actor(BUYER))
        .await
        .unwrap();
    let third = fx
        .flow
        .approve_release(trade.trade_id, actor(SELLER))
        .await
        .unwrap();
    let ApprovalOutcome::Settled(full) = third else {
        panic!("expected the remainder to settle");
    };
    assert!(full.exhausted);
    assert_eq!(full.amount_wei, wei(600));
    assert_eq!(full.trade.status, TradeStatus::Completed);
    assert_eq!(full.trade.balance, Decimal::ZERO);
    assert_eq!(full.trade.balance_wei, Some(U256::ZERO));

    let submissions = fx.chain.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].amount_wei + submissions[1].amount_wei, wei(1000));
}
