//! The trade state machine, end to end.
//!
//! Every operation follows the same shape: fetch the current record,
//! authorize the actor, validate against the current status, then write
//! through a conditional store operation. Racing writers lose the
//! conditional write, never the invariant.

use std::collections::BTreeSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::chain::ChainRegistry;
use crate::config::{SharedConfig, valid_address};
use crate::entities::{
    Participant, SettlementKind, Terms, Trade, TradeRole, TradeStatus, Venue, VenueId,
};
use crate::events::{NotificationEvent, NotificationSender, TimerKind};
use crate::messaging::{VenueGateway, with_retry};
use crate::store::{StoreError, TradeStore, VenueStore};

use super::authz::{AccessRule, Actor, AuthorizationPolicy};
use super::scheduler::Scheduler;
use super::settlement::{SettlementEngine, SettlementOutcome};
use super::venues::VenuePool;
use super::watcher::{DepositCheck, DepositWatcher};
use super::EngineError;

/// Non-terminal statuses: what "the trade bound to this venue" means.
const ACTIVE: [TradeStatus; 7] = [
    TradeStatus::Draft,
    TradeStatus::AwaitingDetails,
    TradeStatus::AwaitingDeposit,
    TradeStatus::Deposited,
    TradeStatus::InFiatTransfer,
    TradeStatus::ReadyToRelease,
    TradeStatus::Disputed,
];

/// Outcome of a venue join request.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Approved {
        trade: Box<Trade>,
        /// This join completed the pair and the trade moved on to
        /// detail-gathering.
        quorum_reached: bool,
    },
    Declined {
        reason: &'static str,
    },
}

/// Outcome of a settlement approval.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// Approval recorded; the counterparty has not approved yet.
    Pending { trade: Box<Trade> },
    /// This approval completed the quorum and the settlement went through.
    Settled(Box<SettlementOutcome>),
    /// Quorum was already met and another caller is mid-settlement; this
    /// approval changes nothing.
    InFlight,
}

pub struct TradeFlow<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    chains: ChainRegistry,
    config: SharedConfig,
    authz: AuthorizationPolicy,
    venues: VenuePool<S, G>,
    watcher: DepositWatcher<S>,
    settlements: SettlementEngine<S>,
    notifications: NotificationSender,
    timers: Scheduler,
}

impl<S, G> TradeFlow<S, G>
where
    S: TradeStore + VenueStore,
    G: VenueGateway,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        chains: ChainRegistry,
        config: SharedConfig,
        notifications: NotificationSender,
        timers: Scheduler,
    ) -> Self {
        let authz = AuthorizationPolicy::new(config.admin.clone());
        let venues = VenuePool::new(Arc::clone(&store), Arc::clone(&gateway));
        let watcher = DepositWatcher::new(Arc::clone(&store), chains.clone(), config.clone());
        let settlements = SettlementEngine::new(Arc::clone(&store), chains.clone(), config.clone());
        Self {
            store,
            gateway,
            chains,
            config,
            authz,
            venues,
            watcher,
            settlements,
            notifications,
            timers,
        }
    }

    /// The settlement engine, shared with the reconciler.
    pub fn settlements(&self) -> &SettlementEngine<S> {
        &self.settlements
    }

    /// Provision the configured venue roster (startup).
    pub async fn provision_venues(&self, venue_ids: &[VenueId]) -> Result<(), EngineError> {
        self.venues.ensure_roster(venue_ids).await
    }

    /// Open a new trade: claim a venue from the pool, bind it, start the
    /// join-deadline clock.
    pub async fn open_trade(&self, creator: Actor) -> Result<(Trade, Venue), EngineError> {
        let mut trade = Trade::new(Participant::new(creator.user, creator.handle));
        let venue = self.venues.assign(trade.trade_id).await?;
        let deadline = OffsetDateTime::now_utc() + self.config.escrow.join_timeout;
        trade.venue_id = Some(venue.venue_id);
        trade.join_deadline = Some(deadline);

        if let Err(err) = self.store.insert(&trade).await {
            if let Err(reclaim_err) = self.venues.reclaim(venue.venue_id, &BTreeSet::new()).await {
                tracing::warn!(
                    venue = %venue.venue_id,
                    error = %reclaim_err,
                    "failed to return venue after trade insert error"
                );
            }
            return Err(err.into());
        }
        self.timers
            .schedule(trade.trade_id, TimerKind::JoinTimeout, deadline);
        tracing::info!(
            trade = %trade.trade_id,
            venue = %venue.venue_id,
            creator = %trade.creator.user,
            "trade opened"
        );
        Ok((trade, venue))
    }

    /// Handle a join request on a venue.
    ///
    /// The creator and one counterparty are admitted; everyone else is
    /// declined. The second admission reaches quorum, but only after a live
    /// membership probe confirms both users are actually in the room (an
    /// approved user may have left again before this point).
    pub async fn record_join(
        &self,
        venue_id: VenueId,
        joiner: Actor,
    ) -> Result<JoinOutcome, EngineError> {
        let Some(trade) = self.store.fetch_by_venue(venue_id, &ACTIVE).await? else {
            with_retry(|| self.gateway.decline_join(venue_id, joiner.user)).await?;
            return Ok(JoinOutcome::Declined {
                reason: "venue has no active trade",
            });
        };
        if trade.joined.len() >= 2 && !trade.joined.contains(&joiner.user) {
            with_retry(|| self.gateway.decline_join(venue_id, joiner.user)).await?;
            return Ok(JoinOutcome::Declined {
                reason: "trade already has both participants",
            });
        }

        with_retry(|| self.gateway.approve_join(venue_id, joiner.user)).await?;
        let updated = self.store.add_joined(trade.trade_id, joiner.user).await?;

        if updated.status != TradeStatus::Draft || updated.joined.len() < 2 {
            return Ok(JoinOutcome::Approved {
                trade: Box::new(updated),
                quorum_reached: false,
            });
        }

        for user in &updated.joined {
            let present = match with_retry(|| self.gateway.is_member(venue_id, *user)).await {
                Ok(present) => present,
                Err(err) => {
                    tracing::warn!(
                        trade = %updated.trade_id,
                        user = %user,
                        error = %err,
                        "membership probe failed, deferring quorum"
                    );
                    false
                }
            };
            if !present {
                return Ok(JoinOutcome::Approved {
                    trade: Box::new(updated),
                    quorum_reached: false,
                });
            }
        }

        let mut quorate = updated.clone();
        quorate.status = TradeStatus::AwaitingDetails;
        quorate.join_deadline = None;
        match self.store.persist(&quorate, &[TradeStatus::Draft]).await {
            Ok(()) => {
                self.timers.cancel(quorate.trade_id, TimerKind::JoinTimeout);
                tracing::info!(trade = %quorate.trade_id, "both participants joined");
                Ok(JoinOutcome::Approved {
                    trade: Box::new(quorate),
                    quorum_reached: true,
                })
            }
            // A concurrent join won the transition.
            Err(StoreError::Conflict(_)) => {
                let current = self.store.fetch(updated.trade_id).await?;
                Ok(JoinOutcome::Approved {
                    trade: Box::new(current),
                    quorum_reached: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Claim the buyer or seller side.
    pub async fn claim_role(
        &self,
        trade_id: Uuid,
        actor: Actor,
        role: TradeRole,
    ) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::Participant, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::AwaitingDetails])?;

        if trade
            .participant(role)
            .is_some_and(|holder| holder.user != actor.user)
        {
            return Err(EngineError::validation(format!(
                "the {} role is already claimed",
                role.as_str()
            )));
        }
        if trade
            .participant(role.opposite())
            .is_some_and(|holder| holder.user == actor.user)
        {
            return Err(EngineError::validation("one user cannot hold both roles"));
        }

        let slot = Some(Participant::new(actor.user, actor.handle));
        match role {
            TradeRole::Buyer => trade.buyer = slot,
            TradeRole::Seller => trade.seller = slot,
        }
        self.store
            .persist(&trade, &[TradeStatus::AwaitingDetails])
            .await?;
        Ok(trade)
    }

    /// Set (or replace) the agreed terms. Changing the chain invalidates any
    /// payout addresses entered for the previous one.
    pub async fn set_terms(
        &self,
        trade_id: Uuid,
        actor: Actor,
        terms: Terms,
    ) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::Participant, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::AwaitingDetails])?;

        if terms.quantity <= Decimal::ZERO {
            return Err(EngineError::validation("quantity must be positive"));
        }
        if terms.rate <= Decimal::ZERO {
            return Err(EngineError::validation("rate must be positive"));
        }
        if terms.payment_method.trim().is_empty() {
            return Err(EngineError::validation("payment method is required"));
        }
        if self.config.chains.get(&terms.chain).is_none() {
            return Err(EngineError::validation(format!(
                "chain '{}' is not configured",
                terms.chain
            )));
        }
        if self
            .config
            .contracts
            .resolve(&terms.token, &terms.chain, trade.venue_id)
            .is_none()
        {
            return Err(EngineError::validation(format!(
                "{} is not supported on {}",
                terms.token, terms.chain
            )));
        }

        if trade.terms.as_ref().is_some_and(|t| t.chain != terms.chain) {
            trade.buyer_address = None;
            trade.seller_address = None;
        }
        trade.terms = Some(terms);
        self.store
            .persist(&trade, &[TradeStatus::AwaitingDetails])
            .await?;
        Ok(trade)
    }

    /// Record the caller's payout address for their claimed role.
    pub async fn set_address(
        &self,
        trade_id: Uuid,
        actor: Actor,
        address: String,
    ) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::RoleHolder, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::AwaitingDetails])?;

        let role = trade
            .role_of(actor.user)
            .ok_or(EngineError::Authorization("requires a claimed trade role"))?;
        let chain = trade
            .terms
            .as_ref()
            .map(|t| t.chain.clone())
            .ok_or_else(|| EngineError::validation("set terms before the payout address"))?;
        let family = self.config.chains.family_of(&chain).ok_or_else(|| {
            EngineError::validation(format!("chain '{chain}' is not configured"))
        })?;

        let address = address.trim().to_owned();
        if !valid_address(family, &address) {
            return Err(EngineError::validation(format!(
                "address is not valid for chain '{chain}'"
            )));
        }
        match role {
            TradeRole::Buyer => trade.buyer_address = Some(address),
            TradeRole::Seller => trade.seller_address = Some(address),
        }
        self.store
            .persist(&trade, &[TradeStatus::AwaitingDetails])
            .await?;
        Ok(trade)
    }

    /// Lock the details and hand out the deposit address. Deposit scanning
    /// starts at the chain head as of this moment.
    pub async fn confirm_details(&self, trade_id: Uuid, actor: Actor) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::Participant, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::AwaitingDetails])?;

        if !trade.details_complete() {
            return Err(EngineError::validation(
                "both roles, the terms and both payout addresses are required first",
            ));
        }
        let terms = trade
            .terms
            .as_ref()
            .ok_or_else(|| EngineError::validation("trade terms are not set"))?;
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
        let head = self.chains.client(&terms.chain)?.head_block().await?;

        trade.deposit_address = Some(entry.deposit_address.clone());
        trade.last_checked_block = head;
        trade.status = TradeStatus::AwaitingDeposit;
        self.store
            .persist(&trade, &[TradeStatus::AwaitingDetails])
            .await?;
        tracing::info!(
            trade = %trade.trade_id,
            deposit_address = %entry.deposit_address,
            from_block = head,
            "details confirmed, awaiting deposit"
        );
        Ok(trade)
    }

    /// Scan for new deposits and credit them.
    pub async fn check_deposit(
        &self,
        trade_id: Uuid,
        actor: Actor,
    ) -> Result<DepositCheck, EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::Participant, &actor, Some(&trade))
            .await?;
        require_status(
            &trade,
            &[TradeStatus::AwaitingDeposit, TradeStatus::Deposited],
        )?;

        let check = self.watcher.check(&trade).await?;
        if let DepositCheck::Credited {
            trade: updated,
            amount,
            full,
        } = &check
        {
            if let Some(venue) = updated.venue_id {
                if *full {
                    self.notify(NotificationEvent::DepositConfirmed {
                        trade_id,
                        venue,
                        amount: *amount,
                        total: updated.balance,
                    })
                    .await;
                } else if let Some(terms) = &updated.terms {
                    self.notify(NotificationEvent::PartialDeposit {
                        trade_id,
                        venue,
                        total: updated.balance,
                        expected: terms.quantity,
                    })
                    .await;
                }
            }
        }
        Ok(check)
    }

    /// Buyer attests the fiat payment went out.
    pub async fn mark_fiat_sent(&self, trade_id: Uuid, actor: Actor) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::BuyerOnly, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::Deposited])?;

        trade.status = TradeStatus::InFiatTransfer;
        self.store
            .persist(&trade, &[TradeStatus::Deposited])
            .await?;
        Ok(trade)
    }

    /// Seller attests the fiat payment arrived.
    pub async fn confirm_fiat_received(
        &self,
        trade_id: Uuid,
        actor: Actor,
    ) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::SellerOnly, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::InFiatTransfer])?;

        trade.status = TradeStatus::ReadyToRelease;
        self.store
            .persist(&trade, &[TradeStatus::InFiatTransfer])
            .await?;
        Ok(trade)
    }

    pub async fn approve_release(
        &self,
        trade_id: Uuid,
        actor: Actor,
    ) -> Result<ApprovalOutcome, EngineError> {
        self.approve_settlement(trade_id, actor, SettlementKind::Release)
            .await
    }

    pub async fn approve_refund(
        &self,
        trade_id: Uuid,
        actor: Actor,
    ) -> Result<ApprovalOutcome, EngineError> {
        self.approve_settlement(trade_id, actor, SettlementKind::Refund)
            .await
    }

    pub async fn decline_release(&self, trade_id: Uuid, actor: Actor) -> Result<Trade, EngineError> {
        self.decline_settlement(trade_id, actor, SettlementKind::Release)
            .await
    }

    pub async fn decline_refund(&self, trade_id: Uuid, actor: Actor) -> Result<Trade, EngineError> {
        self.decline_settlement(trade_id, actor, SettlementKind::Refund)
            .await
    }

    /// Stage a partial settlement amount. Both parties must approve again:
    /// staging wipes the approval sets of both kinds.
    pub async fn stage_partial(
        &self,
        trade_id: Uuid,
        actor: Actor,
        amount: Decimal,
    ) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::RoleHolder, &actor, Some(&trade))
            .await?;
        require_status(
            &trade,
            &[TradeStatus::ReadyToRelease, TradeStatus::Disputed],
        )?;

        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("partial amount must be positive"));
        }
        if amount > trade.balance {
            return Err(EngineError::validation(format!(
                "partial amount {amount} exceeds held balance {}",
                trade.balance
            )));
        }

        let expected = trade.status;
        trade.pending_amount = Some(amount);
        trade.release_approvals.clear();
        trade.refund_approvals.clear();
        self.store.persist(&trade, &[expected]).await?;
        Ok(trade)
    }

    /// Either party freezes the trade for admin attention.
    pub async fn open_dispute(&self, trade_id: Uuid, actor: Actor) -> Result<Trade, EngineError> {
        let mut trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::Participant, &actor, Some(&trade))
            .await?;
        require_status(
            &trade,
            &[
                TradeStatus::Deposited,
                TradeStatus::InFiatTransfer,
                TradeStatus::ReadyToRelease,
            ],
        )?;

        let expected = trade.status;
        trade.status = TradeStatus::Disputed;
        self.store.persist(&trade, &[expected]).await?;
        tracing::info!(trade = %trade.trade_id, by = %actor.user, "dispute opened");
        Ok(trade)
    }

    /// Admin resolution: pay (part of) the balance to the buyer, bypassing
    /// the approval quorum.
    pub async fn force_release(
        &self,
        trade_id: Uuid,
        actor: Actor,
        amount: Option<Decimal>,
    ) -> Result<SettlementOutcome, EngineError> {
        self.force_settlement(trade_id, actor, SettlementKind::Release, amount)
            .await
    }

    /// Admin resolution: return (part of) the balance to the seller.
    pub async fn force_refund(
        &self,
        trade_id: Uuid,
        actor: Actor,
        amount: Option<Decimal>,
    ) -> Result<SettlementOutcome, EngineError> {
        self.force_settlement(trade_id, actor, SettlementKind::Refund, amount)
            .await
    }

    /// Tear down a trade that never held funds and return its venue.
    pub async fn close_trade(&self, trade_id: Uuid, actor: Actor) -> Result<(), EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::ParticipantOrAdmin, &actor, Some(&trade))
            .await?;
        let closable = [
            TradeStatus::Draft,
            TradeStatus::AwaitingDetails,
            TradeStatus::AwaitingDeposit,
        ];
        require_status(&trade, &closable)?;
        if trade.balance > Decimal::ZERO {
            return Err(EngineError::validation(
                "funds are held; settle or dispute instead",
            ));
        }

        if !self.store.delete(trade_id, &closable).await? {
            return Err(EngineError::validation(
                "the trade advanced concurrently, re-check its state",
            ));
        }
        self.timers.cancel_all(trade_id);
        if let Some(venue_id) = trade.venue_id {
            self.venues.reclaim(venue_id, &trade.joined).await?;
        }
        tracing::info!(trade = %trade_id, by = %actor.user, "trade closed");
        Ok(())
    }

    /// Recycle a terminal trade's venue now, without waiting for the grace
    /// deadline. Either party may trigger this once the trade is settled.
    pub async fn recycle_trade(&self, trade_id: Uuid, actor: Actor) -> Result<(), EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::ParticipantOrAdmin, &actor, Some(&trade))
            .await?;
        require_status(&trade, &[TradeStatus::Completed, TradeStatus::Refunded])?;
        self.recycle(&trade).await
    }

    pub async fn get_trade(&self, trade_id: Uuid) -> Result<Trade, EngineError> {
        Ok(self.store.fetch(trade_id).await?)
    }

    pub async fn list_trades(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>, EngineError> {
        Ok(self.store.list(statuses).await?)
    }

    pub async fn list_venues(&self) -> Result<Vec<Venue>, EngineError> {
        Ok(self.store.list_venues().await?)
    }

    /// Sweep entry: delete drafts whose join deadline has passed and free
    /// their venues. Returns how many drafts were expired.
    pub async fn expire_due_drafts(&self) -> Result<usize, EngineError> {
        let due = self
            .store
            .join_timeouts_due(OffsetDateTime::now_utc())
            .await?;
        let mut expired = 0;
        for trade in due {
            match self.expire_draft(&trade).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        trade = %trade.trade_id,
                        error = %err,
                        "draft expiry failed"
                    );
                }
            }
        }
        Ok(expired)
    }

    /// Sweep entry: recycle venues of terminal trades whose grace deadline
    /// has passed. Returns how many were recycled.
    pub async fn recycle_due_trades(&self) -> Result<usize, EngineError> {
        let due = self.store.recycles_due(OffsetDateTime::now_utc()).await?;
        let mut recycled = 0;
        for trade in due {
            match self.recycle(&trade).await {
                Ok(()) => recycled += 1,
                Err(err) => {
                    tracing::warn!(
                        trade = %trade.trade_id,
                        error = %err,
                        "venue recycle failed"
                    );
                }
            }
        }
        Ok(recycled)
    }

    /// Timer entry: a join-window timer fired. Expires the draft if the
    /// record still carries the deadline; a trade that reached quorum (or
    /// was already torn down) is left alone.
    pub async fn expire_if_due(&self, trade_id: Uuid) -> Result<bool, EngineError> {
        let trade = match self.store.fetch(trade_id).await {
            Ok(trade) => trade,
            Err(StoreError::TradeNotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if trade.status != TradeStatus::Draft || trade.join_deadline.is_none() {
            return Ok(false);
        }
        self.expire_draft(&trade).await
    }

    /// Timer entry: a recycle-grace timer fired. Recycles the venue if the
    /// trade is still terminal with the deadline in place.
    pub async fn recycle_if_due(&self, trade_id: Uuid) -> Result<bool, EngineError> {
        let trade = match self.store.fetch(trade_id).await {
            Ok(trade) => trade,
            Err(StoreError::TradeNotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if !trade.status.is_terminal() || trade.recycle_after.is_none() {
            return Ok(false);
        }
        self.recycle(&trade).await?;
        Ok(true)
    }

    async fn approve_settlement(
        &self,
        trade_id: Uuid,
        actor: Actor,
        kind: SettlementKind,
    ) -> Result<ApprovalOutcome, EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::RoleHolder, &actor, Some(&trade))
            .await?;
        require_status(&trade, settleable_from(kind))?;

        let updated = self.store.add_approval(trade_id, kind, actor.user).await?;
        if !updated.has_settlement_quorum(kind) {
            return Ok(ApprovalOutcome::Pending {
                trade: Box::new(updated),
            });
        }

        let amount = updated.pending_amount;
        match self.settle(&updated, kind, amount).await {
            Ok(outcome) => Ok(ApprovalOutcome::Settled(Box::new(outcome))),
            Err(EngineError::SettlementInFlight(_)) => Ok(ApprovalOutcome::InFlight),
            Err(err) => Err(err),
        }
    }

    async fn decline_settlement(
        &self,
        trade_id: Uuid,
        actor: Actor,
        kind: SettlementKind,
    ) -> Result<Trade, EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::RoleHolder, &actor, Some(&trade))
            .await?;
        require_status(&trade, settleable_from(kind))?;

        let mut updated = self.store.clear_approvals(trade_id, kind).await?;
        if updated.pending_amount.is_some() {
            let expected = updated.status;
            updated.pending_amount = None;
            self.store.persist(&updated, &[expected]).await?;
        }
        tracing::info!(
            trade = %trade_id,
            kind = kind.as_str(),
            by = %actor.user,
            "settlement approvals reset"
        );
        Ok(updated)
    }

    async fn force_settlement(
        &self,
        trade_id: Uuid,
        actor: Actor,
        kind: SettlementKind,
        amount: Option<Decimal>,
    ) -> Result<SettlementOutcome, EngineError> {
        let trade = self.store.fetch(trade_id).await?;
        self.authz
            .authorize(AccessRule::AdminOnly, &actor, Some(&trade))
            .await?;
        require_status(&trade, &TradeStatus::FUNDED)?;
        tracing::info!(
            trade = %trade_id,
            kind = kind.as_str(),
            admin = %actor.user,
            "forced settlement"
        );
        self.settle(&trade, kind, amount).await
    }

    async fn settle(
        &self,
        trade: &Trade,
        kind: SettlementKind,
        amount: Option<Decimal>,
    ) -> Result<SettlementOutcome, EngineError> {
        let outcome = self.settlements.execute(trade, kind, amount).await?;
        self.emit_settlement_events(&outcome).await;
        if let (true, Some(recycle_at)) = (outcome.exhausted, outcome.trade.recycle_after) {
            self.timers
                .schedule(outcome.trade.trade_id, TimerKind::Recycle, recycle_at);
        }
        Ok(outcome)
    }

    async fn emit_settlement_events(&self, outcome: &SettlementOutcome) {
        if let Some(event) = outcome.notification() {
            self.notify(event).await;
        }
    }

    /// Returns whether the draft was actually expired (a quorum race means
    /// it no longer is one).
    async fn expire_draft(&self, trade: &Trade) -> Result<bool, EngineError> {
        if !self
            .store
            .delete(trade.trade_id, &[TradeStatus::Draft])
            .await?
        {
            return Ok(false);
        }
        self.timers.cancel(trade.trade_id, TimerKind::JoinTimeout);
        self.notify(NotificationEvent::TradeExpired {
            trade_id: trade.trade_id,
            venue: trade.venue_id,
        })
        .await;
        if let Some(venue_id) = trade.venue_id {
            self.venues.reclaim(venue_id, &trade.joined).await?;
        }
        tracing::info!(trade = %trade.trade_id, "draft expired");
        Ok(true)
    }

    async fn recycle(&self, trade: &Trade) -> Result<(), EngineError> {
        if let Some(venue_id) = trade.venue_id {
            self.venues.reclaim(venue_id, &trade.joined).await?;
        }
        let mut done = trade.clone();
        done.recycle_after = None;
        self.store.persist(&done, &[trade.status]).await?;
        self.timers.cancel(trade.trade_id, TimerKind::Recycle);
        tracing::info!(trade = %trade.trade_id, "venue recycled");
        Ok(())
    }

    async fn notify(&self, event: NotificationEvent) {
        if self.notifications.send(event).await.is_err() {
            tracing::warn!("notification channel closed, dropping event");
        }
    }
}

fn require_status(trade: &Trade, allowed: &[TradeStatus]) -> Result<(), EngineError> {
    if allowed.contains(&trade.status) {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "operation not valid while the trade is {}",
            trade.status.as_str()
        )))
    }
}

/// Statuses a settlement of `kind` may be approved (or declined) from.
/// Releases require the fiat leg to be confirmed; refunds may start from any
/// funded status, disputes included.
fn settleable_from(kind: SettlementKind) -> &'static [TradeStatus] {
    match kind {
        SettlementKind::Release => &[TradeStatus::ReadyToRelease],
        SettlementKind::Refund => &TradeStatus::FUNDED,
    }
}
