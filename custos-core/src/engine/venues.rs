//! The fixed venue pool: claiming rooms for new trades and recycling them
//! afterwards.
//!
//! A venue is only ever in one of three states. `Assigned` is transient and
//! always resolved by `reclaim`: either the room is cleaned (participants
//! evicted, invite rotated) and returns to `Available`, or cleaning failed
//! and it is quarantined as `Terminal`. No path leaves a venue `Assigned`
//! without a live trade.

use std::collections::BTreeSet;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::entities::{UserId, Venue, VenueId, VenueStatus};
use crate::messaging::{VenueGateway, with_retry};
use crate::store::VenueStore;

use super::EngineError;

pub struct VenuePool<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
}

impl<S, G> VenuePool<S, G>
where
    S: VenueStore,
    G: VenueGateway,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>) -> Self {
        Self { store, gateway }
    }

    /// Provision the configured roster. Venues already known keep their
    /// state; removed ids are left alone (an operator may still be draining
    /// them).
    pub async fn ensure_roster(&self, venue_ids: &[VenueId]) -> Result<(), EngineError> {
        for venue_id in venue_ids {
            self.store.ensure(&Venue::new(*venue_id)).await?;
        }
        Ok(())
    }

    /// Claim an available venue for `trade_id` and hand out a fresh invite.
    ///
    /// A venue whose invite cannot be rotated is quarantined and the next
    /// available one is tried; the pool being exhausted is
    /// [`EngineError::NoVenueAvailable`].
    pub async fn assign(&self, trade_id: Uuid) -> Result<Venue, EngineError> {
        loop {
            let Some(mut venue) = self
                .store
                .try_claim(trade_id, OffsetDateTime::now_utc())
                .await?
            else {
                return Err(EngineError::NoVenueAvailable);
            };

            match with_retry(|| self.gateway.rotate_invite(venue.venue_id)).await {
                Ok(credential) => {
                    venue.invite_credential = Some(credential);
                    self.store
                        .persist_venue(&venue, &[VenueStatus::Assigned])
                        .await?;
                    return Ok(venue);
                }
                Err(err) => {
                    tracing::warn!(
                        venue = %venue.venue_id,
                        error = %err,
                        "quarantining venue: invite rotation failed"
                    );
                    venue.status = VenueStatus::Terminal;
                    venue.assigned_trade = None;
                    self.store
                        .persist_venue(&venue, &[VenueStatus::Assigned])
                        .await?;
                }
            }
        }
    }

    /// Remove `users` from the venue. Users already gone count as removed;
    /// an ambiguous membership probe errs on the side of removing.
    pub async fn evict(
        &self,
        venue: VenueId,
        users: &BTreeSet<UserId>,
    ) -> Result<(), EngineError> {
        for user in users {
            let present = match with_retry(|| self.gateway.is_member(venue, *user)).await {
                Ok(present) => present,
                Err(err) => {
                    tracing::debug!(
                        venue = %venue,
                        user = %user,
                        error = %err,
                        "membership probe failed, attempting removal anyway"
                    );
                    true
                }
            };
            if present {
                with_retry(|| self.gateway.remove_member(venue, *user)).await?;
            }
        }
        Ok(())
    }

    /// Return a venue to the pool after its trade ended: evict the trade's
    /// participants, rotate the invite, mark `Available`. Any failure
    /// quarantines the venue as `Terminal` instead of recycling a room that
    /// may still hold a stranger or honor an old invite.
    pub async fn reclaim(
        &self,
        venue_id: VenueId,
        users: &BTreeSet<UserId>,
    ) -> Result<Venue, EngineError> {
        let mut venue = self.store.fetch_venue(venue_id).await?;
        let now = OffsetDateTime::now_utc();

        let cleaned: Result<String, EngineError> = async {
            self.evict(venue_id, users).await?;
            Ok(with_retry(|| self.gateway.rotate_invite(venue_id)).await?)
        }
        .await;

        venue.assigned_trade = None;
        venue.completed_at = Some(now);
        match cleaned {
            Ok(credential) => {
                venue.status = VenueStatus::Available;
                venue.invite_credential = Some(credential);
            }
            Err(err) => {
                tracing::warn!(
                    venue = %venue_id,
                    error = %err,
                    "quarantining venue: cleanup failed"
                );
                venue.status = VenueStatus::Terminal;
            }
        }
        self.store.persist_venue(&venue, &[]).await?;
        Ok(venue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::messaging::GatewayError;
    use crate::testkit::{GatewayCall, MemoryStore, RecordingGateway};

    fn pool() -> (
        VenuePool<MemoryStore, RecordingGateway>,
        Arc<MemoryStore>,
        Arc<RecordingGateway>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let pool = VenuePool::new(Arc::clone(&store), Arc::clone(&gateway));
        (pool, store, gateway)
    }

    #[tokio::test]
    async fn assign_claims_lowest_available_and_rotates_invite() {
        let (pool, store, _gateway) = pool();
        pool.ensure_roster(&[VenueId(-3), VenueId(-1), VenueId(-2)])
            .await
            .unwrap();

        let trade_id = Uuid::now_v7();
        let venue = pool.assign(trade_id).await.unwrap();

        assert_eq!(venue.venue_id, VenueId(-3));
        assert_eq!(venue.status, VenueStatus::Assigned);
        assert_eq!(venue.assigned_trade, Some(trade_id));
        assert!(venue.invite_credential.is_some());

        let stored = store.fetch_venue(VenueId(-3)).await.unwrap();
        assert_eq!(stored, venue);
    }

    #[tokio::test]
    async fn assign_quarantines_broken_venue_and_moves_on() {
        let (pool, store, gateway) = pool();
        pool.ensure_roster(&[VenueId(-1), VenueId(-2)]).await.unwrap();
        // One rejection breaks one rotation; the claim loop moves on.
        gateway.queue_failure(
            "rotate_invite",
            GatewayError::Rejected("not enough rights".into()),
        );

        let venue = pool.assign(Uuid::now_v7()).await.unwrap();
        assert_eq!(venue.venue_id, VenueId(-1));

        let broken = store.fetch_venue(VenueId(-2)).await.unwrap();
        assert_eq!(broken.status, VenueStatus::Terminal);
        assert!(broken.assigned_trade.is_none());
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported() {
        let (pool, _store, _gateway) = pool();
        pool.ensure_roster(&[VenueId(-1)]).await.unwrap();
        pool.assign(Uuid::now_v7()).await.unwrap();

        assert!(matches!(
            pool.assign(Uuid::now_v7()).await,
            Err(EngineError::NoVenueAvailable)
        ));
    }

    #[tokio::test]
    async fn reclaim_evicts_rotates_and_frees() {
        let (pool, store, gateway) = pool();
        pool.ensure_roster(&[VenueId(-1)]).await.unwrap();
        let venue = pool.assign(Uuid::now_v7()).await.unwrap();
        let old_invite = venue.invite_credential.clone().unwrap();

        gateway.join(VenueId(-1), UserId(10));
        gateway.join(VenueId(-1), UserId(20));

        let users: BTreeSet<UserId> = [UserId(10), UserId(20), UserId(30)].into();
        let reclaimed = pool.reclaim(VenueId(-1), &users).await.unwrap();

        assert_eq!(reclaimed.status, VenueStatus::Available);
        assert!(reclaimed.assigned_trade.is_none());
        assert_ne!(reclaimed.invite_credential.unwrap(), old_invite);

        // Only the two present members were removed; user 30 was never there.
        let removals: Vec<_> = gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::RemoveMember { .. }))
            .collect();
        assert_eq!(removals.len(), 2);

        let stored = store.fetch_venue(VenueId(-1)).await.unwrap();
        assert_eq!(stored.status, VenueStatus::Available);
    }

    #[tokio::test]
    async fn failed_reclaim_quarantines_instead_of_reusing() {
        let (pool, store, gateway) = pool();
        pool.ensure_roster(&[VenueId(-1)]).await.unwrap();
        pool.assign(Uuid::now_v7()).await.unwrap();

        gateway.join(VenueId(-1), UserId(10));
        gateway.queue_failure(
            "remove_member",
            GatewayError::Rejected("user is an administrator".into()),
        );

        let users: BTreeSet<UserId> = [UserId(10)].into();
        let reclaimed = pool.reclaim(VenueId(-1), &users).await.unwrap();
        assert_eq!(reclaimed.status, VenueStatus::Terminal);

        let stored = store.fetch_venue(VenueId(-1)).await.unwrap();
        assert_eq!(stored.status, VenueStatus::Terminal);
        // Quarantined venues are never claimable again.
        assert!(store.try_claim(Uuid::now_v7(), OffsetDateTime::now_utc())
            .await
            .unwrap()
            .is_none());
    }
}
