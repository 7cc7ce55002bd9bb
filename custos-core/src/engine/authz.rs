//! Centralized authorization for trade operations.
//!
//! Every mutating operation names its [`AccessRule`]; the policy is the only
//! place that interprets them. Role rules (buyer/seller) are strict: admins
//! do not pass them, because they attest to things only that party can know.

use crate::config::{AdminConfig, ConfigStore};
use crate::entities::{Trade, TradeRole, UserId};

use super::EngineError;

/// Who is asking. Carried through from the calling surface untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user: UserId,
    pub handle: Option<String>,
}

impl Actor {
    pub fn new(user: UserId, handle: Option<String>) -> Self {
        Self { user, handle }
    }
}

/// Access requirement of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRule {
    /// Any admitted member of the trade.
    Participant,
    /// An admitted member holding either role.
    RoleHolder,
    BuyerOnly,
    SellerOnly,
    ParticipantOrAdmin,
    AdminOnly,
}

#[derive(Clone)]
pub struct AuthorizationPolicy {
    admins: ConfigStore<AdminConfig>,
}

impl AuthorizationPolicy {
    pub fn new(admins: ConfigStore<AdminConfig>) -> Self {
        Self { admins }
    }

    pub async fn is_admin(&self, actor: &Actor) -> bool {
        self.admins
            .read()
            .await
            .is_admin(actor.user, actor.handle.as_deref())
    }

    /// Check `actor` against `rule` for `trade`. `trade` may be `None` only
    /// for [`AccessRule::AdminOnly`].
    pub async fn authorize(
        &self,
        rule: AccessRule,
        actor: &Actor,
        trade: Option<&Trade>,
    ) -> Result<(), EngineError> {
        match rule {
            AccessRule::AdminOnly => {
                if self.is_admin(actor).await {
                    Ok(())
                } else {
                    Err(EngineError::Authorization("admin only"))
                }
            }
            AccessRule::Participant => {
                if trade.is_some_and(|t| t.is_participant(actor.user)) {
                    Ok(())
                } else {
                    Err(EngineError::Authorization("not a participant of this trade"))
                }
            }
            AccessRule::RoleHolder => {
                if trade.is_some_and(|t| t.role_of(actor.user).is_some()) {
                    Ok(())
                } else {
                    Err(EngineError::Authorization("requires a claimed trade role"))
                }
            }
            AccessRule::BuyerOnly => {
                if trade.is_some_and(|t| t.role_of(actor.user) == Some(TradeRole::Buyer)) {
                    Ok(())
                } else {
                    Err(EngineError::Authorization("only the buyer may do this"))
                }
            }
            AccessRule::SellerOnly => {
                if trade.is_some_and(|t| t.role_of(actor.user) == Some(TradeRole::Seller)) {
                    Ok(())
                } else {
                    Err(EngineError::Authorization("only the seller may do this"))
                }
            }
            AccessRule::ParticipantOrAdmin => {
                if trade.is_some_and(|t| t.is_participant(actor.user)) || self.is_admin(actor).await
                {
                    Ok(())
                } else {
                    Err(EngineError::Authorization(
                        "requires a participant or an admin",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Participant;

    fn policy(admin_ids: Vec<i64>) -> AuthorizationPolicy {
        AuthorizationPolicy::new(ConfigStore::new(AdminConfig::new(
            admin_ids,
            vec![],
            String::new(),
        )))
    }

    fn trade_with_roles() -> Trade {
        let mut trade = Trade::new(Participant::new(UserId(10), None));
        trade.joined.insert(UserId(20));
        trade.buyer = Some(Participant::new(UserId(10), None));
        trade.seller = Some(Participant::new(UserId(20), None));
        trade
    }

    #[tokio::test]
    async fn buyer_rule_rejects_seller_and_admin() {
        let policy = policy(vec![99]);
        let trade = trade_with_roles();

        let buyer = Actor::new(UserId(10), None);
        let seller = Actor::new(UserId(20), None);
        let admin = Actor::new(UserId(99), None);

        assert!(
            policy
                .authorize(AccessRule::BuyerOnly, &buyer, Some(&trade))
                .await
                .is_ok()
        );
        assert!(
            policy
                .authorize(AccessRule::BuyerOnly, &seller, Some(&trade))
                .await
                .is_err()
        );
        assert!(
            policy
                .authorize(AccessRule::BuyerOnly, &admin, Some(&trade))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn participant_or_admin_accepts_either() {
        let policy = policy(vec![99]);
        let trade = trade_with_roles();

        for user in [10, 20, 99] {
            assert!(
                policy
                    .authorize(
                        AccessRule::ParticipantOrAdmin,
                        &Actor::new(UserId(user), None),
                        Some(&trade)
                    )
                    .await
                    .is_ok()
            );
        }
        assert!(
            policy
                .authorize(
                    AccessRule::ParticipantOrAdmin,
                    &Actor::new(UserId(55), None),
                    Some(&trade)
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn admin_matches_by_handle_too() {
        let policy = AuthorizationPolicy::new(ConfigStore::new(AdminConfig::new(
            vec![],
            vec!["desk_operator".into()],
            String::new(),
        )));
        let actor = Actor::new(UserId(1), Some("@Desk_Operator".into()));
        assert!(
            policy
                .authorize(AccessRule::AdminOnly, &actor, None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn joined_member_without_role_is_participant_but_not_role_holder() {
        let policy = policy(vec![]);
        let mut trade = Trade::new(Participant::new(UserId(10), None));
        trade.joined.insert(UserId(20));
        let member = Actor::new(UserId(20), None);

        assert!(
            policy
                .authorize(AccessRule::Participant, &member, Some(&trade))
                .await
                .is_ok()
        );
        assert!(
            policy
                .authorize(AccessRule::RoleHolder, &member, Some(&trade))
                .await
                .is_err()
        );
    }
}
