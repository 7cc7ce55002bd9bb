//! Admin identity and authentication configuration.

use argon2::{Argon2, PasswordHash, PasswordVerifier};

use crate::entities::UserId;

/// Who may perform admin-only operations, plus the hashed dashboard secret.
///
/// Identity is matched by platform user id first, falling back to a
/// case-insensitive username match for platforms where ids are not always
/// known up front.
#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    pub user_ids: Vec<i64>,
    pub usernames: Vec<String>,
    /// Argon2 hash of the admin API secret.
    pub secret_hash: String,
}

impl AdminConfig {
    pub fn new(user_ids: Vec<i64>, usernames: Vec<String>, secret_hash: String) -> Self {
        Self {
            user_ids,
            usernames: usernames
                .into_iter()
                .map(|name| normalize_handle(&name))
                .collect(),
            secret_hash,
        }
    }

    /// Whether the given identity is on the admin roster.
    pub fn is_admin(&self, user: UserId, handle: Option<&str>) -> bool {
        if self.user_ids.contains(&user.0) {
            return true;
        }
        match handle {
            Some(h) => {
                let h = normalize_handle(h);
                self.usernames.iter().any(|name| *name == h)
            }
            None => false,
        }
    }

    /// Verify a plaintext secret against the stored argon2 hash.
    ///
    /// Returns `false` for a malformed stored hash rather than erroring: a
    /// corrupt config must fail closed.
    pub fn verify_secret(&self, plaintext: &str) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(&self.secret_hash) else {
            return false;
        };

        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed_hash)
            .is_ok()
    }
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{
        Argon2, PasswordHasher,
        password_hash::{SaltString, rand_core::OsRng},
    };

    #[test]
    fn roster_matches_id_or_handle() {
        let admins = AdminConfig::new(vec![7], vec!["@Escrow_Admin".into()], String::new());

        assert!(admins.is_admin(UserId(7), None));
        assert!(admins.is_admin(UserId(99), Some("escrow_admin")));
        assert!(admins.is_admin(UserId(99), Some("@ESCROW_ADMIN")));
        assert!(!admins.is_admin(UserId(99), Some("someone_else")));
        assert!(!admins.is_admin(UserId(99), None));
    }

    #[test]
    fn verify_secret_round_trips() {
        let secret = "dashboard-secret";
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .unwrap()
            .to_string();

        let admins = AdminConfig::new(vec![], vec![], hash);

        assert!(admins.verify_secret("dashboard-secret"));
        assert!(!admins.verify_secret("wrong-secret"));
    }

    #[test]
    fn malformed_hash_fails_closed() {
        let admins = AdminConfig::new(vec![], vec![], "not-a-hash".into());
        assert!(!admins.verify_secret("anything"));
    }
}
