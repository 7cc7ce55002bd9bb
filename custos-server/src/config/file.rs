//! TOML file configuration structures.
//!
//! These structs directly map to the `custos-config.toml` file format.

use std::net::SocketAddr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

use custos_core::config::{ChainFamily, EscrowConfig};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub server: ServerSection,
    pub service: ServiceSection,
    pub admin: AdminSection,
    pub telegram: TelegramSection,
    #[serde(default)]
    pub escrow: EscrowSection,
    #[serde(default)]
    pub chains: Vec<ChainSection>,
    #[serde(default)]
    pub contracts: Vec<ContractSection>,
    #[serde(default)]
    pub venues: VenueSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Frontend-service authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Shared secret the frontend bot presents on every service call.
    pub secret: String,
}

/// Admin roster and dashboard secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSection {
    /// Platform user ids allowed to perform admin actions.
    #[serde(default)]
    pub user_ids: Vec<i64>,
    /// Usernames allowed to perform admin actions (matched case-insensitively).
    #[serde(default)]
    pub usernames: Vec<String>,
    /// The admin API secret. If this is plaintext (doesn't start with
    /// `$argon2`), it will be hashed and the config file will be rewritten.
    pub secret: String,
}

/// Telegram Bot API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSection {
    pub bot_token: String,
}

/// Engine timing and economics. Omitted fields keep the engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowSection {
    /// Service fee, percent, as a decimal string ("0.5").
    #[serde(default = "default_fee_percent")]
    pub fee_percent: Decimal,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_recycle_grace")]
    pub recycle_grace_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_deposit_chunk")]
    pub deposit_chunk: u64,
    #[serde(default = "default_confirm_attempts")]
    pub confirm_attempts: u32,
    #[serde(default = "default_confirm_poll")]
    pub confirm_poll_secs: u64,
}

fn default_fee_percent() -> Decimal {
    EscrowConfig::default().fee_percent
}

fn default_join_timeout() -> u64 {
    EscrowConfig::default().join_timeout.as_secs()
}

fn default_recycle_grace() -> u64 {
    EscrowConfig::default().recycle_grace.as_secs()
}

fn default_sweep_interval() -> u64 {
    EscrowConfig::default().sweep_interval.as_secs()
}

fn default_deposit_chunk() -> u64 {
    EscrowConfig::default().deposit_chunk
}

fn default_confirm_attempts() -> u32 {
    EscrowConfig::default().confirm_attempts
}

fn default_confirm_poll() -> u64 {
    EscrowConfig::default().confirm_poll.as_secs()
}

impl Default for EscrowSection {
    fn default() -> Self {
        Self {
            fee_percent: default_fee_percent(),
            join_timeout_secs: default_join_timeout(),
            recycle_grace_secs: default_recycle_grace(),
            sweep_interval_secs: default_sweep_interval(),
            deposit_chunk: default_deposit_chunk(),
            confirm_attempts: default_confirm_attempts(),
            confirm_poll_secs: default_confirm_poll(),
        }
    }
}

/// One configured chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub name: String,
    pub family: ChainFamily,
    pub rpc_url: Url,
    pub chain_id: u64,
    /// Etherscan-style explorer API used as the deposit-scan fallback.
    #[serde(default)]
    pub explorer_url: Option<Url>,
    #[serde(default)]
    pub explorer_api_key: Option<String>,
    /// Hex private key of the settlement signer for this chain.
    pub signer_key: String,
}

/// One custodial deployment for a (token, chain) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSection {
    pub token: String,
    pub chain: String,
    /// Restrict this entry to one venue, shadowing the venue-agnostic entry
    /// for the same pair.
    #[serde(default)]
    pub venue: Option<i64>,
    /// The custodial vault contract that holds and pays out funds.
    pub custodial_address: String,
    /// The ERC-20 token contract whose Transfer events are scanned.
    pub token_address: String,
    /// Where sellers are told to deposit. Defaults to the custodial address.
    #[serde(default)]
    pub deposit_address: Option<String>,
    pub decimals: u8,
}

/// The provisioned venue roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueSection {
    /// Chat ids of the pooled venues the bot administers.
    #[serde(default)]
    pub ids: Vec<i64>,
}

impl FileConfig {
    /// Check if the admin secret is already hashed (argon2 format).
    pub fn is_admin_secret_hashed(&self) -> bool {
        self.admin.secret.starts_with("$argon2")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:3000"

[service]
secret = "bot-shared-secret"

[admin]
user_ids = [111, 222]
usernames = ["escrow_admin"]
secret = "test-secret"

[telegram]
bot_token = "12345:abcdef"

[escrow]
fee_percent = "0.5"
join_timeout_secs = 900

[[chains]]
name = "polygon"
family = "evm"
rpc_url = "https://polygon-rpc.example.com"
chain_id = 137
explorer_url = "https://api.polygonscan.example.com/api"
explorer_api_key = "key123"
signer_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"

[[contracts]]
token = "USDT"
chain = "polygon"
custodial_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
token_address = "0xc2132D05D31c914a87C6611C10748AEb04B58e8F"
decimals = 6

[venues]
ids = [-1001, -1002]
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.admin.user_ids, vec![111, 222]);
        assert_eq!(config.escrow.join_timeout_secs, 900);
        // Unset escrow fields keep the engine defaults.
        assert_eq!(config.escrow.recycle_grace_secs, 300);
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.contracts.len(), 1);
        assert!(config.contracts[0].deposit_address.is_none());
        assert_eq!(config.venues.ids, vec![-1001, -1002]);
        assert!(!config.is_admin_secret_hashed());
    }

    #[test]
    fn test_minimal_config_parsing() {
        let toml_str = r#"
[server]

[service]
secret = "s"

[admin]
secret = "a"

[telegram]
bot_token = "t"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert!(config.admin.user_ids.is_empty());
        assert!(config.chains.is_empty());
        assert!(config.venues.ids.is_empty());
        assert_eq!(
            config.escrow.sweep_interval_secs,
            EscrowConfig::default().sweep_interval.as_secs()
        );
    }

    #[test]
    fn test_hashed_secret_detection() {
        let config = FileConfig {
            server: ServerSection {
                listen: default_listen_addr(),
            },
            service: ServiceSection {
                secret: "shared".to_string(),
            },
            admin: AdminSection {
                user_ids: vec![],
                usernames: vec![],
                secret: "$argon2id$v=19$m=19456,t=2,p=1$abc123".to_string(),
            },
            telegram: TelegramSection {
                bot_token: "12345:abcdef".to_string(),
            },
            escrow: EscrowSection::default(),
            chains: vec![],
            contracts: vec![],
            venues: VenueSection::default(),
        };
        assert!(config.is_admin_secret_hashed());
    }
}
