//! Configuration module for custos-server.
//!
//! Handles loading configuration from the TOML file and CLI arguments,
//! hashing the admin secret, and converting everything into the validated
//! config types custos-core consumes.

pub mod file;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use custos_core::config::{
    AdminConfig, ChainEndpoint, ChainEndpoints, ChainFamily, ContractEntry, ContractTable,
    EscrowConfig, valid_address,
};
use custos_core::entities::{ChainName, TokenSymbol, VenueId};

use crate::config::file::{ChainSection, ContractSection, EscrowSection, FileConfig};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("password hashing error: {0}")]
    HashError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Everything the server needs, already validated and typed.
pub struct LoadedConfig {
    pub listen: SocketAddr,
    /// Shared secret the frontend service authenticates with.
    pub service_secret: String,
    pub bot_token: String,
    pub admin: AdminConfig,
    pub escrow: EscrowConfig,
    pub chains: ChainEndpoints,
    pub contracts: ContractTable,
    pub venues: Vec<VenueId>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Hash the admin secret if it's plaintext (and rewrite the file)
    /// 5. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        self.validate(&file_config)?;

        let secret_hash = if file_config.is_admin_secret_hashed() {
            file_config.admin.secret.clone()
        } else {
            let hash = self.hash_secret(&file_config.admin.secret)?;
            file_config.admin.secret = hash.clone();
            self.rewrite_config(&file_config)?;
            tracing::info!("Admin secret hashed and config file updated");
            hash
        };

        Ok(build_loaded_config(file_config, secret_hash))
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn validate(&self, config: &FileConfig) -> Result<(), ConfigError> {
        if config.service.secret.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service secret must not be empty".into(),
            ));
        }
        if config.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "telegram bot token must not be empty".into(),
            ));
        }

        for chain in &config.chains {
            if chain.family == ChainFamily::Evm && chain.signer_key.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "chain {} has no settlement signer key",
                    chain.name
                )));
            }
        }

        for contract in &config.contracts {
            let chain_name = ChainName::new(&contract.chain);
            let Some(chain) = config
                .chains
                .iter()
                .find(|c| ChainName::new(&c.name) == chain_name)
            else {
                return Err(ConfigError::ValidationError(format!(
                    "contract {}/{} references an unconfigured chain",
                    contract.token, contract.chain
                )));
            };

            let addresses = [
                &contract.custodial_address,
                &contract.token_address,
            ]
            .into_iter()
            .chain(contract.deposit_address.as_ref());
            for address in addresses {
                if !valid_address(chain.family, address) {
                    return Err(ConfigError::ValidationError(format!(
                        "contract {}/{}: address {} is malformed",
                        contract.token, contract.chain, address
                    )));
                }
            }
        }

        Ok(())
    }

    fn hash_secret(&self, plaintext: &str) -> Result<String, ConfigError> {
        use argon2::{
            Argon2, PasswordHasher,
            password_hash::{SaltString, rand_core::OsRng},
        };

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();

        argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ConfigError::HashError(e.to_string()))
    }

    fn rewrite_config(&self, config: &FileConfig) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(config)?;

        // Write atomically: write to temp file, then rename
        let temp_path = self.config_path.with_extension("toml.tmp");
        std::fs::write(&temp_path, toml_string)?;
        std::fs::rename(&temp_path, &self.config_path)?;

        Ok(())
    }
}

fn build_loaded_config(file_config: FileConfig, secret_hash: String) -> LoadedConfig {
    let chains = ChainEndpoints::new(file_config.chains.into_iter().map(convert_chain));
    let contracts = ContractTable::new(
        file_config
            .contracts
            .into_iter()
            .map(convert_contract)
            .collect(),
    );

    LoadedConfig {
        listen: file_config.server.listen,
        service_secret: file_config.service.secret,
        bot_token: file_config.telegram.bot_token,
        admin: AdminConfig::new(
            file_config.admin.user_ids,
            file_config.admin.usernames,
            secret_hash,
        ),
        escrow: convert_escrow(file_config.escrow),
        chains,
        contracts,
        venues: file_config.venues.ids.into_iter().map(VenueId).collect(),
    }
}

fn convert_escrow(e: EscrowSection) -> EscrowConfig {
    EscrowConfig {
        fee_percent: e.fee_percent,
        join_timeout: Duration::from_secs(e.join_timeout_secs),
        recycle_grace: Duration::from_secs(e.recycle_grace_secs),
        sweep_interval: Duration::from_secs(e.sweep_interval_secs),
        deposit_chunk: e.deposit_chunk,
        confirm_attempts: e.confirm_attempts,
        confirm_poll: Duration::from_secs(e.confirm_poll_secs),
    }
}

fn convert_chain(c: ChainSection) -> ChainEndpoint {
    ChainEndpoint {
        name: ChainName::new(&c.name),
        family: c.family,
        rpc_url: c.rpc_url,
        chain_id: c.chain_id,
        explorer_url: c.explorer_url,
        explorer_api_key: c.explorer_api_key,
        signer_key: c.signer_key,
    }
}

fn convert_contract(c: ContractSection) -> ContractEntry {
    let deposit_address = c
        .deposit_address
        .unwrap_or_else(|| c.custodial_address.clone());
    ContractEntry {
        token: TokenSymbol::new(&c.token),
        chain: ChainName::new(&c.chain),
        venue: c.venue.map(VenueId),
        custodial_address: c.custodial_address,
        token_address: c.token_address,
        deposit_address,
        decimals: c.decimals,
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
