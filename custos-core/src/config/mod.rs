//! Validated runtime configuration types.
//!
//! The server crate parses and validates its TOML file into these types;
//! everything here is already well-formed. Only the admin roster is
//! hot-reloadable (through [`ConfigStore`]); endpoints, contracts and escrow
//! knobs are fixed for the life of the process.

mod admin;
mod chains;
mod config_store;
mod contracts;
mod escrow;

use std::sync::Arc;

pub use admin::AdminConfig;
pub use chains::{ChainEndpoint, ChainEndpoints, ChainFamily, valid_address};
pub use config_store::{ConfigStore, ConfigWatcher};
pub use contracts::{ContractEntry, ContractTable};
pub use escrow::EscrowConfig;

/// All runtime configuration, cloned into every component that needs it.
#[derive(Clone)]
pub struct SharedConfig {
    pub admin: ConfigStore<AdminConfig>,
    pub escrow: Arc<EscrowConfig>,
    pub chains: Arc<ChainEndpoints>,
    pub contracts: Arc<ContractTable>,
}

impl SharedConfig {
    pub fn new(
        admin: AdminConfig,
        escrow: EscrowConfig,
        chains: ChainEndpoints,
        contracts: ContractTable,
    ) -> Self {
        Self {
            admin: ConfigStore::new(admin),
            escrow: Arc::new(escrow),
            chains: Arc::new(chains),
            contracts: Arc::new(contracts),
        }
    }
}
