//! Test doubles and fixtures: an in-memory store that mirrors the Postgres
//! guard semantics, a recording venue gateway, and a scripted chain client.
//!
//! Compiled for unit tests and behind the `testkit` feature for integration
//! tests. None of this is reachable from a release build.

mod chain;
mod fixtures;
mod gateway;
mod store;

pub use chain::{ScriptedChain, SubmissionRecord};
pub use fixtures::{
    BUYER_ADDRESS, CUSTODIAL_ADDRESS, DEPOSIT_ADDRESS, SELLER_ADDRESS, TEST_CHAIN, TOKEN_ADDRESS,
    awaiting_deposit_trade, funded_trade, test_config, test_config_with_escrow, test_entry,
    transfer,
};
pub use gateway::{GatewayCall, RecordingGateway};
pub use store::MemoryStore;
