//! Shared fixture data: one EVM test chain, one USDT custodial deployment,
//! and trade builders for the two interesting starting points.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use url::Url;

use crate::chain::TransferRecord;
use crate::config::{
    AdminConfig, ChainEndpoint, ChainEndpoints, ChainFamily, ContractEntry, ContractTable,
    EscrowConfig, SharedConfig,
};
use crate::entities::{
    ChainName, Participant, Terms, TokenSymbol, Trade, TradeStatus, UserId, VenueId,
};
use crate::utils::units::decimal_to_wei;

pub const TEST_CHAIN: &str = "testchain";
pub const TOKEN_ADDRESS: &str = "0x00000000000000000000000000000000000000aa";
pub const CUSTODIAL_ADDRESS: &str = "0x00000000000000000000000000000000000000cc";
pub const DEPOSIT_ADDRESS: &str = "0x00000000000000000000000000000000000000dd";
pub const BUYER_ADDRESS: &str = "0x00000000000000000000000000000000000000b1";
pub const SELLER_ADDRESS: &str = "0x00000000000000000000000000000000000000e2";

/// Hardhat's first well-known development key. Never funded anywhere real.
const SIGNER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn test_entry() -> ContractEntry {
    ContractEntry {
        token: TokenSymbol::new("USDT"),
        chain: ChainName::new(TEST_CHAIN),
        venue: None,
        custodial_address: CUSTODIAL_ADDRESS.into(),
        token_address: TOKEN_ADDRESS.into(),
        deposit_address: DEPOSIT_ADDRESS.into(),
        decimals: 18,
    }
}

pub fn test_config() -> SharedConfig {
    test_config_with_escrow(EscrowConfig::default())
}

pub fn test_config_with_escrow(escrow: EscrowConfig) -> SharedConfig {
    let endpoint = ChainEndpoint {
        name: ChainName::new(TEST_CHAIN),
        family: ChainFamily::Evm,
        rpc_url: Url::parse("http://localhost:8545").expect("static url"),
        chain_id: 31337,
        explorer_url: None,
        explorer_api_key: None,
        signer_key: SIGNER_KEY.into(),
    };
    SharedConfig::new(
        AdminConfig::new(vec![900], vec!["escrow_admin".into()], String::new()),
        escrow,
        ChainEndpoints::new([endpoint]),
        ContractTable::new(vec![test_entry()]),
    )
}

/// A trade with both roles, terms for 1000 USDT, payout addresses, and a
/// deposit address handed out; the scan cursor sits at block 100.
pub fn awaiting_deposit_trade(buyer: i64, seller: i64) -> Trade {
    let mut trade = Trade::new(Participant::new(UserId(buyer), None));
    trade.joined.insert(UserId(seller));
    trade.buyer = Some(Participant::new(UserId(buyer), None));
    trade.seller = Some(Participant::new(UserId(seller), None));
    trade.venue_id = Some(VenueId(-1));
    trade.terms = Some(Terms {
        token: TokenSymbol::new("USDT"),
        chain: ChainName::new(TEST_CHAIN),
        quantity: Decimal::from(1000),
        rate: Decimal::ONE,
        payment_method: "SEPA".into(),
    });
    trade.buyer_address = Some(BUYER_ADDRESS.into());
    trade.seller_address = Some(SELLER_ADDRESS.into());
    trade.deposit_address = Some(DEPOSIT_ADDRESS.into());
    trade.status = TradeStatus::AwaitingDeposit;
    trade.last_checked_block = 100;
    trade
}

/// A fully deposited trade sitting at `ready_to_release`, holding `balance`
/// tokens (with the exact wei mirror set).
pub fn funded_trade(buyer: i64, seller: i64, balance: Decimal) -> Trade {
    let mut trade = awaiting_deposit_trade(buyer, seller);
    if let Some(terms) = trade.terms.as_mut() {
        terms.quantity = balance;
    }
    trade.status = TradeStatus::ReadyToRelease;
    trade.balance = balance;
    trade.balance_wei = Some(decimal_to_wei(balance, 18).expect("integral fixture balance"));
    trade.seen_deposit_hashes.insert("0xfund01".into());
    trade
}

pub fn transfer(hash: &str, to: &str, amount_wei: U256, block: u64) -> TransferRecord {
    TransferRecord {
        tx_hash: hash.into(),
        from: "0x00000000000000000000000000000000000000f0".into(),
        to: to.into(),
        amount_wei,
        block_number: block,
    }
}
