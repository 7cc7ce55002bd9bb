//! The per-(token, chain) custodial contract table.

use crate::entities::{ChainName, TokenSymbol, VenueId};

/// One custodial deployment: where deposits for a (token, chain) pair go and
/// which contract releases them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEntry {
    pub token: TokenSymbol,
    pub chain: ChainName,
    /// When set, this entry only applies to trades bound to that venue,
    /// shadowing the venue-agnostic entry for the same pair.
    pub venue: Option<VenueId>,
    /// The custodial vault contract that holds and pays out funds.
    pub custodial_address: String,
    /// The ERC-20 token contract whose Transfer events are scanned.
    pub token_address: String,
    /// Where sellers are told to deposit. Usually the custodial vault itself.
    pub deposit_address: String,
    pub decimals: u8,
}

/// Lookup table over all configured custodial deployments.
#[derive(Debug, Clone, Default)]
pub struct ContractTable {
    entries: Vec<ContractEntry>,
}

impl ContractTable {
    pub fn new(entries: Vec<ContractEntry>) -> Self {
        Self { entries }
    }

    /// Resolve the entry for a (token, chain) pair, preferring a venue-scoped
    /// entry when the trade's venue has one.
    pub fn resolve(
        &self,
        token: &TokenSymbol,
        chain: &ChainName,
        venue: Option<VenueId>,
    ) -> Option<&ContractEntry> {
        let matches = |e: &&ContractEntry| e.token == *token && e.chain == *chain;
        if let Some(venue) = venue {
            if let Some(scoped) = self
                .entries
                .iter()
                .filter(matches)
                .find(|e| e.venue == Some(venue))
            {
                return Some(scoped);
            }
        }
        self.entries.iter().filter(matches).find(|e| e.venue.is_none())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContractEntry> {
        self.entries.iter()
    }
}
