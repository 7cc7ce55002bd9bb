//! Per-chain endpoint configuration and address-format validation.

use std::collections::HashMap;
use std::str::FromStr;

use url::Url;

use crate::entities::{ChainName, UnknownCode};

/// Address family of a chain, driving payout-address validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    /// 0x-prefixed 20-byte hex addresses.
    Evm,
    /// Base58check addresses (25 payload bytes).
    Base58,
}

impl FromStr for ChainFamily {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(ChainFamily::Evm),
            "base58" => Ok(ChainFamily::Base58),
            other => Err(UnknownCode {
                kind: "chain family",
                value: other.to_owned(),
            }),
        }
    }
}

/// One configured chain.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub name: ChainName,
    pub family: ChainFamily,
    pub rpc_url: Url,
    pub chain_id: u64,
    /// Etherscan-style explorer API, used as the deposit-scan fallback.
    pub explorer_url: Option<Url>,
    pub explorer_api_key: Option<String>,
    /// Hex private key of the settlement signer for this chain. One signer
    /// services every trade on the chain.
    pub signer_key: String,
}

/// All configured chains, keyed by normalized chain name.
#[derive(Debug, Clone, Default)]
pub struct ChainEndpoints {
    endpoints: HashMap<ChainName, ChainEndpoint>,
}

impl ChainEndpoints {
    pub fn new(endpoints: impl IntoIterator<Item = ChainEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
        }
    }

    pub fn get(&self, chain: &ChainName) -> Option<&ChainEndpoint> {
        self.endpoints.get(chain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEndpoint> {
        self.endpoints.values()
    }

    pub fn family_of(&self, chain: &ChainName) -> Option<ChainFamily> {
        self.endpoints.get(chain).map(|e| e.family)
    }
}

/// Whether `address` is well-formed for the given chain family.
pub fn valid_address(family: ChainFamily, address: &str) -> bool {
    match family {
        ChainFamily::Evm => {
            let Some(hex) = address.strip_prefix("0x") else {
                return false;
            };
            hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        ChainFamily::Base58 => match bs58::decode(address).into_vec() {
            // Base58check payload: 1 version byte + 20 byte hash + 4 byte checksum.
            Ok(bytes) => bytes.len() == 25,
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_addresses_require_0x_and_40_hex_chars() {
        assert!(valid_address(
            ChainFamily::Evm,
            "0x52908400098527886E0F7030069857D2E4169EE7"
        ));
        assert!(valid_address(
            ChainFamily::Evm,
            "0x52908400098527886e0f7030069857d2e4169ee7"
        ));
        assert!(!valid_address(
            ChainFamily::Evm,
            "52908400098527886E0F7030069857D2E4169EE7"
        ));
        assert!(!valid_address(ChainFamily::Evm, "0x1234"));
        assert!(!valid_address(
            ChainFamily::Evm,
            "0x52908400098527886E0F7030069857D2E4169EEZ"
        ));
    }

    #[test]
    fn base58_addresses_decode_to_25_bytes() {
        // A Tron mainnet address (base58check of 21 payload + 4 checksum bytes).
        assert!(valid_address(
            ChainFamily::Base58,
            "TLyqzVGLV1srkB7dToTAEqgDSfPtXRJZYH"
        ));
        // Contains characters outside the base58 alphabet.
        assert!(!valid_address(ChainFamily::Base58, "0OIl+/"));
        // Valid base58 but wrong payload length.
        assert!(!valid_address(ChainFamily::Base58, "abc"));
    }
}
