//! Etherscan-compatible explorer API client, the fallback source for deposit
//! scans when node log queries come back empty or error out.

use alloy_primitives::U256;
use serde::Deserialize;
use url::Url;

use super::{ChainError, TransferRecord};

pub struct ExplorerClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    chain_id: u64,
}

/// Envelope shared by all explorer responses. `result` is an array on
/// success and a bare string on errors, so it stays untyped here.
#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTxEntry {
    hash: String,
    from: String,
    to: String,
    value: String,
    block_number: String,
}

impl ExplorerClient {
    pub fn new(base_url: Url, api_key: Option<String>, chain_id: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            chain_id,
        }
    }

    /// `tokentx` query: ERC-20 transfers touching `recipient` from
    /// `from_block` to the explorer's head, ascending.
    pub async fn token_transfers(
        &self,
        token_address: &str,
        recipient: &str,
        from_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("chainid", &self.chain_id.to_string())
            .append_pair("module", "account")
            .append_pair("action", "tokentx")
            .append_pair("contractaddress", token_address)
            .append_pair("address", recipient)
            .append_pair("startblock", &from_block.to_string())
            .append_pair("endblock", "latest")
            .append_pair("sort", "asc");
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("apikey", key);
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(format!("explorer request failed: {e}")))?
            .error_for_status()
            .map_err(|e| ChainError::Rpc(format!("explorer returned error status: {e}")))?;
        let body: ExplorerResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Rpc(format!("explorer response not json: {e}")))?;
        parse_response(body, recipient)
    }
}

fn parse_response(
    body: ExplorerResponse,
    recipient: &str,
) -> Result<Vec<TransferRecord>, ChainError> {
    if body.status != "1" {
        // The explorer reports an empty result set as an error envelope.
        if body.message.eq_ignore_ascii_case("no transactions found") {
            return Ok(Vec::new());
        }
        let detail = body
            .result
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| body.result.to_string());
        return Err(ChainError::Rpc(format!(
            "explorer error: {} ({detail})",
            body.message
        )));
    }

    let entries: Vec<TokenTxEntry> = serde_json::from_value(body.result)
        .map_err(|e| ChainError::Rpc(format!("explorer result malformed: {e}")))?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        // tokentx also lists outgoing transfers for the address.
        if !entry.to.eq_ignore_ascii_case(recipient) {
            continue;
        }
        let amount_wei = U256::from_str_radix(&entry.value, 10)
            .map_err(|e| ChainError::Rpc(format!("explorer value malformed: {e}")))?;
        let block_number: u64 = entry
            .block_number
            .parse()
            .map_err(|e| ChainError::Rpc(format!("explorer block number malformed: {e}")))?;
        records.push(TransferRecord {
            tx_hash: entry.hash.to_ascii_lowercase(),
            from: entry.from.to_ascii_lowercase(),
            to: entry.to.to_ascii_lowercase(),
            amount_wei,
            block_number,
        });
    }
    Ok(records)
}
