//! Transfer history: a REST collaborator consulted first, falling back to
//! scanning the most recent blocks for matching transfer extrinsics.

use eyre::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::{config::HttpConfig, keys::address};

use super::{tx::{Call, Extrinsic}, ConnectionManager};

/// Blocks scanned by the fallback path.
pub const SCAN_BLOCK_DEPTH: u64 = 25;
/// Overall bound on the fallback scan.
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<u64>,
}

/// Fetch transfers touching `address`, newest first.
pub async fn get_transfers(
    chain: &ConnectionManager,
    http: &HttpConfig,
    addr: &str,
    limit: usize,
) -> eyre::Result<Vec<TransferRecord>> {
    if let Some(base) = http.history_api_base_url.as_deref() {
        match fetch_rest(base, http.history_timeout_secs, addr, limit).await {
            Ok(records) => return Ok(records),
            Err(e) => {
                warn!(error = %e, "history collaborator unavailable; scanning recent blocks");
            }
        }
    }

    match tokio::time::timeout(SCAN_TIMEOUT, scan_recent_blocks(chain, addr, limit)).await {
        Ok(res) => res,
        Err(_elapsed) => {
            warn!("block scan timed out; returning what the node gave us so far");
            Ok(vec![])
        }
    }
}

async fn fetch_rest(
    base: &str,
    timeout_secs: u64,
    addr: &str,
    limit: usize,
) -> eyre::Result<Vec<TransferRecord>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .context("build http client")?;
    let url = format!("{}/api/v1/transfers", base.trim_end_matches('/'));
    let limit_s = limit.to_string();
    let resp = client
        .get(&url)
        .query(&[("address", addr), ("limit", limit_s.as_str())])
        .send()
        .await
        .context("history request")?
        .error_for_status()
        .context("history response status")?;
    let mut records: Vec<TransferRecord> = resp.json().await.context("parse history response")?;
    records.truncate(limit);
    Ok(records)
}

/// Walk at most [`SCAN_BLOCK_DEPTH`] recent blocks and decode every
/// balance-transfer extrinsic touching `addr`. One bad block or extrinsic
/// is skipped, never aborting the scan.
async fn scan_recent_blocks(
    chain: &ConnectionManager,
    addr: &str,
    limit: usize,
) -> eyre::Result<Vec<TransferRecord>> {
    let node_link = chain.current_link().await?;
    let header = node_link
        .request("chain_getHeader", json!([]))
        .await
        .context("fetch chain head")?;
    let head = header
        .get("number")
        .and_then(parse_block_number)
        .ok_or_else(|| eyre::eyre!("chain head malformed: {header}"))?;

    let mut out = vec![];
    let first = head.saturating_sub(SCAN_BLOCK_DEPTH.saturating_sub(1));
    for n in (first..=head).rev() {
        if out.len() >= limit {
            break;
        }
        let block = match fetch_block(&node_link, n).await {
            Ok(b) => b,
            Err(e) => {
                warn!(block = n, error = %e, "skipping unreadable block");
                continue;
            }
        };
        for ext_hex in &block {
            let Ok(ext) = Extrinsic::decode_hex(ext_hex) else {
                continue;
            };
            let Call::Transfer { dest, amount } = ext.call else {
                continue;
            };
            let from = address::encode(&ext.signer);
            let to = address::encode(&dest);
            if from != addr && to != addr {
                continue;
            }
            let Ok(hash) = ext.hash_hex() else {
                continue;
            };
            out.push(TransferRecord {
                hash,
                from,
                to,
                amount,
                block: Some(n),
            });
        }
    }
    out.truncate(limit);
    Ok(out)
}

async fn fetch_block(
    node_link: &super::link::NodeLink,
    number: u64,
) -> eyre::Result<Vec<String>> {
    let hash = node_link
        .request("chain_getBlockHash", json!([number]))
        .await?;
    let hash = hash
        .as_str()
        .ok_or_else(|| eyre::eyre!("block hash was not a string"))?
        .to_owned();
    let block = node_link.request("chain_getBlock", json!([hash])).await?;
    let exts = block
        .pointer("/block/extrinsics")
        .and_then(Value::as_array)
        .ok_or_else(|| eyre::eyre!("block body malformed"))?;
    Ok(exts
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect())
}

fn parse_block_number(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.strip_prefix("0x").map_or_else(
            || s.parse().ok(),
            |t| u64::from_str_radix(t, 16).ok(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_numbers_parse_from_hex_and_decimal() {
        assert_eq!(parse_block_number(&json!(120)), Some(120));
        assert_eq!(parse_block_number(&json!("0x1f")), Some(31));
        assert_eq!(parse_block_number(&json!("120")), Some(120));
        assert_eq!(parse_block_number(&json!(null)), None);
    }

    #[test]
    fn transfer_record_serializes_without_empty_block() -> eyre::Result<()> {
        let r = TransferRecord {
            hash: "0xab".into(),
            from: "a".into(),
            to: "b".into(),
            amount: 5,
            block: None,
        };
        let v = serde_json::to_value(&r)?;
        assert!(v.get("block").is_none(), "block must be omitted when unset");
        Ok(())
    }
}
