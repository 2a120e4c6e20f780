//! The transaction pipeline: build an unsigned payload, obtain a raw
//! signature from the caller's signing capability, wrap it with the scheme
//! discriminator, submit, and await inclusion.
//!
//! All outcomes are structured [`TxResult`]s; nothing raises past this
//! module's boundary.

use blake2::{digest::consts::U32, Blake2b, Digest as _};
use borsh::{BorshDeserialize, BorshSerialize};
use eyre::Context as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::warn;

use crate::{
    errors::KeeperError,
    keys::{address, signer::RawSigner},
};

use super::{ChainSession, ConnectionManager};

type Blake2b256 = Blake2b<U32>;

pub const EXTRINSIC_FORMAT_VERSION: u8 = 4;
/// One-byte discriminator prepended to the raw signature. Only ed25519 is
/// required for parity.
pub const SCHEME_ED25519: u8 = 0x00;
pub const WRAPPED_SIGNATURE_LEN: usize = 65;

/// Conservative fee estimate (base units) when the dry-run query fails.
pub const FEE_FALLBACK: u128 = 12_500_000;

/// Bound on waiting for in-block/finalized status after submission.
const INCLUSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Call {
    Transfer {
        dest: [u8; 32],
        amount: u128,
    },
    AddStake {
        hotkey: [u8; 32],
        netuid: u16,
        amount: u128,
    },
    RemoveStake {
        hotkey: [u8; 32],
        netuid: u16,
        amount: u128,
    },
    MoveStake {
        origin_hotkey: [u8; 32],
        dest_hotkey: [u8; 32],
        origin_netuid: u16,
        dest_netuid: u16,
        amount: u128,
    },
    AddStakeLimit {
        hotkey: [u8; 32],
        netuid: u16,
        amount: u128,
        limit_price: u128,
        allow_partial: bool,
    },
}

impl Call {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "transfer",
            Self::AddStake { .. } => "add_stake",
            Self::RemoveStake { .. } => "remove_stake",
            Self::MoveStake { .. } => "move_stake",
            Self::AddStakeLimit { .. } => "add_stake_limit",
        }
    }
}

/// Everything the node needs to validate a signature, bound to one chain
/// (genesis) and one runtime revision.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UnsignedPayload {
    pub call: Call,
    pub nonce: u64,
    pub genesis_hash: [u8; 32],
    pub spec_version: u32,
    pub transaction_version: u32,
    pub format_version: u8,
}

impl UnsignedPayload {
    pub fn build(call: Call, nonce: u64, session: &ChainSession) -> Self {
        Self {
            call,
            nonce,
            genesis_hash: session.genesis_hash,
            spec_version: session.spec_version,
            transaction_version: session.transaction_version,
            format_version: EXTRINSIC_FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> eyre::Result<Vec<u8>> {
        borsh::to_vec(self).context("encode unsigned payload")
    }
}

/// `[scheme discriminator] ++ raw 64-byte signature`.
pub fn wrap_signature(raw: &[u8; 64]) -> [u8; WRAPPED_SIGNATURE_LEN] {
    let mut out = [0_u8; WRAPPED_SIGNATURE_LEN];
    out[0] = SCHEME_ED25519;
    out[1..].copy_from_slice(raw);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Extrinsic {
    pub format_version: u8,
    pub signer: [u8; 32],
    pub signature: [u8; WRAPPED_SIGNATURE_LEN],
    pub nonce: u64,
    pub call: Call,
}

impl Extrinsic {
    pub fn encode_hex(&self) -> eyre::Result<String> {
        let bytes = borsh::to_vec(self).context("encode extrinsic")?;
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    pub fn decode_hex(s: &str) -> eyre::Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x")).context("decode extrinsic hex")?;
        Self::try_from_slice(&raw).context("decode extrinsic")
    }

    /// blake2b-256 over the encoded bytes, the chain's transaction hash.
    pub fn hash_hex(&self) -> eyre::Result<String> {
        let bytes = borsh::to_vec(self).context("encode extrinsic")?;
        let mut h = Blake2b256::new();
        h.update(&bytes);
        Ok(format!("0x{}", hex::encode(h.finalize())))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TxResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxResult {
    fn ok(hash: String) -> Self {
        Self {
            success: true,
            hash: Some(hash),
            error: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            hash: None,
            error: Some(message.into()),
        }
    }
}

/// Sign a free-standing message (not an extrinsic) with the wrapped
/// signature format.
pub fn sign_message(signer: &Arc<dyn RawSigner>, message: &[u8]) -> String {
    let wrapped = wrap_signature(&signer.sign_raw(message));
    format!("0x{}", hex::encode(wrapped))
}

/// Build and sign an extrinsic without submitting it.
pub async fn build_signed(
    chain: &ConnectionManager,
    signer: &Arc<dyn RawSigner>,
    call: Call,
) -> eyre::Result<Extrinsic> {
    let session = chain.session().await?;
    let from = address::encode(&signer.public_key());
    let nonce = chain.account_nonce(&from).await?;
    let payload = UnsignedPayload::build(call.clone(), nonce, &session);
    let payload_bytes = payload.encode()?;
    let raw = signer.sign_raw(&payload_bytes);
    Ok(Extrinsic {
        format_version: EXTRINSIC_FORMAT_VERSION,
        signer: signer.public_key(),
        signature: wrap_signature(&raw),
        nonce,
        call,
    })
}

/// The full pipeline: build, sign, submit, await in-block or finalized.
pub async fn submit(
    chain: &ConnectionManager,
    signer: Arc<dyn RawSigner>,
    call: Call,
) -> TxResult {
    match submit_inner(chain, &signer, call).await {
        Ok(hash) => TxResult::ok(hash),
        Err(e) => TxResult::fail(crate::errors::to_error_body(&e).message),
    }
}

async fn submit_inner(
    chain: &ConnectionManager,
    signer: &Arc<dyn RawSigner>,
    call: Call,
) -> eyre::Result<String> {
    let node_link = chain.current_link().await?;
    let session = chain.session().await?;
    let ext = build_signed(chain, signer, call).await?;
    let ext_hex = ext.encode_hex()?;
    let tx_hash = ext.hash_hex()?;

    let method = session.capability("submit_watch")?.to_owned();
    let mut sub = node_link
        .subscribe(&method, json!([ext_hex]))
        .await
        .context("submit extrinsic")?;

    let outcome = tokio::time::timeout(INCLUSION_TIMEOUT, async {
        while let Some(status) = sub.rx.recv().await {
            match classify_status(&session, &status) {
                StatusOutcome::Pending => {}
                StatusOutcome::Included => return Ok(()),
                StatusOutcome::Failed(e) => return Err(e),
            }
        }
        Err(eyre::Report::new(KeeperError::NetworkTimeout(
            "status stream ended before inclusion".to_owned(),
        )))
    })
    .await;

    node_link.unsubscribe("author_unwatchExtrinsic", &sub.id).await;

    match outcome {
        Ok(Ok(())) => Ok(tx_hash),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Err(KeeperError::NetworkTimeout(
            "extrinsic was not included in time".to_owned(),
        )
        .into()),
    }
}

enum StatusOutcome {
    Pending,
    Included,
    Failed(eyre::Report),
}

fn classify_status(session: &ChainSession, status: &Value) -> StatusOutcome {
    if status.get("inBlock").is_some() || status.get("finalized").is_some() {
        return StatusOutcome::Included;
    }
    if let Some(de) = status.get("dispatchError") {
        let mi = de.get("module_index").and_then(Value::as_u64);
        let ei = de.get("error_index").and_then(Value::as_u64);
        if let (Some(mi), Some(ei)) = (mi, ei) {
            if let (Ok(mi), Ok(ei)) = (u8::try_from(mi), u8::try_from(ei)) {
                return StatusOutcome::Failed(session.decode_dispatch_error(mi, ei).into());
            }
        }
        return StatusOutcome::Failed(eyre::eyre!("undecodable dispatch error: {de}"));
    }
    if let Some(reason) = status.get("invalid").or_else(|| status.get("dropped")) {
        return StatusOutcome::Failed(eyre::eyre!("extrinsic rejected: {reason}"));
    }
    StatusOutcome::Pending
}

/// Dry-run fee query; falls back to a fixed conservative estimate rather
/// than failing the caller.
pub async fn estimate_fee(chain: &ConnectionManager, from: &str, call: Call) -> u128 {
    match estimate_fee_inner(chain, from, call).await {
        Ok(fee) => fee,
        Err(e) => {
            warn!(error = %e, "fee estimation failed; using fallback");
            FEE_FALLBACK
        }
    }
}

async fn estimate_fee_inner(
    chain: &ConnectionManager,
    from: &str,
    call: Call,
) -> eyre::Result<u128> {
    let node_link = chain.current_link().await?;
    let session = chain.session().await?;
    let method = session.capability("fee")?.to_owned();
    let nonce = chain.account_nonce(from).await?;
    let payload = UnsignedPayload::build(call, nonce, &session);
    let payload_hex = format!("0x{}", hex::encode(payload.encode()?));
    let v = node_link.request(&method, json!([payload_hex])).await?;
    let fee = v.get("partialFee").unwrap_or(&v);
    super::value_to_u128(fee).ok_or_else(|| eyre::eyre!("fee response malformed: {v}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StubSigner;

    impl RawSigner for StubSigner {
        fn public_key(&self) -> [u8; 32] {
            [3_u8; 32]
        }

        fn sign_raw(&self, _payload: &[u8]) -> [u8; 64] {
            [7_u8; 64]
        }
    }

    fn session() -> ChainSession {
        ChainSession {
            genesis_hash: [9_u8; 32],
            spec_version: 212,
            transaction_version: 1,
            capabilities: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    #[test]
    fn wrapped_signature_layout() {
        let signer: Arc<dyn RawSigner> = Arc::new(StubSigner);
        let raw = signer.sign_raw(b"anything");
        let wrapped = wrap_signature(&raw);
        assert_eq!(wrapped.len(), 65);
        assert_eq!(wrapped[0], SCHEME_ED25519);
        assert_eq!(&wrapped[1..], &[7_u8; 64]);
    }

    #[test]
    fn unsigned_payload_embeds_chain_context() -> eyre::Result<()> {
        let s = session();
        let p = UnsignedPayload::build(
            Call::Transfer {
                dest: [1_u8; 32],
                amount: 42,
            },
            11,
            &s,
        );
        let bytes = p.encode()?;
        let back = UnsignedPayload::try_from_slice(&bytes)?;
        assert_eq!(back, p);
        assert_eq!(back.nonce, 11);
        assert_eq!(back.genesis_hash, [9_u8; 32]);
        assert_eq!(back.spec_version, 212);
        assert_eq!(back.format_version, EXTRINSIC_FORMAT_VERSION);
        Ok(())
    }

    #[test]
    fn extrinsic_roundtrips_through_hex() -> eyre::Result<()> {
        let ext = Extrinsic {
            format_version: EXTRINSIC_FORMAT_VERSION,
            signer: [3_u8; 32],
            signature: wrap_signature(&[7_u8; 64]),
            nonce: 5,
            call: Call::AddStake {
                hotkey: [2_u8; 32],
                netuid: 12,
                amount: 1_000_000_000,
            },
        };
        let hex_str = ext.encode_hex()?;
        assert!(hex_str.starts_with("0x"), "hex form carries 0x prefix");
        let back = Extrinsic::decode_hex(&hex_str)?;
        assert_eq!(back, ext);
        Ok(())
    }

    #[test]
    fn extrinsic_hash_is_stable_32_bytes() -> eyre::Result<()> {
        let ext = Extrinsic {
            format_version: EXTRINSIC_FORMAT_VERSION,
            signer: [3_u8; 32],
            signature: wrap_signature(&[7_u8; 64]),
            nonce: 5,
            call: Call::Transfer {
                dest: [1_u8; 32],
                amount: 1,
            },
        };
        let h1 = ext.hash_hex()?;
        let h2 = ext.hash_hex()?;
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 2 + 64, "0x + 32 bytes hex");
        Ok(())
    }

    #[test]
    fn dispatch_status_decodes_via_session_metadata() {
        let mut s = session();
        s.errors.insert(
            (5, 1),
            super::super::DispatchErrorMeta {
                module: "staking".to_owned(),
                name: "InsufficientBalance".to_owned(),
                description: "account balance too low".to_owned(),
            },
        );
        let status = serde_json::json!({
            "dispatchError": { "module_index": 5, "error_index": 1 }
        });
        match classify_status(&s, &status) {
            StatusOutcome::Failed(e) => {
                assert_eq!(
                    e.to_string(),
                    "staking.InsufficientBalance: account balance too low"
                );
            }
            StatusOutcome::Pending | StatusOutcome::Included => {
                panic!("dispatch error must classify as failure")
            }
        }
    }

    #[test]
    fn inclusion_statuses_classify_correctly() {
        let s = session();
        assert!(matches!(
            classify_status(&s, &serde_json::json!({"ready": true})),
            StatusOutcome::Pending
        ));
        assert!(matches!(
            classify_status(&s, &serde_json::json!({"inBlock": "0xabc"})),
            StatusOutcome::Included
        ));
        assert!(matches!(
            classify_status(&s, &serde_json::json!({"finalized": "0xabc"})),
            StatusOutcome::Included
        ));
        assert!(matches!(
            classify_status(&s, &serde_json::json!({"invalid": "bad nonce"})),
            StatusOutcome::Failed(_)
        ));
    }
}
