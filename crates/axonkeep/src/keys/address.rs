//! SS58 address codec for 32-byte ed25519 public keys.

use blake2::{digest::consts::U32, Blake2b, Blake2b512, Digest as _};

use crate::errors::KeeperError;

type Blake2b256 = Blake2b<U32>;

/// Network prefix baked into every address this daemon produces.
pub const SS58_PREFIX: u8 = 42;

const CHECKSUM_PREIMAGE: &[u8] = b"SS58PRE";

fn checksum(data: &[u8]) -> [u8; 2] {
    let mut h = Blake2b512::new();
    h.update(CHECKSUM_PREIMAGE);
    h.update(data);
    let digest = h.finalize();
    let mut out = [0_u8; 2];
    out.copy_from_slice(&digest[..2]);
    out
}

pub fn encode(public_key: &[u8; 32]) -> String {
    let mut data = Vec::with_capacity(1 + 32 + 2);
    data.push(SS58_PREFIX);
    data.extend_from_slice(public_key);
    let cs = checksum(&data);
    data.extend_from_slice(&cs);
    bs58::encode(data).into_string()
}

pub fn decode(address: &str) -> Result<[u8; 32], KeeperError> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|_e| KeeperError::Validation(format!("malformed address: {address}")))?;
    if bytes.len() != 1 + 32 + 2 {
        return Err(KeeperError::Validation(format!(
            "malformed address: {address}"
        )));
    }
    let (payload, cs) = bytes.split_at(33);
    if checksum(payload) != [cs[0], cs[1]] {
        return Err(KeeperError::Validation(format!(
            "address checksum mismatch: {address}"
        )));
    }
    if payload[0] != SS58_PREFIX {
        return Err(KeeperError::Validation(format!(
            "unexpected address prefix {} in {address}",
            payload[0]
        )));
    }
    let mut out = [0_u8; 32];
    out.copy_from_slice(&payload[1..]);
    Ok(out)
}

pub fn is_valid(address: &str) -> bool {
    decode(address).is_ok()
}

/// Deterministic address for a multisig account: the hash of a domain tag,
/// the sorted signatory keys, and the threshold.
pub fn derive_multisig(
    signatories: &[String],
    threshold: u16,
) -> Result<String, KeeperError> {
    if threshold == 0 {
        return Err(KeeperError::Validation("threshold must be >= 1".into()));
    }
    if usize::from(threshold) > signatories.len() {
        return Err(KeeperError::Validation(format!(
            "threshold {threshold} exceeds {} signatories",
            signatories.len()
        )));
    }
    let mut keys: Vec<[u8; 32]> = signatories
        .iter()
        .map(|s| decode(s))
        .collect::<Result<_, _>>()?;
    keys.sort_unstable();
    keys.dedup();
    if keys.len() != signatories.len() {
        return Err(KeeperError::Validation(
            "duplicate signatory addresses".into(),
        ));
    }

    let mut h = Blake2b256::new();
    h.update(b"axonkeep/multisig");
    for k in &keys {
        h.update(k);
    }
    h.update(threshold.to_le_bytes());
    let digest = h.finalize();
    let mut pk = [0_u8; 32];
    pk.copy_from_slice(&digest);
    Ok(encode(&pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() -> eyre::Result<()> {
        let pk = [7_u8; 32];
        let addr = encode(&pk);
        let back = decode(&addr).map_err(|e| eyre::eyre!("{e}"))?;
        assert_eq!(back, pk);
        assert!(is_valid(&addr), "roundtripped address must validate");
        Ok(())
    }

    #[test]
    fn corrupted_address_fails_checksum() {
        let addr = encode(&[9_u8; 32]);
        // Flip one character somewhere past the prefix.
        let mut chars: Vec<char> = addr.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == '1' { '2' } else { '1' };
        let corrupted: String = chars.into_iter().collect();
        assert!(!is_valid(&corrupted), "corrupted address must not validate");
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(!is_valid(""));
        assert!(!is_valid("not-an-address"));
        assert!(!is_valid("0O0O0O"));
    }

    #[test]
    fn multisig_address_is_order_independent() -> eyre::Result<()> {
        let a = encode(&[1_u8; 32]);
        let b = encode(&[2_u8; 32]);
        let m1 = derive_multisig(&[a.clone(), b.clone()], 2).map_err(|e| eyre::eyre!("{e}"))?;
        let m2 = derive_multisig(&[b, a], 2).map_err(|e| eyre::eyre!("{e}"))?;
        assert_eq!(m1, m2);
        Ok(())
    }

    #[test]
    fn multisig_rejects_bad_threshold() {
        let a = encode(&[1_u8; 32]);
        assert!(derive_multisig(&[a.clone()], 0).is_err(), "zero threshold");
        assert!(derive_multisig(&[a], 2).is_err(), "threshold > signatories");
    }
}
