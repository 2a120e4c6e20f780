//! Signing capabilities handed out by the key manager.
//!
//! Only the [`RawSigner`] trait object crosses into the signing pipeline;
//! decrypted secrets stay inside this module.

use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signer as _, SigningKey};
use zeroize::Zeroizing;

use crate::errors::KeeperError;

use super::address;

pub const SEED_LEN: usize = 32;
pub const KEYPAIR_LEN: usize = 64;
pub const MNEMONIC_WORDS: usize = 24;

/// A capability that signs raw payload bytes for one account.
pub trait RawSigner: Send + Sync {
    fn public_key(&self) -> [u8; 32];
    fn sign_raw(&self, payload: &[u8]) -> [u8; 64];

    fn address(&self) -> String {
        address::encode(&self.public_key())
    }
}

#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Accept a 32-byte seed or a 64-byte seed+public keypair blob.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeeperError> {
        match bytes.len() {
            SEED_LEN => {
                let mut seed = Zeroizing::new([0_u8; 32]);
                seed.copy_from_slice(bytes);
                Ok(Self::from_seed(&seed))
            }
            KEYPAIR_LEN => {
                let mut pair = Zeroizing::new([0_u8; 64]);
                pair.copy_from_slice(bytes);
                let key = SigningKey::from_keypair_bytes(&pair).map_err(|_e| {
                    KeeperError::InvalidSecret("keypair public half does not match seed".into())
                })?;
                Ok(Self { key })
            }
            n => Err(KeeperError::InvalidSecret(format!(
                "key must be {SEED_LEN} or {KEYPAIR_LEN} bytes, got {n}"
            ))),
        }
    }

    /// Derive from a BIP-39 phrase: the signing seed is the first 32 bytes
    /// of the standard mnemonic seed.
    pub fn from_mnemonic_phrase(phrase: &str) -> Result<Self, KeeperError> {
        let mnemonic = parse_mnemonic(phrase)?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let mut head = Zeroizing::new([0_u8; 32]);
        head.copy_from_slice(&seed[..SEED_LEN]);
        Ok(Self::from_seed(&head))
    }
}

impl RawSigner for Ed25519Signer {
    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn sign_raw(&self, payload: &[u8]) -> [u8; 64] {
        self.key.sign(payload).to_bytes()
    }
}

/// Validate a phrase (word list + checksum) without keeping it.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, KeeperError> {
    Mnemonic::parse_in_normalized(Language::English, phrase.trim())
        .map_err(|e| KeeperError::InvalidSecret(format!("invalid mnemonic: {e}")))
}

/// Generate a fresh 24-word phrase and its signer.
pub fn generate_mnemonic() -> eyre::Result<(Zeroizing<String>, Ed25519Signer)> {
    let mnemonic = Mnemonic::generate_in(Language::English, MNEMONIC_WORDS)
        .map_err(|e| eyre::eyre!("generate mnemonic: {e}"))?;
    let phrase = Zeroizing::new(mnemonic.to_string());
    let signer = Ed25519Signer::from_mnemonic_phrase(&phrase)
        .map_err(|e| eyre::eyre!("derive from fresh mnemonic: {e}"))?;
    Ok((phrase, signer))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn mnemonic_derivation_is_deterministic() -> eyre::Result<()> {
        let a = Ed25519Signer::from_mnemonic_phrase(VECTOR_PHRASE).map_err(|e| eyre::eyre!("{e}"))?;
        let b = Ed25519Signer::from_mnemonic_phrase(VECTOR_PHRASE).map_err(|e| eyre::eyre!("{e}"))?;
        assert_eq!(a.address(), b.address());
        Ok(())
    }

    #[test]
    fn bad_mnemonic_checksum_is_rejected() {
        let err = Ed25519Signer::from_mnemonic_phrase(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon",
        )
        .err();
        assert!(
            matches!(err, Some(KeeperError::InvalidSecret(_))),
            "expected InvalidSecret, got {err:?}"
        );
    }

    #[test]
    fn generated_mnemonic_has_24_words() -> eyre::Result<()> {
        let (phrase, signer) = generate_mnemonic()?;
        assert_eq!(phrase.split_whitespace().count(), MNEMONIC_WORDS);
        assert!(address::is_valid(&signer.address()), "derived address must be valid");
        Ok(())
    }

    #[test]
    fn secret_bytes_length_is_enforced() {
        assert!(Ed25519Signer::from_secret_bytes(&[0_u8; 31]).is_err(), "31 bytes");
        assert!(Ed25519Signer::from_secret_bytes(&[0_u8; 33]).is_err(), "33 bytes");
        assert!(Ed25519Signer::from_secret_bytes(&[0_u8; 32]).is_ok(), "32 bytes");
    }

    #[test]
    fn keypair_blob_must_be_consistent() {
        let signer = Ed25519Signer::from_seed(&[5_u8; 32]);
        let mut blob = [0_u8; 64];
        blob[..32].copy_from_slice(&[5_u8; 32]);
        blob[32..].copy_from_slice(&signer.public_key());
        assert!(Ed25519Signer::from_secret_bytes(&blob).is_ok(), "matching halves");

        blob[63] ^= 0x01;
        assert!(
            Ed25519Signer::from_secret_bytes(&blob).is_err(),
            "mismatched public half"
        );
    }

    #[test]
    fn signatures_are_64_bytes_and_stable() {
        let signer = Ed25519Signer::from_seed(&[9_u8; 32]);
        let s1 = signer.sign_raw(b"payload");
        let s2 = signer.sign_raw(b"payload");
        assert_eq!(s1.len(), 64);
        assert_eq!(s1, s2, "ed25519 is deterministic");
    }
}
