//! Password-based authenticated encryption for vault secrets.
//!
//! One key per secret: PBKDF2-HMAC-SHA256 over the password with a fresh
//! 32-byte salt, then AES-256-GCM with a fresh 12-byte nonce. Parameters are
//! recorded in the package so they stay versioned with the ciphertext.

use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use eyre::Context as _;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize as _, Zeroizing};

use crate::errors::KeeperError;

pub const KDF_ITERATIONS: u32 = 900_000;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const ALGORITHM: &str = "aes-256-gcm";
const KDF: &str = "pbkdf2-sha256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPackage {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub algorithm: String,
    pub kdf: String,
    pub kdf_params: KdfParams,
}

/// Owned copy of a password for handing to the blocking pool.
pub fn clone_password(p: &SecretString) -> SecretString {
    SecretString::new(p.expose_secret().to_owned().into())
}

fn derive_key(password: &SecretString, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0_u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        key.as_mut(),
    );
    key
}

pub fn encrypt(plaintext: &[u8], password: &SecretString) -> eyre::Result<EncryptedPackage> {
    let mut salt = [0_u8; SALT_LEN];
    let mut nonce = [0_u8; NONCE_LEN];
    {
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);
    }

    let key = derive_key(password, &salt, KDF_ITERATIONS);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).context("aes init")?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let pkg = EncryptedPackage {
        ciphertext: b64.encode(ct),
        iv: b64.encode(nonce),
        salt: b64.encode(salt),
        algorithm: ALGORITHM.to_owned(),
        kdf: KDF.to_owned(),
        kdf_params: KdfParams {
            iterations: KDF_ITERATIONS,
        },
    };
    salt.zeroize();
    nonce.zeroize();
    Ok(pkg)
}

/// Decrypt a package with the given password.
///
/// Every failure mode (wrong password, corrupted ciphertext, malformed
/// fields) collapses into the same `DecryptionError` so nothing reveals
/// partial correctness of the password.
pub fn decrypt(pkg: &EncryptedPackage, password: &SecretString) -> Result<Zeroizing<Vec<u8>>, KeeperError> {
    if pkg.algorithm != ALGORITHM || pkg.kdf != KDF {
        return Err(KeeperError::Decryption);
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    let salt = b64.decode(&pkg.salt).map_err(|_e| KeeperError::Decryption)?;
    let nonce = b64.decode(&pkg.iv).map_err(|_e| KeeperError::Decryption)?;
    let ct = b64
        .decode(&pkg.ciphertext)
        .map_err(|_e| KeeperError::Decryption)?;
    if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
        return Err(KeeperError::Decryption);
    }

    let key = derive_key(password, &salt, pkg.kdf_params.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_e| KeeperError::Decryption)?;
    let pt = cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
        .map_err(|_e| KeeperError::Decryption)?;
    Ok(Zeroizing::new(pt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pw(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    #[test]
    fn roundtrip_many_draws() -> eyre::Result<()> {
        let password = pw("Secret123!_");
        // Each draw costs a full 900k-iteration derivation; keep the loop small.
        for i in 0_u8..3 {
            let plaintext = vec![i; 40];
            let pkg = encrypt(&plaintext, &password)?;
            let out = decrypt(&pkg, &password).map_err(|e| eyre::eyre!("decrypt: {e}"))?;
            assert_eq!(out.as_slice(), plaintext.as_slice());
        }
        Ok(())
    }

    #[test]
    fn encryption_is_never_deterministic() -> eyre::Result<()> {
        let password = pw("same password");
        let a = encrypt(b"same plaintext", &password)?;
        let b = encrypt(b"same plaintext", &password)?;
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.salt, b.salt);
        Ok(())
    }

    #[test]
    fn wrong_password_fails_generically() -> eyre::Result<()> {
        let pkg = encrypt(b"payload", &pw("right"))?;
        let err = decrypt(&pkg, &pw("wrong")).err();
        assert!(
            matches!(err, Some(KeeperError::Decryption)),
            "expected DecryptionError, got {err:?}"
        );
        Ok(())
    }

    #[test]
    fn corrupted_ciphertext_fails_like_wrong_password() -> eyre::Result<()> {
        let password = pw("right");
        let mut pkg = encrypt(b"payload", &password)?;
        pkg.ciphertext = {
            let b64 = base64::engine::general_purpose::STANDARD;
            let mut raw = b64.decode(&pkg.ciphertext)?;
            if let Some(first) = raw.first_mut() {
                *first ^= 0xff;
            }
            b64.encode(raw)
        };
        let err = decrypt(&pkg, &password).err();
        assert!(
            matches!(err, Some(KeeperError::Decryption)),
            "expected DecryptionError, got {err:?}"
        );
        Ok(())
    }

    #[test]
    fn package_records_kdf_parameters() -> eyre::Result<()> {
        let pkg = encrypt(b"x", &pw("p"))?;
        assert_eq!(pkg.algorithm, "aes-256-gcm");
        assert_eq!(pkg.kdf, "pbkdf2-sha256");
        assert_eq!(pkg.kdf_params.iterations, KDF_ITERATIONS);
        Ok(())
    }
}
