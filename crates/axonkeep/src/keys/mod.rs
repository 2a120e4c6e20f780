//! The key manager: coldkey/hotkey lifecycle, unlock sessions, rate
//! limiting, auto-lock, and password changes.
//!
//! Decrypted secrets never leave this module; callers get an
//! [`signer::RawSigner`] capability per unlocked account. KDF work runs on
//! the blocking pool so a 900k-iteration derivation never stalls other
//! request flows.

pub mod address;
pub mod signer;

use crate::{
    crypto::{self, EncryptedPackage},
    errors::KeeperError,
    vault::{Coldkey, ColdkeyKind, Hotkey, LockState, MultisigMeta, Settings, VaultStore},
};
use eyre::Context as _;
use secrecy::SecretString;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::AbortHandle,
    time::Instant,
};
use tracing::{info, warn};
use zeroize::Zeroizing;

use signer::{Ed25519Signer, RawSigner};

const MAX_FAILED_ATTEMPTS: u32 = 5;
const ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    last_failure: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColdkeyInfo {
    pub id: String,
    pub kind: ColdkeyKind,
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    pub unlocked: bool,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotkeyInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub coldkey_id: String,
    pub registered_neuronets: Vec<u16>,
    pub backed_up: bool,
    pub unlocked: bool,
    pub created_at: String,
}

/// Result of a password change: hotkeys re-encrypted under the new
/// password, and hotkeys left untouched because their secret did not
/// decrypt under the coldkey's current password.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordChangeOutcome {
    pub rekeyed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct KeyManager {
    store: VaultStore,
    sessions: Mutex<HashMap<String, Arc<dyn RawSigner>>>,
    attempts: Mutex<HashMap<String, AttemptWindow>>,
    autolock: Mutex<Option<AbortHandle>>,
    /// Handed to timer tasks so a fired timer never keeps the service
    /// alive past shutdown.
    weak: Weak<Self>,
}

async fn decrypt_blocking(
    pkg: EncryptedPackage,
    password: SecretString,
) -> eyre::Result<Result<Zeroizing<Vec<u8>>, KeeperError>> {
    tokio::task::spawn_blocking(move || crypto::decrypt(&pkg, &password))
        .await
        .context("join decrypt task")
}

async fn encrypt_blocking(
    plaintext: Zeroizing<Vec<u8>>,
    password: SecretString,
) -> eyre::Result<EncryptedPackage> {
    tokio::task::spawn_blocking(move || crypto::encrypt(&plaintext, &password))
        .await
        .context("join encrypt task")?
}

/// Interpret a decrypted secret: a UTF-8 mnemonic phrase, else raw key
/// bytes (32-byte seed or 64-byte keypair).
fn signer_from_secret(secret: &[u8]) -> Result<Ed25519Signer, KeeperError> {
    if let Ok(phrase) = std::str::from_utf8(secret) {
        if signer::parse_mnemonic(phrase).is_ok() {
            return Ed25519Signer::from_mnemonic_phrase(phrase);
        }
    }
    Ed25519Signer::from_secret_bytes(secret)
}

fn parse_key_hex(s: &str) -> Result<Zeroizing<Vec<u8>>, KeeperError> {
    let trimmed = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(trimmed)
        .map_err(|_e| KeeperError::InvalidSecret("key must be hex".into()))?;
    Ok(Zeroizing::new(bytes))
}

impl KeyManager {
    pub fn new(store: VaultStore) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            autolock: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub const fn store(&self) -> &VaultStore {
        &self.store
    }

    // ── Coldkey lifecycle ────────────────────────────────────────────

    /// Generate a fresh 24-word coldkey. Returns the phrase (shown once)
    /// and the new record; the coldkey is left unlocked and a default
    /// hotkey is created under the same password.
    pub async fn create_coldkey(
        &self,
        name: &str,
        password: &SecretString,
    ) -> eyre::Result<(Zeroizing<String>, ColdkeyInfo)> {
        let (phrase, sk) = signer::generate_mnemonic()?;
        let info = self
            .add_coldkey_with_secret(
                name,
                ColdkeyKind::Hd,
                &sk,
                Zeroizing::new(phrase.as_bytes().to_vec()),
                password,
            )
            .await?;
        Ok((phrase, info))
    }

    pub async fn import_coldkey_mnemonic(
        &self,
        name: &str,
        phrase: &str,
        password: &SecretString,
    ) -> eyre::Result<ColdkeyInfo> {
        let sk = Ed25519Signer::from_mnemonic_phrase(phrase)?;
        self.add_coldkey_with_secret(
            name,
            ColdkeyKind::Hd,
            &sk,
            Zeroizing::new(phrase.trim().as_bytes().to_vec()),
            password,
        )
        .await
    }

    pub async fn import_coldkey_raw(
        &self,
        name: &str,
        key_hex: &str,
        password: &SecretString,
    ) -> eyre::Result<ColdkeyInfo> {
        let bytes = parse_key_hex(key_hex)?;
        let sk = Ed25519Signer::from_secret_bytes(&bytes)?;
        self.add_coldkey_with_secret(name, ColdkeyKind::PrivateKey, &sk, bytes, password)
            .await
    }

    /// Import an external keystore document. The document must carry the
    /// standard structural fields (`ciphertext`/`iv`/`salt`/`kdf`); it is
    /// decrypted with its own password and re-encrypted under `password`.
    pub async fn import_coldkey_keystore(
        &self,
        name: &str,
        keystore_json: &str,
        keystore_password: &SecretString,
        password: &SecretString,
    ) -> eyre::Result<ColdkeyInfo> {
        let pkg: EncryptedPackage = serde_json::from_str(keystore_json).map_err(|e| {
            KeeperError::Validation(format!("keystore missing required fields: {e}"))
        })?;
        let secret = decrypt_blocking(pkg, crypto::clone_password(keystore_password)).await??;
        let sk = signer_from_secret(&secret)?;
        self.add_coldkey_with_secret(name, ColdkeyKind::Keystore, &sk, secret, password)
            .await
    }

    /// Watch-only coldkey: an address with no secret and no hotkeys.
    pub async fn import_coldkey_watch(&self, name: &str, addr: &str) -> eyre::Result<ColdkeyInfo> {
        if !address::is_valid(addr) {
            return Err(KeeperError::Validation(format!("malformed address: {addr}")).into());
        }
        let record = self
            .insert_coldkey(name, ColdkeyKind::Watch, addr, None, None)
            .await?;
        self.coldkey_info(&record).await
    }

    pub async fn create_coldkey_multisig(
        &self,
        name: &str,
        signatories: Vec<String>,
        threshold: u16,
    ) -> eyre::Result<ColdkeyInfo> {
        let addr = address::derive_multisig(&signatories, threshold)?;
        let record = self
            .insert_coldkey(
                name,
                ColdkeyKind::Multisig,
                &addr,
                None,
                Some(MultisigMeta {
                    threshold,
                    signatories,
                }),
            )
            .await?;
        self.coldkey_info(&record).await
    }

    async fn add_coldkey_with_secret(
        &self,
        name: &str,
        kind: ColdkeyKind,
        sk: &Ed25519Signer,
        secret: Zeroizing<Vec<u8>>,
        password: &SecretString,
    ) -> eyre::Result<ColdkeyInfo> {
        let addr = sk.address();
        let encrypted = encrypt_blocking(secret, crypto::clone_password(password)).await?;
        let record = self
            .insert_coldkey(name, kind, &addr, Some(encrypted), None)
            .await?;

        // Leave the new coldkey unlocked and start its idle timer.
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(record.id.clone(), Arc::new(sk.clone()));
        }
        self.mark_unlocked().await?;
        self.arm_autolock().await?;

        // Every new or imported coldkey gets one default hotkey under the
        // same password.
        self.create_hotkey_inner(&record.id, "default", password, None)
            .await?;

        self.coldkey_info(&record).await
    }

    async fn insert_coldkey(
        &self,
        name: &str,
        kind: ColdkeyKind,
        addr: &str,
        encrypted_secret: Option<EncryptedPackage>,
        multisig: Option<MultisigMeta>,
    ) -> eyre::Result<Coldkey> {
        if name.trim().is_empty() {
            return Err(KeeperError::Validation("name must not be empty".into()).into());
        }
        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        if vault.coldkeys.iter().any(|c| c.address == addr) {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::DuplicateAddress(addr.to_owned()).into());
        }
        let now = crate::vault::utc_now_iso();
        let record = Coldkey {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: name.trim().to_owned(),
            address: addr.to_owned(),
            encrypted_secret,
            derivation_path: None,
            multisig,
            created_at: now.clone(),
            updated_at: now,
        };
        vault.coldkeys.push(record.clone());
        vault.active_coldkey_id = Some(record.id.clone());
        self.store.save_vault(&vault)?;
        VaultStore::release_lock(lock)?;
        info!(coldkey = %record.id, kind = ?kind, "coldkey added");
        Ok(record)
    }

    pub async fn rename_coldkey(&self, id: &str, name: &str) -> eyre::Result<()> {
        if name.trim().is_empty() {
            return Err(KeeperError::Validation("name must not be empty".into()).into());
        }
        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        let Some(ck) = vault.coldkeys.iter_mut().find(|c| c.id == id) else {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("coldkey {id}")).into());
        };
        ck.name = name.trim().to_owned();
        ck.updated_at = crate::vault::utc_now_iso();
        self.store.save_vault(&vault)?;
        VaultStore::release_lock(lock)?;
        Ok(())
    }

    /// Remove a coldkey and every hotkey that references it.
    pub async fn delete_coldkey(&self, id: &str) -> eyre::Result<()> {
        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        let before = vault.coldkeys.len();
        vault.coldkeys.retain(|c| c.id != id);
        if vault.coldkeys.len() == before {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("coldkey {id}")).into());
        }
        if vault.active_coldkey_id.as_deref() == Some(id) {
            vault.active_coldkey_id = vault.coldkeys.first().map(|c| c.id.clone());
        }

        let mut hotkeys = self.store.load_hotkeys()?;
        let removed: Vec<String> = hotkeys
            .iter()
            .filter(|h| h.coldkey_id == id)
            .map(|h| h.id.clone())
            .collect();
        hotkeys.retain(|h| h.coldkey_id != id);

        self.store.save_vault(&vault)?;
        self.store.save_hotkeys(&hotkeys)?;
        VaultStore::release_lock(lock)?;

        let mut sessions = self.sessions.lock().await;
        sessions.remove(id);
        for hid in &removed {
            sessions.remove(hid);
        }
        drop(sessions);
        info!(coldkey = %id, cascaded = removed.len(), "coldkey deleted");
        Ok(())
    }

    pub async fn set_active_coldkey(&self, id: &str) -> eyre::Result<()> {
        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        if !vault.coldkeys.iter().any(|c| c.id == id) {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("coldkey {id}")).into());
        }
        vault.active_coldkey_id = Some(id.to_owned());
        self.store.save_vault(&vault)?;
        VaultStore::release_lock(lock)?;
        Ok(())
    }

    pub async fn active_coldkey(&self) -> eyre::Result<Option<Coldkey>> {
        let vault = self.store.load_vault()?;
        let Some(id) = vault.active_coldkey_id else {
            return Ok(None);
        };
        Ok(vault.coldkeys.into_iter().find(|c| c.id == id))
    }

    pub async fn list_coldkeys(&self) -> eyre::Result<Vec<ColdkeyInfo>> {
        let vault = self.store.load_vault()?;
        let sessions = self.sessions.lock().await;
        let active = vault.active_coldkey_id.clone();
        Ok(vault
            .coldkeys
            .iter()
            .map(|c| Self::info_from(c, sessions.contains_key(&c.id), active.as_deref()))
            .collect())
    }

    fn info_from(c: &Coldkey, unlocked: bool, active: Option<&str>) -> ColdkeyInfo {
        ColdkeyInfo {
            id: c.id.clone(),
            kind: c.kind,
            name: c.name.clone(),
            address: c.address.clone(),
            derivation_path: c.derivation_path.clone(),
            unlocked,
            active: active == Some(c.id.as_str()),
            created_at: c.created_at.clone(),
            updated_at: c.updated_at.clone(),
        }
    }

    async fn coldkey_info(&self, c: &Coldkey) -> eyre::Result<ColdkeyInfo> {
        let vault = self.store.load_vault()?;
        let sessions = self.sessions.lock().await;
        Ok(Self::info_from(
            c,
            sessions.contains_key(&c.id),
            vault.active_coldkey_id.as_deref(),
        ))
    }

    /// Reveal a coldkey's secret (phrase or hex key). Requires the
    /// password even while unlocked.
    pub async fn export_coldkey(
        &self,
        id: &str,
        password: &SecretString,
    ) -> eyre::Result<Zeroizing<String>> {
        let vault = self.store.load_vault()?;
        let ck = vault
            .coldkeys
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| KeeperError::NotFound(format!("coldkey {id}")))?;
        let pkg = ck
            .encrypted_secret
            .clone()
            .ok_or_else(|| KeeperError::Validation("coldkey has no exportable secret".into()))?;
        let secret = decrypt_blocking(pkg, crypto::clone_password(password)).await??;
        let out = std::str::from_utf8(&secret).map_or_else(
            |_e| Zeroizing::new(hex::encode(&*secret)),
            |s| Zeroizing::new(s.to_owned()),
        );
        Ok(out)
    }

    // ── Hotkeys ──────────────────────────────────────────────────────

    pub async fn create_hotkey(
        &self,
        coldkey_id: &str,
        name: &str,
        password: &SecretString,
    ) -> eyre::Result<(Zeroizing<String>, HotkeyInfo)> {
        let (phrase, info) = self
            .create_hotkey_inner(coldkey_id, name, password, None)
            .await?;
        let phrase =
            phrase.ok_or_else(|| eyre::eyre!("generated hotkey must return its phrase"))?;
        Ok((phrase, info))
    }

    pub async fn import_hotkey(
        &self,
        coldkey_id: &str,
        name: &str,
        phrase: &str,
        password: &SecretString,
    ) -> eyre::Result<HotkeyInfo> {
        let (_phrase, info) = self
            .create_hotkey_inner(coldkey_id, name, password, Some(phrase))
            .await?;
        Ok(info)
    }

    async fn create_hotkey_inner(
        &self,
        coldkey_id: &str,
        name: &str,
        password: &SecretString,
        imported_phrase: Option<&str>,
    ) -> eyre::Result<(Option<Zeroizing<String>>, HotkeyInfo)> {
        let vault = self.store.load_vault()?;
        if !vault.coldkeys.iter().any(|c| c.id == coldkey_id) {
            return Err(KeeperError::NotFound(format!("coldkey {coldkey_id}")).into());
        }

        let (phrase, sk, backed_up) = match imported_phrase {
            Some(p) => {
                let sk = Ed25519Signer::from_mnemonic_phrase(p)?;
                (Zeroizing::new(p.trim().to_owned()), sk, true)
            }
            None => {
                let (phrase, sk) = signer::generate_mnemonic()?;
                (phrase, sk, false)
            }
        };
        let addr = sk.address();

        let lock = self.store.acquire_write_lock()?;
        let mut hotkeys = self.store.load_hotkeys()?;
        if hotkeys.iter().any(|h| h.address == addr) {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::DuplicateAddress(addr).into());
        }
        let encrypted = encrypt_blocking(
            Zeroizing::new(phrase.as_bytes().to_vec()),
            crypto::clone_password(password),
        )
        .await?;
        let record = Hotkey {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_owned(),
            address: addr,
            coldkey_id: coldkey_id.to_owned(),
            encrypted_secret: encrypted,
            registered_neuronets: vec![],
            backed_up,
            created_at: crate::vault::utc_now_iso(),
        };
        hotkeys.push(record.clone());
        self.store.save_hotkeys(&hotkeys)?;
        VaultStore::release_lock(lock)?;

        let info = self.hotkey_info(&record).await;
        let out_phrase = if backed_up { None } else { Some(phrase) };
        Ok((out_phrase, info))
    }

    async fn hotkey_info(&self, h: &Hotkey) -> HotkeyInfo {
        let sessions = self.sessions.lock().await;
        HotkeyInfo {
            id: h.id.clone(),
            name: h.name.clone(),
            address: h.address.clone(),
            coldkey_id: h.coldkey_id.clone(),
            registered_neuronets: h.registered_neuronets.clone(),
            backed_up: h.backed_up,
            unlocked: sessions.contains_key(&h.id),
            created_at: h.created_at.clone(),
        }
    }

    pub async fn list_hotkeys(&self, coldkey_id: Option<&str>) -> eyre::Result<Vec<HotkeyInfo>> {
        let hotkeys = self.store.load_hotkeys()?;
        let sessions = self.sessions.lock().await;
        Ok(hotkeys
            .iter()
            .filter(|h| coldkey_id.is_none_or(|id| h.coldkey_id == id))
            .map(|h| HotkeyInfo {
                id: h.id.clone(),
                name: h.name.clone(),
                address: h.address.clone(),
                coldkey_id: h.coldkey_id.clone(),
                registered_neuronets: h.registered_neuronets.clone(),
                backed_up: h.backed_up,
                unlocked: sessions.contains_key(&h.id),
                created_at: h.created_at.clone(),
            })
            .collect())
    }

    pub async fn rename_hotkey(&self, id: &str, name: &str) -> eyre::Result<()> {
        if name.trim().is_empty() {
            return Err(KeeperError::Validation("name must not be empty".into()).into());
        }
        let lock = self.store.acquire_write_lock()?;
        let mut hotkeys = self.store.load_hotkeys()?;
        let Some(h) = hotkeys.iter_mut().find(|h| h.id == id) else {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("hotkey {id}")).into());
        };
        h.name = name.trim().to_owned();
        self.store.save_hotkeys(&hotkeys)?;
        VaultStore::release_lock(lock)?;
        Ok(())
    }

    pub async fn delete_hotkey(&self, id: &str) -> eyre::Result<()> {
        let lock = self.store.acquire_write_lock()?;
        let mut hotkeys = self.store.load_hotkeys()?;
        let before = hotkeys.len();
        hotkeys.retain(|h| h.id != id);
        if hotkeys.len() == before {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("hotkey {id}")).into());
        }
        self.store.save_hotkeys(&hotkeys)?;
        VaultStore::release_lock(lock)?;
        self.sessions.lock().await.remove(id);
        Ok(())
    }

    /// Confirm the user recorded the hotkey phrase: the supplied phrase
    /// must match the stored secret. Only then does `backed_up` flip.
    pub async fn verify_hotkey_backup(
        &self,
        id: &str,
        phrase: &str,
        password: &SecretString,
    ) -> eyre::Result<bool> {
        let hotkeys = self.store.load_hotkeys()?;
        let h = hotkeys
            .iter()
            .find(|h| h.id == id)
            .ok_or_else(|| KeeperError::NotFound(format!("hotkey {id}")))?;
        let secret = decrypt_blocking(h.encrypted_secret.clone(), crypto::clone_password(password)).await??;
        let stored = std::str::from_utf8(&secret)
            .map_err(|_e| KeeperError::Validation("hotkey secret is not a phrase".into()))?;
        let matches = stored.split_whitespace().collect::<Vec<_>>()
            == phrase.split_whitespace().collect::<Vec<_>>();
        if matches && !h.backed_up {
            let lock = self.store.acquire_write_lock()?;
            let mut hotkeys = self.store.load_hotkeys()?;
            if let Some(hm) = hotkeys.iter_mut().find(|h| h.id == id) {
                hm.backed_up = true;
            }
            self.store.save_hotkeys(&hotkeys)?;
            VaultStore::release_lock(lock)?;
        }
        Ok(matches)
    }

    // ── Lock / unlock ────────────────────────────────────────────────

    /// Unlock a coldkey or hotkey. Returns `Ok(false)` on a wrong
    /// password; rate limiting surfaces as `RateLimitedError` without
    /// touching the ciphertext.
    pub async fn unlock(
        &self,
        id: &str,
        password: &SecretString,
    ) -> eyre::Result<bool> {
        let (pkg, expected_addr, is_coldkey) = self.lookup_secret(id).await?;

        self.check_rate_limit(id).await?;

        let secret = match decrypt_blocking(pkg, crypto::clone_password(password)).await? {
            Ok(s) => s,
            Err(KeeperError::Decryption) => {
                self.record_failed_attempt(id).await;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let sk = signer_from_secret(&secret)?;
        if sk.address() != expected_addr {
            // Decryptable but wrong key material means a corrupt record,
            // not a wrong password.
            return Err(KeeperError::Validation(format!(
                "stored secret does not derive recorded address for {id}"
            ))
            .into());
        }

        self.sessions.lock().await.insert(id.to_owned(), Arc::new(sk));
        self.attempts.lock().await.remove(id);
        self.mark_unlocked().await?;
        if is_coldkey {
            self.arm_autolock().await?;
        }
        Ok(true)
    }

    async fn lookup_secret(&self, id: &str) -> eyre::Result<(EncryptedPackage, String, bool)> {
        let vault = self.store.load_vault()?;
        if let Some(ck) = vault.coldkeys.iter().find(|c| c.id == id) {
            if !ck.kind.can_sign() {
                return Err(KeeperError::Validation(format!(
                    "{:?} coldkey cannot be unlocked",
                    ck.kind
                ))
                .into());
            }
            let pkg = ck
                .encrypted_secret
                .clone()
                .ok_or_else(|| KeeperError::Validation("coldkey has no secret".into()))?;
            return Ok((pkg, ck.address.clone(), true));
        }
        let hotkeys = self.store.load_hotkeys()?;
        if let Some(h) = hotkeys.iter().find(|h| h.id == id) {
            return Ok((h.encrypted_secret.clone(), h.address.clone(), false));
        }
        Err(KeeperError::NotFound(format!("key {id}")).into())
    }

    async fn check_rate_limit(&self, id: &str) -> Result<(), KeeperError> {
        let mut attempts = self.attempts.lock().await;
        let Some(w) = attempts.get(id).copied() else {
            return Ok(());
        };
        let elapsed = w.last_failure.elapsed();
        if elapsed >= ATTEMPT_WINDOW {
            attempts.remove(id);
            return Ok(());
        }
        if w.count >= MAX_FAILED_ATTEMPTS {
            let retry_after = ATTEMPT_WINDOW.saturating_sub(elapsed);
            return Err(KeeperError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
        Ok(())
    }

    async fn record_failed_attempt(&self, id: &str) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(id.to_owned()).or_insert(AttemptWindow {
            count: 0,
            last_failure: now,
        });
        entry.count += 1;
        entry.last_failure = now;
        warn!(key = %id, count = entry.count, "failed unlock attempt");
    }

    /// Drop every cached signing capability and cancel the idle timer.
    pub async fn lock(&self) -> eyre::Result<()> {
        self.sessions.lock().await.clear();
        if let Some(handle) = self.autolock.lock().await.take() {
            handle.abort();
        }
        self.store.save_lock_state(&LockState {
            is_locked: true,
            last_unlocked_at: self.store.load_lock_state()?.last_unlocked_at,
        })?;
        info!("vault locked");
        Ok(())
    }

    pub async fn is_unlocked(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// The signing capability for an unlocked account. Callers must hold
    /// the returned `Arc` across their own awaits so a concurrent `lock()`
    /// cannot invalidate an in-flight signature.
    pub async fn signer_for(&self, id: &str) -> Result<Arc<dyn RawSigner>, KeeperError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| KeeperError::Locked(id.to_owned()))
    }

    async fn mark_unlocked(&self) -> eyre::Result<()> {
        self.store.save_lock_state(&LockState {
            is_locked: false,
            last_unlocked_at: Some(crate::vault::utc_now_iso()),
        })
    }

    // ── Auto-lock ────────────────────────────────────────────────────

    /// (Re)arm the idle timer from settings; 0 minutes disables it.
    pub async fn arm_autolock(&self) -> eyre::Result<()> {
        let minutes = self.store.load_vault()?.settings.auto_lock_minutes;
        let mut slot = self.autolock.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        if minutes == 0 {
            return Ok(());
        }
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(minutes) * 60)).await;
            if let Some(km) = weak.upgrade() {
                if let Err(e) = km.lock().await {
                    warn!(error = %e, "auto-lock failed");
                }
            }
        });
        *slot = Some(task.abort_handle());
        Ok(())
    }

    pub async fn settings(&self) -> eyre::Result<Settings> {
        Ok(self.store.load_vault()?.settings)
    }

    pub async fn update_settings(&self, settings: Settings) -> eyre::Result<()> {
        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        vault.settings = settings;
        self.store.save_vault(&vault)?;
        VaultStore::release_lock(lock)?;
        // A shorter idle window takes effect immediately while unlocked.
        if !self.sessions.lock().await.is_empty() {
            self.arm_autolock().await?;
        }
        Ok(())
    }

    // ── Password change ──────────────────────────────────────────────

    /// Re-encrypt a coldkey under a new password, fail-closed on a wrong
    /// current password. Hotkeys encrypted under the same password are
    /// re-encrypted best-effort; any that do not decrypt are left
    /// untouched and reported in the outcome.
    pub async fn change_password(
        &self,
        id: &str,
        current: &SecretString,
        new: &SecretString,
    ) -> eyre::Result<PasswordChangeOutcome> {
        let vault = self.store.load_vault()?;
        let ck = vault
            .coldkeys
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| KeeperError::NotFound(format!("coldkey {id}")))?;
        let pkg = ck
            .encrypted_secret
            .clone()
            .ok_or_else(|| KeeperError::Validation("coldkey has no secret".into()))?;

        let secret = decrypt_blocking(pkg, crypto::clone_password(current)).await??;
        let new_pkg = encrypt_blocking(secret, crypto::clone_password(new)).await?;

        let mut rekeyed = vec![];
        let mut skipped = vec![];
        let mut updated_hotkeys = self.store.load_hotkeys()?;
        for h in updated_hotkeys.iter_mut().filter(|h| h.coldkey_id == id) {
            match decrypt_blocking(h.encrypted_secret.clone(), crypto::clone_password(current)).await? {
                Ok(hot_secret) => {
                    h.encrypted_secret = encrypt_blocking(hot_secret, crypto::clone_password(new)).await?;
                    rekeyed.push(h.id.clone());
                }
                Err(KeeperError::Decryption) => skipped.push(h.id.clone()),
                Err(e) => return Err(e.into()),
            }
        }

        let lock = self.store.acquire_write_lock()?;
        let mut vault = self.store.load_vault()?;
        let Some(ck) = vault.coldkeys.iter_mut().find(|c| c.id == id) else {
            VaultStore::release_lock(lock)?;
            return Err(KeeperError::NotFound(format!("coldkey {id}")).into());
        };
        ck.encrypted_secret = Some(new_pkg);
        ck.updated_at = crate::vault::utc_now_iso();
        self.store.save_vault(&vault)?;
        self.store.save_hotkeys(&updated_hotkeys)?;
        VaultStore::release_lock(lock)?;

        if !skipped.is_empty() {
            warn!(coldkey = %id, skipped = skipped.len(), "hotkeys under a different password were not re-encrypted");
        }
        Ok(PasswordChangeOutcome { rekeyed, skipped })
    }
}
