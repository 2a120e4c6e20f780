//! Persisted vault data model and its JSON-document store.
//!
//! Each collection lives in its own namespaced document under the config
//! dir: `vault.json` (coldkeys + settings), `hotkeys.json`,
//! `permissions.json`, `lock_state.json`, `recent_addresses.json`. All
//! writes go through the atomic private-file helpers; plaintext secrets are
//! never stored.

use crate::{
    crypto::EncryptedPackage,
    errors::KeeperError,
    fsutil,
    paths::KeeperPaths,
};
use eyre::Context as _;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write as _,
    path::PathBuf,
};

pub const VAULT_VERSION: u32 = 1;
pub const RECENT_ADDRESS_CAP: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColdkeyKind {
    Hd,
    PrivateKey,
    Keystore,
    Watch,
    Multisig,
}

impl ColdkeyKind {
    /// Watch-only and multisig coldkeys carry no signing secret.
    pub const fn can_sign(self) -> bool {
        matches!(self, Self::Hd | Self::PrivateKey | Self::Keystore)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisigMeta {
    pub threshold: u16,
    pub signatories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coldkey {
    pub id: String,
    pub kind: ColdkeyKind,
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_secret: Option<EncryptedPackage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multisig: Option<MultisigMeta>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotkey {
    pub id: String,
    pub name: String,
    pub address: String,
    pub coldkey_id: String,
    pub encrypted_secret: EncryptedPackage,
    /// Neuronet ids this hotkey is registered on (UX metadata).
    #[serde(default)]
    pub registered_neuronets: Vec<u16>,
    pub backed_up: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Idle minutes before cached signing capabilities are dropped.
    /// 0 disables auto-lock.
    pub auto_lock_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultFile {
    pub version: u32,
    pub coldkeys: Vec<Coldkey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_coldkey_id: Option<String>,
    pub settings: Settings,
}

impl Default for VaultFile {
    fn default() -> Self {
        Self {
            version: VAULT_VERSION,
            coldkeys: vec![],
            active_coldkey_id: None,
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitePermission {
    pub origin: String,
    pub connected: bool,
    pub accounts: Vec<String>,
    pub connected_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockState {
    pub is_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_unlocked_at: Option<String>,
}

pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
pub struct VaultStore {
    paths: KeeperPaths,
}

impl VaultStore {
    pub fn open(paths: KeeperPaths) -> eyre::Result<Self> {
        paths.ensure_private_dirs()?;
        Ok(Self { paths })
    }

    pub const fn paths(&self) -> &KeeperPaths {
        &self.paths
    }

    fn vault_path(&self) -> PathBuf {
        self.paths.config_dir.join("vault.json")
    }

    fn hotkeys_path(&self) -> PathBuf {
        self.paths.config_dir.join("hotkeys.json")
    }

    fn permissions_path(&self) -> PathBuf {
        self.paths.config_dir.join("permissions.json")
    }

    fn lock_state_path(&self) -> PathBuf {
        self.paths.data_dir.join("lock_state.json")
    }

    fn recent_addresses_path(&self) -> PathBuf {
        self.paths.data_dir.join("recent_addresses.json")
    }

    /// Exclusive lock serializing vault writes across processes. Fails fast
    /// rather than blocking inside a request handler.
    pub fn acquire_write_lock(&self) -> eyre::Result<File> {
        let p = self.paths.write_lock_path();
        if let Some(parent) = p.parent() {
            fsutil::ensure_private_dir(parent)?;
        }
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&p)
            .context("open lock file")?;
        match f.try_lock_exclusive() {
            Ok(()) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(KeeperError::Busy.into())
            }
            Err(e) => Err(eyre::Report::new(e).wrap_err("lock exclusive")),
        }
    }

    pub fn release_lock(f: File) -> eyre::Result<()> {
        FileExt::unlock(&f).context("unlock")?;
        Ok(())
    }

    pub fn load_vault(&self) -> eyre::Result<VaultFile> {
        Ok(fsutil::read_json_opt(&self.vault_path())?.unwrap_or_default())
    }

    pub fn save_vault(&self, v: &VaultFile) -> eyre::Result<()> {
        fsutil::write_json_private(&self.vault_path(), v).context("write vault")
    }

    pub fn load_hotkeys(&self) -> eyre::Result<Vec<Hotkey>> {
        Ok(fsutil::read_json_opt(&self.hotkeys_path())?.unwrap_or_default())
    }

    pub fn save_hotkeys(&self, hotkeys: &[Hotkey]) -> eyre::Result<()> {
        fsutil::write_json_private(&self.hotkeys_path(), &hotkeys).context("write hotkeys")
    }

    pub fn load_permissions(&self) -> eyre::Result<BTreeMap<String, SitePermission>> {
        Ok(fsutil::read_json_opt(&self.permissions_path())?.unwrap_or_default())
    }

    pub fn save_permissions(&self, perms: &BTreeMap<String, SitePermission>) -> eyre::Result<()> {
        fsutil::write_json_private(&self.permissions_path(), perms).context("write permissions")
    }

    pub fn load_lock_state(&self) -> eyre::Result<LockState> {
        Ok(fsutil::read_json_opt(&self.lock_state_path())?.unwrap_or_default())
    }

    pub fn save_lock_state(&self, s: &LockState) -> eyre::Result<()> {
        fsutil::write_json_private(&self.lock_state_path(), s).context("write lock state")
    }

    pub fn load_recent_addresses(&self) -> eyre::Result<Vec<String>> {
        Ok(fsutil::read_json_opt(&self.recent_addresses_path())?.unwrap_or_default())
    }

    /// Push an address to the front of the recent list: de-duplicated,
    /// most-recent-first, capped at [`RECENT_ADDRESS_CAP`].
    pub fn push_recent_address(&self, address: &str) -> eyre::Result<()> {
        let mut list = self.load_recent_addresses()?;
        list.retain(|a| a != address);
        list.insert(0, address.to_owned());
        list.truncate(RECENT_ADDRESS_CAP);
        fsutil::write_json_private(&self.recent_addresses_path(), &list)
            .context("write recent addresses")
    }

    pub fn append_tx_history(&self, entry: &serde_json::Value) -> eyre::Result<()> {
        let p = self.paths.tx_history_path();
        if let Some(parent) = p.parent() {
            fsutil::ensure_private_dir(parent)?;
        }
        let mut f = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .mode(fsutil::MODE_FILE_PRIVATE)
                    .open(&p)
                    .context("open tx history")?
            }
            #[cfg(not(unix))]
            {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&p)
                    .context("open tx history")?
            }
        };
        writeln!(f, "{entry}").context("write tx history")?;
        Ok(())
    }

    pub fn read_tx_history(&self, limit: usize) -> eyre::Result<Vec<serde_json::Value>> {
        let p = self.paths.tx_history_path();
        if !p.exists() {
            return Ok(vec![]);
        }
        let contents = std::fs::read_to_string(&p).context("read tx history")?;
        let mut out = vec![];
        for line in contents.lines().rev() {
            if out.len() >= limit {
                break;
            }
            let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            out.push(v);
        }
        out.reverse();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> eyre::Result<(VaultStore, tempfile::TempDir, tempfile::TempDir)> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = KeeperPaths {
            config_dir: cfg.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
            log_file: data.path().join("log"),
        };
        Ok((VaultStore::open(paths)?, cfg, data))
    }

    #[test]
    fn vault_roundtrip_preserves_settings() -> eyre::Result<()> {
        let (s, _c, _d) = store()?;
        let mut v = s.load_vault()?;
        assert_eq!(v.version, VAULT_VERSION);
        assert_eq!(v.settings.auto_lock_minutes, 15);

        v.settings.auto_lock_minutes = 0;
        v.active_coldkey_id = Some("ck-1".into());
        s.save_vault(&v)?;

        let back = s.load_vault()?;
        assert_eq!(back.settings.auto_lock_minutes, 0);
        assert_eq!(back.active_coldkey_id.as_deref(), Some("ck-1"));
        Ok(())
    }

    #[test]
    fn recent_addresses_dedupe_and_cap() -> eyre::Result<()> {
        let (s, _c, _d) = store()?;
        for i in 0..12 {
            s.push_recent_address(&format!("addr-{i}"))?;
        }
        // Re-push an old one; it must move to the front, not duplicate.
        s.push_recent_address("addr-5")?;

        let list = s.load_recent_addresses()?;
        assert_eq!(list.len(), RECENT_ADDRESS_CAP);
        assert_eq!(list.first().map(String::as_str), Some("addr-5"));
        assert_eq!(list.iter().filter(|a| a.as_str() == "addr-5").count(), 1);
        Ok(())
    }

    #[test]
    fn write_lock_blocks_second_holder() -> eyre::Result<()> {
        let (s, _c, _d) = store()?;
        let held = s.acquire_write_lock()?;
        let second = s.acquire_write_lock();
        assert!(second.is_err(), "second exclusive lock must fail fast");
        VaultStore::release_lock(held)?;
        let third = s.acquire_write_lock()?;
        VaultStore::release_lock(third)?;
        Ok(())
    }
}
