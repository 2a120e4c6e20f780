//! Network/endpoint configuration: the Connection Manager's network-config
//! collaborator. Persisted as `config.toml` under the config dir with
//! `AXONKEEP_*` env overrides applied on load.

use crate::paths::KeeperPaths;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

pub const MAINNET_WS_URL: &str = "wss://entrypoint.axonkeep.net:443";
pub const TESTNET_WS_URL: &str = "wss://test.entrypoint.axonkeep.net:443";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEntry {
    /// Stable id used as the `connect` target ("mainnet", "testnet", ...).
    pub id: String,
    pub name: String,
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Transfer-history REST collaborator. Consulted before falling back to
    /// scanning recent blocks. Unset disables the REST path entirely.
    pub history_api_base_url: Option<String>,
    /// Request timeout for the history collaborator (seconds).
    pub history_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            history_api_base_url: None,
            history_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub networks: Vec<NetworkEntry>,
    /// Network id the daemon connects to at startup.
    pub default_network: String,
    pub http: HttpConfig,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            networks: vec![
                NetworkEntry {
                    id: "mainnet".into(),
                    name: "Mainnet".into(),
                    ws_url: MAINNET_WS_URL.into(),
                },
                NetworkEntry {
                    id: "testnet".into(),
                    name: "Testnet".into(),
                    ws_url: TESTNET_WS_URL.into(),
                },
            ],
            default_network: "mainnet".into(),
            http: HttpConfig::default(),
        }
    }
}

impl KeeperConfig {
    pub fn network(&self, id: &str) -> Option<&NetworkEntry> {
        self.networks.iter().find(|n| n.id == id)
    }
}

fn apply_env_overrides(cfg: &mut KeeperConfig) {
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if !t.is_empty() {
                setter(t);
            }
        }
    }

    apply_env("AXONKEEP_HISTORY_API_BASE_URL", |v| {
        cfg.http.history_api_base_url = Some(v.to_owned());
    });
    apply_env("AXONKEEP_DEFAULT_NETWORK", |v| {
        v.clone_into(&mut cfg.default_network);
    });
    apply_env("AXONKEEP_MAINNET_WS_URL", |v| {
        if let Some(n) = cfg.networks.iter_mut().find(|n| n.id == "mainnet") {
            v.clone_into(&mut n.ws_url);
        }
    });
    apply_env("AXONKEEP_TESTNET_WS_URL", |v| {
        if let Some(n) = cfg.networks.iter_mut().find(|n| n.id == "testnet") {
            v.clone_into(&mut n.ws_url);
        }
    });
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &KeeperPaths) -> Self {
        Self {
            path: paths.config_dir.join("config.toml"),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<KeeperConfig> {
        if !self.path.exists() {
            let mut cfg = KeeperConfig::default();
            apply_env_overrides(&mut cfg);
            self.save(&cfg)?;
            return Ok(cfg);
        }

        let s = fs::read_to_string(&self.path).context("read config.toml")?;
        let mut cfg: KeeperConfig = toml::from_str(&s).context("parse config.toml")?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &KeeperConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes()).context("write config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() -> eyre::Result<()> {
        let cfg = KeeperConfig::default();
        let s = toml::to_string_pretty(&cfg)?;
        let back: KeeperConfig = toml::from_str(&s)?;
        assert_eq!(back.default_network, "mainnet");
        assert_eq!(back.networks.len(), 2);
        assert_eq!(
            back.network("testnet").map(|n| n.ws_url.as_str()),
            Some(TESTNET_WS_URL)
        );
        Ok(())
    }

    #[test]
    fn store_initializes_and_reloads() -> eyre::Result<()> {
        let cfg_dir = tempfile::tempdir()?;
        let data_dir = tempfile::tempdir()?;
        let paths = KeeperPaths {
            config_dir: cfg_dir.path().to_path_buf(),
            data_dir: data_dir.path().to_path_buf(),
            log_file: data_dir.path().join("log"),
        };
        let store = ConfigStore::new(&paths);
        let cfg = store.load_or_init_default()?;
        assert!(cfg_dir.path().join("config.toml").exists());

        let mut edited = cfg;
        edited.default_network = "testnet".into();
        store.save(&edited)?;
        let back = store.load_or_init_default()?;
        assert_eq!(back.default_network, "testnet");
        Ok(())
    }
}
