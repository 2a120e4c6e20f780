use base64::Engine as _;
use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use rand::Rng as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct KeeperPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl KeeperPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("AXONKEEP_DATA_DIR"),
            std::env::var("AXONKEEP_CONFIG_DIR"),
        ) {
            let data_dir = PathBuf::from(data_dir);
            let config_dir = PathBuf::from(config_dir);
            let log_file = data_dir.join("axonkeep.log.jsonl");
            return Ok(Self {
                config_dir,
                data_dir,
                log_file,
            });
        }

        let proj = ProjectDirs::from("", "", "axonkeep").context("resolve project dirs")?;
        let config_dir = proj.config_dir().to_path_buf();
        let data_dir = proj.data_dir().to_path_buf();
        let log_file = data_dir.join("axonkeep.log.jsonl");

        Ok(Self {
            config_dir,
            data_dir,
            log_file,
        })
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }

    pub fn relay_socket_path(&self) -> PathBuf {
        self.data_dir.join("axonkeep-relay.sock")
    }

    pub fn relay_token_path(&self) -> PathBuf {
        self.config_dir.join("relay_auth_token.txt")
    }

    pub fn write_lock_path(&self) -> PathBuf {
        self.data_dir.join("axonkeep.lock")
    }

    pub fn tx_history_path(&self) -> PathBuf {
        self.data_dir.join("tx_history.jsonl")
    }

    /// Read the relay auth token, creating it on first use.
    ///
    /// The relay process must present this token on its first frame before
    /// any origin-stamped request is accepted.
    pub fn ensure_relay_token(&self) -> eyre::Result<String> {
        self.ensure_private_dirs()?;
        let p = self.relay_token_path();
        if p.exists() {
            let md = std::fs::symlink_metadata(&p).with_context(|| format!("stat {}", p.display()))?;
            if md.file_type().is_symlink() {
                eyre::bail!("refusing to read symlink: {}", p.display());
            }
            let s = std::fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
            let tok = s.trim().to_owned();
            if !tok.is_empty() {
                return Ok(tok);
            }
            // Empty token file can be left behind by a process killed mid-create.
            drop(std::fs::remove_file(&p));
        }

        let mut bytes = [0_u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let tok = base64::engine::general_purpose::STANDARD.encode(bytes);
        crate::fsutil::write_atomic_private(&p, format!("{tok}\n").as_bytes())
            .with_context(|| format!("write {}", p.display()))?;
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_token_is_stable_across_reads() -> eyre::Result<()> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = KeeperPaths {
            config_dir: cfg.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
            log_file: data.path().join("axonkeep.log.jsonl"),
        };
        let t1 = paths.ensure_relay_token()?;
        let t2 = paths.ensure_relay_token()?;
        assert_eq!(t1, t2);
        assert!(!t1.is_empty(), "token must not be empty");
        Ok(())
    }
}
