use eyre::Context as _;
use rand::Rng as _;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    if dir.exists() {
        if is_symlink(dir)? {
            eyre::bail!("refusing to use symlinked directory: {}", dir.display());
        }
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if !md.is_dir() {
            eyre::bail!("expected directory at {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    // Best-effort: enforce private perms on Unix.
    #[cfg(unix)]
    {
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if (md.permissions().mode() & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .with_context(|| format!("chmod {}", dir.display()))?;
        }
    }

    Ok(())
}

fn tmp_path_for(parent: &Path, final_name: &Path) -> PathBuf {
    let base = final_name
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut rand_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut rand_bytes);
    parent.join(format!(".{base}.tmp.{}", hex::encode(rand_bytes)))
}

/// Write `bytes` to `path` via a private temp file and an atomic rename.
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_private_dir(parent)?;

    if path.exists() && is_symlink(path)? {
        eyre::bail!("refusing to write to symlink: {}", path.display());
    }

    let tmp = tmp_path_for(parent, path);
    let mut f = {
        #[cfg(unix)]
        {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .mode(MODE_FILE_PRIVATE)
                .open(&tmp)
                .with_context(|| format!("open temp {}", tmp.display()))?
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)
                .with_context(|| format!("open temp {}", tmp.display()))?
        }
    };
    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush()
        .with_context(|| format!("flush {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    // `rename` is atomic on Unix. Windows refuses to clobber.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn write_json_private(path: &Path, v: &impl Serialize) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(v).context("serialize json")?;
    write_atomic_private(path, s.as_bytes())
}

/// Read a JSON document, returning `None` when the file does not exist yet.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> eyre::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let v = serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_document_roundtrip() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("doc.json");

        let missing: Option<Vec<String>> = read_json_opt(&p)?;
        assert!(missing.is_none(), "expected no document before first write");

        write_json_private(&p, &vec!["a".to_owned(), "b".to_owned()])?;
        let back: Option<Vec<String>> = read_json_opt(&p)?;
        assert_eq!(back, Some(vec!["a".to_owned(), "b".to_owned()]));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_private() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("secret.json");
        write_json_private(&p, &serde_json::json!({"k": 1}))?;
        let mode = std::fs::metadata(&p)?.permissions().mode();
        assert_eq!(mode & 0o777, MODE_FILE_PRIVATE, "mode was {mode:o}");
        Ok(())
    }
}
