//! End-to-end key-manager flows against a real on-disk vault.

use axonkeep::{
    errors::KeeperError,
    keys::{address, KeyManager},
    paths::KeeperPaths,
    vault::{Settings, VaultStore},
};
use secrecy::SecretString;
use std::sync::Arc;

const PASSWORD: &str = "Secret123!_";

fn pw(s: &str) -> SecretString {
    SecretString::new(s.to_owned().into())
}

fn manager() -> eyre::Result<(Arc<KeyManager>, tempfile::TempDir, tempfile::TempDir)> {
    let cfg = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let paths = KeeperPaths {
        config_dir: cfg.path().to_path_buf(),
        data_dir: data.path().to_path_buf(),
        log_file: data.path().join("log"),
    };
    let store = VaultStore::open(paths)?;
    let km = KeyManager::new(store);
    Ok((km, cfg, data))
}

/// Disable the idle timer so paused-time tests control every clock edge.
async fn disable_autolock(km: &Arc<KeyManager>) -> eyre::Result<()> {
    km.update_settings(Settings {
        auto_lock_minutes: 0,
    })
    .await
}

#[tokio::test]
async fn create_lock_unlock_cycle() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;

    let (mnemonic, info) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    assert_eq!(mnemonic.split_whitespace().count(), 24);
    assert!(address::is_valid(&info.address), "address must be valid SS58");
    assert!(info.unlocked, "fresh coldkey must be unlocked");
    assert!(info.active, "fresh coldkey becomes active");

    // A default hotkey exists, not yet backed up.
    let hotkeys = km.list_hotkeys(Some(&info.id)).await?;
    assert_eq!(hotkeys.len(), 1);
    assert_eq!(hotkeys[0].name, "default");
    assert!(!hotkeys[0].backed_up, "generated hotkey starts not backed up");

    km.lock().await?;
    assert!(!km.is_unlocked(&info.id).await, "lock clears every session");

    assert!(km.unlock(&info.id, &pw(PASSWORD)).await?, "correct password unlocks");
    assert!(km.is_unlocked(&info.id).await);

    km.lock().await?;
    assert!(!km.unlock(&info.id, &pw("wrong")).await?, "wrong password returns false");
    assert!(!km.is_unlocked(&info.id).await, "failed unlock leaves it locked");
    Ok(())
}

#[tokio::test]
async fn imported_mnemonic_is_deterministic_and_duplicates_rejected() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;

    let (mnemonic, info) = km.create_coldkey("first", &pw(PASSWORD)).await?;
    let dup = km
        .import_coldkey_mnemonic("again", &mnemonic, &pw(PASSWORD))
        .await;
    let err = dup.err().map(|e| {
        e.downcast_ref::<KeeperError>()
            .map(KeeperError::code)
            .unwrap_or("other")
            .to_owned()
    });
    assert_eq!(
        err.as_deref(),
        Some("duplicate_address"),
        "same mnemonic derives the same address: {info:?}"
    );
    Ok(())
}

#[tokio::test]
async fn sixth_wrong_attempt_is_rate_limited() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, info) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    km.lock().await?;

    for attempt in 1..=5 {
        let ok = km.unlock(&info.id, &pw("wrong")).await?;
        assert!(!ok, "attempt {attempt} fails normally");
    }

    let sixth = km.unlock(&info.id, &pw("wrong")).await;
    let code = sixth.err().and_then(|e| {
        e.downcast_ref::<KeeperError>()
            .map(|k| k.code().to_owned())
    });
    assert_eq!(code.as_deref(), Some("rate_limited"), "attempt 6 is refused outright");

    // Even the correct password is refused inside the window.
    let correct = km.unlock(&info.id, &pw(PASSWORD)).await;
    assert!(correct.is_err(), "rate limit applies before decryption");
    Ok(())
}

#[tokio::test]
async fn delete_coldkey_cascades_to_hotkeys() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, a) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    let (_m2, b) = km.create_coldkey("B", &pw(PASSWORD)).await?;
    let (_hp, _h) = km.create_hotkey(&a.id, "miner", &pw(PASSWORD)).await?;

    assert_eq!(km.list_hotkeys(Some(&a.id)).await?.len(), 2);

    km.delete_coldkey(&a.id).await?;
    assert!(km.list_hotkeys(Some(&a.id)).await?.is_empty(), "no orphan hotkeys remain");
    assert_eq!(km.list_hotkeys(None).await?.len(), 1, "B's default hotkey survives");
    assert_eq!(
        km.list_coldkeys().await?.iter().filter(|c| c.id == a.id).count(),
        0
    );
    drop(b);
    Ok(())
}

#[tokio::test]
async fn change_password_reports_skipped_hotkeys() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, ck) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    // A hotkey deliberately under its own password.
    let (_hp, independent) = km
        .create_hotkey(&ck.id, "independent", &pw("other-password"))
        .await?;

    let outcome = km
        .change_password(&ck.id, &pw(PASSWORD), &pw("NewSecret456!_"))
        .await?;
    assert_eq!(outcome.rekeyed.len(), 1, "default hotkey follows the coldkey password");
    assert_eq!(outcome.skipped, vec![independent.id.clone()]);

    km.lock().await?;
    assert!(
        km.unlock(&ck.id, &pw("NewSecret456!_")).await?,
        "new password unlocks the coldkey"
    );
    assert!(
        km.unlock(&independent.id, &pw("other-password")).await?,
        "skipped hotkey still opens under its own password"
    );
    Ok(())
}

#[tokio::test]
async fn change_password_fails_closed_on_wrong_current() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, ck) = km.create_coldkey("A", &pw(PASSWORD)).await?;

    let res = km.change_password(&ck.id, &pw("wrong"), &pw("new")).await;
    assert!(res.is_err(), "wrong current password must fail");

    km.lock().await?;
    assert!(
        km.unlock(&ck.id, &pw(PASSWORD)).await?,
        "old password still works after the failed change"
    );
    Ok(())
}

#[tokio::test]
async fn hotkey_backup_verification_flips_flag() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, ck) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    let (phrase, hk) = km.create_hotkey(&ck.id, "miner", &pw(PASSWORD)).await?;
    assert!(!hk.backed_up);

    let wrong = km
        .verify_hotkey_backup(&hk.id, "not the phrase", &pw(PASSWORD))
        .await?;
    assert!(!wrong, "wrong phrase does not verify");
    let still = km.list_hotkeys(Some(&ck.id)).await?;
    assert!(
        still.iter().all(|h| h.id != hk.id || !h.backed_up),
        "flag unchanged after failed verification"
    );

    let right = km.verify_hotkey_backup(&hk.id, &phrase, &pw(PASSWORD)).await?;
    assert!(right, "correct phrase verifies");
    let after = km.list_hotkeys(Some(&ck.id)).await?;
    assert!(
        after.iter().any(|h| h.id == hk.id && h.backed_up),
        "flag flips only after verification"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn autolock_fires_after_idle_timeout() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let (_m, ck) = km.create_coldkey("A", &pw(PASSWORD)).await?;
    assert!(km.is_unlocked(&ck.id).await);

    // Arm a 5-minute idle timer now that the session exists.
    km.update_settings(Settings {
        auto_lock_minutes: 5,
    })
    .await?;

    tokio::time::sleep(std::time::Duration::from_secs(5 * 60 + 2)).await;
    // Give the fired timer task a beat to run lock().
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert!(
        !km.is_unlocked(&ck.id).await,
        "auto-lock clears the session after the idle window"
    );
    Ok(())
}

#[tokio::test]
async fn watch_only_coldkeys_cannot_unlock() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    let addr = address::encode(&[6_u8; 32]);
    let info = km.import_coldkey_watch("observer", &addr).await?;
    assert!(!info.unlocked);

    let res = km.unlock(&info.id, &pw(PASSWORD)).await;
    assert!(res.is_err(), "watch-only keys hold no secret to unlock");
    Ok(())
}

#[tokio::test]
async fn raw_key_import_roundtrips_through_export() -> eyre::Result<()> {
    let (km, _c, _d) = manager()?;
    disable_autolock(&km).await?;
    let seed_hex = format!("0x{}", hex::encode([42_u8; 32]));
    let info = km
        .import_coldkey_raw("raw", &seed_hex, &pw(PASSWORD))
        .await?;
    assert!(info.unlocked);

    let exported = km.export_coldkey(&info.id, &pw(PASSWORD)).await?;
    assert_eq!(&*exported, &hex::encode([42_u8; 32]));
    Ok(())
}
