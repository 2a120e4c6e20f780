//! Permission and approval broker flows.

use axonkeep::{
    broker::Broker,
    chain::ConnectionManager,
    config::KeeperConfig,
    errors::KeeperError,
    keys::{address, KeyManager},
    paths::KeeperPaths,
    vault::VaultStore,
};
use std::{sync::Arc, time::Duration};

struct Fixture {
    keys: Arc<KeyManager>,
    broker: Arc<Broker>,
    _cfg: tempfile::TempDir,
    _data: tempfile::TempDir,
}

fn fixture() -> eyre::Result<Fixture> {
    let cfg = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let paths = KeeperPaths {
        config_dir: cfg.path().to_path_buf(),
        data_dir: data.path().to_path_buf(),
        log_file: data.path().join("log"),
    };
    let store = VaultStore::open(paths)?;
    let keys = KeyManager::new(store);
    let chain = ConnectionManager::new(KeeperConfig::default());
    let broker = Broker::new(Arc::clone(&keys), chain);
    Ok(Fixture {
        keys,
        broker,
        _cfg: cfg,
        _data: data,
    })
}

fn error_code(e: &eyre::Report) -> Option<&'static str> {
    e.downcast_ref::<KeeperError>().map(KeeperError::code)
}

#[tokio::test]
async fn connect_waits_for_approval_and_grants_accounts() -> eyre::Result<()> {
    let f = fixture()?;
    let addr = address::encode(&[1_u8; 32]);
    f.keys.import_coldkey_watch("observer", &addr).await?;

    let broker = Arc::clone(&f.broker);
    let join = tokio::spawn(async move { broker.connect("https://dapp.example").await });

    // Wait for the pending approval to register, then approve it.
    let notice = loop {
        let pending = f.broker.list_pending().await;
        if let Some(n) = pending.into_iter().next() {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(notice.method, "connect");
    assert_eq!(notice.origin, "https://dapp.example");
    f.broker.resolve_approval(notice.id, true).await;

    let accounts = join.await??;
    assert_eq!(accounts, vec![addr.clone()]);

    // A second connect returns the grant without a fresh approval.
    let again = f.broker.connect("https://dapp.example").await?;
    assert_eq!(again, vec![addr.clone()]);
    assert!(f.broker.list_pending().await.is_empty());

    assert_eq!(f.broker.get_accounts("https://dapp.example").await?, vec![addr]);
    Ok(())
}

#[tokio::test]
async fn rejected_connect_grants_nothing() -> eyre::Result<()> {
    let f = fixture()?;
    let broker = Arc::clone(&f.broker);
    let join = tokio::spawn(async move { broker.connect("https://evil.example").await });

    let notice = loop {
        let pending = f.broker.list_pending().await;
        if let Some(n) = pending.into_iter().next() {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    f.broker.resolve_approval(notice.id, false).await;

    let res = join.await?;
    assert_eq!(
        res.err().as_ref().and_then(error_code),
        Some("approval_rejected")
    );
    assert!(
        f.broker.get_accounts("https://evil.example").await?.is_empty(),
        "no grant persists after rejection"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unresolved_approval_times_out_and_late_resolution_is_noop() -> eyre::Result<()> {
    let f = fixture()?;
    let broker = Arc::clone(&f.broker);
    let join = tokio::spawn(async move { broker.connect("https://slow.example").await });

    let notice = loop {
        let pending = f.broker.list_pending().await;
        if let Some(n) = pending.into_iter().next() {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    tokio::time::sleep(Duration::from_secs(5 * 60 + 2)).await;
    let res = join.await?;
    assert_eq!(
        res.err().as_ref().and_then(error_code),
        Some("approval_timeout")
    );
    assert!(f.broker.list_pending().await.is_empty(), "timed-out approval is gone");

    // Resolving the same id afterwards has no observable effect.
    f.broker.resolve_approval(notice.id, true).await;
    assert!(f.broker.get_accounts("https://slow.example").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn revoke_then_get_accounts_is_empty() -> eyre::Result<()> {
    let f = fixture()?;
    let addr = address::encode(&[2_u8; 32]);
    f.keys.import_coldkey_watch("observer", &addr).await?;

    let broker = Arc::clone(&f.broker);
    let join = tokio::spawn(async move { broker.connect("https://site.example").await });
    let notice = loop {
        let pending = f.broker.list_pending().await;
        if let Some(n) = pending.into_iter().next() {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    f.broker.resolve_approval(notice.id, true).await;
    join.await??;

    assert!(!f.broker.get_accounts("https://site.example").await?.is_empty());
    f.broker.revoke_permission("https://site.example").await?;
    assert!(f.broker.get_accounts("https://site.example").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn sensitive_actions_fail_closed_without_grant_or_unlock() -> eyre::Result<()> {
    let f = fixture()?;

    // No grant at all: the approval itself may pass, but execution-time
    // validation refuses. Approve whatever lands in the queue.
    let broker = Arc::clone(&f.broker);
    let join = tokio::spawn(async move {
        broker
            .sign_message("https://nogrant.example", b"hello")
            .await
    });
    let notice = loop {
        let pending = f.broker.list_pending().await;
        if let Some(n) = pending.into_iter().next() {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    f.broker.resolve_approval(notice.id, true).await;
    let res = join.await?;
    assert_eq!(
        res.err().as_ref().and_then(error_code),
        Some("permission_denied"),
        "missing grant fails closed at execution time"
    );
    Ok(())
}
