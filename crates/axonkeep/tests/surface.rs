//! Drive the trusted control surface over an in-memory pipe: every
//! response must arrive in the uniform success/failure envelope.

use axonkeep::{context::AppContext, paths::KeeperPaths, rpc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

struct Surface {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    _cfg: tempfile::TempDir,
    _data: tempfile::TempDir,
}

impl Surface {
    async fn send(&mut self, frame: Value) -> eyre::Result<()> {
        self.writer
            .write_all(format!("{frame}\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next frame carrying a response `id` (event frames are skipped).
    async fn next_response(&mut self) -> eyre::Result<Value> {
        while let Some(line) = self.lines.next_line().await? {
            let v: Value = serde_json::from_str(&line)?;
            if v.get("id").is_some() {
                return Ok(v);
            }
        }
        eyre::bail!("surface closed without a response")
    }
}

fn start_surface() -> eyre::Result<Surface> {
    let cfg = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let paths = KeeperPaths {
        config_dir: cfg.path().to_path_buf(),
        data_dir: data.path().to_path_buf(),
        log_file: data.path().join("log"),
    };
    let ctx = AppContext::new(paths)?;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, client_write) = tokio::io::split(client);

    tokio::spawn(async move {
        drop(
            rpc::server::serve(
                ctx,
                server_read,
                server_write,
            )
            .await,
        );
    });

    Ok(Surface {
        writer: client_write,
        lines: BufReader::new(client_read).lines(),
        _cfg: cfg,
        _data: data,
    })
}

#[tokio::test]
async fn settings_roundtrip_through_envelopes() -> eyre::Result<()> {
    let mut s = start_surface()?;

    s.send(json!({ "id": 1, "kind": "settings:get", "params": {} }))
        .await?;
    let resp = s.next_response().await?;
    assert_eq!(resp.get("id"), Some(&json!(1)));
    assert_eq!(resp.get("success"), Some(&json!(true)));
    assert_eq!(
        resp.pointer("/data/settings/auto_lock_minutes"),
        Some(&json!(15))
    );

    s.send(json!({
        "id": 2,
        "kind": "settings:update",
        "params": { "auto_lock_minutes": 0 }
    }))
    .await?;
    let resp = s.next_response().await?;
    assert_eq!(resp.get("success"), Some(&json!(true)));

    s.send(json!({ "id": 3, "kind": "settings:get", "params": {} }))
        .await?;
    let resp = s.next_response().await?;
    assert_eq!(
        resp.pointer("/data/settings/auto_lock_minutes"),
        Some(&json!(0))
    );
    Ok(())
}

#[tokio::test]
async fn unknown_kinds_and_chain_queries_fail_in_envelope() -> eyre::Result<()> {
    let mut s = start_surface()?;

    s.send(json!({ "id": 1, "kind": "bogus:kind", "params": {} }))
        .await?;
    let resp = s.next_response().await?;
    assert_eq!(resp.get("success"), Some(&json!(false)));
    assert_eq!(
        resp.pointer("/error/code").and_then(Value::as_str),
        Some("not_found")
    );

    // Chain queries while disconnected: a typed error, not a transport
    // failure.
    s.send(json!({ "id": 2, "kind": "neuronets:list", "params": {} }))
        .await?;
    let resp = s.next_response().await?;
    assert_eq!(resp.get("success"), Some(&json!(false)));
    assert_eq!(
        resp.pointer("/error/code").and_then(Value::as_str),
        Some("not_connected")
    );
    Ok(())
}

#[tokio::test]
async fn wallet_status_works_before_any_wallet_exists() -> eyre::Result<()> {
    let mut s = start_surface()?;
    s.send(json!({ "id": 7, "kind": "wallet:status", "params": {} }))
        .await?;
    let resp = s.next_response().await?;
    assert_eq!(resp.get("success"), Some(&json!(true)));
    assert_eq!(resp.pointer("/data/coldkey_count"), Some(&json!(0)));
    assert_eq!(resp.pointer("/data/is_locked"), Some(&json!(true)));
    Ok(())
}
