//! The untrusted dApp surface: a local socket served to an intermediary
//! relay which authenticates once with the relay token and then stamps the
//! calling `origin` onto every frame. The daemon trusts the stamp, never
//! the page.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, BufReader},
    sync::mpsc,
};
use tracing::warn;

use crate::{
    context::AppContext,
    errors::{to_error_body, KeeperError},
};

use super::{fail, handlers, ok, transport, MAX_LINE_BYTES};

#[derive(Debug, Deserialize)]
struct RelayHello {
    token: String,
}

#[derive(Debug, Deserialize)]
struct DappRequest {
    id: Value,
    origin: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[cfg(unix)]
fn bind_listener(ctx: &AppContext) -> eyre::Result<tokio::net::UnixListener> {
    use eyre::Context as _;

    let p = ctx.paths.relay_socket_path();
    if p.exists() {
        let md = std::fs::symlink_metadata(&p).context("stat existing socket path")?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to remove symlink at {}", p.display());
        }
        std::fs::remove_file(&p)
            .with_context(|| format!("remove existing socket at {}", p.display()))?;
    }
    if let Some(parent) = p.parent() {
        crate::fsutil::ensure_private_dir(parent)?;
    }
    let l = tokio::net::UnixListener::bind(&p)
        .with_context(|| format!("bind unix socket at {}", p.display()))?;
    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Err(e) = std::fs::set_permissions(
            &p,
            std::fs::Permissions::from_mode(crate::fsutil::MODE_FILE_PRIVATE),
        ) {
            warn!(error = %e, "failed to set relay socket permissions");
        }
    }
    Ok(l)
}

#[cfg(unix)]
pub async fn run_relay(ctx: Arc<AppContext>) -> eyre::Result<()> {
    let token: Arc<str> = Arc::from(ctx.paths.ensure_relay_token()?);
    let listener = bind_listener(&ctx)?;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let ctx2 = Arc::clone(&ctx);
        let token2 = Arc::clone(&token);
        tokio::spawn(async move {
            if let Err(e) = serve_relay_connection(stream, ctx2, token2).await {
                warn!(error = %e, "relay connection failed");
            }
        });
    }
}

#[cfg(not(unix))]
pub async fn run_relay(ctx: Arc<AppContext>) -> eyre::Result<()> {
    use eyre::Context as _;

    let token: Arc<str> = Arc::from(ctx.paths.ensure_relay_token()?);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:41786")
        .await
        .context("bind relay listener (loopback)")?;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let ctx2 = Arc::clone(&ctx);
        let token2 = Arc::clone(&token);
        tokio::spawn(async move {
            if let Err(e) = serve_relay_connection(stream, ctx2, token2).await {
                warn!(error = %e, "relay connection failed");
            }
        });
    }
}

pub async fn serve_relay_connection<S>(
    stream: S,
    ctx: Arc<AppContext>,
    token: Arc<str>,
) -> eyre::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Value>(64);

    let writer_task = tokio::spawn(async move {
        let mut w = write_half;
        while let Some(frame) = frame_rx.recv().await {
            if transport::write_frame(&mut w, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();

    // First frame must carry the relay token.
    let authed = match lines.next_line().await? {
        Some(line) => matches!(
            serde_json::from_str::<RelayHello>(&line),
            Ok(hello) if hello.token == *token
        ),
        None => false,
    };
    frame_tx.send(json!({ "authorized": authed })).await.ok();
    if !authed {
        drop(frame_tx);
        drop(writer_task.await);
        return Ok(());
    }

    // Authorized: forward dApp events to this relay.
    let mut events = ctx.broker.subscribe_events();
    let event_tx = frame_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            if event_tx.send(json!(ev)).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_LINE_BYTES {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let req: DappRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discarding malformed relay frame");
                continue;
            }
        };

        let ctx2 = Arc::clone(&ctx);
        let reply_tx = frame_tx.clone();
        tokio::spawn(async move {
            let frame = match dispatch(&ctx2, &req.origin, &req.method, req.params).await {
                Ok(data) => ok(req.id, data),
                Err(e) => fail(req.id, to_error_body(&e)),
            };
            drop(reply_tx.send(frame).await);
        });
    }

    event_task.abort();
    drop(frame_tx);
    drop(writer_task.await);
    Ok(())
}

async fn dispatch(
    ctx: &Arc<AppContext>,
    origin: &str,
    method: &str,
    params: Value,
) -> eyre::Result<Value> {
    if origin.trim().is_empty() {
        return Err(KeeperError::Validation("missing origin".into()).into());
    }
    match method {
        "connect" => {
            let accounts = ctx.broker.connect(origin).await?;
            Ok(json!({ "accounts": accounts }))
        }
        "disconnect" => {
            ctx.broker.disconnect(origin).await?;
            Ok(json!({ "disconnected": true }))
        }
        "getAccounts" => {
            let accounts = ctx.broker.get_accounts(origin).await?;
            Ok(json!({ "accounts": accounts }))
        }
        "getBalance" => {
            #[derive(Deserialize)]
            struct P {
                address: Option<String>,
            }
            let p: P = handlers::parse_params(params)?;
            let balance = ctx.broker.get_balance(origin, p.address.as_deref()).await?;
            Ok(json!({ "balance": balance.to_string() }))
        }
        "signMessage" => {
            #[derive(Deserialize)]
            struct P {
                message: String,
            }
            let p: P = handlers::parse_params(params)?;
            let bytes = decode_message(&p.message)?;
            let signature = ctx.broker.sign_message(origin, &bytes).await?;
            Ok(json!({ "signature": signature }))
        }
        "signTransaction" => {
            let call = transaction_call(&params)?;
            let signed = ctx.broker.sign_transaction(origin, call).await?;
            Ok(json!({ "signed": signed }))
        }
        "sendTransaction" => {
            let call = transaction_call(&params)?;
            let result = ctx.broker.send_transaction(origin, call).await?;
            Ok(json!({ "result": result }))
        }
        "addStake" => {
            let mut v = params;
            splice_type(&mut v, "add_stake")?;
            let call = handlers::parse_call(&v)?;
            let result = ctx.broker.add_stake(origin, call).await?;
            Ok(json!({ "result": result }))
        }
        "removeStake" => {
            let mut v = params;
            splice_type(&mut v, "remove_stake")?;
            let call = handlers::parse_call(&v)?;
            let result = ctx.broker.remove_stake(origin, call).await?;
            Ok(json!({ "result": result }))
        }
        other => Err(KeeperError::NotFound(format!("unknown method {other}")).into()),
    }
}

fn transaction_call(params: &Value) -> eyre::Result<crate::chain::tx::Call> {
    let tx_v = params
        .get("transaction")
        .ok_or_else(|| KeeperError::Validation("missing transaction".into()))?;
    handlers::parse_call(tx_v)
}

fn splice_type(v: &mut Value, ty: &str) -> eyre::Result<()> {
    let Some(obj) = v.as_object_mut() else {
        return Err(KeeperError::Validation("params must be an object".into()).into());
    };
    obj.insert("type".to_owned(), Value::String(ty.to_owned()));
    Ok(())
}

/// A dApp message: UTF-8 text, or raw bytes as 0x-hex.
fn decode_message(s: &str) -> eyre::Result<Vec<u8>> {
    if let Some(stripped) = s.strip_prefix("0x") {
        return hex::decode(stripped)
            .map_err(|_e| KeeperError::Validation("message hex is malformed".into()).into());
    }
    Ok(s.as_bytes().to_vec())
}
