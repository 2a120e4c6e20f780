//! A single live JSON-RPC link to a chain node over websocket.
//!
//! Responses are correlated to requests by id; subscription notifications
//! are routed to per-subscription channels. When the socket drops, every
//! pending call fails and the `closed` watch flips, which is what the
//! connection manager's reconnect scheduler listens for.

use eyre::Context as _;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Default bound for a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const SUBSCRIPTION_BUFFER: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;
type SubMap = Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>;

pub struct Subscription {
    pub id: String,
    pub rx: mpsc::Receiver<Value>,
}

pub struct NodeLink {
    next_id: AtomicU64,
    out_tx: mpsc::Sender<WsMessage>,
    pending: PendingMap,
    subs: SubMap,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("closed", &*self.closed_rx.borrow())
            .finish()
    }
}

impl NodeLink {
    /// Open the websocket and spawn its reader/writer tasks. The caller
    /// wraps this in its own handshake timeout.
    pub async fn dial(url: &str) -> eyre::Result<Self> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("websocket connect to {url}"))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subs: SubMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            drop(sink.close().await);
        });

        let pending_r = Arc::clone(&pending);
        let subs_r = Arc::clone(&subs);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(t)) => t,
                    Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(v) = serde_json::from_str::<Value>(&text) else {
                    debug!("discarding non-json frame from node");
                    continue;
                };
                route_incoming(&pending_r, &subs_r, v).await;
            }

            // Socket is gone: fail everything in flight, then flip closed.
            let mut map = pending_r.lock().await;
            for (_id, tx) in map.drain() {
                drop(tx.send(Err("link closed".to_owned())));
            }
            drop(map);
            subs_r.lock().await.clear();
            drop(closed_tx.send(true));
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            out_tx,
            pending,
            subs,
            closed_rx,
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// A watch that flips to `true` exactly once, when the socket drops.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub async fn request(&self, method: &str, params: Value) -> eyre::Result<Value> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> eyre::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let sent = self
            .out_tx
            .send(WsMessage::Text(frame.to_string().into()))
            .await;
        if sent.is_err() {
            self.pending.lock().await.remove(&id);
            eyre::bail!("link closed");
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(Ok(v))) => Ok(v),
            Ok(Ok(Err(e))) => Err(eyre::eyre!("{method}: {e}")),
            Ok(Err(_recv)) => Err(eyre::eyre!("{method}: link closed")),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(eyre::eyre!("{method}: request timed out"))
            }
        }
    }

    /// Issue a subscription request; the returned channel yields each
    /// notification's `result` payload.
    pub async fn subscribe(&self, method: &str, params: Value) -> eyre::Result<Subscription> {
        let sub_id = self.request(method, params).await?;
        let sub_id = match sub_id {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => eyre::bail!("unexpected subscription id: {other}"),
        };
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subs.lock().await.insert(sub_id.clone(), tx);
        Ok(Subscription { id: sub_id, rx })
    }

    pub async fn unsubscribe(&self, method: &str, sub_id: &str) {
        self.subs.lock().await.remove(sub_id);
        if let Err(e) = self.request(method, json!([sub_id])).await {
            debug!(error = %e, "unsubscribe failed (link may be gone)");
        }
    }

    /// Close the link; the reader task observes the dropped socket and
    /// flips the closed watch.
    pub async fn close(&self) {
        drop(self.out_tx.send(WsMessage::Close(None)).await);
    }
}

async fn route_incoming(pending: &PendingMap, subs: &SubMap, v: Value) {
    // Subscription notification: method + params.subscription.
    if v.get("method").is_some() {
        let Some(params) = v.get("params") else {
            return;
        };
        let Some(sub_id) = params.get("subscription") else {
            return;
        };
        let sub_id = match sub_id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return,
        };
        let payload = params.get("result").cloned().unwrap_or(Value::Null);
        let tx = subs.lock().await.get(&sub_id).cloned();
        if let Some(tx) = tx {
            if tx.send(payload).await.is_err() {
                subs.lock().await.remove(&sub_id);
            }
        }
        return;
    }

    // Plain response.
    let Some(id) = v.get("id").and_then(Value::as_u64) else {
        return;
    };
    let Some(tx) = pending.lock().await.remove(&id) else {
        warn!(id, "response for unknown request id");
        return;
    };
    let outcome = if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown node error");
        Err(msg.to_owned())
    } else {
        Ok(v.get("result").cloned().unwrap_or(Value::Null))
    };
    drop(tx.send(outcome));
}
