//! The trusted control surface: line-delimited JSON over stdio.
//!
//! Requests are dispatched on their own tasks so a call suspended on an
//! interactive approval never blocks the read loop — the `approvals:resolve`
//! frame that releases it arrives on the same connection. A single writer
//! task serializes all outgoing frames.

use serde_json::json;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, BufReader},
    sync::mpsc,
};
use tracing::warn;

use crate::{context::AppContext, errors::to_error_body};

use super::{event, fail, handlers, ok, transport, Request, MAX_LINE_BYTES};

pub async fn run(ctx: Arc<AppContext>) -> eyre::Result<()> {
    serve(ctx, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn serve<R, W>(ctx: Arc<AppContext>, reader: R, writer: W) -> eyre::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frame_tx, mut frame_rx) = mpsc::channel::<serde_json::Value>(64);

    let writer_task = tokio::spawn(async move {
        let mut w = writer;
        while let Some(frame) = frame_rx.recv().await {
            if transport::write_frame(&mut w, &frame).await.is_err() {
                break;
            }
        }
    });

    // Approval notices surface as unsolicited event frames.
    let mut notices = ctx.broker.subscribe_notices();
    let notice_tx = frame_tx.clone();
    let notice_task = tokio::spawn(async move {
        while let Ok(n) = notices.recv().await {
            if notice_tx
                .send(event("approvals:pending", json!(n)))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Connectivity transitions too.
    let mut status = ctx.chain.status();
    let status_tx = frame_tx.clone();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let phase = *status.borrow_and_update();
            if status_tx
                .send(event("network:status", json!({ "phase": phase })))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_LINE_BYTES {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discarding malformed request frame");
                continue;
            }
        };

        let ctx2 = Arc::clone(&ctx);
        let reply_tx = frame_tx.clone();
        tokio::spawn(async move {
            let frame = match handlers::dispatch(&ctx2, &req.kind, req.params).await {
                Ok(data) => ok(req.id, data),
                Err(e) => fail(req.id, to_error_body(&e)),
            };
            drop(reply_tx.send(frame).await);
        });
    }

    notice_task.abort();
    status_task.abort();
    drop(frame_tx);
    drop(writer_task.await);
    Ok(())
}
