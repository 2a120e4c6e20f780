//! `network:*` handlers.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{chain::ConnectionManager, context::AppContext, errors::KeeperError};

use super::parse_params;

pub async fn handle(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    match kind {
        "network:connect" => {
            #[derive(Deserialize)]
            struct P {
                network: String,
                url: Option<String>,
            }
            let p: P = parse_params(params)?;
            ctx.chain.connect(&p.network, p.url.as_deref()).await?;
            ctx.broker.emit_network_changed(p.network.clone());
            Ok(json!({ "connected": p.network }))
        }
        "network:disconnect" => {
            ctx.chain.disconnect().await;
            Ok(json!({ "disconnected": true }))
        }
        "network:status" => {
            let phase = ctx.chain.phase();
            Ok(json!({ "phase": phase }))
        }
        "network:test" => {
            #[derive(Deserialize)]
            struct P {
                url: String,
            }
            let p: P = parse_params(params)?;
            let reachable = ConnectionManager::test_connection(&p.url).await.is_ok();
            Ok(json!({ "url": p.url, "reachable": reachable }))
        }
        "network:list" => {
            Ok(json!({ "networks": ctx.config.networks }))
        }
        other => Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    }
}
