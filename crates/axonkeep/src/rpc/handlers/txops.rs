//! Transaction handlers for the trusted surface. These act for the active
//! coldkey and require it to be unlocked; the interactive approval flow is
//! only for untrusted origins.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::{chain::tx, context::AppContext, errors::KeeperError};

use super::parse_call;

pub async fn handle(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    let call = build_call(kind, &params)?;

    let active = ctx
        .keys
        .active_coldkey()
        .await?
        .ok_or_else(|| KeeperError::NotFound("no active coldkey".to_owned()))?;
    // Capture the signing capability before any suspension point; a
    // concurrent lock() cannot revoke an in-flight signature.
    let signer = ctx.keys.signer_for(&active.id).await?;

    let result = ctx.broker.submit_with_records(signer, call).await;
    Ok(json!({ "result": result }))
}

fn build_call(kind: &str, params: &Value) -> eyre::Result<tx::Call> {
    // The kind implies the call type; splice it in so the shared parser
    // validates the remaining fields.
    let ty = match kind {
        "transfer:send" => "transfer",
        "staking:add" => "add_stake",
        "staking:remove" => "remove_stake",
        "staking:move" => "move_stake",
        "staking:add-limit" => "add_stake_limit",
        other => return Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    };
    let mut v = params.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("type".to_owned(), Value::String(ty.to_owned()));
    } else {
        return Err(KeeperError::Validation("params must be an object".into()).into());
    }
    parse_call(&v)
}
