//! Trusted-surface request handlers, grouped by message-kind family.

mod network;
mod query;
mod txops;
mod wallet;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    amount,
    chain::tx,
    context::AppContext,
    errors::KeeperError,
    keys::address,
};

pub async fn dispatch(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    match kind {
        "wallet:create"
        | "wallet:import-mnemonic"
        | "wallet:import-key"
        | "wallet:import-keystore"
        | "wallet:import-watch"
        | "wallet:create-multisig"
        | "wallet:list"
        | "wallet:select"
        | "wallet:rename"
        | "wallet:change-password"
        | "wallet:delete"
        | "wallet:unlock"
        | "wallet:lock"
        | "wallet:status"
        | "wallet:export"
        | "hotkey:create"
        | "hotkey:import"
        | "hotkey:list"
        | "hotkey:rename"
        | "hotkey:delete"
        | "hotkey:verify-backup"
        | "settings:get"
        | "settings:update"
        | "addresses:recent" => wallet::handle(ctx, kind, params).await,

        "network:connect" | "network:disconnect" | "network:status" | "network:test"
        | "network:list" => network::handle(ctx, kind, params).await,

        "balance:get"
        | "staking:get-info"
        | "staking:get-info-detailed"
        | "neuronets:list"
        | "neuronets:list-detailed"
        | "validators:list"
        | "price:get"
        | "transfers:get"
        | "transfers:submissions"
        | "fee:estimate" => query::handle(ctx, kind, params).await,

        "transfer:send" | "staking:add" | "staking:remove" | "staking:move"
        | "staking:add-limit" => txops::handle(ctx, kind, params).await,

        "permissions:get-all" | "permissions:revoke" | "approvals:list" | "approvals:resolve" => {
            handle_broker(ctx, kind, params).await
        }

        other => Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    }
}

async fn handle_broker(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    match kind {
        "permissions:get-all" => {
            let perms = ctx.broker.list_permissions().await?;
            Ok(json!({ "permissions": perms }))
        }
        "permissions:revoke" => {
            #[derive(serde::Deserialize)]
            struct P {
                origin: String,
            }
            let p: P = parse_params(params)?;
            ctx.broker.revoke_permission(&p.origin).await?;
            Ok(json!({ "revoked": p.origin }))
        }
        "approvals:list" => {
            let pending = ctx.broker.list_pending().await;
            Ok(json!({ "approvals": pending }))
        }
        "approvals:resolve" => {
            #[derive(serde::Deserialize)]
            struct P {
                id: u64,
                approve: bool,
            }
            let p: P = parse_params(params)?;
            ctx.broker.resolve_approval(p.id, p.approve).await;
            Ok(json!({ "resolved": p.id }))
        }
        other => Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    }
}

pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> eyre::Result<T> {
    // Omitted params arrive as null; treat them as an empty object.
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| KeeperError::Validation(format!("bad params: {e}")).into())
}

/// An `amount` field: a decimal token string ("1.5") or base units as a
/// JSON number.
pub(crate) fn parse_amount_value(v: &Value) -> eyre::Result<u128> {
    match v {
        Value::String(s) => amount::parse_amount_ui(s)
            .map_err(|e| KeeperError::Validation(format!("bad amount: {e}")).into()),
        Value::Number(n) => n
            .as_u128()
            .ok_or_else(|| KeeperError::Validation("amount must be non-negative".into()).into()),
        _ => Err(KeeperError::Validation("amount must be a string or number".into()).into()),
    }
}

fn field<'a>(v: &'a Value, name: &str) -> eyre::Result<&'a Value> {
    v.get(name)
        .ok_or_else(|| KeeperError::Validation(format!("missing field {name}")).into())
}

fn address_field(v: &Value, name: &str) -> eyre::Result<[u8; 32]> {
    let s = field(v, name)?
        .as_str()
        .ok_or_else(|| KeeperError::Validation(format!("{name} must be a string")))?;
    Ok(address::decode(s)?)
}

fn netuid_field(v: &Value, name: &str) -> eyre::Result<u16> {
    let n = field(v, name)?
        .as_u64()
        .ok_or_else(|| KeeperError::Validation(format!("{name} must be a number")))?;
    u16::try_from(n)
        .map_err(|_e| KeeperError::Validation(format!("{name} out of range")).into())
}

/// Parse a call description shared by `fee:estimate` and the dApp
/// `signTransaction`/`sendTransaction` methods.
pub(crate) fn parse_call(v: &Value) -> eyre::Result<tx::Call> {
    let ty = field(v, "type")?
        .as_str()
        .ok_or_else(|| KeeperError::Validation("type must be a string".into()))?;
    let amount_of = |name: &str| -> eyre::Result<u128> { parse_amount_value(field(v, name)?) };

    match ty {
        "transfer" => Ok(tx::Call::Transfer {
            dest: address_field(v, "to")?,
            amount: amount_of("amount")?,
        }),
        "add_stake" => Ok(tx::Call::AddStake {
            hotkey: address_field(v, "hotkey")?,
            netuid: netuid_field(v, "netuid")?,
            amount: amount_of("amount")?,
        }),
        "remove_stake" => Ok(tx::Call::RemoveStake {
            hotkey: address_field(v, "hotkey")?,
            netuid: netuid_field(v, "netuid")?,
            amount: amount_of("amount")?,
        }),
        "move_stake" => Ok(tx::Call::MoveStake {
            origin_hotkey: address_field(v, "origin_hotkey")?,
            dest_hotkey: address_field(v, "dest_hotkey")?,
            origin_netuid: netuid_field(v, "origin_netuid")?,
            dest_netuid: netuid_field(v, "dest_netuid")?,
            amount: amount_of("amount")?,
        }),
        "add_stake_limit" => Ok(tx::Call::AddStakeLimit {
            hotkey: address_field(v, "hotkey")?,
            netuid: netuid_field(v, "netuid")?,
            amount: amount_of("amount")?,
            limit_price: amount_of("limit_price")?,
            allow_partial: v
                .get("allow_partial")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        other => Err(KeeperError::Validation(format!("unknown call type {other}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_parsing_validates_fields() -> eyre::Result<()> {
        let dest = address::encode(&[4_u8; 32]);
        let call = parse_call(&json!({ "type": "transfer", "to": dest, "amount": "1.5" }))?;
        assert_eq!(
            call,
            tx::Call::Transfer {
                dest: [4_u8; 32],
                amount: 1_500_000_000,
            }
        );

        let bad = parse_call(&json!({ "type": "transfer", "to": "nope", "amount": "1" }));
        assert!(bad.is_err(), "malformed address must be rejected");

        let unknown = parse_call(&json!({ "type": "teleport" }));
        assert!(unknown.is_err(), "unknown call type must be rejected");
        Ok(())
    }

    #[test]
    fn amounts_accept_ui_strings_and_base_numbers() -> eyre::Result<()> {
        assert_eq!(parse_amount_value(&json!("2"))?, 2_000_000_000);
        assert_eq!(parse_amount_value(&json!(42))?, 42);
        assert!(parse_amount_value(&json!(true)).is_err(), "bool is invalid");
        Ok(())
    }
}
