//! Read-only chain query handlers.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    amount,
    chain::{history, tx},
    context::AppContext,
    errors::KeeperError,
};

use super::{parse_call, parse_params};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Resolve an explicit address or fall back to the active coldkey's.
async fn resolve_address(ctx: &Arc<AppContext>, addr: Option<String>) -> eyre::Result<String> {
    match addr {
        Some(a) => Ok(a),
        None => {
            let active = ctx
                .keys
                .active_coldkey()
                .await?
                .ok_or_else(|| KeeperError::NotFound("no active coldkey".to_owned()))?;
            Ok(active.address)
        }
    }
}

pub async fn handle(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    match kind {
        "balance:get" => {
            #[derive(Deserialize)]
            struct P {
                address: Option<String>,
            }
            let p: P = parse_params(params)?;
            let addr = resolve_address(ctx, p.address).await?;
            let balance = ctx.chain.get_balance(&addr).await?;
            Ok(json!({
                "address": addr,
                "balance": balance.to_string(),
                "formatted": amount::format_amount(balance),
            }))
        }
        "staking:get-info" | "staking:get-info-detailed" => {
            #[derive(Deserialize)]
            struct P {
                coldkey: Option<String>,
            }
            let p: P = parse_params(params)?;
            let addr = resolve_address(ctx, p.coldkey).await?;
            let positions = ctx.chain.get_stake_info(&addr).await?;

            if kind == "staking:get-info" {
                return Ok(json!({ "coldkey": addr, "positions": positions }));
            }

            // Detailed: annotate each position with its validator's name.
            // A missing roster entry just leaves the name out.
            let validators = ctx.chain.list_validators(None).await.unwrap_or_default();
            let detailed: Vec<Value> = positions
                .iter()
                .map(|pos| {
                    let validator = validators
                        .iter()
                        .find(|v| v.hotkey == pos.hotkey)
                        .and_then(|v| v.name.clone());
                    json!({
                        "hotkey": pos.hotkey,
                        "netuid": pos.netuid,
                        "amount": pos.amount.to_string(),
                        "formatted": amount::format_amount(pos.amount),
                        "validator_name": validator,
                    })
                })
                .collect();
            Ok(json!({ "coldkey": addr, "positions": detailed }))
        }
        "neuronets:list" | "neuronets:list-detailed" => {
            let detailed = kind == "neuronets:list-detailed";
            let neuronets = ctx.chain.list_neuronets(detailed).await?;
            Ok(json!({ "neuronets": neuronets }))
        }
        "validators:list" => {
            #[derive(Deserialize)]
            struct P {
                netuid: Option<u16>,
            }
            let p: P = parse_params(params)?;
            let validators = ctx.chain.list_validators(p.netuid).await?;
            Ok(json!({ "validators": validators }))
        }
        "price:get" => {
            #[derive(Deserialize)]
            struct P {
                netuid: u16,
            }
            let p: P = parse_params(params)?;
            let price = ctx.chain.get_price(p.netuid).await?;
            Ok(json!({
                "netuid": p.netuid,
                "price": price.to_string(),
                "formatted": amount::format_amount(price),
            }))
        }
        "transfers:get" => {
            #[derive(Deserialize)]
            struct P {
                address: Option<String>,
                limit: Option<usize>,
            }
            let p: P = parse_params(params)?;
            let addr = resolve_address(ctx, p.address).await?;
            let limit = p.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 200);
            let transfers =
                history::get_transfers(&ctx.chain, ctx.http(), &addr, limit).await?;
            Ok(json!({ "address": addr, "transfers": transfers }))
        }
        "transfers:submissions" => {
            // Locally recorded submission outcomes, independent of chain
            // availability.
            #[derive(Deserialize)]
            struct P {
                limit: Option<usize>,
            }
            let p: P = parse_params(params)?;
            let limit = p.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 200);
            let submissions = ctx.keys.store().read_tx_history(limit)?;
            Ok(json!({ "submissions": submissions }))
        }
        "fee:estimate" => {
            #[derive(Deserialize)]
            struct P {
                call: Value,
                from: Option<String>,
            }
            let p: P = parse_params(params)?;
            let call = parse_call(&p.call)?;
            let from = resolve_address(ctx, p.from).await?;
            let fee = tx::estimate_fee(&ctx.chain, &from, call).await;
            Ok(json!({
                "fee": fee.to_string(),
                "formatted": amount::format_amount(fee),
            }))
        }
        other => Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    }
}
