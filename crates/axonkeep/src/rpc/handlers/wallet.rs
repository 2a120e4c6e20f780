//! `wallet:*`, `hotkey:*`, `settings:*`, and `addresses:recent` handlers.

use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{context::AppContext, errors::KeeperError, vault::Settings};

use super::parse_params;

fn secret(s: String) -> SecretString {
    SecretString::new(s.into())
}

pub async fn handle(ctx: &Arc<AppContext>, kind: &str, params: Value) -> eyre::Result<Value> {
    match kind {
        "wallet:create" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let (mnemonic, info) = ctx.keys.create_coldkey(&p.name, &secret(p.password)).await?;
            Ok(json!({ "mnemonic": &*mnemonic, "coldkey": info }))
        }
        "wallet:import-mnemonic" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                mnemonic: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let info = ctx
                .keys
                .import_coldkey_mnemonic(&p.name, &p.mnemonic, &secret(p.password))
                .await?;
            Ok(json!({ "coldkey": info }))
        }
        "wallet:import-key" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                key: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let info = ctx
                .keys
                .import_coldkey_raw(&p.name, &p.key, &secret(p.password))
                .await?;
            Ok(json!({ "coldkey": info }))
        }
        "wallet:import-keystore" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                keystore: String,
                keystore_password: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let info = ctx
                .keys
                .import_coldkey_keystore(
                    &p.name,
                    &p.keystore,
                    &secret(p.keystore_password),
                    &secret(p.password),
                )
                .await?;
            Ok(json!({ "coldkey": info }))
        }
        "wallet:import-watch" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                address: String,
            }
            let p: P = parse_params(params)?;
            let info = ctx.keys.import_coldkey_watch(&p.name, &p.address).await?;
            Ok(json!({ "coldkey": info }))
        }
        "wallet:create-multisig" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                signatories: Vec<String>,
                threshold: u16,
            }
            let p: P = parse_params(params)?;
            let info = ctx
                .keys
                .create_coldkey_multisig(&p.name, p.signatories, p.threshold)
                .await?;
            Ok(json!({ "coldkey": info }))
        }
        "wallet:list" => {
            let coldkeys = ctx.keys.list_coldkeys().await?;
            Ok(json!({ "coldkeys": coldkeys }))
        }
        "wallet:select" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
            }
            let p: P = parse_params(params)?;
            ctx.keys.set_active_coldkey(&p.id).await?;
            let accounts = match ctx.keys.active_coldkey().await? {
                Some(c) => vec![c.address],
                None => vec![],
            };
            ctx.broker.emit_accounts_changed(accounts);
            Ok(json!({ "active": p.id }))
        }
        "wallet:rename" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                name: String,
            }
            let p: P = parse_params(params)?;
            ctx.keys.rename_coldkey(&p.id, &p.name).await?;
            Ok(json!({ "renamed": p.id }))
        }
        "wallet:change-password" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                current_password: String,
                new_password: String,
            }
            let p: P = parse_params(params)?;
            let outcome = ctx
                .keys
                .change_password(&p.id, &secret(p.current_password), &secret(p.new_password))
                .await?;
            Ok(json!({ "outcome": outcome }))
        }
        "wallet:delete" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
            }
            let p: P = parse_params(params)?;
            ctx.keys.delete_coldkey(&p.id).await?;
            let accounts = match ctx.keys.active_coldkey().await? {
                Some(c) => vec![c.address],
                None => vec![],
            };
            ctx.broker.emit_accounts_changed(accounts);
            Ok(json!({ "deleted": p.id }))
        }
        "wallet:unlock" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let unlocked = ctx.keys.unlock(&p.id, &secret(p.password)).await?;
            Ok(json!({ "unlocked": unlocked }))
        }
        "wallet:lock" => {
            ctx.keys.lock().await?;
            Ok(json!({ "locked": true }))
        }
        "wallet:status" => {
            let lock_state = ctx.keys.store().load_lock_state()?;
            let coldkeys = ctx.keys.list_coldkeys().await?;
            let active = coldkeys.iter().find(|c| c.active).map(|c| c.id.clone());
            let any_unlocked = coldkeys.iter().any(|c| c.unlocked);
            Ok(json!({
                "is_locked": !any_unlocked,
                "last_unlocked_at": lock_state.last_unlocked_at,
                "active_coldkey_id": active,
                "coldkey_count": coldkeys.len(),
            }))
        }
        "wallet:export" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let phrase = ctx.keys.export_coldkey(&p.id, &secret(p.password)).await?;
            Ok(json!({ "secret": &*phrase }))
        }

        "hotkey:create" => {
            #[derive(Deserialize)]
            struct P {
                coldkey_id: String,
                name: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let (mnemonic, info) = ctx
                .keys
                .create_hotkey(&p.coldkey_id, &p.name, &secret(p.password))
                .await?;
            Ok(json!({ "mnemonic": &*mnemonic, "hotkey": info }))
        }
        "hotkey:import" => {
            #[derive(Deserialize)]
            struct P {
                coldkey_id: String,
                name: String,
                mnemonic: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let info = ctx
                .keys
                .import_hotkey(&p.coldkey_id, &p.name, &p.mnemonic, &secret(p.password))
                .await?;
            Ok(json!({ "hotkey": info }))
        }
        "hotkey:list" => {
            #[derive(Deserialize)]
            struct P {
                coldkey_id: Option<String>,
            }
            let p: P = parse_params(params)?;
            let hotkeys = ctx.keys.list_hotkeys(p.coldkey_id.as_deref()).await?;
            Ok(json!({ "hotkeys": hotkeys }))
        }
        "hotkey:rename" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                name: String,
            }
            let p: P = parse_params(params)?;
            ctx.keys.rename_hotkey(&p.id, &p.name).await?;
            Ok(json!({ "renamed": p.id }))
        }
        "hotkey:delete" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
            }
            let p: P = parse_params(params)?;
            ctx.keys.delete_hotkey(&p.id).await?;
            Ok(json!({ "deleted": p.id }))
        }
        "hotkey:verify-backup" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
                mnemonic: String,
                password: String,
            }
            let p: P = parse_params(params)?;
            let verified = ctx
                .keys
                .verify_hotkey_backup(&p.id, &p.mnemonic, &secret(p.password))
                .await?;
            Ok(json!({ "verified": verified }))
        }

        "settings:get" => {
            let settings = ctx.keys.settings().await?;
            Ok(json!({ "settings": settings }))
        }
        "settings:update" => {
            let settings: Settings = parse_params(params)?;
            ctx.keys.update_settings(settings.clone()).await?;
            Ok(json!({ "settings": settings }))
        }
        "addresses:recent" => {
            let addresses = ctx.keys.store().load_recent_addresses()?;
            Ok(json!({ "addresses": addresses }))
        }

        other => Err(KeeperError::NotFound(format!("unknown kind {other}")).into()),
    }
}
