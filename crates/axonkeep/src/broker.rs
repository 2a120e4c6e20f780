//! The permission & approval broker: per-origin account grants, interactive
//! approvals with timeout, and execution-time re-validation for every
//! sensitive dApp request.

use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::AbortHandle,
};
use tracing::{info, warn};

use crate::{
    chain::{tx, ConnectionManager},
    errors::KeeperError,
    keys::{signer::RawSigner, KeyManager},
    vault::{Coldkey, SitePermission},
};

pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalNotice {
    pub id: u64,
    pub origin: String,
    pub method: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DappEvent {
    Connect {
        origin: String,
        accounts: Vec<String>,
    },
    Disconnect {
        origin: String,
    },
    AccountsChanged {
        accounts: Vec<String>,
    },
    NetworkChanged {
        network: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approved,
    Rejected,
    TimedOut,
}

struct Pending {
    notice: ApprovalNotice,
    resolve_tx: oneshot::Sender<Decision>,
    timer: AbortHandle,
}

pub struct Broker {
    keys: Arc<KeyManager>,
    chain: Arc<ConnectionManager>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    notices: broadcast::Sender<ApprovalNotice>,
    events: broadcast::Sender<DappEvent>,
    /// Handed to timeout tasks so a fired timer never keeps the broker
    /// alive past shutdown.
    weak: Weak<Self>,
}

impl Broker {
    pub fn new(keys: Arc<KeyManager>, chain: Arc<ConnectionManager>) -> Arc<Self> {
        let (notices, _n) = broadcast::channel(EVENT_BUFFER);
        let (events, _e) = broadcast::channel(EVENT_BUFFER);
        Arc::new_cyclic(|weak| Self {
            keys,
            chain,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notices,
            events,
            weak: weak.clone(),
        })
    }

    /// Approval notices for the interactive surface.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<ApprovalNotice> {
        self.notices.subscribe()
    }

    /// Events for connected dApp relays.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DappEvent> {
        self.events.subscribe()
    }

    pub fn emit_accounts_changed(&self, accounts: Vec<String>) {
        drop(self.events.send(DappEvent::AccountsChanged { accounts }));
    }

    pub fn emit_network_changed(&self, network: String) {
        drop(self.events.send(DappEvent::NetworkChanged { network }));
    }

    // ── Approvals ────────────────────────────────────────────────────

    /// Register a pending approval, notify the interactive surface, and
    /// suspend until it resolves. Unresolved approvals auto-reject after
    /// [`APPROVAL_TIMEOUT`].
    async fn request_approval(
        &self,
        origin: &str,
        method: &str,
        summary: String,
    ) -> Result<(), KeeperError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notice = ApprovalNotice {
            id,
            origin: origin.to_owned(),
            method: method.to_owned(),
            summary,
        };

        let (resolve_tx, resolve_rx) = oneshot::channel();
        let weak = self.weak.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(APPROVAL_TIMEOUT).await;
            if let Some(broker) = weak.upgrade() {
                broker.finish(id, Decision::TimedOut).await;
            }
        });

        self.pending.lock().await.insert(
            id,
            Pending {
                notice: notice.clone(),
                resolve_tx,
                timer: timer.abort_handle(),
            },
        );
        drop(self.notices.send(notice));

        match resolve_rx.await {
            Ok(Decision::Approved) => Ok(()),
            Ok(Decision::Rejected) | Err(_) => Err(KeeperError::ApprovalRejected),
            Ok(Decision::TimedOut) => Err(KeeperError::ApprovalTimeout),
        }
    }

    /// Resolve a pending approval from the interactive surface. Resolving
    /// an id that no longer exists is a no-op.
    pub async fn resolve_approval(&self, id: u64, approve: bool) {
        let decision = if approve {
            Decision::Approved
        } else {
            Decision::Rejected
        };
        self.finish(id, decision).await;
    }

    async fn finish(&self, id: u64, decision: Decision) {
        let Some(p) = self.pending.lock().await.remove(&id) else {
            return;
        };
        p.timer.abort();
        if decision == Decision::TimedOut {
            warn!(approval = id, origin = %p.notice.origin, "approval timed out");
        }
        drop(p.resolve_tx.send(decision));
    }

    pub async fn list_pending(&self) -> Vec<ApprovalNotice> {
        let mut out: Vec<ApprovalNotice> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.notice.clone())
            .collect();
        out.sort_by_key(|n| n.id);
        out
    }

    // ── Permissions ──────────────────────────────────────────────────

    /// Connect an origin. An existing grant returns its accounts
    /// immediately; otherwise the call suspends on an interactive approval
    /// and returns the granted accounts once approved.
    pub async fn connect(&self, origin: &str) -> eyre::Result<Vec<String>> {
        let perms = self.keys.store().load_permissions()?;
        if let Some(p) = perms.get(origin) {
            if p.connected {
                return Ok(p.accounts.clone());
            }
        }
        drop(perms);

        self.request_approval(origin, "connect", format!("{origin} wants to connect"))
            .await?;

        let accounts: Vec<String> = self
            .keys
            .list_coldkeys()
            .await?
            .into_iter()
            .map(|c| c.address)
            .collect();
        let mut perms = self.keys.store().load_permissions()?;
        perms.insert(
            origin.to_owned(),
            SitePermission {
                origin: origin.to_owned(),
                connected: true,
                accounts: accounts.clone(),
                connected_at: crate::vault::utc_now_iso(),
            },
        );
        self.keys.store().save_permissions(&perms)?;
        info!(%origin, accounts = accounts.len(), "origin connected");
        drop(self.events.send(DappEvent::Connect {
            origin: origin.to_owned(),
            accounts: accounts.clone(),
        }));
        Ok(accounts)
    }

    pub async fn disconnect(&self, origin: &str) -> eyre::Result<()> {
        let mut perms = self.keys.store().load_permissions()?;
        if perms.remove(origin).is_some() {
            self.keys.store().save_permissions(&perms)?;
            drop(self.events.send(DappEvent::Disconnect {
                origin: origin.to_owned(),
            }));
        }
        Ok(())
    }

    /// Delete an origin's grant; `get_accounts` then returns empty.
    pub async fn revoke_permission(&self, origin: &str) -> eyre::Result<()> {
        let mut perms = self.keys.store().load_permissions()?;
        if perms.remove(origin).is_some() {
            self.keys.store().save_permissions(&perms)?;
            info!(%origin, "permission revoked");
            drop(self.events.send(DappEvent::Disconnect {
                origin: origin.to_owned(),
            }));
        }
        Ok(())
    }

    pub async fn get_accounts(&self, origin: &str) -> eyre::Result<Vec<String>> {
        let perms = self.keys.store().load_permissions()?;
        Ok(perms
            .get(origin)
            .filter(|p| p.connected)
            .map(|p| p.accounts.clone())
            .unwrap_or_default())
    }

    pub async fn list_permissions(&self) -> eyre::Result<Vec<SitePermission>> {
        Ok(self.keys.store().load_permissions()?.into_values().collect())
    }

    // ── Sensitive actions ────────────────────────────────────────────

    /// Execution-time checks, run after the approval resolves: the origin
    /// still holds a grant, an active account exists, and its key is
    /// unlocked. Any failing check fails closed.
    async fn validated_context(
        &self,
        origin: &str,
    ) -> eyre::Result<(Coldkey, Arc<dyn RawSigner>)> {
        let perms = self.keys.store().load_permissions()?;
        if !perms.get(origin).is_some_and(|p| p.connected) {
            return Err(KeeperError::PermissionDenied(format!(
                "{origin} holds no connect grant"
            ))
            .into());
        }
        let active = self
            .keys
            .active_coldkey()
            .await?
            .ok_or_else(|| KeeperError::NotFound("no active coldkey".to_owned()))?;
        let signer = self.keys.signer_for(&active.id).await?;
        Ok((active, signer))
    }

    pub async fn sign_message(&self, origin: &str, message: &[u8]) -> eyre::Result<String> {
        self.request_approval(
            origin,
            "signMessage",
            format!("{origin} asks to sign a {}-byte message", message.len()),
        )
        .await?;
        let (_active, signer) = self.validated_context(origin).await?;
        Ok(tx::sign_message(&signer, message))
    }

    /// Build and sign a transaction without submitting it.
    pub async fn sign_transaction(
        &self,
        origin: &str,
        call: tx::Call,
    ) -> eyre::Result<String> {
        self.request_approval(
            origin,
            "signTransaction",
            format!("{origin} asks to sign a {} transaction", call.label()),
        )
        .await?;
        let (_active, signer) = self.validated_context(origin).await?;
        let ext = tx::build_signed(&self.chain, &signer, call).await?;
        ext.encode_hex()
    }

    pub async fn send_transaction(
        &self,
        origin: &str,
        call: tx::Call,
    ) -> eyre::Result<tx::TxResult> {
        self.request_approval(
            origin,
            "sendTransaction",
            format!("{origin} asks to submit a {} transaction", call.label()),
        )
        .await?;
        let (_active, signer) = self.validated_context(origin).await?;
        Ok(self.submit_with_records(signer, call).await)
    }

    pub async fn add_stake(
        &self,
        origin: &str,
        call: tx::Call,
    ) -> eyre::Result<tx::TxResult> {
        self.request_approval(
            origin,
            "addStake",
            format!("{origin} asks to add stake"),
        )
        .await?;
        let (_active, signer) = self.validated_context(origin).await?;
        Ok(self.submit_with_records(signer, call).await)
    }

    pub async fn remove_stake(
        &self,
        origin: &str,
        call: tx::Call,
    ) -> eyre::Result<tx::TxResult> {
        self.request_approval(
            origin,
            "removeStake",
            format!("{origin} asks to remove stake"),
        )
        .await?;
        let (_active, signer) = self.validated_context(origin).await?;
        Ok(self.submit_with_records(signer, call).await)
    }

    /// Submit through the pipeline and record the outcome: tx-history
    /// JSONL always, recent-address list for successful transfers.
    ///
    /// The signer capability is captured before this await chain begins, so
    /// a concurrent `lock()` cannot invalidate the in-flight signature.
    pub async fn submit_with_records(
        &self,
        signer: Arc<dyn RawSigner>,
        call: tx::Call,
    ) -> tx::TxResult {
        let label = call.label();
        let dest = match &call {
            tx::Call::Transfer { dest, .. } => Some(crate::keys::address::encode(dest)),
            tx::Call::AddStake { .. }
            | tx::Call::RemoveStake { .. }
            | tx::Call::MoveStake { .. }
            | tx::Call::AddStakeLimit { .. } => None,
        };
        let result = tx::submit(&self.chain, signer, call).await;

        let entry = serde_json::json!({
            "ts": crate::vault::utc_now_iso(),
            "type": label,
            "success": result.success,
            "hash": result.hash.clone(),
            "error": result.error.clone(),
        });
        if let Err(e) = self.keys.store().append_tx_history(&entry) {
            warn!(error = %e, "failed to append tx history");
        }
        if result.success {
            if let Some(dest) = dest {
                if let Err(e) = self.keys.store().push_recent_address(&dest) {
                    warn!(error = %e, "failed to record recent address");
                }
            }
        }
        result
    }

    pub async fn get_balance(&self, origin: &str, addr: Option<&str>) -> eyre::Result<u128> {
        let perms = self.keys.store().load_permissions()?;
        let grant = perms
            .get(origin)
            .filter(|p| p.connected)
            .ok_or_else(|| {
                KeeperError::PermissionDenied(format!("{origin} holds no connect grant"))
            })?;
        let addr = match addr {
            Some(a) => {
                if !grant.accounts.iter().any(|x| x == a) {
                    return Err(KeeperError::PermissionDenied(format!(
                        "{origin} was not granted {a}"
                    ))
                    .into());
                }
                a.to_owned()
            }
            None => {
                let active = self
                    .keys
                    .active_coldkey()
                    .await?
                    .ok_or_else(|| KeeperError::NotFound("no active coldkey".to_owned()))?;
                active.address
            }
        };
        self.chain.get_balance(&addr).await
    }
}
