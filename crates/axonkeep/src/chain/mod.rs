//! The connection manager: owns the single live link to a chain node,
//! resolves the node's capabilities once per handshake, and keeps the link
//! alive with bounded reconnection.

pub mod history;
pub mod link;
pub mod tx;

use crate::{
    config::KeeperConfig,
    errors::KeeperError,
};
use eyre::Context as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::AbortHandle,
};
use tracing::{info, warn};

use link::NodeLink;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const RECONNECT_STEP_MS: u64 = 2_000;
const RECONNECT_CAP_MS: u64 = 30_000;

/// Backoff before reconnect attempt `attempt` (1-based).
pub const fn backoff_delay(attempt: u32) -> Duration {
    let ms = (attempt as u64).saturating_mul(RECONNECT_STEP_MS);
    Duration::from_millis(if ms > RECONNECT_CAP_MS {
        RECONNECT_CAP_MS
    } else {
        ms
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Chain capabilities with their known method aliases, resolved once per
/// handshake against the node's `rpc_methods` listing.
const CAPABILITIES: &[(&str, &[&str])] = &[
    ("nonce", &["system_accountNextIndex", "account_nextIndex"]),
    ("submit_watch", &["author_submitAndWatchExtrinsic"]),
    ("balance", &["chainstate_getBalance", "system_accountBalance"]),
    ("stake_info", &["stakeInfo_getStakeForColdkey", "stakeInfo_getStake"]),
    (
        "neuronets",
        &["neuronetInfo_getNeuronetsInfo", "neuronetInfo_getSubnetsInfo"],
    ),
    (
        "neuronet_detail",
        &["neuronetInfo_getNeuronetInfo", "neuronetInfo_getSubnetInfo"],
    ),
    (
        "validators",
        &["delegateInfo_getDelegates", "validatorInfo_getValidators"],
    ),
    ("price", &["neuronetInfo_getPrices", "stakeInfo_getAlphaPrices"]),
    ("fee", &["payment_queryFeeInfo", "payment_queryInfo"]),
    (
        "error_metadata",
        &["runtime_getErrorMetadata", "system_errorMetadata"],
    ),
];

/// Resolve each capability to the first alias the node actually exposes.
pub fn resolve_capabilities(methods: &[String]) -> HashMap<&'static str, String> {
    let mut out = HashMap::new();
    for (key, aliases) in CAPABILITIES {
        if let Some(m) = aliases.iter().find(|a| methods.iter().any(|x| x == *a)) {
            out.insert(*key, (*m).to_owned());
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct DispatchErrorMeta {
    pub module: String,
    pub name: String,
    pub description: String,
}

/// Everything learned during one successful handshake.
#[derive(Debug)]
pub struct ChainSession {
    pub genesis_hash: [u8; 32],
    pub spec_version: u32,
    pub transaction_version: u32,
    pub capabilities: HashMap<&'static str, String>,
    pub errors: HashMap<(u8, u8), DispatchErrorMeta>,
}

impl ChainSession {
    pub fn capability(&self, key: &str) -> Result<&str, KeeperError> {
        self.capabilities
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| KeeperError::NotSupported(key.to_owned()))
    }

    /// Decode a chain-level rejection into `module.reason: description`.
    pub fn decode_dispatch_error(&self, module_index: u8, error_index: u8) -> KeeperError {
        self.errors.get(&(module_index, error_index)).map_or_else(
            || KeeperError::Dispatch {
                module: format!("module#{module_index}"),
                reason: format!("error#{error_index}"),
                description: "unrecognized dispatch error".to_owned(),
            },
            |m| KeeperError::Dispatch {
                module: m.module.clone(),
                reason: m.name.clone(),
                description: m.description.clone(),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    id: String,
    url: String,
}

#[derive(Default)]
struct ConnInner {
    link: Option<Arc<NodeLink>>,
    session: Option<Arc<ChainSession>>,
    target: Option<Target>,
    attempts: u32,
    connecting: bool,
    reconnect: Option<AbortHandle>,
    monitor: Option<AbortHandle>,
    /// Bumped on every teardown so stale monitor/reconnect callbacks
    /// cannot act on superseded state.
    generation: u64,
}

impl ConnInner {
    fn teardown(&mut self) -> Option<Arc<NodeLink>> {
        self.generation += 1;
        if let Some(h) = self.reconnect.take() {
            h.abort();
        }
        if let Some(h) = self.monitor.take() {
            h.abort();
        }
        self.session = None;
        self.link.take()
    }
}

pub struct ConnectionManager {
    cfg: KeeperConfig,
    inner: Mutex<ConnInner>,
    status_tx: watch::Sender<LinkPhase>,
    /// Handed to monitor/reconnect tasks so a stale task never keeps the
    /// manager alive past shutdown.
    weak: Weak<Self>,
}

impl ConnectionManager {
    pub fn new(cfg: KeeperConfig) -> Arc<Self> {
        let (status_tx, _rx) = watch::channel(LinkPhase::Disconnected);
        Arc::new_cyclic(|weak| Self {
            cfg,
            inner: Mutex::new(ConnInner::default()),
            status_tx,
            weak: weak.clone(),
        })
    }

    pub const fn config(&self) -> &KeeperConfig {
        &self.cfg
    }

    /// Subscribe to connectivity transitions.
    pub fn status(&self) -> watch::Receiver<LinkPhase> {
        self.status_tx.subscribe()
    }

    pub fn phase(&self) -> LinkPhase {
        *self.status_tx.borrow()
    }

    fn set_phase(&self, phase: LinkPhase) {
        self.status_tx.send_if_modified(|p| {
            if *p == phase {
                false
            } else {
                *p = phase;
                true
            }
        });
    }

    /// Connect to a known network (or a custom URL for that network id).
    ///
    /// Idempotent when already connected to the same target; rejects when a
    /// connect is already in flight; otherwise tears down any existing link
    /// first.
    pub async fn connect(
        &self,
        target_id: &str,
        custom_url: Option<&str>,
    ) -> eyre::Result<()> {
        let url = match custom_url {
            Some(u) => u.to_owned(),
            None => self
                .cfg
                .network(target_id)
                .ok_or_else(|| KeeperError::NotFound(format!("network {target_id}")))?
                .ws_url
                .clone(),
        };
        let target = Target {
            id: target_id.to_owned(),
            url,
        };

        let (old_link, generation) = {
            let mut inner = self.inner.lock().await;
            if inner.connecting {
                return Err(KeeperError::Busy.into());
            }
            if self.phase() == LinkPhase::Connected && inner.target.as_ref() == Some(&target) {
                return Ok(());
            }
            inner.connecting = true;
            inner.target = Some(target.clone());
            inner.attempts = 0;
            let old = inner.teardown();
            (old, inner.generation)
        };
        if let Some(l) = old_link {
            l.close().await;
        }
        self.set_phase(LinkPhase::Connecting);

        match self.dial_and_install(&target, generation).await {
            Ok(()) => {
                self.inner.lock().await.connecting = false;
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.connecting = false;
                    // Only this connect's failure may schedule retries; a
                    // superseding connect owns the state now.
                    if inner.generation == generation {
                        self.schedule_reconnect_locked(&mut inner);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        let old = self.inner.lock().await.teardown();
        if let Some(l) = old {
            l.close().await;
        }
        self.set_phase(LinkPhase::Disconnected);
    }

    /// Open a throwaway link purely to verify reachability.
    pub async fn test_connection(url: &str) -> eyre::Result<()> {
        let probe = async {
            let l = NodeLink::dial(url).await?;
            let r = l.request("chain_getBlockHash", json!([0])).await;
            l.close().await;
            r.map(|_v| ())
        };
        tokio::time::timeout(TEST_CONNECTION_TIMEOUT, probe)
            .await
            .map_err(|_e| KeeperError::NetworkTimeout(format!("test connection to {url}")))?
    }

    async fn dial_and_install(
        &self,
        target: &Target,
        generation: u64,
    ) -> eyre::Result<()> {
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&target.url))
            .await
            .map_err(|_e| KeeperError::NetworkTimeout(format!("handshake with {}", target.url)))?;
        let (node_link, session) = handshake?;
        let node_link = Arc::new(node_link);
        let session = Arc::new(session);

        let mut closed = node_link.closed_signal();
        let mut inner = self.inner.lock().await;
        // A concurrent disconnect/connect may have superseded this dial.
        if inner.generation != generation {
            drop(inner);
            node_link.close().await;
            eyre::bail!("connect superseded");
        }
        inner.link = Some(Arc::clone(&node_link));
        inner.session = Some(session);
        inner.attempts = 0;

        let weak = self.weak.clone();
        let monitor = tokio::spawn(async move {
            // Wait for the closed flag to flip.
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            if let Some(this) = weak.upgrade() {
                this.handle_link_loss(generation).await;
            }
        });
        inner.monitor = Some(monitor.abort_handle());
        drop(inner);

        self.set_phase(LinkPhase::Connected);
        info!(network = %target.id, "connected to chain node");
        Ok(())
    }

    async fn handle_link_loss(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        warn!("chain link lost");
        inner.link = None;
        inner.session = None;
        self.set_phase(LinkPhase::Reconnecting);
        self.schedule_reconnect_locked(&mut inner);
    }

    fn schedule_reconnect_locked(&self, inner: &mut ConnInner) {
        inner.attempts += 1;
        if inner.attempts > MAX_RECONNECT_ATTEMPTS {
            warn!(
                attempts = inner.attempts - 1,
                "reconnect attempts exhausted; staying disconnected"
            );
            inner.reconnect = None;
            self.set_phase(LinkPhase::Disconnected);
            return;
        }
        let delay = backoff_delay(inner.attempts);
        let generation = inner.generation;
        let attempt = inner.attempts;
        self.set_phase(LinkPhase::Reconnecting);

        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.redial(generation, attempt).await;
            }
        });
        inner.reconnect = Some(task.abort_handle());
    }

    async fn redial(&self, generation: u64, attempt: u32) {
        let target = {
            let inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.target.clone()
        };
        let Some(target) = target else {
            return;
        };
        info!(network = %target.id, attempt, "reconnecting");
        if let Err(e) = self.dial_and_install(&target, generation).await {
            warn!(error = %e, attempt, "reconnect failed");
            let mut inner = self.inner.lock().await;
            if inner.generation == generation {
                self.schedule_reconnect_locked(&mut inner);
            }
        }
    }

    // ── Chain queries ────────────────────────────────────────────────

    async fn require_session(&self) -> Result<(Arc<NodeLink>, Arc<ChainSession>), KeeperError> {
        let inner = self.inner.lock().await;
        match (&inner.link, &inner.session) {
            (Some(l), Some(s)) => Ok((Arc::clone(l), Arc::clone(s))),
            _ => Err(KeeperError::NotConnected),
        }
    }

    pub async fn session(&self) -> Result<Arc<ChainSession>, KeeperError> {
        self.require_session().await.map(|(_l, s)| s)
    }

    pub async fn current_link(&self) -> Result<Arc<NodeLink>, KeeperError> {
        self.require_session().await.map(|(l, _s)| l)
    }

    pub async fn account_nonce(&self, address: &str) -> eyre::Result<u64> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("nonce")?.to_owned();
        let v = l.request(&method, json!([address])).await?;
        v.as_u64()
            .ok_or_else(|| eyre::eyre!("nonce response was not a number: {v}"))
    }

    pub async fn get_balance(&self, address: &str) -> eyre::Result<u128> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("balance")?.to_owned();
        let v = l.request(&method, json!([address])).await?;
        let free = v.get("free").unwrap_or(&v);
        value_to_u128(free).ok_or_else(|| eyre::eyre!("balance response malformed: {v}"))
    }

    pub async fn get_stake_info(&self, coldkey: &str) -> eyre::Result<Vec<StakePosition>> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("stake_info")?.to_owned();
        let v = l.request(&method, json!([coldkey])).await?;
        let items = v
            .as_array()
            .ok_or_else(|| eyre::eyre!("stake info response malformed: {v}"))?;
        // Per-item failures are omitted, never aborting the batch.
        Ok(items.iter().filter_map(StakePosition::from_value).collect())
    }

    pub async fn list_neuronets(&self, detailed: bool) -> eyre::Result<Vec<NeuronetInfo>> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("neuronets")?.to_owned();
        let v = l.request(&method, json!([])).await?;
        let items = v
            .as_array()
            .ok_or_else(|| eyre::eyre!("neuronet listing malformed: {v}"))?;
        let mut out: Vec<NeuronetInfo> =
            items.iter().filter_map(NeuronetInfo::from_value).collect();

        if detailed {
            let detail_method = s.capability("neuronet_detail")?.to_owned();
            for n in &mut out {
                // Skip-and-continue: one bad neuronet never sinks the list.
                match l.request(&detail_method, json!([n.netuid])).await {
                    Ok(d) => n.apply_detail(&d),
                    Err(e) => {
                        warn!(netuid = n.netuid, error = %e, "neuronet detail fetch failed; omitting detail");
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn list_validators(&self, netuid: Option<u16>) -> eyre::Result<Vec<ValidatorInfo>> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("validators")?.to_owned();
        let params = netuid.map_or_else(|| json!([]), |n| json!([n]));
        let v = l.request(&method, params).await?;
        let items = v
            .as_array()
            .ok_or_else(|| eyre::eyre!("validator roster malformed: {v}"))?;
        Ok(items.iter().filter_map(ValidatorInfo::from_value).collect())
    }

    /// Price of one neuronet's stake token in base units of the native
    /// token, from the chain's stake pools.
    pub async fn get_price(&self, netuid: u16) -> eyre::Result<u128> {
        let (l, s) = self.require_session().await?;
        let method = s.capability("price")?.to_owned();
        let v = l.request(&method, json!([netuid])).await?;
        let price = v.get("price").unwrap_or(&v);
        value_to_u128(price).ok_or_else(|| eyre::eyre!("price response malformed: {v}"))
    }
}

// ── Query result types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StakePosition {
    pub hotkey: String,
    pub netuid: u16,
    pub amount: u128,
}

impl StakePosition {
    fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            hotkey: v.get("hotkey")?.as_str()?.to_owned(),
            netuid: u16::try_from(v.get("netuid")?.as_u64()?).ok()?,
            amount: value_to_u128(v.get("amount")?)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NeuronetInfo {
    pub netuid: u16,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_stake: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator_count: Option<u64>,
}

impl NeuronetInfo {
    fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            netuid: u16::try_from(v.get("netuid")?.as_u64()?).ok()?,
            name: v
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            owner: None,
            total_stake: None,
            validator_count: None,
        })
    }

    fn apply_detail(&mut self, d: &Value) {
        self.owner = d.get("owner").and_then(Value::as_str).map(str::to_owned);
        self.total_stake = d.get("total_stake").and_then(value_to_u128);
        self.validator_count = d.get("validator_count").and_then(Value::as_u64);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatorInfo {
    pub hotkey: String,
    pub stake: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ValidatorInfo {
    fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            hotkey: v.get("hotkey")?.as_str()?.to_owned(),
            stake: value_to_u128(v.get("stake")?)?,
            name: v.get("name").and_then(Value::as_str).map(str::to_owned),
        })
    }
}

/// Amounts arrive as JSON numbers or decimal strings (u128 overflows f64).
pub fn value_to_u128(v: &Value) -> Option<u128> {
    match v {
        Value::Number(n) => n.as_u128(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ── Handshake ────────────────────────────────────────────────────────

fn parse_hex32(s: &str) -> eyre::Result<[u8; 32]> {
    let raw = hex::decode(s.trim_start_matches("0x")).context("decode hash hex")?;
    let arr: [u8; 32] = raw
        .try_into()
        .map_err(|_e| eyre::eyre!("hash must be 32 bytes"))?;
    Ok(arr)
}

async fn handshake(url: &str) -> eyre::Result<(NodeLink, ChainSession)> {
    let node_link = NodeLink::dial(url).await?;

    let genesis = node_link
        .request("chain_getBlockHash", json!([0]))
        .await
        .context("fetch genesis hash")?;
    let genesis_hash = parse_hex32(
        genesis
            .as_str()
            .ok_or_else(|| eyre::eyre!("genesis hash was not a string"))?,
    )?;

    let rt = node_link
        .request("state_getRuntimeVersion", json!([]))
        .await
        .context("fetch runtime version")?;
    let spec_version = u32::try_from(
        rt.get("specVersion")
            .and_then(Value::as_u64)
            .ok_or_else(|| eyre::eyre!("runtime version missing specVersion"))?,
    )
    .context("specVersion range")?;
    let transaction_version = u32::try_from(
        rt.get("transactionVersion")
            .and_then(Value::as_u64)
            .ok_or_else(|| eyre::eyre!("runtime version missing transactionVersion"))?,
    )
    .context("transactionVersion range")?;

    let methods_v = node_link
        .request("rpc_methods", json!([]))
        .await
        .context("fetch rpc methods")?;
    let methods: Vec<String> = methods_v
        .get("methods")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let capabilities = resolve_capabilities(&methods);

    let mut errors = HashMap::new();
    if let Some(method) = capabilities.get("error_metadata") {
        match node_link.request(method, json!([])).await {
            Ok(Value::Array(items)) => {
                for it in &items {
                    let Some(mi) = it.get("module_index").and_then(Value::as_u64) else {
                        continue;
                    };
                    let Some(ei) = it.get("error_index").and_then(Value::as_u64) else {
                        continue;
                    };
                    let (Ok(mi), Ok(ei)) = (u8::try_from(mi), u8::try_from(ei)) else {
                        continue;
                    };
                    errors.insert(
                        (mi, ei),
                        DispatchErrorMeta {
                            module: it
                                .get("module")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_owned(),
                            name: it
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_owned(),
                            description: it
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        },
                    );
                }
            }
            Ok(_) | Err(_) => {
                warn!("error metadata unavailable; dispatch errors will show raw indices");
            }
        }
    }

    Ok((
        node_link,
        ChainSession {
            genesis_hash,
            spec_version,
            transaction_version,
            capabilities,
            errors,
        },
    ))
}
