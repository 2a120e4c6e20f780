//! Process-lifetime service wiring. The three services are constructed
//! once, owned here, and passed by reference into the request surfaces; no
//! module-scoped singletons.

use std::sync::Arc;

use crate::{
    broker::Broker,
    chain::ConnectionManager,
    config::{ConfigStore, HttpConfig, KeeperConfig},
    keys::KeyManager,
    paths::KeeperPaths,
    vault::VaultStore,
};

pub struct AppContext {
    pub keys: Arc<KeyManager>,
    pub chain: Arc<ConnectionManager>,
    pub broker: Arc<Broker>,
    pub config: KeeperConfig,
    pub paths: KeeperPaths,
}

impl AppContext {
    pub fn new(paths: KeeperPaths) -> eyre::Result<Arc<Self>> {
        let config = ConfigStore::new(&paths).load_or_init_default()?;
        let store = VaultStore::open(paths.clone())?;
        let keys = KeyManager::new(store);
        let chain = ConnectionManager::new(config.clone());
        let broker = Broker::new(Arc::clone(&keys), Arc::clone(&chain));
        Ok(Arc::new(Self {
            keys,
            chain,
            broker,
            config,
            paths,
        }))
    }

    pub const fn http(&self) -> &HttpConfig {
        &self.config.http
    }
}
