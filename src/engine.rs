//! Engine assembly.
//!
//! [`BalanceSync`] wires the pool, module registry, cache, and orchestrator
//! together. Construction is explicit dependency injection: the process
//! builds exactly one engine and passes it around; there is no global state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{config_channel, ConfigFeed};
use crate::modules::{BalanceModule, ModuleRegistry};
use crate::orchestrator::Orchestrator;
use crate::prelude::*;
use crate::store::{BalanceCache, SnapshotStore};
use crate::transport::{ConnectionPool, LightClientProvider, WsRpcConfig};
use crate::types::{AccountAddress, BalanceRecord, LedgerId, TokenId};

/// Cache persistence cadence while the engine runs.
const CACHE_PERSIST_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Default)]
pub struct BalanceSyncBuilder {
    modules: ModuleRegistry,
    light_provider: Option<Arc<dyn LightClientProvider>>,
    data_dir: Option<PathBuf>,
    ws_config: WsRpcConfig,
}

impl BalanceSyncBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: Arc<dyn BalanceModule>) -> Self {
        self.modules.register(module);
        self
    }

    pub fn with_light_client_provider(mut self, provider: Arc<dyn LightClientProvider>) -> Self {
        self.light_provider = Some(provider);
        self
    }

    /// Directory for cache and light-client database snapshots. Without one
    /// the engine runs memory-only.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_ws_config(mut self, config: WsRpcConfig) -> Self {
        self.ws_config = config;
        self
    }

    /// Build the engine and the configuration feed the embedder drives it
    /// through.
    pub fn build(self) -> Result<(BalanceSync, ConfigFeed)> {
        let (feed, config) = config_channel();

        let snapshots = match self.data_dir {
            Some(dir) => Some(Arc::new(
                SnapshotStore::new(dir).map_err(|e| crate::Error::Snapshot(e.to_string()))?,
            )),
            None => None,
        };
        let cache = Arc::new(match &snapshots {
            Some(store) => BalanceCache::with_persistence(Arc::clone(store)),
            None => BalanceCache::new(),
        });
        let pool = Arc::new(ConnectionPool::new(
            config.settings.clone(),
            self.light_provider,
            snapshots,
            self.ws_config,
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&pool),
            Arc::new(self.modules),
            Arc::clone(&cache),
            config,
        );

        Ok((
            BalanceSync {
                orchestrator,
                cache,
                pool,
                tasks: StdMutex::new(Vec::new()),
            },
            feed,
        ))
    }
}

/// The balance synchronization engine.
pub struct BalanceSync {
    orchestrator: Arc<Orchestrator>,
    cache: Arc<BalanceCache>,
    pool: Arc<ConnectionPool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl BalanceSync {
    /// Spawn the reconciliation loop and periodic cache persistence.
    /// Idempotent: a running engine is not started twice.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock");
        if !tasks.is_empty() {
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        tasks.push(tokio::spawn(orchestrator.run()));

        let cache = Arc::clone(&self.cache);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(CACHE_PERSIST_INTERVAL).await;
                if let Err(err) = cache.persist().await {
                    warn!(%err, "periodic cache persistence failed");
                }
            }
        }));
        info!("balance sync engine started");
    }

    /// Register an external consumer; the first one opens subscriptions.
    pub async fn subscribe(&self, consumer_id: impl Into<String>) -> bool {
        self.orchestrator.subscribe(consumer_id).await
    }

    /// Consumer disconnect; the last one closes subscriptions.
    pub async fn unsubscribe_consumer(&self, consumer_id: &str) {
        self.orchestrator.unsubscribe_consumer(consumer_id).await
    }

    /// Point query: cache, then one-shot fetch. See
    /// [`Orchestrator::get_balance`].
    pub async fn get_balance(
        &self,
        ledger: &LedgerId,
        token_id: &TokenId,
        address: &AccountAddress,
    ) -> Result<Option<BalanceRecord>> {
        self.orchestrator.get_balance(ledger, token_id, address).await
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stop background tasks and persist the cache one last time.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        if let Err(err) = self.cache.persist().await {
            warn!(%err, "final cache persistence failed");
        }
        info!("balance sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_and_shuts_down_cleanly() {
        let (engine, feed) = BalanceSyncBuilder::new().build().unwrap();
        engine.start();
        engine.start(); // second start is a no-op
        feed.set_settings(crate::config::Settings::default());
        assert!(engine.subscribe("ui").await);
        engine.unsubscribe_consumer("ui").await;
        engine.shutdown().await;
    }
}
