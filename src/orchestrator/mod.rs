//! The subscription orchestrator.
//!
//! Watches the configuration inputs, computes the current watch-set, opens
//! and closes aggregated module subscriptions, and reconciles results into
//! the balance cache. Runtime logic is split across:
//! - `watch_set`: pure watch-set computation and structural short-circuits
//! - this module: the `Closed → Open → Closing → Closed` state machine,
//!   generation bookkeeping, update handling, and reaping passes

pub mod watch_set;

#[cfg(test)]
mod tests;

pub use watch_set::{WatchSet, WatchTarget};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigChange, ConfigWatch};
use crate::modules::{
    AddressesByToken, ModuleContext, ModuleRegistry, ModuleUpdate, Unsubscribe,
};
use crate::prelude::*;
use crate::store::BalanceCache;
use crate::transport::ConnectionPool;
use crate::types::{
    AccountAddress, BalanceRecord, BalanceStatus, Balances, LedgerId, ModuleId, TokenId,
};

/// Deferred-unsubscribe delay. Keeps connections briefly warm across rapid
/// close/reopen cycles; cancellation is already hard at the consumption layer
/// via the generation check.
const UNSUBSCRIBE_GRACE: Duration = Duration::from_secs(10);

/// Account-removal reap debounce. The account list is populated incrementally
/// at startup; reaping immediately would delete balances for accounts that
/// simply haven't loaded yet.
const ACCOUNT_REAP_DEBOUNCE: Duration = Duration::from_secs(10);

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Closed,
    Open,
    Closing,
}

struct OpenSubscription {
    module: ModuleId,
    unsubscribe: Unsubscribe,
}

/// Single shared orchestrator, explicitly constructed and injected; lives for
/// the whole process.
pub struct Orchestrator {
    pool: Arc<ConnectionPool>,
    modules: Arc<ModuleRegistry>,
    cache: Arc<BalanceCache>,
    config: ConfigWatch,
    state: watch::Sender<SubscriptionState>,
    generation: AtomicU64,
    consumers: Mutex<HashSet<String>>,
    open_subs: Mutex<Vec<OpenSubscription>>,
    current: Mutex<Option<Arc<WatchSet>>>,
    reconcile_lock: Mutex<()>,
    account_reap: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        modules: Arc<ModuleRegistry>,
        cache: Arc<BalanceCache>,
        config: ConfigWatch,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SubscriptionState::Closed);
        Arc::new(Self {
            pool,
            modules,
            cache,
            config,
            state,
            generation: AtomicU64::new(0),
            consumers: Mutex::new(HashSet::new()),
            open_subs: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            reconcile_lock: Mutex::new(()),
            account_reap: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Broadcast "state changed" signal. Guards await this rather than any
    /// promise tied to scheduled unsubscribe callbacks.
    pub fn state_signal(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    /// Register an external consumer. The first consumer opens subscriptions.
    /// Returns whether the consumer was newly registered.
    pub async fn subscribe(self: &Arc<Self>, consumer_id: impl Into<String>) -> bool {
        let (newly, count) = {
            let mut consumers = self.consumers.lock().await;
            let newly = consumers.insert(consumer_id.into());
            (newly, consumers.len())
        };
        if newly && count == 1 {
            self.open_subscriptions().await;
        }
        newly
    }

    /// Consumer disconnect: the last one out closes subscriptions.
    pub async fn unsubscribe_consumer(self: &Arc<Self>, consumer_id: &str) {
        let closed_last = {
            let mut consumers = self.consumers.lock().await;
            consumers.remove(consumer_id) && consumers.is_empty()
        };
        if closed_last {
            self.close_subscriptions().await;
        }
    }

    /// Reconciliation loop: wake on any configuration change. Returns when
    /// every configuration feed handle has been dropped.
    pub async fn run(self: Arc<Self>) {
        let mut config = self.config.clone();
        loop {
            match config.changed().await {
                ConfigChange::Shutdown => {
                    info!("configuration feeds dropped, reconciliation loop exiting");
                    break;
                }
                change => self.reconcile(change == ConfigChange::Accounts).await,
            }
        }
    }

    /// One reconciliation pass. Serialized: a new pass will not begin while a
    /// previous `Closing` transition is still in flight.
    pub(crate) async fn reconcile(self: &Arc<Self>, account_event: bool) {
        let _serialized = self.reconcile_lock.lock().await;

        let next = Arc::new(WatchSet::compute(&self.config.snapshot()));
        let prev = self.current.lock().await.clone();

        if let Some(prev) = &prev {
            if **prev == *next {
                debug!("watch-set unchanged, skipping reconciliation");
                return;
            }
            // Chain/network/token/module membership changed: reap immediately.
            if !prev.same_inputs(&next) {
                self.reap_removed(&next).await;
            }
        }

        if account_event {
            self.schedule_account_reap().await;
        }

        *self.current.lock().await = Some(Arc::clone(&next));

        let has_consumers = !self.consumers.lock().await.is_empty();
        if has_consumers {
            self.close_subscriptions().await;
            self.open_subscriptions().await;
        }
    }

    /// Delete cached records whose chain, network, token, or owning module no
    /// longer exists. Explicit pass, not garbage collection.
    async fn reap_removed(&self, next: &WatchSet) {
        let ledgers: HashSet<LedgerId> = next
            .chains
            .iter()
            .map(|c| LedgerId::Chain(c.id.clone()))
            .chain(next.networks.iter().map(|n| LedgerId::Network(n.id.clone())))
            .collect();
        let token_ids: HashSet<&TokenId> = next.tokens.iter().map(|t| &t.id).collect();

        let removed = self
            .cache
            .delete_where(|record| {
                !ledgers.contains(&record.ledger)
                    || !token_ids.contains(&record.token_id)
                    || !self.modules.contains(&record.source)
            })
            .await;
        if removed > 0 {
            info!(removed, "reaped records for removed chains/networks/tokens");
        }
    }

    /// (Re)start the debounced account reap. The timer restarts on every
    /// account-list event; at fire time, addresses are re-read so accounts
    /// added during the debounce window are never touched.
    async fn schedule_account_reap(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut pending = self.account_reap.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(ACCOUNT_REAP_DEBOUNCE).await;
            let addresses: HashSet<AccountAddress> = this
                .config
                .snapshot()
                .accounts
                .iter()
                .map(|a| a.address.clone())
                .collect();
            let removed = this
                .cache
                .delete_where(|record| !addresses.contains(&record.address))
                .await;
            if removed > 0 {
                info!(removed, "reaped records for removed accounts");
            }
        }));
    }

    /// `Closed → Open`. Groups the watch-set by module and opens one
    /// aggregated subscription per module with a non-empty target group.
    async fn open_subscriptions(self: &Arc<Self>) {
        // Re-entrancy guard: wait out an in-flight close.
        let mut signal = self.state.subscribe();
        loop {
            let state = *signal.borrow_and_update();
            match state {
                SubscriptionState::Closing => {
                    if signal.changed().await.is_err() {
                        return;
                    }
                }
                SubscriptionState::Open => return,
                SubscriptionState::Closed => break,
            }
        }
        if self.consumers.lock().await.is_empty() {
            return;
        }

        let watch_set = {
            let mut current = self.current.lock().await;
            match &*current {
                Some(set) => Arc::clone(set),
                None => {
                    let set = Arc::new(WatchSet::compute(&self.config.snapshot()));
                    *current = Some(Arc::clone(&set));
                    set
                }
            }
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let ctx = self.module_context(&watch_set);
        let mut opened = Vec::new();

        for (module_id, targets) in watch_set.targets_by_module() {
            let Some(module) = self.modules.get(&module_id) else {
                warn!(module = %module_id, "no module registered for token family");
                continue;
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            match module.subscribe_balances(&ctx, &targets, tx).await {
                Ok(unsubscribe) => {
                    let this = Arc::clone(self);
                    let pump_module = module_id.clone();
                    let pump_targets = targets.clone();
                    tokio::spawn(async move {
                        while let Some(update) = rx.recv().await {
                            this.handle_update(generation, &pump_module, &pump_targets, update)
                                .await;
                        }
                    });
                    opened.push(OpenSubscription {
                        module: module_id,
                        unsubscribe,
                    });
                }
                // Endpoint failure is fatal to this module's subscription
                // only; other chains and modules are unaffected.
                Err(err) => warn!(module = %module_id, %err, "could not open module subscription"),
            }
        }

        let count = opened.len();
        self.open_subs.lock().await.extend(opened);
        self.state.send_replace(SubscriptionState::Open);
        debug!(
            subscriptions = count,
            generation, "module subscriptions opened"
        );
    }

    /// `Open → Closing → Closed`. Bumps the generation (invalidating
    /// in-flight callbacks) and schedules every unsubscribe after a grace
    /// delay; the state is `Closed` as soon as the callbacks are scheduled.
    async fn close_subscriptions(&self) {
        let mut signal = self.state.subscribe();
        loop {
            let state = *signal.borrow_and_update();
            match state {
                SubscriptionState::Closing => {
                    if signal.changed().await.is_err() {
                        return;
                    }
                }
                SubscriptionState::Closed => return,
                SubscriptionState::Open => break,
            }
        }

        self.state.send_replace(SubscriptionState::Closing);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let subs: Vec<OpenSubscription> = std::mem::take(&mut *self.open_subs.lock().await);
        debug!(
            subscriptions = subs.len(),
            generation, "scheduling deferred unsubscribes"
        );

        tokio::spawn(async move {
            tokio::time::sleep(UNSUBSCRIBE_GRACE).await;
            for sub in subs {
                debug!(module = %sub.module, "invoking deferred unsubscribe");
                (sub.unsubscribe)();
            }
        });

        self.state.send_replace(SubscriptionState::Closed);
    }

    /// One delivery from a module subscription. Every path is guarded by the
    /// generation check: callbacks from a superseded generation are silent
    /// no-ops, so out-of-order delivery across a close/reopen boundary cannot
    /// resurrect old data.
    async fn handle_update(
        &self,
        generation: u64,
        module_id: &ModuleId,
        targets: &AddressesByToken,
        update: ModuleUpdate,
    ) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(module = %module_id, generation, "dropping update from superseded generation");
            return;
        }
        match update {
            ModuleUpdate::Balances(balances) => {
                let tagged: Balances = balances
                    .iter()
                    .map(|record| record.with_status(BalanceStatus::Live(generation)))
                    .collect();
                self.cache.upsert(tagged).await;
            }
            ModuleUpdate::Error(err) if err.marks_stale() => {
                warn!(module = %module_id, %err, "flagging cached records stale");
                let affected = err.affected.as_ref().unwrap_or(targets);
                self.cache
                    .mark_stale_where(|record| {
                        record.source == *module_id
                            && affected
                                .get(&record.token_id)
                                .is_some_and(|addrs| addrs.contains(&record.address))
                    })
                    .await;
            }
            ModuleUpdate::Error(err) => {
                warn!(module = %module_id, %err, "module subscription error, dropped");
            }
        }
    }

    /// Point query: cache first, then a one-shot module fetch that does NOT
    /// populate the long-lived store. One-off queries for untracked
    /// addresses must not perturb the subscription set.
    pub async fn get_balance(
        &self,
        ledger: &LedgerId,
        token_id: &TokenId,
        address: &AccountAddress,
    ) -> Result<Option<BalanceRecord>> {
        let snapshot = self.config.snapshot();
        let token = snapshot
            .tokens
            .iter()
            .find(|t| t.id == *token_id)
            .ok_or_else(|| crate::Error::unknown("token", token_id.as_str()))?;
        if token.ledger != *ledger {
            return Err(crate::Error::invalid_request(format!(
                "token {token_id} does not live on {ledger}"
            )));
        }

        let id = format!("{}-{}-{}-{}", token.module, address, ledger, token_id);
        if let Some(record) = self.cache.get(&id).await {
            return Ok(Some(record));
        }

        let module = self
            .modules
            .get(&token.module)
            .ok_or_else(|| crate::Error::unknown("module", token.module.as_str()))?;

        let watch_set = match &*self.current.lock().await {
            Some(set) => Arc::clone(set),
            None => Arc::new(WatchSet::compute(&snapshot)),
        };
        let ctx = self.module_context(&watch_set);

        let mut query = AddressesByToken::new();
        query.insert(token_id.clone(), vec![address.clone()]);
        let fetched = module.fetch_balances(&ctx, &query).await?;
        let found = fetched
            .iter()
            .find(|r| r.token_id == *token_id && r.address == *address)
            .cloned();
        Ok(found)
    }

    fn module_context(&self, watch_set: &WatchSet) -> ModuleContext {
        let snapshot = self.config.snapshot();
        let chains = watch_set
            .chains
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();
        let networks = watch_set
            .networks
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let tokens = watch_set
            .tokens
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        let metadata: HashMap<_, _> = snapshot
            .chains
            .iter()
            .filter_map(|c| c.metadata.as_ref().map(|m| (c.id.clone(), m.clone())))
            .collect();
        ModuleContext {
            pool: Arc::clone(&self.pool),
            tokens: Arc::new(tokens),
            chains: Arc::new(chains),
            networks: Arc::new(networks),
            metadata: Arc::new(metadata),
        }
    }

    /// Rank lookup for sorted balance views, derived from the current
    /// watch-set descriptors.
    pub async fn ledger_ranks(&self) -> HashMap<LedgerId, u32> {
        let current = self.current.lock().await;
        let Some(watch_set) = &*current else {
            return HashMap::new();
        };
        let mut ranks = HashMap::new();
        for chain in &watch_set.chains {
            if let Some(rank) = chain.rank {
                ranks.insert(LedgerId::Chain(chain.id.clone()), rank);
            }
        }
        for network in &watch_set.networks {
            if let Some(rank) = network.rank {
                ranks.insert(LedgerId::Network(network.id.clone()), rank);
            }
        }
        ranks
    }
}
