//! Integration tests for the orchestrator.
//!
//! Tests cover:
//! - Subscription state machine transitions
//! - Generation-guarded update handling
//! - Stale-endpoint error scoping
//! - Debounced account reaping
//! - Immediate chain/token reaping
//! - Point queries bypassing the subscription machinery

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{config_channel, ConfigFeed, Settings};
use crate::modules::{
    AddressesByToken, BalanceModule, ModuleContext, ModuleError, ModuleErrorKind, ModuleRegistry,
    ModuleUpdate, Unsubscribe,
};
use crate::orchestrator::{Orchestrator, SubscriptionState};
use crate::prelude::*;
use crate::store::BalanceCache;
use crate::transport::{ConnectionPool, WsRpcConfig};
use crate::types::{
    AccountAddress, AccountConfig, AmountField, BalanceRecord, BalanceStatus, Balances,
    ChainConfig, ChainId, LedgerId, ModuleId, TokenConfig, TokenId,
};

const MODULE: &str = "substrate-native";

/// Module double: captures subscription channels so tests can push updates,
/// counts unsubscribes and one-shot fetches.
struct MockModule {
    senders: StdMutex<Vec<UnboundedSender<ModuleUpdate>>>,
    unsubscribes: Arc<AtomicUsize>,
    fetches: AtomicUsize,
    fetch_result: StdMutex<Balances>,
}

impl MockModule {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: StdMutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            fetches: AtomicUsize::new(0),
            fetch_result: StdMutex::new(Balances::default()),
        })
    }

    fn latest_sender(&self) -> UnboundedSender<ModuleUpdate> {
        self.senders.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl BalanceModule for MockModule {
    fn id(&self) -> ModuleId {
        ModuleId::from(MODULE)
    }

    async fn fetch_balances(
        &self,
        _ctx: &ModuleContext,
        _addresses_by_token: &AddressesByToken,
    ) -> Result<Balances> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.fetch_result.lock().unwrap().clone())
    }

    async fn subscribe_balances(
        &self,
        _ctx: &ModuleContext,
        _addresses_by_token: &AddressesByToken,
        sender: UnboundedSender<ModuleUpdate>,
    ) -> Result<Unsubscribe> {
        self.senders.lock().unwrap().push(sender);
        let unsubscribes = Arc::clone(&self.unsubscribes);
        Ok(Box::new(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

fn chain(id: &str) -> ChainConfig {
    ChainConfig {
        id: ChainId::from(id),
        name: id.to_owned(),
        genesis_hash: Some(format!("0x{id}")),
        account_format: 0,
        endpoints: vec![format!("wss://{id}.example")],
        enabled: true,
        is_testnet: false,
        rank: None,
        light_client: None,
        metadata_fingerprint: Some(format!("{id}-v1")),
        metadata: None,
    }
}

fn token(id: &str, chain_id: &str) -> TokenConfig {
    TokenConfig {
        id: TokenId::from(id),
        module: ModuleId::from(MODULE),
        ledger: LedgerId::Chain(ChainId::from(chain_id)),
        symbol: id.to_uppercase(),
        decimals: 10,
        enabled: true,
        rates: Default::default(),
    }
}

fn account(address: &str) -> AccountConfig {
    AccountConfig {
        address: AccountAddress::from(address),
        genesis_hash: None,
    }
}

fn record(token_id: &str, chain_id: &str, address: &str, free: u128) -> BalanceRecord {
    let mut r = BalanceRecord::new(
        MODULE,
        LedgerId::Chain(ChainId::from(chain_id)),
        token_id,
        address,
    );
    r.free = AmountField::from(free);
    r
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    feed: ConfigFeed,
    cache: Arc<BalanceCache>,
    module: Arc<MockModule>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let (feed, config) = config_channel();
    let module = MockModule::new();
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::clone(&module) as Arc<dyn BalanceModule>);
    let pool = Arc::new(ConnectionPool::new(
        config.settings.clone(),
        None,
        None,
        WsRpcConfig::default(),
    ));
    let cache = Arc::new(BalanceCache::new());
    let orchestrator = Orchestrator::new(pool, Arc::new(registry), Arc::clone(&cache), config);
    Harness {
        orchestrator,
        feed,
        cache,
        module,
    }
}

/// Let spawned tasks (update pumps, reap timers at fire time) run.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn feed_one_chain(feed: &ConfigFeed, addresses: &[&str]) {
    feed.set_chains(vec![chain("polkadot")]);
    feed.set_tokens(vec![token("dot", "polkadot")]);
    feed.set_accounts(addresses.iter().map(|a| account(a)).collect());
    feed.set_settings(Settings::default());
}

#[tokio::test(start_paused = true)]
async fn first_consumer_opens_last_consumer_closes() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    assert_eq!(h.orchestrator.state(), SubscriptionState::Closed);

    assert!(h.orchestrator.subscribe("ui-1").await);
    assert_eq!(h.orchestrator.state(), SubscriptionState::Open);
    // Registering the same consumer again is not a new registration.
    assert!(!h.orchestrator.subscribe("ui-1").await);

    h.orchestrator.subscribe("ui-2").await;
    h.orchestrator.unsubscribe_consumer("ui-1").await;
    assert_eq!(h.orchestrator.state(), SubscriptionState::Open);

    h.orchestrator.unsubscribe_consumer("ui-2").await;
    assert_eq!(h.orchestrator.state(), SubscriptionState::Closed);

    // The unsubscribe itself is deferred by the grace delay.
    assert_eq!(h.module.unsubscribes.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.module.unsubscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn live_updates_are_upserted_with_generation_marker() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let generation = h.orchestrator.generation();
    h.module
        .latest_sender()
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 100,
        ))))
        .unwrap();
    settle().await;

    let stored = h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .unwrap();
    assert_eq!(stored.status, BalanceStatus::Live(generation));
    assert_eq!(stored.free_planck(), 100);
}

#[tokio::test(start_paused = true)]
async fn superseded_generation_updates_are_discarded() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let old_sender = h.module.latest_sender();
    old_sender
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 100,
        ))))
        .unwrap();
    settle().await;

    // A watch-set change supersedes the open subscriptions.
    h.feed.set_accounts(vec![account("alice"), account("bob")]);
    h.orchestrator.reconcile(true).await;
    settle().await;
    assert!(h.orchestrator.generation() > 0);

    // The old subscription pushes again; the callback must be a no-op.
    old_sender
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 999,
        ))))
        .unwrap();
    settle().await;

    let stored = h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .unwrap();
    assert_eq!(stored.free_planck(), 100);
}

#[tokio::test(start_paused = true)]
async fn stale_endpoint_errors_flag_only_the_affected_subset() {
    let h = harness();
    h.feed.set_chains(vec![chain("polkadot"), chain("kusama")]);
    h.feed
        .set_tokens(vec![token("dot", "polkadot"), token("ksm", "kusama")]);
    h.feed.set_accounts(vec![account("alice")]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let sender = h.module.latest_sender();
    sender
        .send(ModuleUpdate::Balances(Balances::new([
            record("dot", "polkadot", "alice", 100),
            record("ksm", "kusama", "alice", 50),
        ])))
        .unwrap();
    settle().await;

    // The polkadot leg of the subscription degrades.
    let mut affected = AddressesByToken::new();
    affected.insert(TokenId::from("dot"), vec![AccountAddress::from("alice")]);
    sender
        .send(ModuleUpdate::Error(
            ModuleError::new(ModuleErrorKind::StaleRpc, "stale rpc").with_affected(affected),
        ))
        .unwrap();
    settle().await;

    let dot = h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .unwrap();
    assert_eq!(dot.status, BalanceStatus::Stale);
    assert_eq!(dot.free_planck(), 100); // flagged, not deleted

    let ksm = h
        .cache
        .get(&record("ksm", "kusama", "alice", 0).id())
        .await
        .unwrap();
    assert!(ksm.status.is_live());
}

#[tokio::test(start_paused = true)]
async fn other_errors_are_dropped_without_cache_mutation() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let sender = h.module.latest_sender();
    sender
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 100,
        ))))
        .unwrap();
    settle().await;

    sender
        .send(ModuleUpdate::Error(ModuleError::new(
            ModuleErrorKind::Other,
            "decode failure",
        )))
        .unwrap();
    settle().await;

    let stored = h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .unwrap();
    assert!(stored.status.is_live());
}

#[tokio::test(start_paused = true)]
async fn fresh_push_overrides_stale_flag() {
    // Latest generation-valid write wins: a stale flag is not sticky.
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let sender = h.module.latest_sender();
    sender
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 100,
        ))))
        .unwrap();
    sender
        .send(ModuleUpdate::Error(ModuleError::new(
            ModuleErrorKind::StaleRpc,
            "stale rpc",
        )))
        .unwrap();
    sender
        .send(ModuleUpdate::Balances(Balances::from(record(
            "dot", "polkadot", "alice", 150,
        ))))
        .unwrap();
    settle().await;

    let stored = h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .unwrap();
    assert!(stored.status.is_live());
    assert_eq!(stored.free_planck(), 150);
}

#[tokio::test(start_paused = true)]
async fn account_shrink_reaps_after_debounce() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice", "bob", "carol"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    h.module
        .latest_sender()
        .send(ModuleUpdate::Balances(Balances::new([
            record("dot", "polkadot", "alice", 1),
            record("dot", "polkadot", "bob", 2),
            record("dot", "polkadot", "carol", 3),
        ])))
        .unwrap();
    settle().await;
    assert_eq!(h.cache.len().await, 3);

    // 3 accounts -> 1
    h.feed.set_accounts(vec![account("alice")]);
    h.orchestrator.reconcile(true).await;

    // Inside the debounce window nothing is deleted yet.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.cache.len().await, 3);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(h.cache.len().await, 1);
    assert!(h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn account_reap_debounce_restarts_on_new_events() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice", "bob"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    h.module
        .latest_sender()
        .send(ModuleUpdate::Balances(Balances::new([
            record("dot", "polkadot", "alice", 1),
            record("dot", "polkadot", "bob", 2),
        ])))
        .unwrap();
    settle().await;

    h.feed.set_accounts(vec![account("alice")]);
    h.orchestrator.reconcile(true).await;

    // Bob comes back before the debounce fires; the restarted pass must not
    // delete anything.
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.feed.set_accounts(vec![account("alice"), account("bob")]);
    h.orchestrator.reconcile(true).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(h.cache.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn removed_chains_are_reaped_immediately() {
    let h = harness();
    h.feed.set_chains(vec![chain("polkadot"), chain("kusama")]);
    h.feed
        .set_tokens(vec![token("dot", "polkadot"), token("ksm", "kusama")]);
    h.feed.set_accounts(vec![account("alice")]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    h.module
        .latest_sender()
        .send(ModuleUpdate::Balances(Balances::new([
            record("dot", "polkadot", "alice", 1),
            record("ksm", "kusama", "alice", 2),
        ])))
        .unwrap();
    settle().await;
    assert_eq!(h.cache.len().await, 2);

    h.feed.set_chains(vec![chain("polkadot")]);
    h.feed.set_tokens(vec![token("dot", "polkadot")]);
    h.orchestrator.reconcile(false).await;
    settle().await;

    assert_eq!(h.cache.len().await, 1);
    assert!(h
        .cache
        .get(&record("dot", "polkadot", "alice", 0).id())
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn unchanged_watch_set_causes_no_churn() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;
    h.orchestrator.subscribe("ui").await;

    let generation = h.orchestrator.generation();
    let subscriptions = h.module.senders.lock().unwrap().len();

    // Same values fed again: the trigger fires, the reconciliation
    // short-circuits on structural equality.
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;

    assert_eq!(h.orchestrator.generation(), generation);
    assert_eq!(h.module.senders.lock().unwrap().len(), subscriptions);
}

#[tokio::test(start_paused = true)]
async fn point_query_prefers_cache() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;

    h.cache
        .upsert(Balances::from(record("dot", "polkadot", "alice", 42)))
        .await;

    let found = h
        .orchestrator
        .get_balance(
            &LedgerId::Chain(ChainId::from("polkadot")),
            &TokenId::from("dot"),
            &AccountAddress::from("alice"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.free_planck(), 42);
    assert_eq!(h.module.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn point_query_miss_fetches_without_caching() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;

    *h.module.fetch_result.lock().unwrap() =
        Balances::from(record("dot", "polkadot", "outsider", 7));

    let found = h
        .orchestrator
        .get_balance(
            &LedgerId::Chain(ChainId::from("polkadot")),
            &TokenId::from("dot"),
            &AccountAddress::from("outsider"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.free_planck(), 7);
    assert_eq!(h.module.fetches.load(Ordering::SeqCst), 1);
    // One-off queries must not perturb the long-lived store.
    assert!(h.cache.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn point_query_for_unknown_token_is_rejected() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;

    let err = h
        .orchestrator
        .get_balance(
            &LedgerId::Chain(ChainId::from("polkadot")),
            &TokenId::from("nope"),
            &AccountAddress::from("alice"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::Error::Unknown { kind: "token", .. }));
}

#[tokio::test(start_paused = true)]
async fn point_query_with_mismatched_ledger_is_rejected() {
    let h = harness();
    feed_one_chain(&h.feed, &["alice"]);
    h.orchestrator.reconcile(false).await;

    let err = h
        .orchestrator
        .get_balance(
            &LedgerId::Chain(ChainId::from("kusama")),
            &TokenId::from("dot"),
            &AccountAddress::from("alice"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::Error::InvalidRequest(_)));
}
