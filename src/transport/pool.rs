//! The per-chain connection multiplexer.
//!
//! Every chain and network has at most one live transport, shared by all
//! callers. `acquire` hands out an opaque caller id and bumps a reference
//! count; `release` tears the transport down when the last holder leaves.
//! There is no grace delay at this layer: rapid subscribe/unsubscribe cycles
//! are absorbed one level up by the orchestrator's deferred unsubscribes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::prelude::*;
use crate::store::SnapshotStore;
use crate::transport::{
    light_client::{LightClientProvider, LightClientTransport},
    ws_rpc::{WsRpcClient, WsRpcConfig},
    RpcTransport, SubscribeRequest, SubscriptionId, SubscriptionMessage,
};
use crate::types::{ChainDescriptor, LedgerId, NetworkDescriptor};
use crate::TransportError;

/// Health probe cadence while any caller holds a reference.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Opaque identity of one connection holder. Random, unique among current
/// holders of the same chain; nothing depends on allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

struct ChainSlot {
    transport: Arc<dyn RpcTransport>,
    holders: HashSet<u64>,
    keepalive: JoinHandle<()>,
}

/// Shares one transport per chain among concurrent callers.
pub struct ConnectionPool {
    slots: Mutex<HashMap<LedgerId, ChainSlot>>,
    settings: watch::Receiver<Settings>,
    light_provider: Option<Arc<dyn LightClientProvider>>,
    snapshots: Option<Arc<SnapshotStore>>,
    ws_config: WsRpcConfig,
    http: reqwest::Client,
}

impl ConnectionPool {
    pub fn new(
        settings: watch::Receiver<Settings>,
        light_provider: Option<Arc<dyn LightClientProvider>>,
        snapshots: Option<Arc<SnapshotStore>>,
        ws_config: WsRpcConfig,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            settings,
            light_provider,
            snapshots,
            ws_config,
            http: reqwest::Client::new(),
        }
    }

    /// Acquire the shared transport for a chain, creating it if this is the
    /// first holder. Readiness is awaited before returning, so a returned
    /// transport is usable immediately.
    pub async fn acquire_chain(
        &self,
        chain: &ChainDescriptor,
    ) -> Result<(CallerId, Arc<dyn RpcTransport>)> {
        let ledger = LedgerId::Chain(chain.id.clone());
        self.acquire(ledger, &chain.endpoints, Some(chain)).await
    }

    pub async fn acquire_network(
        &self,
        network: &NetworkDescriptor,
    ) -> Result<(CallerId, Arc<dyn RpcTransport>)> {
        let ledger = LedgerId::Network(network.id.clone());
        self.acquire(ledger, &network.endpoints, None).await
    }

    // The slot map lock is held across transport creation: a second caller
    // arriving mid-connect must wait and then share, never open a second
    // socket to the same chain.
    async fn acquire(
        &self,
        ledger: LedgerId,
        endpoints: &[String],
        chain: Option<&ChainDescriptor>,
    ) -> Result<(CallerId, Arc<dyn RpcTransport>)> {
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.get_mut(&ledger) {
            let caller = new_caller_id(&slot.holders);
            slot.holders.insert(caller.0);
            return Ok((caller, Arc::clone(&slot.transport)));
        }

        let transport = self.open_transport(&ledger, endpoints, chain).await?;
        let keepalive = spawn_keepalive(ledger.clone(), Arc::clone(&transport));

        let caller = new_caller_id(&HashSet::new());
        let mut holders = HashSet::new();
        holders.insert(caller.0);
        info!(ledger = %ledger, "transport opened");
        slots.insert(
            ledger,
            ChainSlot {
                transport: Arc::clone(&transport),
                holders,
                keepalive,
            },
        );
        Ok((caller, transport))
    }

    async fn open_transport(
        &self,
        ledger: &LedgerId,
        endpoints: &[String],
        chain: Option<&ChainDescriptor>,
    ) -> Result<Arc<dyn RpcTransport>> {
        let use_light_clients = self.settings.borrow().use_light_clients;
        if let (Some(provider), Some(chain)) = (&self.light_provider, chain) {
            if use_light_clients {
                if let Some(light_config) = &chain.light_client {
                    let transport = LightClientTransport::connect(
                        provider,
                        &chain.id,
                        light_config,
                        self.snapshots.clone(),
                        &self.http,
                    )
                    .await?;
                    debug!(ledger = %ledger, "using embedded light client");
                    return Ok(Arc::new(transport));
                }
            }
        }

        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints.into());
        }
        let client = WsRpcClient::connect(endpoints.to_vec(), self.ws_config.clone()).await?;
        Ok(Arc::new(client))
    }

    /// Drop one holder. The transport is torn down (and its keep-alive timer
    /// cancelled) when the reference count reaches zero.
    pub async fn release(&self, ledger: &LedgerId, caller: CallerId) {
        let closing = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(ledger) else {
                warn!(ledger = %ledger, "release for unknown transport");
                return;
            };
            if !slot.holders.remove(&caller.0) {
                warn!(ledger = %ledger, "release for unknown holder");
                return;
            }
            if !slot.holders.is_empty() {
                return;
            }
            slots.remove(ledger)
        };
        if let Some(slot) = closing {
            slot.keepalive.abort();
            info!(ledger = %ledger, "last holder released, closing transport");
            slot.transport.close().await;
        }
    }

    /// One request/response round trip on the chain's shared transport.
    pub async fn send(
        &self,
        ledger: &LedgerId,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.transport_for(ledger).await?.send(method, params).await
    }

    pub async fn subscribe(
        &self,
        ledger: &LedgerId,
        request: SubscribeRequest,
        sender: tokio::sync::mpsc::UnboundedSender<SubscriptionMessage>,
    ) -> Result<SubscriptionId> {
        self.transport_for(ledger)
            .await?
            .subscribe(request, sender)
            .await
    }

    pub async fn unsubscribe(&self, ledger: &LedgerId, id: SubscriptionId) -> Result<()> {
        self.transport_for(ledger).await?.unsubscribe(id).await
    }

    pub async fn holder_count(&self, ledger: &LedgerId) -> usize {
        self.slots
            .lock()
            .await
            .get(ledger)
            .map(|slot| slot.holders.len())
            .unwrap_or(0)
    }

    async fn transport_for(&self, ledger: &LedgerId) -> Result<Arc<dyn RpcTransport>> {
        let slots = self.slots.lock().await;
        slots
            .get(ledger)
            .map(|slot| Arc::clone(&slot.transport))
            .ok_or_else(|| TransportError::NotConnected.into())
    }
}

fn new_caller_id(holders: &HashSet<u64>) -> CallerId {
    loop {
        let id = rand::random::<u64>();
        if !holders.contains(&id) {
            return CallerId(id);
        }
    }
}

/// Probe the transport every 10s while held; skipped while disconnected (the
/// transport's own reconnection is already in flight then).
fn spawn_keepalive(ledger: LedgerId, transport: Arc<dyn RpcTransport>) -> JoinHandle<()> {
    let probe_method = match &ledger {
        LedgerId::Chain(_) => "system_health",
        LedgerId::Network(_) => "eth_chainId",
    };
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            if !transport.is_connected() {
                debug!(ledger = %ledger, "skipping keep-alive probe while disconnected");
                continue;
            }
            if let Err(err) = transport.send(probe_method, json!([])).await {
                debug!(ledger = %ledger, %err, "keep-alive probe failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;
    use crate::transport::light_client::LightClientSession;
    use crate::types::{ChainId, LightClientConfig};

    #[derive(Default)]
    struct MockSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl RpcTransport for MockSession {
        async fn send(&self, _method: &str, _params: Value) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn subscribe(
            &self,
            _request: SubscribeRequest,
            _sender: UnboundedSender<SubscriptionMessage>,
        ) -> Result<SubscriptionId> {
            Ok(SubscriptionId(1))
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::Relaxed)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl LightClientSession for MockSession {
        async fn database_snapshot(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    struct MockProvider {
        starts: AtomicUsize,
        session: Arc<MockSession>,
    }

    #[async_trait]
    impl LightClientProvider for MockProvider {
        async fn start(
            &self,
            _chain_spec: String,
            _database: Option<String>,
        ) -> Result<Arc<dyn LightClientSession>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.session) as Arc<dyn LightClientSession>)
        }
    }

    fn light_chain() -> ChainDescriptor {
        ChainDescriptor {
            id: ChainId::from("polkadot"),
            genesis_hash: Some("0x91b1".into()),
            account_format: 0,
            endpoints: vec![],
            rank: Some(0),
            light_client: Some(LightClientConfig {
                chain_spec: Some("{}".into()),
                chain_spec_url: None,
                relay: None,
            }),
        }
    }

    fn pool_with(provider: Arc<MockProvider>) -> ConnectionPool {
        let (_tx, rx) = watch::channel(Settings {
            enable_testnets: false,
            use_light_clients: true,
        });
        ConnectionPool::new(rx, Some(provider), None, WsRpcConfig::default())
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_transport() {
        let provider = Arc::new(MockProvider {
            starts: AtomicUsize::new(0),
            session: Arc::new(MockSession::default()),
        });
        let pool = Arc::new(pool_with(Arc::clone(&provider)));
        let chain = light_chain();

        let (a, b) = tokio::join!(pool.acquire_chain(&chain), pool.acquire_chain(&chain));
        let (caller_a, _) = a.unwrap();
        let (caller_b, _) = b.unwrap();

        assert_eq!(provider.starts.load(Ordering::SeqCst), 1);
        assert_ne!(caller_a, caller_b);

        let ledger = LedgerId::Chain(chain.id.clone());
        assert_eq!(pool.holder_count(&ledger).await, 2);

        pool.release(&ledger, caller_a).await;
        assert!(!provider.session.closed.load(Ordering::Relaxed));
        assert_eq!(pool.holder_count(&ledger).await, 1);

        pool.release(&ledger, caller_b).await;
        assert!(provider.session.closed.load(Ordering::Relaxed));
        assert_eq!(pool.holder_count(&ledger).await, 0);
    }

    #[tokio::test]
    async fn subscriptions_ride_the_shared_transport() {
        let provider = Arc::new(MockProvider {
            starts: AtomicUsize::new(0),
            session: Arc::new(MockSession::default()),
        });
        let pool = pool_with(Arc::clone(&provider));
        let chain = light_chain();
        let (caller, _) = pool.acquire_chain(&chain).await.unwrap();
        let ledger = LedgerId::Chain(chain.id.clone());

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = pool
            .subscribe(
                &ledger,
                SubscribeRequest {
                    subscribe_method: "state_subscribeStorage".into(),
                    unsubscribe_method: "state_unsubscribeStorage".into(),
                    notification_method: "state_storage".into(),
                    params: json!([[]]),
                },
                tx,
            )
            .await
            .unwrap();
        pool.unsubscribe(&ledger, sub).await.unwrap();
        pool.release(&ledger, caller).await;
    }

    #[tokio::test]
    async fn acquire_without_endpoints_or_light_client_fails() {
        let provider = Arc::new(MockProvider {
            starts: AtomicUsize::new(0),
            session: Arc::new(MockSession::default()),
        });
        let pool = pool_with(provider);

        let mut chain = light_chain();
        chain.light_client = None;
        let err = match pool.acquire_chain(&chain).await {
            Ok(_) => panic!("expected acquire_chain to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::NoEndpoints)
        ));
    }

    #[tokio::test]
    async fn send_without_connection_is_rejected() {
        let provider = Arc::new(MockProvider {
            starts: AtomicUsize::new(0),
            session: Arc::new(MockSession::default()),
        });
        let pool = pool_with(provider);
        let err = pool
            .send(
                &LedgerId::Chain(ChainId::from("nowhere")),
                "system_health",
                json!([]),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::NotConnected)
        ));
    }
}
