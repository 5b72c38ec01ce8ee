//! Embedded light-client transport.
//!
//! The embedded client itself (e.g. a smoldot binding) is a pluggable
//! collaborator behind [`LightClientProvider`], the same way balance modules
//! are pluggable. This module owns the lifecycle around it: resolving the
//! chain specification (inline or fetched over HTTP), restoring a persisted
//! client database, and periodically persisting fresh database snapshots
//! while the client runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::prelude::*;
use crate::store::SnapshotStore;
use crate::transport::{RpcTransport, SubscribeRequest, SubscriptionId, SubscriptionMessage};
use crate::types::{ChainId, LightClientConfig};
use crate::TransportError;

/// How often the client database snapshot is persisted while running.
const DB_PERSIST_INTERVAL: Duration = Duration::from_secs(300);

/// HTTP status codes that indicate transient server errors (retryable)
const RETRYABLE_STATUS_CODES: &[u16] = &[502, 503, 504];

/// Maximum number of retry attempts for a chain-spec fetch
const MAX_FETCH_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds (doubles with each retry)
const INITIAL_BACKOFF_MS: u64 = 100;

/// Supplies embedded light-client sessions. Implemented by the embedder.
#[async_trait]
pub trait LightClientProvider: Send + Sync {
    /// Start a client for the given chain spec, restoring `database` if the
    /// engine persisted one in a previous run.
    async fn start(
        &self,
        chain_spec: String,
        database: Option<String>,
    ) -> Result<Arc<dyn LightClientSession>>;
}

/// A running embedded client: a normal RPC transport plus database export.
#[async_trait]
pub trait LightClientSession: RpcTransport {
    /// Serialized client database, persisted so the next run can warm-start
    /// its sync.
    async fn database_snapshot(&self) -> Result<String>;
}

/// A light-client session wrapped with snapshot persistence.
pub struct LightClientTransport {
    chain_id: ChainId,
    session: Arc<dyn LightClientSession>,
    snapshots: Option<Arc<SnapshotStore>>,
    persist_task: JoinHandle<()>,
}

fn db_snapshot_name(chain_id: &ChainId) -> String {
    format!("light-client-db-{chain_id}")
}

impl LightClientTransport {
    /// Resolve the chain spec, restore any persisted database, start the
    /// client, and begin periodic database persistence.
    pub async fn connect(
        provider: &Arc<dyn LightClientProvider>,
        chain_id: &ChainId,
        config: &LightClientConfig,
        snapshots: Option<Arc<SnapshotStore>>,
        http: &reqwest::Client,
    ) -> Result<Self> {
        let chain_spec = resolve_chain_spec(config, http).await?;

        let database = match &snapshots {
            Some(store) => store
                .load::<String>(&db_snapshot_name(chain_id))
                .unwrap_or_else(|err| {
                    warn!(chain = %chain_id, %err, "could not read light client database snapshot");
                    None
                }),
            None => None,
        };

        let session = provider.start(chain_spec, database).await?;

        let persist_task = {
            let session = Arc::clone(&session);
            let snapshots = snapshots.clone();
            let chain_id = chain_id.clone();
            tokio::spawn(async move {
                let Some(store) = snapshots else { return };
                loop {
                    tokio::time::sleep(DB_PERSIST_INTERVAL).await;
                    persist_database(&store, &chain_id, session.as_ref()).await;
                }
            })
        };

        Ok(Self {
            chain_id: chain_id.clone(),
            session,
            snapshots,
            persist_task,
        })
    }
}

async fn persist_database(
    store: &SnapshotStore,
    chain_id: &ChainId,
    session: &dyn LightClientSession,
) {
    match session.database_snapshot().await {
        Ok(database) => {
            if let Err(err) = store.save(&db_snapshot_name(chain_id), &database) {
                warn!(chain = %chain_id, %err, "could not persist light client database");
            } else {
                debug!(chain = %chain_id, "light client database persisted");
            }
        }
        Err(err) => warn!(chain = %chain_id, %err, "light client database snapshot failed"),
    }
}

/// Fetch the chain specification, retrying transient upstream errors with
/// exponential backoff.
async fn resolve_chain_spec(config: &LightClientConfig, http: &reqwest::Client) -> Result<String> {
    if let Some(spec) = &config.chain_spec {
        return Ok(spec.clone());
    }
    let Some(url) = &config.chain_spec_url else {
        return Err(TransportError::LightClient(
            "no chain spec or chain spec url configured".into(),
        )
        .into());
    };

    for attempt in 0..=MAX_FETCH_RETRIES {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::LightClient(e.to_string()))?;

        let status = response.status().as_u16();
        if RETRYABLE_STATUS_CODES.contains(&status) && attempt < MAX_FETCH_RETRIES {
            let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
            warn!(
                status,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis(),
                url = %url,
                "Retryable chain spec fetch error, backing off"
            );
            tokio::time::sleep(backoff).await;
            continue;
        }
        if status >= 400 {
            return Err(TransportError::LightClient(format!(
                "chain spec fetch failed with status {status}"
            ))
            .into());
        }
        return response
            .text()
            .await
            .map_err(|e| TransportError::LightClient(e.to_string()).into());
    }

    Err(TransportError::LightClient(format!(
        "max retries ({MAX_FETCH_RETRIES}) exceeded fetching {url}"
    ))
    .into())
}

#[async_trait]
impl RpcTransport for LightClientTransport {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.session.send(method, params).await
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sender: UnboundedSender<SubscriptionMessage>,
    ) -> Result<SubscriptionId> {
        self.session.subscribe(request, sender).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.session.unsubscribe(id).await
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn close(&self) {
        self.persist_task.abort();
        if let Some(store) = &self.snapshots {
            persist_database(store, &self.chain_id, self.session.as_ref()).await;
        }
        self.session.close().await;
    }
}
