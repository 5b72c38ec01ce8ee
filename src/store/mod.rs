//! The persistent balance cache.
//!
//! A single logical keyed table of [`BalanceRecord`]s. Module subscriptions
//! upsert into it, reaping passes delete from it, and consumers outside the
//! engine read it through point gets or the live-query stream, never through
//! the network layer. Concurrent upserts are commutative (keyed upsert, no
//! read-modify-write); generation checks upstream keep stale writers out.

pub mod snapshot;

pub use snapshot::SnapshotStore;

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::types::{BalanceRecord, BalanceStatus, Balances};

const CACHE_SNAPSHOT: &str = "balances";

/// Capacity of the live-query channel. Consumers that fall behind drop
/// intermediate snapshots and resume at the latest one.
const LIVE_QUERY_BUFFER: usize = 16;

pub struct BalanceCache {
    records: RwLock<Balances>,
    live_tx: broadcast::Sender<Balances>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_QUERY_BUFFER);
        Self {
            records: RwLock::new(Balances::default()),
            live_tx,
            snapshots: None,
        }
    }

    /// Cache backed by a snapshot store: loads the persisted table now and
    /// saves through [`BalanceCache::persist`].
    pub fn with_persistence(snapshots: Arc<SnapshotStore>) -> Self {
        let loaded: Balances = match snapshots.load::<Balances>(CACHE_SNAPSHOT) {
            Ok(Some(balances)) => {
                debug!(records = balances.len(), "balance cache restored");
                // Live status never survives a restart.
                balances
                    .iter()
                    .map(|record| record.with_status(BalanceStatus::Cache))
                    .collect()
            }
            Ok(None) => Balances::default(),
            Err(err) => {
                warn!(%err, "could not restore balance cache");
                Balances::default()
            }
        };
        let (live_tx, _) = broadcast::channel(LIVE_QUERY_BUFFER);
        Self {
            records: RwLock::new(loaded),
            live_tx,
            snapshots: Some(snapshots),
        }
    }

    pub async fn get(&self, id: &str) -> Option<BalanceRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Balances {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Keyed upsert: incoming records replace cached records with the same
    /// identity and insert otherwise.
    pub async fn upsert(&self, incoming: Balances) {
        if incoming.is_empty() {
            return;
        }
        let next = {
            let mut records = self.records.write().await;
            *records = records.add(incoming);
            records.clone()
        };
        let _ = self.live_tx.send(next);
    }

    pub async fn delete_ids<S: AsRef<str>>(&self, ids: impl IntoIterator<Item = S>) {
        let next = {
            let mut records = self.records.write().await;
            *records = records.remove(ids);
            records.clone()
        };
        let _ = self.live_tx.send(next);
    }

    /// Delete every record matching the predicate. Returns how many went.
    pub async fn delete_where(&self, pred: impl Fn(&BalanceRecord) -> bool) -> usize {
        let (removed, next) = {
            let mut records = self.records.write().await;
            let doomed: Vec<String> = records
                .iter()
                .filter(|r| pred(r))
                .map(|r| r.id())
                .collect();
            let removed = doomed.len();
            if removed > 0 {
                *records = records.remove(doomed);
            }
            (removed, records.clone())
        };
        if removed > 0 {
            let _ = self.live_tx.send(next);
        }
        removed
    }

    /// Flag matching records as stale without deleting them; stale balances
    /// stay visible but untrustworthy. Returns how many were flagged.
    pub async fn mark_stale_where(&self, pred: impl Fn(&BalanceRecord) -> bool) -> usize {
        let (flagged, next) = {
            let mut records = self.records.write().await;
            let stale: Balances = records
                .iter()
                .filter(|r| r.status != BalanceStatus::Stale && pred(r))
                .map(|r| r.with_status(BalanceStatus::Stale))
                .collect();
            let flagged = stale.len();
            if flagged > 0 {
                *records = records.add(stale);
            }
            (flagged, records.clone())
        };
        if flagged > 0 {
            let _ = self.live_tx.send(next);
        }
        flagged
    }

    /// Live query: a stream of full table snapshots, one per mutation.
    pub fn live(&self) -> broadcast::Receiver<Balances> {
        self.live_tx.subscribe()
    }

    /// Persist the table. Live records are demoted to cache status on disk:
    /// liveness does not survive a restart.
    pub async fn persist(&self) -> crate::prelude::Result<()> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(());
        };
        let demoted: Balances = {
            let records = self.records.read().await;
            records
                .iter()
                .map(|record| {
                    if record.status.is_live() {
                        record.with_status(BalanceStatus::Cache)
                    } else {
                        record.clone()
                    }
                })
                .collect()
        };
        snapshots
            .save(CACHE_SNAPSHOT, &demoted)
            .map_err(|e| crate::Error::Snapshot(e.to_string()))
    }
}

impl Default for BalanceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AmountField, ChainId, LedgerId};

    fn record(address: &str, free: u128) -> BalanceRecord {
        let mut r = BalanceRecord::new(
            "substrate-native",
            LedgerId::Chain(ChainId::from("polkadot")),
            "dot",
            address,
        );
        r.free = AmountField::from(free);
        r.status = BalanceStatus::Live(1);
        r
    }

    #[tokio::test]
    async fn upsert_replaces_by_identity() {
        let cache = BalanceCache::new();
        cache.upsert(Balances::from(record("alice", 10))).await;
        cache.upsert(Balances::from(record("alice", 20))).await;
        assert_eq!(cache.len().await, 1);
        let stored = cache.get(&record("alice", 0).id()).await.unwrap();
        assert_eq!(stored.free_planck(), 20);
    }

    #[tokio::test]
    async fn delete_where_removes_matches_only() {
        let cache = BalanceCache::new();
        cache
            .upsert(Balances::new([record("alice", 1), record("bob", 2)]))
            .await;
        let removed = cache.delete_where(|r| r.address.as_str() == "bob").await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn mark_stale_flags_without_deleting() {
        let cache = BalanceCache::new();
        cache
            .upsert(Balances::new([record("alice", 1), record("bob", 2)]))
            .await;
        let flagged = cache
            .mark_stale_where(|r| r.address.as_str() == "alice")
            .await;
        assert_eq!(flagged, 1);
        let alice = cache.get(&record("alice", 0).id()).await.unwrap();
        assert_eq!(alice.status, BalanceStatus::Stale);
        assert_eq!(alice.free_planck(), 1);
        let bob = cache.get(&record("bob", 0).id()).await.unwrap();
        assert_eq!(bob.status, BalanceStatus::Live(1));
    }

    #[tokio::test]
    async fn live_query_sees_mutations() {
        let cache = BalanceCache::new();
        let mut live = cache.live();
        cache.upsert(Balances::from(record("alice", 10))).await;
        let snapshot = live.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn persistence_round_trip_demotes_live_records() {
        let dir = std::env::temp_dir().join(format!("balance-sync-cache-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(SnapshotStore::new(dir).unwrap());

        let cache = BalanceCache::with_persistence(Arc::clone(&store));
        cache.upsert(Balances::from(record("alice", 10))).await;
        cache.persist().await.unwrap();

        let reloaded = BalanceCache::with_persistence(store);
        let alice = reloaded.get(&record("alice", 0).id()).await.unwrap();
        assert_eq!(alice.status, BalanceStatus::Cache);
        assert_eq!(alice.free_planck(), 10);
    }
}
