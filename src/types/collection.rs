//! The keyed balance collection.
//!
//! `Balances` is an immutable-style set of [`BalanceRecord`]s keyed by record
//! identity: operations return new collections instead of mutating in place,
//! and `add` is last-write-wins on key collision.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::amount::to_float;
use super::balance::{BalanceRecord, BalanceStatus};
use super::chain::TokenConfig;
use super::ids::{AccountAddress, LedgerId, ModuleId, TokenId};

/// Tokens known to the engine, keyed by token id.
pub type TokenRegistry = std::collections::HashMap<TokenId, TokenConfig>;

/// A structural partial match: every populated field must equal the record's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceMatch {
    pub source: Option<ModuleId>,
    pub address: Option<AccountAddress>,
    pub ledger: Option<LedgerId>,
    pub token_id: Option<TokenId>,
    pub status: Option<BalanceStatus>,
}

impl BalanceMatch {
    pub fn source(mut self, source: impl Into<ModuleId>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn address(mut self, address: impl Into<AccountAddress>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn ledger(mut self, ledger: impl Into<LedgerId>) -> Self {
        self.ledger = Some(ledger.into());
        self
    }

    pub fn token_id(mut self, token_id: impl Into<TokenId>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    pub fn status(mut self, status: BalanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, record: &BalanceRecord) -> bool {
        self.source.as_ref().is_none_or(|v| *v == record.source)
            && self.address.as_ref().is_none_or(|v| *v == record.address)
            && self.ledger.as_ref().is_none_or(|v| *v == record.ledger)
            && self.token_id.as_ref().is_none_or(|v| *v == record.token_id)
            && self.status.as_ref().is_none_or(|v| *v == record.status)
    }
}

/// One query term: either a structural partial match or an arbitrary
/// predicate.
#[derive(Clone)]
pub enum BalanceQuery {
    Match(BalanceMatch),
    Predicate(Arc<dyn Fn(&BalanceRecord) -> bool + Send + Sync>),
}

impl BalanceQuery {
    pub fn predicate(f: impl Fn(&BalanceRecord) -> bool + Send + Sync + 'static) -> Self {
        BalanceQuery::Predicate(Arc::new(f))
    }

    fn matches(&self, record: &BalanceRecord) -> bool {
        match self {
            BalanceQuery::Match(m) => m.matches(record),
            BalanceQuery::Predicate(f) => f(record),
        }
    }
}

impl From<BalanceMatch> for BalanceQuery {
    fn from(m: BalanceMatch) -> Self {
        BalanceQuery::Match(m)
    }
}

/// Keyed set of balance records. No duplicate identities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balances {
    records: BTreeMap<String, BalanceRecord>,
}

impl Balances {
    pub fn new(records: impl IntoIterator<Item = BalanceRecord>) -> Self {
        let mut map = BTreeMap::new();
        for record in records {
            map.insert(record.id(), record);
        }
        Self { records: map }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&BalanceRecord> {
        self.records.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BalanceRecord> {
        self.records.values()
    }

    /// New collection containing records matching ANY of the query terms.
    pub fn find<Q>(&self, queries: impl IntoIterator<Item = Q>) -> Balances
    where
        Q: Into<BalanceQuery>,
    {
        let queries: Vec<BalanceQuery> = queries.into_iter().map(Into::into).collect();
        Balances {
            records: self
                .records
                .iter()
                .filter(|(_, record)| queries.iter().any(|q| q.matches(record)))
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        }
    }

    /// New collection merging `other` over `self`; `other` wins on key
    /// collision.
    pub fn add(&self, other: impl Into<Balances>) -> Balances {
        let mut records = self.records.clone();
        for (id, record) in other.into().records {
            records.insert(id, record);
        }
        Balances { records }
    }

    /// New collection without the given identities.
    pub fn remove<S: AsRef<str>>(&self, ids: impl IntoIterator<Item = S>) -> Balances {
        let mut records = self.records.clone();
        for id in ids {
            records.remove(id.as_ref());
        }
        Balances { records }
    }

    /// Records sorted by the owning ledger's display rank. Records whose
    /// ledger has no rank sort last; ties keep identity order.
    pub fn sorted(&self, rank_of: impl Fn(&LedgerId) -> Option<u32>) -> Vec<BalanceRecord> {
        let mut records: Vec<BalanceRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|record| {
            let rank = rank_of(&record.ledger);
            (rank.is_none(), rank)
        });
        records
    }

    /// Aggregate view over the collection for fiat totals.
    pub fn sum<'a>(&'a self, tokens: &'a TokenRegistry) -> BalanceSum<'a> {
        BalanceSum {
            balances: self,
            tokens,
        }
    }
}

impl From<BalanceRecord> for Balances {
    fn from(record: BalanceRecord) -> Self {
        Balances::new([record])
    }
}

impl FromIterator<BalanceRecord> for Balances {
    fn from_iter<I: IntoIterator<Item = BalanceRecord>>(iter: I) -> Self {
        Balances::new(iter)
    }
}

impl IntoIterator for Balances {
    type Item = BalanceRecord;
    type IntoIter = std::collections::btree_map::IntoValues<String, BalanceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

/// Per-field fiat totals across a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FiatTotals {
    pub total: f64,
    pub free: f64,
    pub reserved: f64,
    pub locked: f64,
    pub transferable: f64,
    pub fee_payable: f64,
}

/// Aggregation handle returned by [`Balances::sum`].
pub struct BalanceSum<'a> {
    balances: &'a Balances,
    tokens: &'a TokenRegistry,
}

impl BalanceSum<'_> {
    /// Convert every record through its token's exchange rate and sum.
    /// Records whose token lacks a rate (or a token entry at all) contribute
    /// zero rather than erroring.
    pub fn fiat(&self, currency: &str) -> FiatTotals {
        let mut totals = FiatTotals::default();
        for record in self.balances.iter() {
            let Some(token) = self.tokens.get(&record.token_id) else {
                continue;
            };
            let Some(rate) = token.rates.get(currency).copied() else {
                continue;
            };
            let fiat = |planck: u128| to_float(planck, token.decimals) * rate;
            totals.total += fiat(record.total_planck());
            totals.free += fiat(record.free_planck());
            totals.reserved += fiat(record.reserved_planck());
            totals.locked += fiat(record.locked_planck());
            totals.transferable += fiat(record.transferable_planck());
            totals.fee_payable += fiat(record.fee_payable_planck());
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::amount::AmountField;
    use crate::types::ids::ChainId;

    fn record(token: &str, address: &str, free: u128) -> BalanceRecord {
        let mut r = BalanceRecord::new(
            "substrate-native",
            LedgerId::Chain(ChainId::from("polkadot")),
            token,
            address,
        );
        r.free = AmountField::from(free);
        r
    }

    #[test]
    fn add_is_idempotent_for_same_identity() {
        let base = Balances::default();
        let x = record("dot", "alice", 10);
        let once = base.add(x.clone());
        let twice = once.add(x.clone());
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn add_prefers_argument_on_collision() {
        let old = record("dot", "alice", 10);
        let new = record("dot", "alice", 99);
        let merged = Balances::from(old).add(new);
        assert_eq!(merged.iter().next().unwrap().free_planck(), 99);
    }

    #[test]
    fn remove_excludes_identities() {
        let a = record("dot", "alice", 1);
        let b = record("dot", "bob", 2);
        let all = Balances::new([a.clone(), b.clone()]);
        let left = all.remove([a.id()]);
        assert_eq!(left.len(), 1);
        assert!(left.get(&b.id()).is_some());
    }

    #[test]
    fn find_terms_are_or_combined() {
        let a = record("dot", "alice", 1);
        let b = record("ksm", "bob", 2);
        let c = record("dot", "carol", 3);
        let all = Balances::new([a, b, c]);

        let found = all.find([
            BalanceMatch::default().address("alice"),
            BalanceMatch::default().token_id("ksm"),
        ]);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn find_accepts_arbitrary_predicates() {
        let all = Balances::new([record("dot", "alice", 1), record("dot", "bob", 200)]);
        let rich = all.find([BalanceQuery::predicate(|r| r.free_planck() > 100)]);
        assert_eq!(rich.len(), 1);
        assert_eq!(rich.iter().next().unwrap().address.as_str(), "bob");
    }

    #[test]
    fn sorted_puts_rankless_ledgers_last() {
        let mut a = record("dot", "alice", 1);
        a.ledger = LedgerId::Chain(ChainId::from("polkadot"));
        let mut b = record("ksm", "alice", 1);
        b.ledger = LedgerId::Chain(ChainId::from("kusama"));
        let mut c = record("unk", "alice", 1);
        c.ledger = LedgerId::Chain(ChainId::from("unranked"));

        let all = Balances::new([c, b, a]);
        let sorted = all.sorted(|ledger| match ledger.as_str() {
            "polkadot" => Some(0),
            "kusama" => Some(1),
            _ => None,
        });
        let ids: Vec<&str> = sorted.iter().map(|r| r.ledger.as_str()).collect();
        assert_eq!(ids, ["polkadot", "kusama", "unranked"]);
    }

    #[test]
    fn fiat_sum_skips_missing_rates() {
        let dot = record("dot", "alice", 20_000_000_000); // 2 DOT at 10 decimals
        let unknown = record("mystery", "alice", 1_000_000);

        let mut tokens = TokenRegistry::new();
        tokens.insert(
            TokenId::from("dot"),
            TokenConfig {
                id: TokenId::from("dot"),
                module: ModuleId::from("substrate-native"),
                ledger: LedgerId::Chain(ChainId::from("polkadot")),
                symbol: "DOT".into(),
                decimals: 10,
                enabled: true,
                rates: [("usd".to_string(), 4.5)].into_iter().collect(),
            },
        );

        let all = Balances::new([dot, unknown]);
        let totals = all.sum(&tokens).fiat("usd");
        assert!((totals.free - 9.0).abs() < 1e-9);
        assert!((totals.transferable - 9.0).abs() < 1e-9);
        // No rate for "eur": everything contributes zero.
        assert_eq!(all.sum(&tokens).fiat("eur"), FiatTotals::default());
    }
}
