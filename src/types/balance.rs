//! Balance records and the derived-amount algebra.
//!
//! A [`BalanceRecord`] is what a balance module reports for one
//! (source, address, ledger, token) identity. The raw fields keep whatever
//! shape the module delivered; the derived accessors compute the quantities
//! consumers actually display:
//!
//! - `total = free + reserved + extra(include_in_total)`
//! - `locked = max(locks)`: locks overlay the same funds, they do not stack
//! - `transferable = max(free − max(locks not marked include_in_transferable), 0)`
//! - `fee_payable = max(free − max(locks marked exclude_from_fee_payable), 0)`
//!
//! Records are immutable once constructed; every derived quantity is computed
//! lazily and memoized for the lifetime of the instance.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::amount::{format_units, to_float, AmountField};
use super::chain::TokenConfig;
use super::ids::{AccountAddress, LedgerId, ModuleId, TokenId};

/// Cache trust state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BalanceStatus {
    /// Fresh data from an open subscription, tagged with the generation that
    /// was current when the subscription was opened.
    Live(u64),
    /// Loaded from the persistent cache; not yet confirmed by a live source.
    Cache,
    /// The owning endpoint degraded mid-subscription. The value is kept
    /// visible but must not be trusted.
    Stale,
}

impl BalanceStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, BalanceStatus::Live(_))
    }
}

/// Lazily computed derived amounts. Skipped by serde and ignored by
/// equality; cloning carries the computed values along since they are pure
/// functions of the raw fields.
#[derive(Debug, Clone, Default)]
struct Memo {
    free: OnceLock<u128>,
    total: OnceLock<u128>,
    locked: OnceLock<u128>,
    transferable: OnceLock<u128>,
    fee_payable: OnceLock<u128>,
}

/// One balance identity as reported by a source module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRecord {
    /// Module that produced this record.
    pub source: ModuleId,
    pub status: BalanceStatus,
    pub address: AccountAddress,
    pub ledger: LedgerId,
    pub token_id: TokenId,
    #[serde(default)]
    pub free: AmountField,
    #[serde(default)]
    pub reserves: AmountField,
    #[serde(default)]
    pub locks: AmountField,
    #[serde(default)]
    pub extra: AmountField,
    #[serde(skip)]
    memo: Memo,
}

impl PartialEq for BalanceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.status == other.status
            && self.address == other.address
            && self.ledger == other.ledger
            && self.token_id == other.token_id
            && self.free == other.free
            && self.reserves == other.reserves
            && self.locks == other.locks
            && self.extra == other.extra
    }
}

impl Eq for BalanceRecord {}

impl BalanceRecord {
    pub fn new(
        source: impl Into<ModuleId>,
        ledger: impl Into<LedgerId>,
        token_id: impl Into<TokenId>,
        address: impl Into<AccountAddress>,
    ) -> Self {
        Self {
            source: source.into(),
            status: BalanceStatus::Cache,
            address: address.into(),
            ledger: ledger.into(),
            token_id: token_id.into(),
            free: AmountField::default(),
            reserves: AmountField::default(),
            locks: AmountField::default(),
            extra: AmountField::default(),
            memo: Memo::default(),
        }
    }

    /// Identity key, invariant for the lifetime of the record. Used for cache
    /// upsert and delete.
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.source, self.address, self.ledger, self.token_id
        )
    }

    /// Copy of this record with a different status. The derived amounts are
    /// unaffected, so the memo carries over.
    pub fn with_status(&self, status: BalanceStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next
    }

    pub fn free_planck(&self) -> u128 {
        *self.memo.free.get_or_init(|| self.free.sum())
    }

    pub fn reserved_planck(&self) -> u128 {
        self.reserves.sum()
    }

    /// Largest binding lock. Locks cover the same funds, so the maximum (not
    /// the sum) is what matters.
    pub fn locked_planck(&self) -> u128 {
        *self.memo.locked.get_or_init(|| self.locks.max())
    }

    pub fn total_planck(&self) -> u128 {
        *self.memo.total.get_or_init(|| {
            self.free_planck()
                + self.reserved_planck()
                + self.extra.sum_where(|e| e.include_in_total)
        })
    }

    pub fn transferable_planck(&self) -> u128 {
        *self.memo.transferable.get_or_init(|| {
            if self.locks.is_empty() {
                return self.free_planck();
            }
            let binding = self.locks.max_where(|e| !e.include_in_transferable);
            self.free_planck().saturating_sub(binding)
        })
    }

    pub fn fee_payable_planck(&self) -> u128 {
        *self.memo.fee_payable.get_or_init(|| {
            if self.locks.is_empty() {
                return self.free_planck();
            }
            let binding = self.locks.max_where(|e| e.exclude_from_fee_payable);
            self.free_planck().saturating_sub(binding)
        })
    }

    /// All derived amounts paired with the token's decimals and rates, for
    /// token-string and fiat formatting.
    pub fn amounts(&self, token: &TokenConfig) -> BalanceAmounts {
        let make = |planck: u128| TokenAmount {
            planck,
            decimals: token.decimals,
            rates: token.rates.clone(),
        };
        BalanceAmounts {
            total: make(self.total_planck()),
            free: make(self.free_planck()),
            reserved: make(self.reserved_planck()),
            locked: make(self.locked_planck()),
            transferable: make(self.transferable_planck()),
            fee_payable: make(self.fee_payable_planck()),
        }
    }
}

/// A planck quantity plus the token context needed to format it.
#[derive(Debug, Clone)]
pub struct TokenAmount {
    pub planck: u128,
    pub decimals: u8,
    rates: HashMap<String, f64>,
}

impl TokenAmount {
    /// Whole-token decimal string, trailing zeroes trimmed.
    pub fn tokens(&self) -> String {
        format_units(self.planck, self.decimals)
    }

    /// Fiat value in the given currency, if a rate is known.
    pub fn fiat(&self, currency: &str) -> Option<f64> {
        self.rates
            .get(currency)
            .map(|rate| to_float(self.planck, self.decimals) * rate)
    }
}

/// The six displayable quantities of one record.
#[derive(Debug, Clone)]
pub struct BalanceAmounts {
    pub total: TokenAmount,
    pub free: TokenAmount,
    pub reserved: TokenAmount,
    pub locked: TokenAmount,
    pub transferable: TokenAmount,
    pub fee_payable: TokenAmount,
}
