//! Data model: identifiers, configuration objects, raw amounts, balance
//! records, and the keyed balance collection.

pub mod amount;
pub mod balance;
pub mod chain;
pub mod collection;
pub mod ids;

pub use amount::{format_units, to_float, AmountField, LabelledAmount};
pub use balance::{BalanceAmounts, BalanceRecord, BalanceStatus, TokenAmount};
pub use chain::{
    AccountConfig, ChainConfig, ChainDescriptor, LightClientConfig, NetworkConfig,
    NetworkDescriptor, TokenConfig,
};
pub use collection::{BalanceMatch, BalanceQuery, BalanceSum, Balances, FiatTotals, TokenRegistry};
pub use ids::{AccountAddress, ChainId, LedgerId, ModuleId, NetworkId, TokenId};
