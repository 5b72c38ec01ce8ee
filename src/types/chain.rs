//! Chain, network, token, and account configuration types.
//!
//! The full `*Config` types are what upstream configuration feeds deliver.
//! The orchestrator keeps only the `*Descriptor` projections in working
//! memory: enough to open connections and diff watch-sets without holding (or
//! structurally comparing) whole chain objects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{AccountAddress, ChainId, LedgerId, ModuleId, NetworkId, TokenId};

/// Light-client bootstrap configuration for a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightClientConfig {
    /// Inline chain specification, if the embedder ships one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_spec: Option<String>,
    /// URL to fetch the chain specification from when not inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_spec_url: Option<String>,
    /// Relay chain this parachain syncs through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<ChainId>,
}

/// Full upstream chain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,
    /// SS58 address format prefix. Opaque to the engine.
    #[serde(default)]
    pub account_format: u16,
    /// RPC endpoints, ranked best-first.
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub is_testnet: bool,
    /// Display rank for sorted balance views. Rankless chains sort last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_client: Option<LightClientConfig>,
    /// Fingerprint of the metadata blob, compared structurally for change
    /// detection. The blob itself is never inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_fingerprint: Option<String>,
    /// Opaque metadata blob handed to balance modules untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Full upstream EVM network object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub id: NetworkId,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub is_testnet: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

/// A token definition: which module family handles it and where it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub id: TokenId,
    pub module: ModuleId,
    pub ledger: LedgerId,
    pub symbol: String,
    pub decimals: u8,
    pub enabled: bool,
    /// Exchange rates keyed by currency code ("usd", "eur", ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rates: HashMap<String, f64>,
}

/// An account to track balances for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub address: AccountAddress,
    /// Hardware and locked accounts are restricted to the chain whose genesis
    /// hash matches; unrestricted accounts are watched everywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,
}

/// Minimal chain projection held by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDescriptor {
    pub id: ChainId,
    pub genesis_hash: Option<String>,
    pub account_format: u16,
    pub endpoints: Vec<String>,
    pub rank: Option<u32>,
    pub light_client: Option<LightClientConfig>,
}

impl From<&ChainConfig> for ChainDescriptor {
    fn from(cfg: &ChainConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            genesis_hash: cfg.genesis_hash.clone(),
            account_format: cfg.account_format,
            endpoints: cfg.endpoints.clone(),
            rank: cfg.rank,
            light_client: cfg.light_client.clone(),
        }
    }
}

/// Minimal network projection held by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDescriptor {
    pub id: NetworkId,
    pub endpoints: Vec<String>,
    pub rank: Option<u32>,
}

impl From<&NetworkConfig> for NetworkDescriptor {
    fn from(cfg: &NetworkConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            endpoints: cfg.endpoints.clone(),
            rank: cfg.rank,
        }
    }
}
