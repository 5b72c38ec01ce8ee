//! Watch-set computation.
//!
//! Combines the account list, enabled chains and networks (testnet policy
//! applied), enabled tokens, and connectivity into the set of
//! (ledger, token, address) triples requiring live updates, plus the minimal
//! descriptor projections the orchestrator keeps in working memory.
//! Recomputation is cheap and pure; reconciliation short-circuits on
//! structural equality with the previously computed set.

use std::collections::HashMap;

use crate::config::ConfigSnapshot;
use crate::modules::AddressesByToken;
use crate::types::{
    AccountAddress, ChainDescriptor, ChainId, LedgerId, ModuleId, NetworkDescriptor, TokenConfig,
    TokenId,
};

/// One triple requiring live updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub ledger: LedgerId,
    pub token_id: TokenId,
    pub address: AccountAddress,
    /// Present when the owning account is restricted to one chain's genesis
    /// hash; the target only exists because the restriction matched.
    pub genesis_restriction: Option<String>,
}

/// The computed watch-set plus the projections it was derived from.
///
/// `PartialEq` is structural over every list; an unchanged configuration
/// produces an equal value and therefore no subscription churn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchSet {
    pub chains: Vec<ChainDescriptor>,
    pub networks: Vec<NetworkDescriptor>,
    pub tokens: Vec<TokenConfig>,
    pub metadata_fingerprints: Vec<(ChainId, String)>,
    pub targets: Vec<WatchTarget>,
}

impl WatchSet {
    pub fn compute(snapshot: &ConfigSnapshot) -> WatchSet {
        let testnets = snapshot.settings.enable_testnets;

        let mut chains: Vec<ChainDescriptor> = snapshot
            .chains
            .iter()
            .filter(|c| c.enabled && (testnets || !c.is_testnet))
            .filter(|c| !c.endpoints.is_empty() || c.light_client.is_some())
            .map(ChainDescriptor::from)
            .collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));

        let mut networks: Vec<NetworkDescriptor> = snapshot
            .networks
            .iter()
            .filter(|n| n.enabled && (testnets || !n.is_testnet))
            .filter(|n| !n.endpoints.is_empty())
            .map(NetworkDescriptor::from)
            .collect();
        networks.sort_by(|a, b| a.id.cmp(&b.id));

        let chain_genesis: HashMap<&ChainId, Option<&String>> = chains
            .iter()
            .map(|c| (&c.id, c.genesis_hash.as_ref()))
            .collect();
        let network_ids: Vec<&crate::types::NetworkId> = networks.iter().map(|n| &n.id).collect();

        let mut tokens: Vec<TokenConfig> = snapshot
            .tokens
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| match &t.ledger {
                LedgerId::Chain(id) => chain_genesis.contains_key(id),
                LedgerId::Network(id) => network_ids.contains(&id),
            })
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.id.cmp(&b.id));

        let mut metadata_fingerprints: Vec<(ChainId, String)> = snapshot
            .chains
            .iter()
            .filter(|c| c.enabled && (testnets || !c.is_testnet))
            .filter_map(|c| {
                c.metadata_fingerprint
                    .as_ref()
                    .map(|f| (c.id.clone(), f.clone()))
            })
            .collect();
        metadata_fingerprints.sort();

        let mut targets = Vec::new();
        for token in &tokens {
            for account in snapshot.accounts.iter() {
                match &account.genesis_hash {
                    // Restricted accounts are only watched on the chain whose
                    // genesis hash matches; networks never match.
                    Some(restriction) => {
                        let LedgerId::Chain(chain_id) = &token.ledger else {
                            continue;
                        };
                        if chain_genesis.get(chain_id).copied().flatten() != Some(restriction) {
                            continue;
                        }
                        targets.push(WatchTarget {
                            ledger: token.ledger.clone(),
                            token_id: token.id.clone(),
                            address: account.address.clone(),
                            genesis_restriction: Some(restriction.clone()),
                        });
                    }
                    None => targets.push(WatchTarget {
                        ledger: token.ledger.clone(),
                        token_id: token.id.clone(),
                        address: account.address.clone(),
                        genesis_restriction: None,
                    }),
                }
            }
        }

        WatchSet {
            chains,
            networks,
            tokens,
            metadata_fingerprints,
            targets,
        }
    }

    /// The structural short-circuit over derived inputs: chains, networks,
    /// tokens, and metadata fingerprints all unchanged.
    pub fn same_inputs(&self, other: &WatchSet) -> bool {
        self.chains == other.chains
            && self.networks == other.networks
            && self.tokens == other.tokens
            && self.metadata_fingerprints == other.metadata_fingerprints
    }

    /// Targets grouped the way subscriptions are opened: by module, then by
    /// token. Modules with no targets get no entry.
    pub fn targets_by_module(&self) -> HashMap<ModuleId, AddressesByToken> {
        let module_of: HashMap<&TokenId, &ModuleId> =
            self.tokens.iter().map(|t| (&t.id, &t.module)).collect();

        let mut grouped: HashMap<ModuleId, AddressesByToken> = HashMap::new();
        for target in &self.targets {
            let Some(module) = module_of.get(&target.token_id) else {
                continue;
            };
            grouped
                .entry((*module).clone())
                .or_default()
                .entry(target.token_id.clone())
                .or_default()
                .push(target.address.clone());
        }
        grouped
    }

    /// Display rank of a ledger, for sorted balance views.
    pub fn rank_of(&self, ledger: &LedgerId) -> Option<u32> {
        match ledger {
            LedgerId::Chain(id) => self
                .chains
                .iter()
                .find(|c| &c.id == id)
                .and_then(|c| c.rank),
            LedgerId::Network(id) => self
                .networks
                .iter()
                .find(|n| &n.id == id)
                .and_then(|n| n.rank),
        }
    }
}
