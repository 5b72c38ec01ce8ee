//! Configuration inputs.
//!
//! The engine consumes five read-only streams: enabled chains, enabled EVM
//! networks, enabled tokens, the account list, and global settings. Each is a
//! `tokio::sync::watch` channel; the embedder holds the [`ConfigFeed`] and the
//! engine holds a [`ConfigWatch`]. Publishing a value that compares equal to
//! the current one still wakes the orchestrator, which then short-circuits on
//! structural equality.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{AccountConfig, ChainConfig, NetworkConfig, TokenConfig};

/// Global user settings consumed by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Watch testnet chains and networks too.
    pub enable_testnets: bool,
    /// Prefer the embedded light client where a chain is configured for it.
    pub use_light_clients: bool,
}

/// Producer side, held by the embedder.
#[derive(Debug, Clone)]
pub struct ConfigFeed {
    chains: watch::Sender<Arc<Vec<ChainConfig>>>,
    networks: watch::Sender<Arc<Vec<NetworkConfig>>>,
    tokens: watch::Sender<Arc<Vec<TokenConfig>>>,
    accounts: watch::Sender<Arc<Vec<AccountConfig>>>,
    settings: watch::Sender<Settings>,
}

impl ConfigFeed {
    pub fn set_chains(&self, chains: Vec<ChainConfig>) {
        self.chains.send_replace(Arc::new(chains));
    }

    pub fn set_networks(&self, networks: Vec<NetworkConfig>) {
        self.networks.send_replace(Arc::new(networks));
    }

    pub fn set_tokens(&self, tokens: Vec<TokenConfig>) {
        self.tokens.send_replace(Arc::new(tokens));
    }

    pub fn set_accounts(&self, accounts: Vec<AccountConfig>) {
        self.accounts.send_replace(Arc::new(accounts));
    }

    pub fn set_settings(&self, settings: Settings) {
        self.settings.send_replace(settings);
    }
}

/// Consumer side, held by the orchestrator.
#[derive(Debug, Clone)]
pub struct ConfigWatch {
    pub(crate) chains: watch::Receiver<Arc<Vec<ChainConfig>>>,
    pub(crate) networks: watch::Receiver<Arc<Vec<NetworkConfig>>>,
    pub(crate) tokens: watch::Receiver<Arc<Vec<TokenConfig>>>,
    pub(crate) accounts: watch::Receiver<Arc<Vec<AccountConfig>>>,
    pub(crate) settings: watch::Receiver<Settings>,
}

impl ConfigWatch {
    /// Coherent point-in-time copy of every input.
    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            chains: self.chains.borrow().clone(),
            networks: self.networks.borrow().clone(),
            tokens: self.tokens.borrow().clone(),
            accounts: self.accounts.borrow().clone(),
            settings: *self.settings.borrow(),
        }
    }

    /// Wait until any input changes. Returns which stream fired; the account
    /// stream is distinguished because removals from it are reaped on a
    /// debounce rather than immediately.
    pub(crate) async fn changed(&mut self) -> ConfigChange {
        tokio::select! {
            res = self.chains.changed() => {
                if res.is_err() {
                    return ConfigChange::Shutdown;
                }
                ConfigChange::Chains
            }
            res = self.networks.changed() => {
                if res.is_err() {
                    return ConfigChange::Shutdown;
                }
                ConfigChange::Networks
            }
            res = self.tokens.changed() => {
                if res.is_err() {
                    return ConfigChange::Shutdown;
                }
                ConfigChange::Tokens
            }
            res = self.accounts.changed() => {
                if res.is_err() {
                    return ConfigChange::Shutdown;
                }
                ConfigChange::Accounts
            }
            res = self.settings.changed() => {
                if res.is_err() {
                    return ConfigChange::Shutdown;
                }
                ConfigChange::Settings
            }
        }
    }
}

/// Which configuration stream triggered a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigChange {
    Chains,
    Networks,
    Tokens,
    Accounts,
    Settings,
    /// Every feed handle dropped; the engine should wind down.
    Shutdown,
}

/// A coherent copy of all configuration inputs.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub chains: Arc<Vec<ChainConfig>>,
    pub networks: Arc<Vec<NetworkConfig>>,
    pub tokens: Arc<Vec<TokenConfig>>,
    pub accounts: Arc<Vec<AccountConfig>>,
    pub settings: Settings,
}

/// Create the paired configuration handles. Everything starts empty and
/// disabled; the embedder feeds real values after construction.
pub fn config_channel() -> (ConfigFeed, ConfigWatch) {
    let (chains_tx, chains_rx) = watch::channel(Arc::new(Vec::new()));
    let (networks_tx, networks_rx) = watch::channel(Arc::new(Vec::new()));
    let (tokens_tx, tokens_rx) = watch::channel(Arc::new(Vec::new()));
    let (accounts_tx, accounts_rx) = watch::channel(Arc::new(Vec::new()));
    let (settings_tx, settings_rx) = watch::channel(Settings::default());
    (
        ConfigFeed {
            chains: chains_tx,
            networks: networks_tx,
            tokens: tokens_tx,
            accounts: accounts_tx,
            settings: settings_tx,
        },
        ConfigWatch {
            chains: chains_rx,
            networks: networks_rx,
            tokens: tokens_rx,
            accounts: accounts_rx,
            settings: settings_rx,
        },
    )
}
