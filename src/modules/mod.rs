//! The balance module interface.
//!
//! One module exists per token family (substrate native, assets pallet,
//! ERC-20, ...). Modules own the wire protocol: given addresses grouped by
//! token, they encode storage queries through the connection pool and decode
//! the results into [`Balances`]. The engine never inspects chain metadata;
//! it hands the opaque blob to the module and consumes normalized records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::prelude::*;
use crate::transport::ConnectionPool;
use crate::types::{
    AccountAddress, Balances, ChainDescriptor, ChainId, ModuleId, NetworkDescriptor, NetworkId,
    TokenId, TokenRegistry,
};

/// Watch targets grouped the way modules consume them.
pub type AddressesByToken = HashMap<TokenId, Vec<AccountAddress>>;

/// Invoked to tear one module subscription down. Deferred invocation is the
/// caller's business; modules must tolerate it firing well after the fact.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// How a module subscription failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleErrorKind {
    /// The endpoint degraded mid-subscription (stale responses, pruned
    /// state). Matching cached records get flagged stale.
    StaleRpc,
    /// The connection was exhausted or dropped beyond recovery for this
    /// subscription. Treated like `StaleRpc` for cache purposes.
    Disconnected,
    /// Anything else: logged and dropped, the subscription may recover.
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ModuleError {
    pub kind: ModuleErrorKind,
    pub message: String,
    /// The exact token/address subset the failing call was responsible for,
    /// when narrower than the whole subscription (e.g. one chain of many).
    pub affected: Option<AddressesByToken>,
}

impl ModuleError {
    pub fn new(kind: ModuleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            affected: None,
        }
    }

    pub fn with_affected(mut self, affected: AddressesByToken) -> Self {
        self.affected = Some(affected);
        self
    }

    /// Whether cached records for the failing call should be flagged stale.
    pub fn marks_stale(&self) -> bool {
        matches!(
            self.kind,
            ModuleErrorKind::StaleRpc | ModuleErrorKind::Disconnected
        )
    }
}

/// One delivery from a module subscription: a batch of normalized records or
/// an error.
#[derive(Debug, Clone)]
pub enum ModuleUpdate {
    Balances(Balances),
    Error(ModuleError),
}

/// Everything a module needs to do its job: the shared connection pool and
/// the current descriptor projections.
#[derive(Clone)]
pub struct ModuleContext {
    pub pool: Arc<ConnectionPool>,
    pub tokens: Arc<TokenRegistry>,
    pub chains: Arc<HashMap<ChainId, ChainDescriptor>>,
    pub networks: Arc<HashMap<NetworkId, NetworkDescriptor>>,
    /// Opaque metadata blobs keyed by chain, handed through untouched.
    pub metadata: Arc<HashMap<ChainId, serde_json::Value>>,
}

/// A pluggable balance source for one token family.
#[async_trait]
pub trait BalanceModule: Send + Sync {
    fn id(&self) -> ModuleId;

    /// One-shot fetch, bypassing any subscription machinery.
    async fn fetch_balances(
        &self,
        ctx: &ModuleContext,
        addresses_by_token: &AddressesByToken,
    ) -> Result<Balances>;

    /// Open a streaming subscription. Updates flow to `sender` until the
    /// returned closure is invoked. Connections are acquired through
    /// `ctx.pool` and must be released when the closure fires.
    async fn subscribe_balances(
        &self,
        ctx: &ModuleContext,
        addresses_by_token: &AddressesByToken,
        sender: UnboundedSender<ModuleUpdate>,
    ) -> Result<Unsubscribe>;
}

/// The modules known to the engine, keyed by module id.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleId, Arc<dyn BalanceModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn BalanceModule>) {
        self.modules.insert(module.id(), module);
    }

    pub fn get(&self, id: &ModuleId) -> Option<&Arc<dyn BalanceModule>> {
        self.modules.get(id)
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ModuleId> {
        self.modules.keys()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
