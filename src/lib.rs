#![deny(unreachable_pub)]

// Core modules
mod engine;
mod errors;
mod prelude;

// Shared utilities
pub mod serde_utils;
pub mod types;

// Feature modules
pub mod config;
pub mod modules;
pub mod orchestrator;
pub mod store;
pub mod transport;

// Re-exports
pub use config::{config_channel, ConfigFeed, ConfigWatch, Settings};
pub use engine::{BalanceSync, BalanceSyncBuilder};
pub use errors::{Error, TransportError};
pub use modules::{
    AddressesByToken, BalanceModule, ModuleContext, ModuleError, ModuleErrorKind, ModuleRegistry,
    ModuleUpdate, Unsubscribe,
};
pub use orchestrator::{Orchestrator, SubscriptionState, WatchSet, WatchTarget};
pub use store::{BalanceCache, SnapshotStore};
pub use transport::{
    CallerId, ConnectionPool, LightClientProvider, LightClientSession, RpcTransport,
    SubscribeRequest, SubscriptionId, SubscriptionMessage, WsRpcClient, WsRpcConfig, WsRpcStats,
};
pub use types::*;
