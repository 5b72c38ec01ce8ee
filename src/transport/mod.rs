//! Chain transports and the per-chain connection multiplexer.
//!
//! A transport speaks JSON-RPC to one chain: request/response via [`RpcTransport::send`]
//! and pubsub via [`RpcTransport::subscribe`]. Two implementations exist: a
//! websocket client against a remote node ([`ws_rpc::WsRpcClient`]) and an
//! embedded light client reached through the [`light_client::LightClientProvider`]
//! seam. The [`pool::ConnectionPool`] shares one live transport per chain among
//! any number of holders.

pub mod light_client;
pub mod pool;
pub mod ws_rpc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::prelude::*;

pub use light_client::{LightClientProvider, LightClientSession};
pub use pool::{CallerId, ConnectionPool};
pub use ws_rpc::{WsRpcClient, WsRpcConfig, WsRpcStats};

/// Logical subscription id, stable across transport reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u32);

/// Everything needed to establish (and re-establish) one pubsub subscription.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subscribe_method: String,
    pub unsubscribe_method: String,
    pub notification_method: String,
    pub params: Value,
}

/// Messages delivered to a subscription holder.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// A pubsub notification payload.
    Notification(Value),
    /// The underlying socket dropped. The transport reconnects and
    /// resubscribes on its own; holders stay subscribed.
    Disconnected,
}

/// A JSON-RPC capable connection to one chain.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// One request/response round trip.
    async fn send(&self, method: &str, params: Value) -> Result<Value>;

    /// Open a pubsub subscription. Notifications flow to `sender` until
    /// [`RpcTransport::unsubscribe`] is called with the returned id.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sender: UnboundedSender<SubscriptionMessage>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}
