//! JSON-RPC 2.0 over websocket against a remote chain node.
//!
//! One client owns one socket. A spawned reader task routes responses to
//! pending requests and pubsub notifications to subscription channels; when
//! the socket drops, the reader reconnects with exponential backoff and
//! jitter, rotating through the chain's ranked endpoint list, then
//! re-establishes every subscription. Logical subscription ids held by callers
//! never change across reconnects.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    spawn,
    sync::{mpsc::UnboundedSender, oneshot, Mutex},
    time,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{self, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

use crate::prelude::*;
use crate::transport::{SubscribeRequest, SubscriptionId, SubscriptionMessage};
use crate::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, protocol::Message>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// Connection health and reconnection tuning.
#[derive(Debug, Clone)]
pub struct WsRpcConfig {
    /// Interval for protocol-level ping frames (default: 30s)
    pub ping_interval: Duration,
    /// Timeout for a pong before the connection is considered dead (default: 90s)
    pub pong_timeout: Duration,
    /// Initial delay before the first reconnection attempt (default: 1s)
    pub initial_reconnect_delay: Duration,
    /// Maximum delay between reconnection attempts (default: 60s)
    pub max_reconnect_delay: Duration,
    /// Backoff multiplier for exponential delay (default: 2.0)
    pub backoff_multiplier: f64,
    /// Jitter factor to prevent thundering herd (default: 0.2 = ±20%)
    pub jitter_factor: f64,
    /// Maximum consecutive reconnection failures before giving up (0 = unlimited)
    pub max_consecutive_failures: u32,
    /// Timeout for one request/response round trip (default: 30s)
    pub request_timeout: Duration,
}

impl Default for WsRpcConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_consecutive_failures: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection statistics.
#[derive(Debug, Clone)]
pub struct WsRpcStats {
    pub reconnection_count: u64,
    pub consecutive_failures: u64,
    pub is_connected: bool,
}

/// Internal connection state tracking.
#[derive(Debug)]
struct ConnState {
    start_time: Instant,
    last_pong_nanos: AtomicU64,
    reconnection_count: AtomicU64,
    consecutive_failures: AtomicU64,
    is_reconnecting: AtomicBool,
    is_connected: AtomicBool,
}

impl ConnState {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_pong_nanos: AtomicU64::new(0),
            reconnection_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            is_reconnecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(true),
        }
    }

    fn record_pong(&self) {
        let nanos = self.start_time.elapsed().as_nanos() as u64;
        self.last_pong_nanos.store(nanos, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn time_since_last_pong(&self) -> Duration {
        let last = self.last_pong_nanos.load(Ordering::Relaxed);
        let now = self.start_time.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(last))
    }
}

struct SubEntry {
    request: SubscribeRequest,
    sender: UnboundedSender<SubscriptionMessage>,
    /// Server-side subscription key. Remapped on every (re)subscribe.
    server_key: Option<String>,
}

#[derive(Default)]
struct SubscriptionTable {
    entries: HashMap<u32, SubEntry>,
    /// (notification method, server key) -> logical id
    by_server: HashMap<(String, String), u32>,
}

impl SubscriptionTable {
    fn bind(&mut self, logical: u32, server_key: String) {
        if let Some(entry) = self.entries.get_mut(&logical) {
            if let Some(old) = entry.server_key.take() {
                self.by_server
                    .remove(&(entry.request.notification_method.clone(), old));
            }
            self.by_server.insert(
                (entry.request.notification_method.clone(), server_key.clone()),
                logical,
            );
            entry.server_key = Some(server_key);
        }
    }

    fn unbind(&mut self, logical: u32) -> Option<SubEntry> {
        let entry = self.entries.remove(&logical)?;
        if let Some(key) = &entry.server_key {
            self.by_server
                .remove(&(entry.request.notification_method.clone(), key.clone()));
        }
        Some(entry)
    }
}

/// What one incoming frame means. Pure classification, routing happens in the
/// reader task.
#[derive(Debug)]
enum Incoming {
    Response { id: u64, result: Result<Value> },
    Notification { method: String, server_key: String, payload: Value },
    Ignored,
}

fn classify_incoming(raw: &str) -> Result<Incoming> {
    if !raw.starts_with('{') {
        return Ok(Incoming::Ignored);
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| crate::Error::json_parse(e.to_string()))?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let result = match value.get("error") {
            Some(err) => Err(TransportError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
            }
            .into()),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response { id, result });
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        if let Some(params) = value.get("params") {
            if let Some(sub) = params.get("subscription") {
                return Ok(Incoming::Notification {
                    method: method.to_owned(),
                    server_key: server_key_of(sub),
                    payload: params.get("result").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }

    Ok(Incoming::Ignored)
}

/// Server subscription ids arrive as strings or numbers depending on the
/// node; normalize to one key shape.
fn server_key_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct WsRpcClient {
    stop_flag: Arc<AtomicBool>,
    writer: Arc<Mutex<Writer>>,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    pending: Arc<Mutex<PendingMap>>,
    next_request_id: Arc<AtomicU64>,
    next_logical_id: AtomicU32,
    conn_state: Arc<ConnState>,
    config: WsRpcConfig,
}

impl WsRpcClient {
    /// Connect to the first reachable endpoint, best-ranked first.
    pub async fn connect(endpoints: Vec<String>, config: WsRpcConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints.into());
        }

        let (socket, endpoint_index) = Self::connect_any(&endpoints, 0).await?;
        let (writer, mut reader) = socket.split();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let conn_state = Arc::new(ConnState::new());
        let writer = Arc::new(Mutex::new(writer));
        let subscriptions: Arc<Mutex<SubscriptionTable>> = Arc::default();
        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let next_request_id = Arc::new(AtomicU64::new(1));

        // Reader task with reconnection
        {
            let writer = Arc::clone(&writer);
            let stop_flag = Arc::clone(&stop_flag);
            let conn_state = Arc::clone(&conn_state);
            let subscriptions = Arc::clone(&subscriptions);
            let pending = Arc::clone(&pending);
            let next_request_id = Arc::clone(&next_request_id);
            let config = config.clone();
            let mut endpoint_index = endpoint_index;

            let reader_fut = async move {
                while !stop_flag.load(Ordering::Relaxed) {
                    if let Some(frame) = reader.next().await {
                        if let Ok(WsMessage::Pong(_)) = &frame {
                            conn_state.record_pong();
                        }
                        if let Err(err) =
                            route_frame(frame, &subscriptions, &pending).await
                        {
                            error!("Error processing frame from RPC reader: {err}");
                        }
                        continue;
                    }

                    // Socket closed by peer
                    conn_state.is_connected.store(false, Ordering::Relaxed);
                    warn!("RPC websocket disconnected");
                    notify_disconnect(&subscriptions).await;

                    conn_state.is_reconnecting.store(true, Ordering::Relaxed);
                    let mut attempt = 0u32;
                    loop {
                        if stop_flag.load(Ordering::Relaxed) {
                            return;
                        }
                        let delay = backoff_delay(
                            attempt,
                            config.initial_reconnect_delay,
                            config.max_reconnect_delay,
                            config.backoff_multiplier,
                            config.jitter_factor,
                        );
                        info!(
                            "RPC reconnecting attempt={} delay_ms={}",
                            attempt + 1,
                            delay.as_millis()
                        );
                        time::sleep(delay).await;

                        // Rotate to the next endpoint on every attempt
                        endpoint_index = (endpoint_index + 1) % endpoints.len();
                        match Self::connect_any(&endpoints, endpoint_index).await {
                            Ok((socket, index)) => {
                                endpoint_index = index;
                                let (new_writer, new_reader) = socket.split();
                                reader = new_reader;
                                *writer.lock().await = new_writer;

                                drain_pending(&pending).await;

                                conn_state.is_connected.store(true, Ordering::Relaxed);
                                conn_state.is_reconnecting.store(false, Ordering::Relaxed);
                                conn_state
                                    .reconnection_count
                                    .fetch_add(1, Ordering::Relaxed);
                                conn_state.consecutive_failures.store(0, Ordering::Relaxed);
                                conn_state.record_pong();

                                resubscribe_all(
                                    &writer,
                                    &subscriptions,
                                    &pending,
                                    &next_request_id,
                                    config.request_timeout,
                                );

                                info!(
                                    "RPC reconnect finished endpoint={}",
                                    endpoints[endpoint_index]
                                );
                                break;
                            }
                            Err(err) => {
                                let failures = conn_state
                                    .consecutive_failures
                                    .fetch_add(1, Ordering::Relaxed)
                                    + 1;
                                if config.max_consecutive_failures > 0
                                    && failures >= config.max_consecutive_failures as u64
                                {
                                    error!(
                                        "Max reconnection failures exceeded, giving up failures={failures}"
                                    );
                                    conn_state.is_reconnecting.store(false, Ordering::Relaxed);
                                    return;
                                }
                                error!(
                                    "Could not reconnect: {err} attempt={} failures={failures}",
                                    attempt + 1
                                );
                                attempt += 1;
                            }
                        }
                    }
                }
                debug!("RPC reader task stopped");
            };
            spawn(reader_fut);
        }

        // Ping task with pong timeout detection
        {
            let stop_flag = Arc::clone(&stop_flag);
            let writer = Arc::clone(&writer);
            let conn_state = Arc::clone(&conn_state);
            let ping_interval = config.ping_interval;
            let pong_timeout = config.pong_timeout;

            let ping_fut = async move {
                time::sleep(Duration::from_secs(1)).await;
                while !stop_flag.load(Ordering::Relaxed) {
                    if conn_state.is_reconnecting.load(Ordering::Relaxed) {
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }

                    if conn_state.time_since_last_pong() > pong_timeout {
                        warn!(
                            "Pong timeout, forcing reconnect time_since_pong_secs={:.1}",
                            conn_state.time_since_last_pong().as_secs_f64()
                        );
                        let mut writer = writer.lock().await;
                        if let Err(err) = writer.send(WsMessage::Close(None)).await {
                            debug!("Error sending close frame: {err}");
                        }
                        time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }

                    {
                        let mut writer = writer.lock().await;
                        if let Err(err) = writer.send(WsMessage::Ping(Vec::new())).await {
                            debug!("Error sending ping frame: {err}");
                        }
                    }
                    time::sleep(ping_interval).await;
                }
                debug!("RPC ping task stopped");
            };
            spawn(ping_fut);
        }

        conn_state.record_pong();

        Ok(Self {
            stop_flag,
            writer,
            subscriptions,
            pending,
            next_request_id,
            next_logical_id: AtomicU32::new(1),
            conn_state,
            config,
        })
    }

    async fn connect_any(endpoints: &[String], start: usize) -> Result<(Socket, usize)> {
        let mut last_err = None;
        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            match connect_async(endpoints[index].as_str()).await {
                Ok((socket, _)) => return Ok((socket, index)),
                Err(err) => {
                    warn!("Endpoint {} unreachable: {err}", endpoints[index]);
                    last_err = Some(err);
                }
            }
        }
        Err(TransportError::Connection(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        )
        .into())
    }

    pub fn stats(&self) -> WsRpcStats {
        WsRpcStats {
            reconnection_count: self.conn_state.reconnection_count.load(Ordering::Relaxed),
            consecutive_failures: self.conn_state.consecutive_failures.load(Ordering::Relaxed),
            is_connected: self.conn_state.is_connected.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl crate::transport::RpcTransport for WsRpcClient {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        rpc_request(
            &self.writer,
            &self.pending,
            &self.next_request_id,
            method,
            params,
            self.config.request_timeout,
        )
        .await
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sender: UnboundedSender<SubscriptionMessage>,
    ) -> Result<SubscriptionId> {
        let logical = self.next_logical_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut table = self.subscriptions.lock().await;
            table.entries.insert(
                logical,
                SubEntry {
                    request: request.clone(),
                    sender,
                    server_key: None,
                },
            );
        }

        let result = rpc_request(
            &self.writer,
            &self.pending,
            &self.next_request_id,
            &request.subscribe_method,
            request.params.clone(),
            self.config.request_timeout,
        )
        .await;

        match result {
            Ok(value) => {
                let mut table = self.subscriptions.lock().await;
                table.bind(logical, server_key_of(&value));
                Ok(SubscriptionId(logical))
            }
            Err(err) => {
                self.subscriptions.lock().await.entries.remove(&logical);
                Err(err)
            }
        }
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let entry = {
            let mut table = self.subscriptions.lock().await;
            table
                .unbind(id.0)
                .ok_or(TransportError::SubscriptionNotFound)?
        };

        if let Some(server_key) = entry.server_key {
            rpc_request(
                &self.writer,
                &self.pending,
                &self.next_request_id,
                &entry.request.unsubscribe_method,
                json!([server_key]),
                self.config.request_timeout,
            )
            .await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn_state.is_connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.conn_state.is_connected.store(false, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(WsMessage::Close(None)).await {
            debug!("Error sending close frame on shutdown: {err}");
        }
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// One request/response round trip through the shared writer.
async fn rpc_request(
    writer: &Arc<Mutex<Writer>>,
    pending: &Arc<Mutex<PendingMap>>,
    next_request_id: &Arc<AtomicU64>,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value> {
    let request_id = next_request_id.fetch_add(1, Ordering::SeqCst);
    let envelope = json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": method,
        "params": params,
    });
    let payload =
        serde_json::to_string(&envelope).map_err(|e| crate::Error::json_parse(e.to_string()))?;

    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(request_id, tx);

    {
        let mut writer = writer.lock().await;
        if let Err(err) = writer.send(WsMessage::Text(payload)).await {
            pending.lock().await.remove(&request_id);
            return Err(TransportError::Send(err.to_string()).into());
        }
    }

    match time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TransportError::Send("response channel closed".into()).into()),
        Err(_) => {
            pending.lock().await.remove(&request_id);
            Err(TransportError::Timeout.into())
        }
    }
}

async fn route_frame(
    frame: std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    subscriptions: &Arc<Mutex<SubscriptionTable>>,
    pending: &Arc<Mutex<PendingMap>>,
) -> Result<()> {
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) => {
            debug!("Reader frame error: {err}");
            return Ok(());
        }
    };
    let text = match frame.into_text() {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };

    match classify_incoming(&text)? {
        Incoming::Response { id, result } => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(result);
            } else {
                warn!("Response for unknown request id={id}");
            }
        }
        Incoming::Notification {
            method,
            server_key,
            payload,
        } => {
            let table = subscriptions.lock().await;
            if let Some(logical) = table.by_server.get(&(method.clone(), server_key.clone())) {
                if let Some(entry) = table.entries.get(logical) {
                    let _ = entry
                        .sender
                        .send(SubscriptionMessage::Notification(payload));
                }
            } else {
                debug!("Notification for unknown subscription method={method} key={server_key}");
            }
        }
        Incoming::Ignored => {}
    }
    Ok(())
}

/// Tell every subscription holder the socket dropped.
async fn notify_disconnect(subscriptions: &Arc<Mutex<SubscriptionTable>>) {
    let table = subscriptions.lock().await;
    for entry in table.entries.values() {
        let _ = entry.sender.send(SubscriptionMessage::Disconnected);
    }
}

/// Fail pending requests from before a reconnection fast; their responses
/// will never arrive on the new socket.
async fn drain_pending(pending: &Arc<Mutex<PendingMap>>) {
    let mut pending = pending.lock().await;
    let orphaned = pending.len();
    if orphaned > 0 {
        warn!("Failing {orphaned} orphaned requests after reconnection");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Connection(
                "connection reset during reconnection".into(),
            )
            .into()));
        }
    }
}

/// Re-establish every logical subscription on a fresh socket. Spawned so the
/// reader task can resume pumping responses first.
fn resubscribe_all(
    writer: &Arc<Mutex<Writer>>,
    subscriptions: &Arc<Mutex<SubscriptionTable>>,
    pending: &Arc<Mutex<PendingMap>>,
    next_request_id: &Arc<AtomicU64>,
    timeout: Duration,
) {
    let writer = Arc::clone(writer);
    let subscriptions = Arc::clone(subscriptions);
    let pending = Arc::clone(pending);
    let next_request_id = Arc::clone(next_request_id);

    spawn(async move {
        let targets: Vec<(u32, SubscribeRequest)> = {
            let table = subscriptions.lock().await;
            table
                .entries
                .iter()
                .map(|(logical, entry)| (*logical, entry.request.clone()))
                .collect()
        };

        for (logical, request) in targets {
            let result = rpc_request(
                &writer,
                &pending,
                &next_request_id,
                &request.subscribe_method,
                request.params.clone(),
                timeout,
            )
            .await;
            match result {
                Ok(value) => {
                    subscriptions.lock().await.bind(logical, server_key_of(&value));
                }
                Err(err) => {
                    error!("Could not resubscribe {}: {err}", request.subscribe_method);
                }
            }
        }
    });
}

/// Exponential backoff delay with deterministic jitter.
fn backoff_delay(
    attempt: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
) -> Duration {
    let base_secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    let capped_secs = base_secs.min(max.as_secs_f64());

    let jitter_mult = if attempt.is_multiple_of(2) {
        1.0 + jitter_factor * 0.5
    } else {
        1.0 - jitter_factor * 0.5
    };
    let jittered_secs = capped_secs * jitter_mult;

    Duration::from_secs_f64(jittered_secs.max(0.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let d0 = backoff_delay(0, initial, max, 2.0, 0.0);
        let d3 = backoff_delay(3, initial, max, 2.0, 0.0);
        let d20 = backoff_delay(20, initial, max, 2.0, 0.0);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d3, Duration::from_secs(8));
        assert_eq!(d20, Duration::from_secs(60));
    }

    #[test]
    fn classify_response_ok() {
        let incoming =
            classify_incoming(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        match incoming {
            Incoming::Response { id, result } => {
                assert_eq!(id, 7);
                assert_eq!(result.unwrap(), serde_json::json!({"ok": true}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_response_error() {
        let incoming = classify_incoming(
            r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match incoming {
            Incoming::Response { id, result } => {
                assert_eq!(id, 8);
                assert!(result.is_err());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let incoming = classify_incoming(
            r#"{"jsonrpc":"2.0","method":"state_storage","params":{"subscription":"abc123","result":{"block":"0x1"}}}"#,
        )
        .unwrap();
        match incoming {
            Incoming::Notification {
                method,
                server_key,
                payload,
            } => {
                assert_eq!(method, "state_storage");
                assert_eq!(server_key, "abc123");
                assert_eq!(payload["block"], "0x1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_numeric_subscription_keys() {
        let incoming = classify_incoming(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":42,"result":"0x0"}}"#,
        )
        .unwrap();
        match incoming {
            Incoming::Notification { server_key, .. } => assert_eq!(server_key, "42"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_json_frames_are_ignored() {
        assert!(matches!(
            classify_incoming("pong").unwrap(),
            Incoming::Ignored
        ));
    }
}
