use thiserror::Error;

/// Transport-layer errors (websocket RPC and light-client transports).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("No healthy endpoint configured for chain")]
    NoEndpoints,
    #[error("Light client error: {0}")]
    LightClient(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("RPC error (code {code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Subscription not found")]
    SubscriptionNotFound,
    #[error("No live connection for chain")]
    NotConnected,
}

/// Main engine error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport failure, fatal to the specific call that triggered it.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A balance module rejected or failed a request.
    #[error("Module error: {0}")]
    Module(String),

    /// Caller passed something structurally invalid (programmer error,
    /// surfaced synchronously).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown chain, network, token, or module id.
    #[error("Unknown {kind}: {id}")]
    Unknown { kind: &'static str, id: String },

    /// JSON (de)serialization failure.
    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// Snapshot store I/O failure.
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

// Convenience constructors for common error patterns
impl Error {
    pub fn json_parse(msg: impl Into<String>) -> Self {
        Error::JsonParse(msg.into())
    }

    pub fn module(msg: impl Into<String>) -> Self {
        Error::Module(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        Error::Unknown {
            kind,
            id: id.into(),
        }
    }
}
