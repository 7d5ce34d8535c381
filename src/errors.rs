/// Error taxonomy for the indexing engine core.
///
/// Mirrors the propagation rules: `Config`/`ChainMismatch` are fatal during
/// init, `Network`/`Rpc` in chain-head pollers are logged and swallowed,
/// `Dictionary` disables or skips a cycle, `BlockUnavailable` is non-fatal in
/// worker mode, `Handler` is fatal, `InvalidAction` surfaces from block
/// assembly.
use std::fmt;

#[derive(Debug, Clone)]
pub enum EngineError {
    Config(String),
    Network(String),
    Rpc(String),
    ChainMismatch(String),
    BlockUnavailable { height: i64 },
    Dictionary(String),
    Handler(String),
    InvalidAction(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        EngineError::Network(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        EngineError::Rpc(msg.into())
    }

    pub fn chain_mismatch(msg: impl Into<String>) -> Self {
        EngineError::ChainMismatch(msg.into())
    }

    pub fn dictionary(msg: impl Into<String>) -> Self {
        EngineError::Dictionary(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        EngineError::Handler(msg.into())
    }

    pub fn invalid_action(msg: impl Into<String>) -> Self {
        EngineError::InvalidAction(msg.into())
    }

    /// True for errors that should terminate the process at init (exit 1).
    pub fn is_fatal_at_init(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::ChainMismatch(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(m) => write!(f, "config error: {}", m),
            EngineError::Network(m) => write!(f, "network error: {}", m),
            EngineError::Rpc(m) => write!(f, "rpc error: {}", m),
            EngineError::ChainMismatch(m) => write!(f, "chain mismatch: {}", m),
            EngineError::BlockUnavailable { height } => {
                write!(f, "block unavailable at height {}", height)
            }
            EngineError::Dictionary(m) => write!(f, "dictionary error: {}", m),
            EngineError::Handler(m) => write!(f, "handler error: {}", m),
            EngineError::InvalidAction(m) => write!(f, "invalid action: {}", m),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            EngineError::Network(e.to_string())
        } else {
            EngineError::Rpc(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Rpc(format!("json decode error: {}", e))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
