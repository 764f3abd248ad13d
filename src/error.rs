// src/error.rs
use thiserror::Error;

use crate::types::ExecutionStatus;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failures at the broker boundary (REST calls and streams).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker rejected request ({code}): {message}")]
    Api { code: String, message: String },
    #[error("failed to decode broker payload: {0}")]
    Decode(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("stream is not connected")]
    NotConnected,
    #[error("stream closed")]
    StreamClosed,
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BrokerError::Decode(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Decode(err.to_string())
    }
}

/// Misconfiguration. Never retried: fatal at startup or for the single bot
/// creation request that triggered it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("please provide {0} via configuration or environment")]
    MissingToken(&'static str),
    #[error("unknown candle interval: {0:?}")]
    UnknownCandleInterval(String),
    #[error("can't use candle interval {0} for realtime trading")]
    UnsupportedInterval(String),
    #[error("unknown instrument type: {0:?}")]
    UnknownInstrumentType(String),
    #[error("can't margin-trade {ticker} ({figi})")]
    MarginUnavailable { ticker: String, figi: String },
    #[error("unknown strategy: {0:?}")]
    UnknownStrategy(String),
    #[error("invalid params for strategy {name:?}: {reason}")]
    InvalidStrategyParams { name: String, reason: String },
    #[error("window must be at least 2, got {0}")]
    InvalidWindow(usize),
    #[error("combat trading is not enabled")]
    CombatDisabled,
    #[error("unknown bot id: {0}")]
    UnknownBot(String),
}

/// A subscription the broker refused to serve. The topic will never
/// produce data, so this is fatal.
#[derive(Debug, Error)]
#[error("failed to subscribe to {kind} ({figi}): {status}")]
pub struct SubscriptionError {
    pub kind: String,
    pub figi: String,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("order {order_id} ended as {status:?}")]
    Terminal {
        order_id: String,
        status: ExecutionStatus,
    },
    #[error("fill stream for order {0} closed before the order was filled")]
    FillStreamClosed(String),
}
