// src/connectors/traits.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    Candle, CandleInterval, Instrument, InstrumentType, MarginAttributes, OrderBook, OrderRequest,
    OrderResponse, OrderState, OrderTrades, PortfolioPosition, Positions, TradingStatus,
};

/// Request/response half of the broker API. A client is bound to either the
/// sandbox or the live ("combat") environment at construction.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn is_sandbox(&self) -> bool;

    async fn get_accounts(&self) -> BrokerResult<Vec<String>>;
    async fn open_sandbox_account(&self) -> BrokerResult<String>;
    async fn close_sandbox_account(&self, account_id: &str) -> BrokerResult<()>;
    /// Credits a sandbox account, returns the resulting balance.
    async fn sandbox_pay_in(
        &self,
        account_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> BrokerResult<Decimal>;

    async fn get_positions(&self, account_id: &str) -> BrokerResult<Positions>;
    async fn get_portfolio(&self, account_id: &str) -> BrokerResult<Vec<PortfolioPosition>>;
    async fn get_margin_attributes(&self, account_id: &str) -> BrokerResult<MarginAttributes>;

    async fn instrument_by_figi(
        &self,
        figi: &str,
        instrument_type: InstrumentType,
    ) -> BrokerResult<Instrument>;

    async fn post_order(&self, request: &OrderRequest) -> BrokerResult<OrderResponse>;
    async fn get_order_state(&self, account_id: &str, order_id: &str)
        -> BrokerResult<OrderState>;

    async fn get_candles(
        &self,
        figi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: CandleInterval,
    ) -> BrokerResult<Vec<Candle>>;
}

/// Streaming half of the broker API.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Opens a fresh market-data connection. The connection is dead once
    /// `events` yields `None` or an `Error` event.
    async fn connect_market_data(&self) -> BrokerResult<MarketDataConnection>;

    /// Opens the trade-fill stream for the given accounts.
    async fn connect_trades(&self, account_ids: Vec<String>)
        -> BrokerResult<mpsc::Receiver<OrderTrades>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    Candle,
    Info,
    OrderBook,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::Candle => f.write_str("candles"),
            TopicKind::Info => f.write_str("info"),
            TopicKind::OrderBook => f.write_str("order book"),
        }
    }
}

/// A market-data topic on the physical stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Candles { figi: String, interval: CandleInterval },
    Info { figi: String },
    OrderBook { figi: String, depth: u32 },
}

impl Topic {
    pub fn kind(&self) -> TopicKind {
        match self {
            Topic::Candles { .. } => TopicKind::Candle,
            Topic::Info { .. } => TopicKind::Info,
            Topic::OrderBook { .. } => TopicKind::OrderBook,
        }
    }

    pub fn figi(&self) -> &str {
        match self {
            Topic::Candles { figi, .. } | Topic::Info { figi } | Topic::OrderBook { figi, .. } => {
                figi
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketDataRequest {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    pub kind: TopicKind,
    pub figi: String,
    pub status: SubscriptionStatus,
}

/// Every decoded inbound market-data message.
#[derive(Debug)]
pub enum MarketDataEvent {
    TradingStatus(TradingStatus),
    Candle(Candle),
    OrderBook(OrderBook),
    SubscriptionAck(Vec<SubscriptionAck>),
    Error(BrokerError),
}

/// One live physical market-data connection.
pub struct MarketDataConnection {
    pub requests: mpsc::Sender<MarketDataRequest>,
    pub events: mpsc::Receiver<MarketDataEvent>,
}
