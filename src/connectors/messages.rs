// src/connectors/messages.rs
//! JSON shapes of the Tinkoff Invest API v2 REST gateway and stream
//! endpoints. Field names follow the gateway's camelCase; 64-bit integers
//! arrive as strings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::connectors::traits::{SubscriptionAck, SubscriptionStatus, TopicKind};
use crate::error::BrokerError;
use crate::types::{
    BookLevel, Candle, CandleInterval, ExecutionStatus, Fill, Instrument, InstrumentType,
    MarginAttributes, MoneyAmount, OrderBook, OrderResponse, OrderState, OrderTrades,
    PortfolioPosition, Positions, SecurityPosition, SecurityTradingStatus, Side, TradingStatus,
};

const NANO: i64 = 1_000_000_000;

/// Accepts `"123"` as well as `123`.
fn int64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

fn int64_str<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// Fixed-point number: `units + nano * 1e-9`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quotation {
    #[serde(default, deserialize_with = "int64", serialize_with = "int64_str")]
    pub units: i64,
    #[serde(default)]
    pub nano: i32,
}

impl From<Quotation> for Decimal {
    fn from(q: Quotation) -> Self {
        Decimal::from(q.units) + Decimal::new(q.nano as i64, 9)
    }
}

impl From<Decimal> for Quotation {
    fn from(value: Decimal) -> Self {
        let units = value.trunc();
        let nano = ((value - units) * Decimal::from(NANO)).trunc();
        Quotation {
            units: i64::try_from(units).unwrap_or_default(),
            nano: i32::try_from(nano).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoneyValue {
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "int64", serialize_with = "int64_str")]
    pub units: i64,
    #[serde(default)]
    pub nano: i32,
}

impl MoneyValue {
    pub fn new(currency: &str, amount: Decimal) -> Self {
        let q = Quotation::from(amount);
        Self {
            currency: currency.to_string(),
            units: q.units,
            nano: q.nano,
        }
    }

    pub fn amount(&self) -> Decimal {
        Quotation {
            units: self.units,
            nano: self.nano,
        }
        .into()
    }
}

impl From<MoneyValue> for MoneyAmount {
    fn from(m: MoneyValue) -> Self {
        MoneyAmount {
            amount: m.amount(),
            currency: m.currency.to_ascii_lowercase(),
        }
    }
}

// ---- enum names -----------------------------------------------------------

pub fn candle_interval_name(interval: CandleInterval) -> &'static str {
    match interval {
        CandleInterval::OneMinute => "CANDLE_INTERVAL_1_MIN",
        CandleInterval::FiveMinutes => "CANDLE_INTERVAL_5_MIN",
        CandleInterval::FifteenMinutes => "CANDLE_INTERVAL_15_MIN",
        CandleInterval::Hour => "CANDLE_INTERVAL_HOUR",
        CandleInterval::Day => "CANDLE_INTERVAL_DAY",
    }
}

pub fn subscription_interval_name(interval: CandleInterval) -> &'static str {
    match interval {
        CandleInterval::OneMinute => "SUBSCRIPTION_INTERVAL_ONE_MINUTE",
        CandleInterval::FiveMinutes => "SUBSCRIPTION_INTERVAL_FIVE_MINUTES",
        _ => "SUBSCRIPTION_INTERVAL_UNSPECIFIED",
    }
}

fn parse_subscription_interval(name: &str) -> Option<CandleInterval> {
    match name {
        "SUBSCRIPTION_INTERVAL_ONE_MINUTE" => Some(CandleInterval::OneMinute),
        "SUBSCRIPTION_INTERVAL_FIVE_MINUTES" => Some(CandleInterval::FiveMinutes),
        _ => None,
    }
}

pub fn direction_name(side: Side) -> &'static str {
    match side {
        Side::Buy => "ORDER_DIRECTION_BUY",
        Side::Sell => "ORDER_DIRECTION_SELL",
    }
}

fn parse_direction(name: &str) -> Side {
    if name == "ORDER_DIRECTION_SELL" {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn parse_execution_status(name: &str) -> ExecutionStatus {
    match name {
        "EXECUTION_REPORT_STATUS_FILL" => ExecutionStatus::Filled,
        "EXECUTION_REPORT_STATUS_PARTIALLYFILL" => ExecutionStatus::PartiallyFilled,
        "EXECUTION_REPORT_STATUS_CANCELLED" => ExecutionStatus::Cancelled,
        "EXECUTION_REPORT_STATUS_REJECTED" => ExecutionStatus::Rejected,
        _ => ExecutionStatus::New,
    }
}

pub fn instrument_method(instrument_type: InstrumentType) -> &'static str {
    match instrument_type {
        InstrumentType::Bond => "BondBy",
        InstrumentType::Currency => "CurrencyBy",
        InstrumentType::Etf => "EtfBy",
        InstrumentType::Future => "FutureBy",
        InstrumentType::Share => "ShareBy",
    }
}

// ---- REST responses -------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: serde_json::Value,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountsResponse {
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
}

#[derive(Debug, Deserialize)]
pub struct AccountRecord {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSandboxAccountResponse {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PayInResponse {
    #[serde(default)]
    pub balance: MoneyValue,
}

#[derive(Debug, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub money: Vec<MoneyValue>,
    #[serde(default)]
    pub securities: Vec<SecurityRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityRecord {
    pub figi: String,
    #[serde(default, deserialize_with = "int64")]
    pub balance: i64,
}

impl From<PositionsResponse> for Positions {
    fn from(r: PositionsResponse) -> Self {
        Positions {
            money: r.money.into_iter().map(MoneyAmount::from).collect(),
            securities: r
                .securities
                .into_iter()
                .map(|s| SecurityPosition {
                    figi: s.figi,
                    balance: s.balance,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PortfolioResponse {
    #[serde(default)]
    pub positions: Vec<PortfolioRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioRecord {
    pub figi: String,
    #[serde(default)]
    pub quantity_lots: Quotation,
}

impl From<PortfolioRecord> for PortfolioPosition {
    fn from(r: PortfolioRecord) -> Self {
        PortfolioPosition {
            figi: r.figi,
            quantity_lots: r.quantity_lots.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginAttributesResponse {
    #[serde(default)]
    pub liquid_portfolio: MoneyValue,
    #[serde(default)]
    pub starting_margin: MoneyValue,
}

impl From<MarginAttributesResponse> for MarginAttributes {
    fn from(r: MarginAttributesResponse) -> Self {
        MarginAttributes {
            liquid_portfolio: r.liquid_portfolio.amount(),
            starting_margin: r.starting_margin.amount(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InstrumentResponse {
    pub instrument: InstrumentRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRecord {
    pub figi: String,
    pub ticker: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub lot: i64,
    #[serde(default)]
    pub min_price_increment: Quotation,
    #[serde(default)]
    pub dlong: Quotation,
    #[serde(default)]
    pub dshort: Quotation,
    #[serde(default)]
    pub short_enabled_flag: bool,
}

impl InstrumentRecord {
    pub fn into_instrument(self, instrument_type: InstrumentType) -> Instrument {
        Instrument {
            figi: self.figi,
            ticker: self.ticker,
            instrument_type,
            currency: self.currency.to_ascii_lowercase(),
            lot: self.lot.max(1),
            min_price_increment: self.min_price_increment.into(),
            dlong: self.dlong.into(),
            dshort: self.dshort.into(),
            short_enabled: self.short_enabled_flag,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOrderBody<'a> {
    pub figi: &'a str,
    #[serde(serialize_with = "int64_str")]
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Quotation>,
    pub direction: &'static str,
    pub account_id: &'a str,
    pub order_type: &'static str,
    pub order_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOrderResponse {
    pub order_id: String,
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub execution_report_status: String,
    #[serde(default, deserialize_with = "int64")]
    pub lots_requested: i64,
    #[serde(default, deserialize_with = "int64")]
    pub lots_executed: i64,
}

impl From<PostOrderResponse> for OrderResponse {
    fn from(r: PostOrderResponse) -> Self {
        OrderResponse {
            status: parse_execution_status(&r.execution_report_status),
            id: r.order_id,
            figi: r.figi,
            requested_lots: r.lots_requested,
            executed_lots: r.lots_executed,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStateResponse {
    pub order_id: String,
    #[serde(default)]
    pub execution_report_status: String,
    #[serde(default, deserialize_with = "int64")]
    pub lots_requested: i64,
    #[serde(default, deserialize_with = "int64")]
    pub lots_executed: i64,
    #[serde(default)]
    pub average_position_price: MoneyValue,
    #[serde(default)]
    pub stages: Vec<OrderStage>,
}

#[derive(Debug, Deserialize)]
pub struct OrderStage {
    #[serde(default)]
    pub price: MoneyValue,
    #[serde(default, deserialize_with = "int64")]
    pub quantity: i64,
}

impl From<OrderStateResponse> for OrderState {
    fn from(r: OrderStateResponse) -> Self {
        OrderState {
            status: parse_execution_status(&r.execution_report_status),
            id: r.order_id,
            requested_lots: r.lots_requested,
            executed_lots: r.lots_executed,
            avg_fill_price: r.average_position_price.amount(),
            // stage quantities are lots; the weighted average is unaffected
            fills: r
                .stages
                .into_iter()
                .map(|s| Fill {
                    price: s.price.amount(),
                    quantity: s.quantity,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CandlesResponse {
    #[serde(default)]
    pub candles: Vec<HistoricCandle>,
}

#[derive(Debug, Deserialize)]
pub struct HistoricCandle {
    pub open: Quotation,
    pub high: Quotation,
    pub low: Quotation,
    pub close: Quotation,
    #[serde(default, deserialize_with = "int64")]
    pub volume: i64,
    pub time: DateTime<Utc>,
}

impl HistoricCandle {
    pub fn into_candle(self, figi: &str, interval: CandleInterval) -> Candle {
        Candle {
            figi: figi.to_string(),
            interval,
            open: self.open.into(),
            high: self.high.into(),
            low: self.low.into(),
            close: self.close.into(),
            volume: self.volume,
            time: self.time,
        }
    }
}

// ---- market data stream ---------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataResponse {
    pub candle: Option<StreamCandle>,
    pub orderbook: Option<StreamOrderBook>,
    pub trading_status: Option<StreamTradingStatus>,
    pub subscribe_candles_response: Option<SubscribeCandlesResponse>,
    pub subscribe_order_book_response: Option<SubscribeOrderBookResponse>,
    pub subscribe_info_response: Option<SubscribeInfoResponse>,
}

#[derive(Debug, Deserialize)]
pub struct StreamCandle {
    pub figi: String,
    pub interval: String,
    pub open: Quotation,
    pub high: Quotation,
    pub low: Quotation,
    pub close: Quotation,
    #[serde(default, deserialize_with = "int64")]
    pub volume: i64,
    pub time: DateTime<Utc>,
}

impl StreamCandle {
    pub fn into_candle(self) -> Result<Candle, BrokerError> {
        let interval = parse_subscription_interval(&self.interval)
            .ok_or_else(|| BrokerError::Decode(format!("candle interval {}", self.interval)))?;
        Ok(Candle {
            figi: self.figi,
            interval,
            open: self.open.into(),
            high: self.high.into(),
            low: self.low.into(),
            close: self.close.into(),
            volume: self.volume,
            time: self.time,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamOrder {
    pub price: Quotation,
    #[serde(default, deserialize_with = "int64")]
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct StreamOrderBook {
    pub figi: String,
    pub depth: u32,
    #[serde(default)]
    pub bids: Vec<StreamOrder>,
    #[serde(default)]
    pub asks: Vec<StreamOrder>,
    pub time: DateTime<Utc>,
}

impl From<StreamOrderBook> for OrderBook {
    fn from(b: StreamOrderBook) -> Self {
        let level = |o: StreamOrder| BookLevel {
            price: o.price.into(),
            quantity: o.quantity,
        };
        OrderBook {
            figi: b.figi,
            depth: b.depth,
            bids: b.bids.into_iter().map(level).collect(),
            asks: b.asks.into_iter().map(level).collect(),
            time: b.time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTradingStatus {
    pub figi: String,
    pub trading_status: String,
    pub time: DateTime<Utc>,
}

impl From<StreamTradingStatus> for TradingStatus {
    fn from(s: StreamTradingStatus) -> Self {
        let status = match s.trading_status.as_str() {
            "SECURITY_TRADING_STATUS_NORMAL_TRADING" => SecurityTradingStatus::NormalTrading,
            "SECURITY_TRADING_STATUS_NOT_AVAILABLE_FOR_TRADING" => {
                SecurityTradingStatus::NotAvailable
            }
            other => SecurityTradingStatus::Other(other.to_string()),
        };
        TradingStatus {
            figi: s.figi,
            status,
            time: s.time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub figi: String,
    pub subscription_status: String,
}

impl SubscriptionRecord {
    fn into_ack(self, kind: TopicKind) -> SubscriptionAck {
        let status = if self.subscription_status == "SUBSCRIPTION_STATUS_SUCCESS" {
            SubscriptionStatus::Success
        } else {
            SubscriptionStatus::Failed(self.subscription_status)
        };
        SubscriptionAck {
            kind,
            figi: self.figi,
            status,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeCandlesResponse {
    #[serde(default)]
    pub candles_subscriptions: Vec<SubscriptionRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOrderBookResponse {
    #[serde(default)]
    pub order_book_subscriptions: Vec<SubscriptionRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeInfoResponse {
    #[serde(default)]
    pub info_subscriptions: Vec<SubscriptionRecord>,
}

impl MarketDataResponse {
    /// Collects every subscription acknowledgement carried by the message.
    pub fn take_acks(&mut self) -> Vec<SubscriptionAck> {
        let mut acks = Vec::new();
        if let Some(r) = self.subscribe_candles_response.take() {
            acks.extend(
                r.candles_subscriptions
                    .into_iter()
                    .map(|s| s.into_ack(TopicKind::Candle)),
            );
        }
        if let Some(r) = self.subscribe_order_book_response.take() {
            acks.extend(
                r.order_book_subscriptions
                    .into_iter()
                    .map(|s| s.into_ack(TopicKind::OrderBook)),
            );
        }
        if let Some(r) = self.subscribe_info_response.take() {
            acks.extend(
                r.info_subscriptions
                    .into_iter()
                    .map(|s| s.into_ack(TopicKind::Info)),
            );
        }
        acks
    }
}

// ---- trades stream --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TradesStreamLine {
    pub result: Option<TradesStreamResponse>,
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradesStreamResponse {
    pub order_trades: Option<StreamOrderTrades>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOrderTrades {
    pub order_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub trades: Vec<StreamTrade>,
}

#[derive(Debug, Deserialize)]
pub struct StreamTrade {
    pub price: Quotation,
    #[serde(default, deserialize_with = "int64")]
    pub quantity: i64,
}

impl From<StreamOrderTrades> for OrderTrades {
    fn from(t: StreamOrderTrades) -> Self {
        OrderTrades {
            side: parse_direction(&t.direction),
            order_id: t.order_id,
            account_id: t.account_id,
            figi: t.figi,
            trades: t
                .trades
                .into_iter()
                .map(|tr| Fill {
                    price: tr.price.into(),
                    quantity: tr.quantity,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quotation_converts_both_ways() {
        let q = Quotation {
            units: 114,
            nano: 250_000_000,
        };
        assert_eq!(Decimal::from(q), dec!(114.25));
        assert_eq!(Quotation::from(dec!(-0.5)), Quotation { units: 0, nano: -500_000_000 });
        assert_eq!(Quotation::from(dec!(12.000000001)), Quotation { units: 12, nano: 1 });
    }

    #[test]
    fn decodes_stream_candle_with_string_volume() {
        let raw = r#"{"candle":{"figi":"BBG000B9XRY4","interval":"SUBSCRIPTION_INTERVAL_ONE_MINUTE",
            "open":{"units":"100","nano":0},"high":{"units":"101","nano":0},
            "low":{"units":"99","nano":500000000},"close":{"units":"100","nano":250000000},
            "volume":"42","time":"2023-01-10T10:00:00Z"}}"#;
        let msg: MarketDataResponse = serde_json::from_str(raw).unwrap();
        let candle = msg.candle.unwrap().into_candle().unwrap();
        assert_eq!(candle.interval, CandleInterval::OneMinute);
        assert_eq!(candle.low, dec!(99.5));
        assert_eq!(candle.close, dec!(100.25));
        assert_eq!(candle.volume, 42);
    }

    #[test]
    fn collects_failed_acks() {
        let raw = r#"{"subscribeOrderBookResponse":{"trackingId":"x","orderBookSubscriptions":[
            {"figi":"F1","depth":10,"subscriptionStatus":"SUBSCRIPTION_STATUS_INSTRUMENT_NOT_FOUND"}]}}"#;
        let mut msg: MarketDataResponse = serde_json::from_str(raw).unwrap();
        let acks = msg.take_acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, TopicKind::OrderBook);
        assert_eq!(
            acks[0].status,
            SubscriptionStatus::Failed("SUBSCRIPTION_STATUS_INSTRUMENT_NOT_FOUND".into())
        );
    }

    #[test]
    fn decodes_trades_stream_line() {
        let raw = r#"{"result":{"orderTrades":{"orderId":"o-1","accountId":"acc",
            "figi":"F1","direction":"ORDER_DIRECTION_SELL",
            "trades":[{"price":{"units":"10","nano":0},"quantity":"3"}]}}}"#;
        let line: TradesStreamLine = serde_json::from_str(raw).unwrap();
        let trades: OrderTrades = line.result.unwrap().order_trades.unwrap().into();
        assert_eq!(trades.side, Side::Sell);
        assert_eq!(trades.trades, vec![Fill { price: dec!(10), quantity: 3 }]);
    }
}
