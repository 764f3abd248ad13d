// src/types.rs
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

pub type BotId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn reverse(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentType {
    Bond,
    Currency,
    Etf,
    Future,
    Share,
}

impl FromStr for InstrumentType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bond" => Ok(InstrumentType::Bond),
            "currency" => Ok(InstrumentType::Currency),
            "etf" => Ok(InstrumentType::Etf),
            "future" => Ok(InstrumentType::Future),
            "share" => Ok(InstrumentType::Share),
            _ => Err(ConfigError::UnknownInstrumentType(s.to_string())),
        }
    }
}

/// Candle aggregation interval. Only the first two are available for
/// realtime subscriptions, the rest are history-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    Hour,
    Day,
}

impl CandleInterval {
    pub fn duration(self) -> Duration {
        match self {
            CandleInterval::OneMinute => Duration::minutes(1),
            CandleInterval::FiveMinutes => Duration::minutes(5),
            CandleInterval::FifteenMinutes => Duration::minutes(15),
            CandleInterval::Hour => Duration::hours(1),
            CandleInterval::Day => Duration::days(1),
        }
    }

    pub fn supports_realtime(self) -> bool {
        matches!(self, CandleInterval::OneMinute | CandleInterval::FiveMinutes)
    }
}

impl FromStr for CandleInterval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1min" => Ok(CandleInterval::OneMinute),
            "5min" => Ok(CandleInterval::FiveMinutes),
            "15min" => Ok(CandleInterval::FifteenMinutes),
            "1hour" => Ok(CandleInterval::Hour),
            "1day" => Ok(CandleInterval::Day),
            _ => Err(ConfigError::UnknownCandleInterval(s.to_string())),
        }
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandleInterval::OneMinute => "1min",
            CandleInterval::FiveMinutes => "5min",
            CandleInterval::FifteenMinutes => "15min",
            CandleInterval::Hour => "1hour",
            CandleInterval::Day => "1day",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub figi: String,
    pub interval: CandleInterval,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub figi: String,
    pub depth: u32,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityTradingStatus {
    NormalTrading,
    NotAvailable,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStatus {
    pub figi: String,
    pub status: SecurityTradingStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub figi: String,
    pub ticker: String,
    pub instrument_type: InstrumentType,
    pub currency: String,
    pub lot: i64,
    pub min_price_increment: Decimal,
    pub dlong: Decimal,
    pub dshort: Decimal,
    pub short_enabled: bool,
}

impl Instrument {
    pub fn supports_margin(&self) -> bool {
        !self.dlong.is_zero() && !self.dshort.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyAmount {
    pub currency: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPosition {
    pub figi: String,
    pub balance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Positions {
    pub money: Vec<MoneyAmount>,
    pub securities: Vec<SecurityPosition>,
}

impl Positions {
    pub fn money_in(&self, currency: &str) -> Decimal {
        self.money
            .iter()
            .filter(|m| m.currency.eq_ignore_ascii_case(currency))
            .map(|m| m.amount)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub figi: String,
    pub quantity_lots: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginAttributes {
    pub liquid_portfolio: Decimal,
    pub starting_margin: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// One execution against an order. `quantity` is in instrument units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub figi: String,
    pub quantity: i64,
    pub price: Option<Decimal>,
    pub side: Side,
    pub account_id: String,
    pub order_type: OrderType,
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub figi: String,
    pub status: ExecutionStatus,
    pub requested_lots: i64,
    pub executed_lots: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub id: String,
    pub status: ExecutionStatus,
    pub requested_lots: i64,
    pub executed_lots: i64,
    pub avg_fill_price: Decimal,
    pub fills: Vec<Fill>,
}

/// Trade-fill stream event for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTrades {
    pub order_id: String,
    pub account_id: String,
    pub figi: String,
    pub side: Side,
    pub trades: Vec<Fill>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub currency: String,
    pub amount: Decimal,
    pub occupied: bool,
}

/// Volume-weighted average price of a set of fills.
pub fn average_fill_price(fills: &[Fill]) -> Option<Decimal> {
    let volume: i64 = fills.iter().map(|f| f.quantity).sum();
    if volume == 0 {
        return None;
    }
    let notional: Decimal = fills
        .iter()
        .map(|f| f.price * Decimal::from(f.quantity))
        .sum();
    Some(notional / Decimal::from(volume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn vwap_weights_by_quantity() {
        let fills = [
            Fill { price: dec!(100), quantity: 1 },
            Fill { price: dec!(103), quantity: 2 },
        ];
        assert_eq!(average_fill_price(&fills), Some(dec!(102)));
        assert_eq!(average_fill_price(&[]), None);
    }

    #[test]
    fn parses_intervals_and_flags_realtime_support() {
        let interval: CandleInterval = "5min".parse().unwrap();
        assert_eq!(interval, CandleInterval::FiveMinutes);
        assert!(interval.supports_realtime());
        assert!(!CandleInterval::Hour.supports_realtime());
        assert!("2min".parse::<CandleInterval>().is_err());
        assert_eq!(CandleInterval::Day.to_string(), "1day");
    }
}
