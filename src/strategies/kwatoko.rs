// src/strategies/kwatoko.rs
//! Trades the jump that tends to follow an anomalously large order at the
//! top of the book: joins just in front of it and protects the entry with
//! a stop pair.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::config::OrdersConfig;
use crate::strategies::signal::TradeSignal;
use crate::strategies::traits::{MarketData, Strategy, StrategyOutput};
use crate::types::{Instrument, Side};
use crate::utils::precision::round_to_increment;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KwatokoParams {
    /// Top-of-book quantity over the book average that counts as an anomaly.
    pub anomaly_threshold: f64,
    /// Relative offset of the entry from the anomalous order's price.
    pub price_delta: f64,
}

impl Default for KwatokoParams {
    fn default() -> Self {
        Self {
            anomaly_threshold: 10.0,
            price_delta: 0.001,
        }
    }
}

pub struct KwatokoStrategy {
    params: KwatokoParams,
}

impl KwatokoStrategy {
    pub fn new(params: KwatokoParams) -> Self {
        Self { params }
    }
}

impl Strategy for KwatokoStrategy {
    fn name(&self) -> &'static str {
        "Kwatoko"
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn trade_signal(
        &mut self,
        instrument: &Instrument,
        market: MarketData<'_>,
        orders: &OrdersConfig,
    ) -> (Option<TradeSignal>, StrategyOutput) {
        let output = StrategyOutput::new();
        let Some(book) = market.order_book else {
            return (None, output);
        };
        let (Some(best_bid), Some(best_ask)) = (book.bids.first(), book.asks.first()) else {
            return (None, output);
        };

        let levels = (book.bids.len() + book.asks.len()) as f64;
        let total: i64 = book.bids.iter().chain(book.asks.iter()).map(|l| l.quantity).sum();
        let avg = total as f64 / levels;
        if avg <= 0.0 {
            return (None, output);
        }

        let Some(delta) = Decimal::from_f64(self.params.price_delta) else {
            return (None, output);
        };
        let entry = if best_bid.quantity as f64 / avg >= self.params.anomaly_threshold {
            Some((Side::Buy, best_bid.price * (Decimal::ONE + delta)))
        } else if best_ask.quantity as f64 / avg >= self.params.anomaly_threshold {
            Some((Side::Sell, best_ask.price * (Decimal::ONE - delta)))
        } else {
            None
        };

        let signal = entry.map(|(side, price)| {
            let price = round_to_increment(price, instrument.min_price_increment);
            TradeSignal::with_stop_orders(side, price, orders, instrument.min_price_increment)
        });
        (signal, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::paper_instrument;
    use crate::core::orders::StopOrderKind;
    use crate::types::{BookLevel, OrderBook};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: i64) -> BookLevel {
        BookLevel { price, quantity }
    }

    fn run(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Option<TradeSignal> {
        let book = OrderBook {
            figi: "F1".into(),
            depth: bids.len() as u32,
            bids,
            asks,
            time: Utc::now(),
        };
        KwatokoStrategy::new(KwatokoParams {
            anomaly_threshold: 3.0,
            price_delta: 0.001,
        })
        .trade_signal(
            &paper_instrument("F1", "AAA", "rub"),
            MarketData {
                candles: &[],
                order_book: Some(&book),
            },
            &OrdersConfig::default(),
        )
        .0
    }

    #[test]
    fn joins_in_front_of_a_large_bid() {
        let signal = run(
            vec![level(dec!(100), 100), level(dec!(99.9), 5)],
            vec![level(dec!(100.1), 5), level(dec!(100.2), 10)],
        )
        .unwrap();
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.price, dec!(100.1));
        let tp = signal.take_profit.unwrap();
        assert_eq!((tp.side, tp.trigger_price), (Side::Sell, dec!(101.1)));
        assert_eq!(signal.stop_loss.unwrap().kind, StopOrderKind::StopLoss);
    }

    #[test]
    fn undercuts_a_large_ask() {
        let signal = run(
            vec![level(dec!(100), 5), level(dec!(99.9), 5)],
            vec![level(dec!(200), 100), level(dec!(200.1), 5)],
        )
        .unwrap();
        assert_eq!(signal.side, Side::Sell);
        assert_eq!(signal.price, dec!(199.8));
    }

    #[test]
    fn even_book_gives_nothing() {
        assert!(run(
            vec![level(dec!(100), 10), level(dec!(99.9), 10)],
            vec![level(dec!(100.1), 10), level(dec!(100.2), 10)],
        )
        .is_none());
        assert!(run(vec![], vec![]).is_none());
    }
}
