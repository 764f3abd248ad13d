// src/strategies/consecutive_ratio.rs
//! Signals when bids (or asks) dominate the order book for a number of
//! snapshots in a row.

use serde::Deserialize;
use tracing::debug;

use crate::config::OrdersConfig;
use crate::strategies::signal::TradeSignal;
use crate::strategies::traits::{MarketData, Strategy, StrategyOutput};
use crate::types::{Instrument, Side};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsecutiveRatioParams {
    /// Share of all book quantity one side must hold.
    pub ratio: f64,
    pub times_repeated: u32,
}

impl Default for ConsecutiveRatioParams {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            times_repeated: 10,
        }
    }
}

pub struct ConsecutiveRatioStrategy {
    params: ConsecutiveRatioParams,
    flag: Option<Side>,
    repeated: u32,
}

impl ConsecutiveRatioStrategy {
    pub fn new(params: ConsecutiveRatioParams) -> Self {
        Self {
            params,
            flag: None,
            repeated: 0,
        }
    }
}

impl Strategy for ConsecutiveRatioStrategy {
    fn name(&self) -> &'static str {
        "Consecutive ratio"
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn trade_signal(
        &mut self,
        _instrument: &Instrument,
        market: MarketData<'_>,
        orders: &OrdersConfig,
    ) -> (Option<TradeSignal>, StrategyOutput) {
        let Some(book) = market.order_book else {
            return (None, StrategyOutput::new());
        };
        let bids: i64 = book.bids.iter().map(|l| l.quantity).sum();
        let asks: i64 = book.asks.iter().map(|l| l.quantity).sum();
        if bids + asks <= 0 {
            return (None, StrategyOutput::new());
        }
        let total = (bids + asks) as f64;
        let (bids_ratio, asks_ratio) = (bids as f64 / total, asks as f64 / total);

        if bids_ratio >= self.params.ratio && self.flag != Some(Side::Sell) {
            self.flag = Some(Side::Buy);
            self.repeated += 1;
        } else if asks_ratio >= self.params.ratio && self.flag != Some(Side::Buy) {
            self.flag = Some(Side::Sell);
            self.repeated += 1;
        } else {
            self.flag = None;
            self.repeated = 0;
        }
        debug!(figi = %book.figi, bids_ratio, asks_ratio, repeated = self.repeated, "Book ratio");

        let price = market
            .candles
            .last()
            .map(|c| c.close)
            .or_else(|| book.bids.first().map(|l| l.price))
            .unwrap_or_default();
        let signal = match self.flag {
            Some(side) if self.repeated >= self.params.times_repeated => {
                Some(TradeSignal::new(side, orders.order_type, price))
            }
            _ => None,
        };
        (signal, StrategyOutput::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::paper_instrument;
    use crate::types::{BookLevel, OrderBook};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn book(bid_qty: i64, ask_qty: i64) -> OrderBook {
        OrderBook {
            figi: "F1".into(),
            depth: 1,
            bids: vec![BookLevel { price: dec!(99), quantity: bid_qty }],
            asks: vec![BookLevel { price: dec!(101), quantity: ask_qty }],
            time: Utc::now(),
        }
    }

    fn feed(strategy: &mut ConsecutiveRatioStrategy, book: &OrderBook) -> Option<TradeSignal> {
        strategy
            .trade_signal(
                &paper_instrument("F1", "AAA", "rub"),
                MarketData {
                    candles: &[],
                    order_book: Some(book),
                },
                &OrdersConfig::default(),
            )
            .0
    }

    #[test]
    fn needs_the_ratio_repeated() {
        let mut s = ConsecutiveRatioStrategy::new(ConsecutiveRatioParams {
            ratio: 0.8,
            times_repeated: 3,
        });
        let heavy_bids = book(90, 10);
        assert!(feed(&mut s, &heavy_bids).is_none());
        assert!(feed(&mut s, &heavy_bids).is_none());
        let signal = feed(&mut s, &heavy_bids).unwrap();
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.price, dec!(99));
    }

    #[test]
    fn balanced_book_resets_the_count() {
        let mut s = ConsecutiveRatioStrategy::new(ConsecutiveRatioParams {
            ratio: 0.8,
            times_repeated: 2,
        });
        assert!(feed(&mut s, &book(10, 90)).is_none());
        assert!(feed(&mut s, &book(50, 50)).is_none());
        assert!(feed(&mut s, &book(10, 90)).is_none());
        assert_eq!(feed(&mut s, &book(10, 90)).unwrap().side, Side::Sell);
    }

    #[test]
    fn flipping_sides_does_not_count() {
        let mut s = ConsecutiveRatioStrategy::new(ConsecutiveRatioParams {
            ratio: 0.8,
            times_repeated: 2,
        });
        assert!(feed(&mut s, &book(90, 10)).is_none());
        // asks dominate while the buy flag is up: reset
        assert!(feed(&mut s, &book(10, 90)).is_none());
        assert!(feed(&mut s, &book(10, 90)).is_none());
        assert_eq!(feed(&mut s, &book(10, 90)).unwrap().side, Side::Sell);
    }
}
