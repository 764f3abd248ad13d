// src/strategies/traits.rs
use std::collections::HashMap;

use crate::config::OrdersConfig;
use crate::strategies::signal::TradeSignal;
use crate::types::{Candle, Instrument, OrderBook};

/// What a bot has seen so far: the last `window` candles (the live one
/// last) and the freshest order book, if any arrived.
#[derive(Debug, Clone, Copy)]
pub struct MarketData<'a> {
    pub candles: &'a [Candle],
    pub order_book: Option<&'a OrderBook>,
}

/// Named indicator values a strategy reports alongside its decision.
pub type StrategyOutput = HashMap<String, f64>;

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Keys that appear in every output map, in display order.
    fn output_keys(&self) -> &'static [&'static str];

    // May keep state between calls (e.g. repeat counters)
    fn trade_signal(
        &mut self,
        instrument: &Instrument,
        market: MarketData<'_>,
        orders: &OrdersConfig,
    ) -> (Option<TradeSignal>, StrategyOutput);
}
