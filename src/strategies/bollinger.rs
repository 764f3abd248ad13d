// src/strategies/bollinger.rs
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use ta::indicators::BollingerBands;
use ta::Next;

use crate::config::OrdersConfig;
use crate::strategies::signal::TradeSignal;
use crate::strategies::traits::{MarketData, Strategy, StrategyOutput};
use crate::types::{Instrument, Side};

pub const LOWER_BOUND: &str = "bollinger_lower_bound";
pub const UPPER_BOUND: &str = "bollinger_upper_bound";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BollingerParams {
    /// Standard deviation multiplier.
    pub coef: f64,
    /// Relative tolerance when checking that the close sits on a band.
    pub point_dev: f64,
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self {
            coef: 3.0,
            point_dev: 0.0005,
        }
    }
}

/// True when `sample` lies within `ref_point * (1 ± deviation)`.
pub fn is_around_point(sample: f64, ref_point: f64, deviation: f64) -> bool {
    let spread = (ref_point * deviation).abs();
    sample >= ref_point - spread && sample <= ref_point + spread
}

/// Buys when the close touches the lower band, sells when it touches the upper.
pub struct BollingerStrategy {
    params: BollingerParams,
}

impl BollingerStrategy {
    pub fn new(params: BollingerParams) -> Self {
        Self { params }
    }
}

impl Strategy for BollingerStrategy {
    fn name(&self) -> &'static str {
        "Bollinger Bands (R)"
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[LOWER_BOUND, UPPER_BOUND]
    }

    fn trade_signal(
        &mut self,
        _instrument: &Instrument,
        market: MarketData<'_>,
        orders: &OrdersConfig,
    ) -> (Option<TradeSignal>, StrategyOutput) {
        let mut output = StrategyOutput::new();
        let Some(current) = market.candles.last() else {
            return (None, output);
        };
        let Ok(mut bands) = BollingerBands::new(market.candles.len(), self.params.coef) else {
            return (None, output);
        };

        let mut last = None;
        for candle in market.candles {
            last = Some(bands.next(candle.close.to_f64().unwrap_or_default()));
        }
        let Some(bands) = last else {
            return (None, output);
        };
        output.insert(LOWER_BOUND.to_string(), bands.lower);
        output.insert(UPPER_BOUND.to_string(), bands.upper);

        let close = current.close.to_f64().unwrap_or_default();
        let side = if is_around_point(close, bands.lower, self.params.point_dev)
            && close < bands.average
        {
            Some(Side::Buy)
        } else if is_around_point(close, bands.upper, self.params.point_dev) {
            Some(Side::Sell)
        } else {
            None
        };

        let signal = side.map(|side| TradeSignal::new(side, orders.order_type, current.close));
        (signal, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::{flat_candle, paper_instrument};
    use crate::types::{Candle, CandleInterval};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn closes(values: &[Decimal]) -> Vec<Candle> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, c)| flat_candle("F1", CandleInterval::OneMinute, *c, start + Duration::minutes(i as i64)))
            .collect()
    }

    fn run(params: BollingerParams, candles: &[Candle]) -> (Option<TradeSignal>, StrategyOutput) {
        BollingerStrategy::new(params).trade_signal(
            &paper_instrument("F1", "AAA", "rub"),
            MarketData {
                candles,
                order_book: None,
            },
            &OrdersConfig::default(),
        )
    }

    #[test]
    fn buys_near_the_lower_band() {
        let candles = closes(&[dec!(186.45), dec!(185.13), dec!(184.95)]);
        let (signal, output) = run(BollingerParams { coef: 3.0, point_dev: 0.01 }, &candles);

        assert_eq!(signal.unwrap().side, Side::Buy);
        assert!((output[LOWER_BOUND] - 183.5038).abs() < 1e-3);
        assert!((output[UPPER_BOUND] - 187.5162).abs() < 1e-3);
    }

    #[test]
    fn sells_near_the_upper_band() {
        let candles = closes(&[dec!(100), dec!(100), dec!(120)]);
        let (signal, _) = run(BollingerParams { coef: 1.0, point_dev: 0.05 }, &candles);
        let signal = signal.unwrap();
        assert_eq!(signal.side, Side::Sell);
        assert_eq!(signal.price, dec!(120));
    }

    #[test]
    fn flat_market_stays_quiet() {
        let candles = closes(&[dec!(100), dec!(101), dec!(100), dec!(101)]);
        let (signal, output) = run(BollingerParams::default(), &candles);
        assert!(signal.is_none());
        assert_eq!(output.len(), 2);
        assert!(run(BollingerParams::default(), &[]).0.is_none());
    }

    #[test]
    fn around_point_is_inclusive() {
        assert!(is_around_point(99.0, 100.0, 0.01));
        assert!(is_around_point(101.0, 100.0, 0.01));
        assert!(!is_around_point(98.9, 100.0, 0.01));
    }
}
