// src/storage/mod.rs
//! Best-effort outlets for what bots see and do. Nothing here may block or
//! fail a bot: sinks drop data rather than wait.

pub mod journal;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::strategies::traits::StrategyOutput;
use crate::types::{Candle, Side};

/// A filled order as shown on dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderExecution {
    pub figi: String,
    pub account_id: String,
    pub side: Side,
    pub lots: i64,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

pub trait PersistenceSink: Send + Sync {
    fn on_historic_candles(&self, bot: &str, candles: &[Candle]);
    fn on_live_candle_update(&self, bot: &str, candle: &Candle);
    fn on_strategy_output(&self, bot: &str, time: DateTime<Utc>, output: &StrategyOutput);
}

pub trait AnnotationSink: Send + Sync {
    fn on_order_executed(&self, bot: &str, execution: &OrderExecution);
}

/// Used when no journal is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PersistenceSink for LogSink {
    fn on_historic_candles(&self, bot: &str, candles: &[Candle]) {
        debug!(bot, count = candles.len(), "Historic candles loaded");
    }

    fn on_live_candle_update(&self, bot: &str, candle: &Candle) {
        debug!(bot, time = %candle.time, close = %candle.close, "Live candle");
    }

    fn on_strategy_output(&self, bot: &str, time: DateTime<Utc>, output: &StrategyOutput) {
        if !output.is_empty() {
            debug!(bot, %time, ?output, "Strategy output");
        }
    }
}

impl AnnotationSink for LogSink {
    fn on_order_executed(&self, bot: &str, execution: &OrderExecution) {
        info!(
            bot,
            "{} {} lots of {} @ {}",
            execution.side, execution.lots, execution.figi, execution.price
        );
    }
}
