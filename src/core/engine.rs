// src/core/engine.rs
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::connectors::traits::{BrokerClient, StreamClient};
use crate::core::accounts::AccountRegistry;
use crate::core::multiplexer::StreamMultiplexer;
use crate::core::orders::{OrderExecutor, TradesHub};
use crate::core::subscriptions::{RequestLink, SubscriptionTable};
use crate::core::supervisor::{ConnectionState, ReconnectSupervisor};
use crate::error::{BrokerError, BrokerResult, SubscriptionError};
use crate::types::{Candle, CandleInterval, Instrument, InstrumentType, Side};
use crate::utils::connectivity::ConnectivityProbe;

#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub channel_capacity: usize,
    pub send_timeout: Duration,
    pub order_poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub history_lookback_days: u32,
}

impl From<&RuntimeConfig> for EnvSettings {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            channel_capacity: cfg.channel_capacity,
            send_timeout: cfg.send_timeout(),
            order_poll_interval: cfg.order_poll_interval(),
            reconnect_delay: cfg.reconnect_delay(),
            history_lookback_days: cfg.history_lookback_days,
        }
    }
}

/// One broker environment (sandbox or live): its accounts, the shared
/// market-data connection and order execution.
pub struct TradeEnv {
    broker: Arc<dyn BrokerClient>,
    stream: Arc<dyn StreamClient>,
    pub accounts: AccountRegistry,
    pub subscriptions: Arc<SubscriptionTable>,
    pub mux: Arc<StreamMultiplexer>,
    supervisor: Arc<ReconnectSupervisor>,
    executor: OrderExecutor,
    trades: Option<Arc<TradesHub>>,
    settings: EnvSettings,
}

impl TradeEnv {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        stream: Arc<dyn StreamClient>,
        probe: Arc<dyn ConnectivityProbe>,
        settings: EnvSettings,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionTable::new(RequestLink::default()));
        let mux = Arc::new(StreamMultiplexer::new(
            subscriptions.clone(),
            settings.channel_capacity,
            settings.send_timeout,
        ));
        let supervisor = Arc::new(ReconnectSupervisor::new(
            stream.clone(),
            subscriptions.clone(),
            mux.clone(),
            probe,
            settings.reconnect_delay,
        ));
        let trades = if broker.is_sandbox() {
            None
        } else {
            Some(Arc::new(TradesHub::default()))
        };
        let executor = OrderExecutor::new(
            broker.clone(),
            trades.clone(),
            settings.order_poll_interval,
        );

        Self {
            accounts: AccountRegistry::new(broker.clone()),
            broker,
            stream,
            subscriptions,
            mux,
            supervisor,
            executor,
            trades,
            settings,
        }
    }

    pub fn is_sandbox(&self) -> bool {
        self.broker.is_sandbox()
    }

    pub fn label(&self) -> &'static str {
        if self.is_sandbox() {
            "sandbox"
        } else {
            "combat"
        }
    }

    /// Opens the sandbox accounts or loads the live ones, then starts the
    /// market-data loop (and, for live environments, the trade-fill pump).
    pub async fn start(
        &self,
        sandbox_accounts: usize,
        funding: &HashMap<String, Decimal>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<Result<(), SubscriptionError>>> {
        if self.is_sandbox() {
            for _ in 0..sandbox_accounts {
                self.accounts.create_sandbox_account(funding).await?;
            }
        } else {
            let ids = self.accounts.load_existing().await?;
            if let Some(hub) = &self.trades {
                tokio::spawn(hub.clone().run(
                    self.stream.clone(),
                    ids,
                    self.settings.reconnect_delay,
                    shutdown.clone(),
                ));
            }
        }

        let supervisor = self.supervisor.clone();
        info!("Starting {} environment", self.label());
        Ok(tokio::spawn(async move { supervisor.run(shutdown).await }))
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state()
    }

    pub async fn instrument(&self, figi: &str, instrument_type: InstrumentType) -> BrokerResult<Instrument> {
        self.broker.instrument_by_figi(figi, instrument_type).await
    }

    /// Candles of the day-long range ending `n` days before now.
    pub async fn candles_for_nth_day_before(
        &self,
        figi: &str,
        interval: CandleInterval,
        n: u32,
    ) -> BrokerResult<Vec<Candle>> {
        let to = Utc::now() - ChronoDuration::days(n as i64);
        let from = to - ChronoDuration::days(1);
        self.broker.get_candles(figi, from, to, interval).await
    }

    /// At least `n` most recent candles in time order, walking back one day
    /// at a time.
    pub async fn last_candles(
        &self,
        figi: &str,
        interval: CandleInterval,
        n: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let mut candles: Vec<Candle> = Vec::new();
        let mut day = 0;
        while candles.len() < n {
            if day > self.settings.history_lookback_days {
                return Err(BrokerError::NotFound(format!(
                    "{} {} candles of {} within {} days",
                    n, interval, figi, self.settings.history_lookback_days
                )));
            }
            let mut older = self.candles_for_nth_day_before(figi, interval, day).await?;
            older.append(&mut candles);
            candles = older;
            day += 1;
        }
        Ok(candles)
    }

    /// Most money the account may put into one deal on `side`.
    pub async fn max_deal_value(
        &self,
        account_id: &str,
        side: Side,
        instrument: &Instrument,
        price: Decimal,
        allow_margin: bool,
    ) -> BrokerResult<Decimal> {
        let margin_free = |attrs: &crate::types::MarginAttributes, factor: Decimal| {
            (attrs.liquid_portfolio - attrs.starting_margin)
                .checked_div(factor)
                .unwrap_or_default()
        };
        let value = match side {
            Side::Buy if allow_margin => {
                let attrs = self.broker.get_margin_attributes(account_id).await?;
                margin_free(&attrs, instrument.dlong)
            }
            Side::Buy => {
                let positions = self.broker.get_positions(account_id).await?;
                positions.money_in(&instrument.currency)
            }
            Side::Sell if allow_margin && instrument.short_enabled => {
                let attrs = self.broker.get_margin_attributes(account_id).await?;
                margin_free(&attrs, instrument.dshort)
            }
            Side::Sell => {
                let lots = self.lots_have(account_id, &instrument.figi).await?;
                lots * Decimal::from(instrument.lot) * price
            }
        };
        Ok(value.max(Decimal::ZERO))
    }

    /// Whole lots affordable at `price` after the fee.
    pub fn lots_can_afford(
        side: Side,
        max_deal_value: Decimal,
        instrument: &Instrument,
        price: Decimal,
        fee: Decimal,
    ) -> i64 {
        let with_fee = match side {
            Side::Buy => price * (Decimal::ONE + fee),
            Side::Sell => price * (Decimal::ONE - fee),
        };
        let lot_cost = with_fee * Decimal::from(instrument.lot);
        if lot_cost <= Decimal::ZERO || max_deal_value <= Decimal::ZERO {
            return 0;
        }
        (max_deal_value / lot_cost).floor().to_i64().unwrap_or(0)
    }

    /// Signed lots of `figi` held on the account. Short positions are negative.
    pub async fn lots_have(&self, account_id: &str, figi: &str) -> BrokerResult<Decimal> {
        let portfolio = self.broker.get_portfolio(account_id).await?;
        Ok(portfolio
            .into_iter()
            .find(|p| p.figi == figi)
            .map(|p| p.quantity_lots)
            .unwrap_or_default())
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    /// Closes every sandbox account.
    pub async fn close(&self) {
        self.accounts.close_all().await;
        if !self.is_sandbox() {
            warn!("Live accounts are left as they are");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::{flat_candle, paper_instrument, PaperBroker};
    use crate::types::MarginAttributes;
    use crate::utils::connectivity::AlwaysOnline;
    use rust_decimal_macros::dec;

    fn settings() -> EnvSettings {
        EnvSettings {
            channel_capacity: 16,
            send_timeout: Duration::from_millis(50),
            order_poll_interval: Duration::from_millis(5),
            reconnect_delay: Duration::from_millis(10),
            history_lookback_days: 5,
        }
    }

    fn env(broker: &Arc<PaperBroker>) -> TradeEnv {
        TradeEnv::new(broker.clone(), broker.clone(), Arc::new(AlwaysOnline), settings())
    }

    #[test]
    fn lots_include_fee_on_both_sides() {
        let instrument = paper_instrument("F1", "AAA", "rub");
        assert_eq!(
            TradeEnv::lots_can_afford(Side::Buy, dec!(1000), &instrument, dec!(99), dec!(0.01)),
            10
        );
        assert_eq!(
            TradeEnv::lots_can_afford(Side::Buy, dec!(1000), &instrument, dec!(100), dec!(0.01)),
            9
        );
        assert_eq!(
            TradeEnv::lots_can_afford(Side::Sell, dec!(1000), &instrument, dec!(100), dec!(0.01)),
            10
        );
        assert_eq!(
            TradeEnv::lots_can_afford(Side::Buy, dec!(0), &instrument, dec!(100), dec!(0)),
            0
        );
    }

    #[tokio::test]
    async fn deal_value_without_margin() {
        let broker = Arc::new(PaperBroker::new(true, 16));
        let instrument = paper_instrument("F1", "AAA", "rub");
        broker.add_instrument(instrument.clone()).await;
        broker.set_price("F1", dec!(10)).await;
        let env = env(&broker);
        let acc = env
            .accounts
            .create_sandbox_account(&HashMap::from([("rub".to_string(), dec!(500))]))
            .await
            .unwrap();

        let buy = env
            .max_deal_value(&acc, Side::Buy, &instrument, dec!(10), false)
            .await
            .unwrap();
        assert_eq!(buy, dec!(500));

        assert_eq!(
            env.max_deal_value(&acc, Side::Sell, &instrument, dec!(10), false)
                .await
                .unwrap(),
            dec!(0)
        );
        env.executor()
            .place(&instrument, 3, None, Side::Buy, &acc, crate::types::OrderType::Market)
            .await
            .unwrap();
        assert_eq!(env.lots_have(&acc, "F1").await.unwrap(), dec!(3));
        assert_eq!(
            env.max_deal_value(&acc, Side::Sell, &instrument, dec!(12), false)
                .await
                .unwrap(),
            dec!(36)
        );
    }

    #[tokio::test]
    async fn deal_value_with_margin() {
        let broker = Arc::new(PaperBroker::new(true, 16));
        let mut instrument = paper_instrument("F1", "AAA", "rub");
        instrument.dlong = dec!(0.5);
        instrument.dshort = dec!(0.25);
        instrument.short_enabled = true;
        broker
            .set_margin(
                "acc",
                MarginAttributes {
                    liquid_portfolio: dec!(1000),
                    starting_margin: dec!(200),
                },
            )
            .await;
        let env = env(&broker);

        assert_eq!(
            env.max_deal_value("acc", Side::Buy, &instrument, dec!(1), true)
                .await
                .unwrap(),
            dec!(1600)
        );
        assert_eq!(
            env.max_deal_value("acc", Side::Sell, &instrument, dec!(1), true)
                .await
                .unwrap(),
            dec!(3200)
        );
    }

    #[tokio::test]
    async fn last_candles_walks_back_day_by_day() {
        let broker = Arc::new(PaperBroker::new(true, 16));
        let now = Utc::now();
        let candles: Vec<Candle> = (1..=3)
            .map(|d| flat_candle("F1", CandleInterval::Hour, Decimal::from(d), now - ChronoDuration::days(d) - ChronoDuration::hours(1)))
            .collect();
        broker.add_candles(candles).await;
        let env = env(&broker);

        let got = env
            .last_candles("F1", CandleInterval::Hour, 2)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].time < got[1].time);
        assert_eq!(got[1].close, dec!(1));

        assert!(env.last_candles("F1", CandleInterval::Hour, 10).await.is_err());
    }
}
