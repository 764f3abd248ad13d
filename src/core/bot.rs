// src/core/bot.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::connectors::traits::Topic;
use crate::core::engine::TradeEnv;
use crate::core::multiplexer::MarketDataChannelStack;
use crate::core::orders::PendingStops;
use crate::core::supervisor::ConnectionState;
use crate::error::{ConfigError, OrderError};
use crate::storage::{AnnotationSink, OrderExecution, PersistenceSink};
use crate::strategies::signal::TradeSignal;
use crate::strategies::traits::{MarketData, Strategy};
use crate::strategies::StrategyFactory;
use crate::types::{
    BotId, Candle, CandleInterval, Instrument, InstrumentType, OrderBook, OrderType,
    SecurityTradingStatus, Side, TradingStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BotControl {
    pub paused: bool,
    pub removing: bool,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub cooldown: Duration,
    pub restart_delay: Duration,
}

/// Everything a bot is built from. Validated by the caller.
pub struct BotSetup {
    pub id: BotId,
    pub name: String,
    pub config: BotConfig,
    pub interval: CandleInterval,
    pub instrument_type: InstrumentType,
    /// Fraction, not percent.
    pub fee: Decimal,
    pub env: Arc<TradeEnv>,
    pub factory: StrategyFactory,
    pub persistence: Arc<dyn PersistenceSink>,
    pub annotations: Arc<dyn AnnotationSink>,
    pub settings: BotSettings,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotStatus {
    pub id: BotId,
    pub name: String,
    pub figi: String,
    pub strategy: String,
    pub sandbox: bool,
    pub paused: bool,
}

enum Intent {
    Open(PendingStops),
    Close,
}

/// Result of an order placed off the driver loop.
struct Completion {
    intent: Intent,
    side: Side,
    lots: i64,
    account_id: String,
    result: Result<Decimal, OrderError>,
}

/// Bot state that outlives a crash and restart.
struct DriverState {
    strategy: Box<dyn Strategy>,
    currency: Option<String>,
    account: Option<String>,
    prev_side: Option<Side>,
    stops: PendingStops,
    in_flight: bool,
    cooldown_until: Option<Instant>,
    trading: bool,
    order_book: Option<OrderBook>,
    live_time: Option<DateTime<Utc>>,
    history: Vec<Candle>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
}

enum Exit {
    Shutdown,
    Removed,
}

pub struct Bot {
    pub id: BotId,
    pub name: String,
    config: BotConfig,
    interval: CandleInterval,
    instrument_type: InstrumentType,
    fee: Decimal,
    env: Arc<TradeEnv>,
    factory: StrategyFactory,
    persistence: Arc<dyn PersistenceSink>,
    annotations: Arc<dyn AnnotationSink>,
    settings: BotSettings,
    control: watch::Sender<BotControl>,
    shutdown: watch::Receiver<bool>,
}

impl Bot {
    pub fn new(setup: BotSetup) -> Self {
        let (control, _) = watch::channel(BotControl::default());
        Self {
            id: setup.id,
            name: setup.name,
            config: setup.config,
            interval: setup.interval,
            instrument_type: setup.instrument_type,
            fee: setup.fee,
            env: setup.env,
            factory: setup.factory,
            persistence: setup.persistence,
            annotations: setup.annotations,
            settings: setup.settings,
            control,
            shutdown: setup.shutdown,
        }
    }

    pub fn status(&self) -> BotStatus {
        BotStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            figi: self.config.figi.clone(),
            strategy: self.config.strategy.clone(),
            sandbox: self.config.sandbox,
            paused: self.control.borrow().paused,
        }
    }

    /// Flips the pause flag and returns the new value.
    pub fn toggle_pause(&self) -> bool {
        let mut paused = false;
        self.control.send_modify(|c| {
            c.paused = !c.paused;
            paused = c.paused;
        });
        info!(bot = %self.name, paused, "Pause toggled");
        paused
    }

    /// Marks the bot for removal and drops its subscriptions. The driver
    /// loop notices and exits.
    pub async fn remove(&self) {
        self.control.send_modify(|c| {
            c.paused = false;
            c.removing = true;
        });
        self.env.subscriptions.unsubscribe_all(&self.id).await;
        info!(bot = %self.name, "Removing");
    }

    fn is_removing(&self) -> bool {
        self.control.borrow().removing
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow() || self.is_removing()
    }

    /// Runs the bot until shutdown or removal. Crashes are logged and the
    /// bot restarts after a delay; configuration errors stop it for good.
    pub async fn serve(self: Arc<Self>) {
        let strategy = match self
            .factory
            .create(&self.config.strategy, &self.config.strategy_params)
        {
            Ok(strategy) => strategy,
            Err(e) => {
                error!(bot = %self.name, "Cannot start: {}", e);
                return;
            }
        };
        let (completions_tx, completions_rx) = mpsc::channel(4);
        let mut state = DriverState {
            strategy,
            currency: None,
            account: None,
            prev_side: None,
            stops: PendingStops::default(),
            in_flight: false,
            cooldown_until: None,
            trading: false,
            order_book: None,
            live_time: None,
            history: Vec::new(),
            completions_tx,
            completions_rx,
        };

        info!(bot = %self.name, strategy = state.strategy.name(), "Bot started");
        loop {
            match self.run_once(&mut state).await {
                Ok(Exit::Shutdown | Exit::Removed) => break,
                Err(e) => {
                    if let Some(config) = e.downcast_ref::<ConfigError>() {
                        error!(bot = %self.name, "Stopped: {}", config);
                        break;
                    }
                    error!(bot = %self.name, "Crashed: {:#}", e);
                    if !self.sleep(self.settings.restart_delay).await {
                        break;
                    }
                    info!(bot = %self.name, "Restarting");
                }
            }
        }

        self.env.subscriptions.unsubscribe_all(&self.id).await;
        self.env.mux.deregister(&self.id).await;
        if let (Some(account), Some(currency)) = (state.account.take(), state.currency.take()) {
            if self.is_removing() {
                warn!(bot = %self.name, account = %account, "Removed while holding a position, releasing the account");
            }
            if state.in_flight {
                info!(bot = %self.name, account = %account, "Order in flight, the account is released once it completes");
                self.release_after_completion(state, account, currency);
            } else if let Err(e) = self.env.accounts.release(&account, &currency).await {
                warn!(bot = %self.name, "Release of {} failed: {}", account, e);
            }
        }
        info!(bot = %self.name, "Bot stopped");
    }

    /// The account stays occupied until the order placed on it settles.
    fn release_after_completion(&self, state: DriverState, account: String, currency: String) {
        let DriverState {
            completions_tx,
            mut completions_rx,
            ..
        } = state;
        drop(completions_tx);
        let env = self.env.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            match completions_rx.recv().await {
                Some(Completion { result: Ok(price), side, lots, .. }) => {
                    info!(bot = %name, "{} {} lots for {} on {} after the bot stopped", side, lots, price, account);
                }
                Some(Completion { result: Err(e), .. }) => {
                    warn!(bot = %name, "Order on {} failed after the bot stopped: {}", account, e);
                }
                None => warn!(bot = %name, "Order task on {} vanished", account),
            }
            if let Err(e) = env.accounts.release(&account, &currency).await {
                warn!(bot = %name, "Release of {} failed: {}", account, e);
            }
        });
    }

    /// Sleeps unless shutdown or removal comes first.
    async fn sleep(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        let mut control = self.control.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_stopping(),
            _ = shutdown.wait_for(|s| *s) => false,
            _ = control.wait_for(|c| c.removing) => false,
        }
    }

    async fn run_once(&self, state: &mut DriverState) -> Result<Exit> {
        let mut shutdown = self.shutdown.clone();
        let mut control = self.control.subscribe();

        let instrument = self
            .env
            .instrument(&self.config.figi, self.instrument_type)
            .await?;
        if self.config.allow_margin && !instrument.supports_margin() {
            return Err(ConfigError::MarginUnavailable {
                ticker: instrument.ticker.clone(),
                figi: instrument.figi.clone(),
            }
            .into());
        }
        state.currency = Some(instrument.currency.clone());

        let mut connection = self.env.connection_state();
        tokio::select! {
            ready = connection.wait_for(|s| *s == ConnectionState::Connected) => {
                if ready.is_err() {
                    anyhow::bail!("market data supervisor is gone");
                }
            }
            _ = shutdown.wait_for(|s| *s) => return Ok(Exit::Shutdown),
            _ = control.wait_for(|c| c.removing) => return Ok(Exit::Removed),
        }

        let mut stack = self.env.mux.register(&self.id).await;
        self.subscribe().await?;
        info!(
            bot = %self.name,
            "Trading {} ({}) on {} candles, window {}, margin {}, fee {}",
            instrument.ticker, instrument.figi, self.interval, self.config.window,
            self.config.allow_margin, self.fee
        );

        let exit = self
            .drive(state, &instrument, &mut stack, &mut shutdown, &mut control)
            .await;
        self.env.mux.deregister(&self.id).await;
        exit
    }

    async fn subscribe(&self) -> Result<()> {
        let figi = self.config.figi.clone();
        let table = &self.env.subscriptions;
        table.subscribe(&self.id, Topic::Info { figi: figi.clone() }).await?;
        table
            .subscribe(
                &self.id,
                Topic::Candles {
                    figi: figi.clone(),
                    interval: self.interval,
                },
            )
            .await?;
        table
            .subscribe(
                &self.id,
                Topic::OrderBook {
                    figi,
                    depth: self.config.order_book_depth,
                },
            )
            .await?;
        Ok(())
    }

    async fn drive(
        &self,
        state: &mut DriverState,
        instrument: &Instrument,
        stack: &mut MarketDataChannelStack,
        shutdown: &mut watch::Receiver<bool>,
        control: &mut watch::Receiver<BotControl>,
    ) -> Result<Exit> {
        loop {
            if *shutdown.borrow() {
                return Ok(Exit::Shutdown);
            }
            let paused = {
                let c = control.borrow();
                if c.removing {
                    return Ok(Exit::Removed);
                }
                c.paused
            };

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(Exit::Shutdown);
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return Ok(Exit::Removed);
                    }
                }
                done = state.completions_rx.recv() => {
                    if let Some(done) = done {
                        self.on_completion(state, instrument, done).await?;
                    }
                }
                status = stack.trading_status.recv() => match status {
                    Some(status) => self.on_trading_status(state, status),
                    None => anyhow::bail!("trading status channel closed"),
                },
                book = stack.order_book.recv() => match book {
                    Some(book) => state.order_book = Some(book),
                    None => anyhow::bail!("order book channel closed"),
                },
                candle = stack.candle.recv() => match candle {
                    Some(candle) if !paused => self.on_candle(state, instrument, candle).await?,
                    Some(_) => {}
                    None => anyhow::bail!("candle channel closed"),
                },
            }
        }
    }

    fn on_trading_status(&self, state: &mut DriverState, status: TradingStatus) {
        let trading = status.status == SecurityTradingStatus::NormalTrading;
        if trading != state.trading {
            info!(bot = %self.name, status = ?status.status, "Trading status changed");
        }
        state.trading = trading;
    }

    async fn on_candle(
        &self,
        state: &mut DriverState,
        instrument: &Instrument,
        candle: Candle,
    ) -> Result<()> {
        if state.live_time != Some(candle.time) {
            let fetched = self
                .env
                .last_candles(&self.config.figi, self.interval, self.config.window)
                .await?;
            let mut history: Vec<Candle> = fetched
                .into_iter()
                .filter(|c| c.time < candle.time)
                .collect();
            let keep = self.config.window.saturating_sub(1);
            if history.len() > keep {
                history.drain(..history.len() - keep);
            }
            if state.live_time.is_none() {
                self.persistence.on_historic_candles(&self.name, &history);
            }
            state.history = history;
            state.live_time = Some(candle.time);
            debug!(bot = %self.name, time = %candle.time, "New candle");
        }
        self.persistence.on_live_candle_update(&self.name, &candle);

        if state.account.is_some() && !state.in_flight {
            if let Some(fired) = state.stops.check(candle.close) {
                info!(bot = %self.name, kind = ?fired.kind, trigger = %fired.trigger_price, "Stop order fired");
                let signal = TradeSignal::from_stop(&fired, candle.close);
                return self.act(state, instrument, signal).await;
            }
        }

        let mut window = state.history.clone();
        window.push(candle.clone());
        let (signal, output) = state.strategy.trade_signal(
            instrument,
            MarketData {
                candles: &window,
                order_book: state.order_book.as_ref(),
            },
            &self.config.orders,
        );
        self.persistence.on_strategy_output(&self.name, candle.time, &output);

        match signal {
            Some(signal) => self.act(state, instrument, signal).await,
            None => Ok(()),
        }
    }

    async fn act(
        &self,
        state: &mut DriverState,
        instrument: &Instrument,
        mut signal: TradeSignal,
    ) -> Result<()> {
        if state.in_flight {
            debug!(bot = %self.name, "Order in flight, signal ignored");
            return Ok(());
        }
        if let Some(until) = state.cooldown_until {
            if Instant::now() < until {
                debug!(bot = %self.name, "Cooling down, signal ignored");
                return Ok(());
            }
            state.cooldown_until = None;
        }

        match state.account.clone() {
            None => {
                if !state.trading {
                    debug!(bot = %self.name, "Instrument is not trading, signal ignored");
                    return Ok(());
                }
                let Some(mut lease) = self.env.accounts.acquire(&instrument.currency).await else {
                    warn!(bot = %self.name, "No free account in {}", instrument.currency);
                    state.cooldown_until = Some(Instant::now() + self.settings.cooldown);
                    return Ok(());
                };
                let max_deal_value = self
                    .env
                    .max_deal_value(
                        lease.account_id(),
                        signal.side,
                        instrument,
                        signal.price,
                        self.config.allow_margin,
                    )
                    .await?;
                let lots = TradeEnv::lots_can_afford(
                    signal.side,
                    max_deal_value,
                    instrument,
                    signal.price,
                    self.fee,
                );
                if lots == 0 {
                    info!(
                        bot = %self.name,
                        "Can't afford a lot on {} (max deal value {}), cooling down",
                        lease.account_id(), max_deal_value
                    );
                    lease.discard();
                    state.cooldown_until = Some(Instant::now() + self.settings.cooldown);
                    return Ok(());
                }
                let account_id = lease.commit();
                state.account = Some(account_id.clone());
                let stops = signal.take_stops();
                self.place(state, instrument, &signal, lots, account_id, Intent::Open(stops));
            }
            Some(account_id) => {
                if state.prev_side == Some(signal.side) {
                    return Ok(());
                }
                let held = self.env.lots_have(&account_id, &instrument.figi).await?;
                let lots = held.abs().trunc().to_i64().unwrap_or(0);
                if lots == 0 {
                    info!(bot = %self.name, "Nothing left to close on {}", account_id);
                    self.finish_position(state, instrument, &account_id).await;
                    return Ok(());
                }
                self.place(state, instrument, &signal, lots, account_id, Intent::Close);
            }
        }
        Ok(())
    }

    fn place(
        &self,
        state: &mut DriverState,
        instrument: &Instrument,
        signal: &TradeSignal,
        lots: i64,
        account_id: String,
        intent: Intent,
    ) {
        state.in_flight = true;
        let env = self.env.clone();
        let tx = state.completions_tx.clone();
        let instrument = instrument.clone();
        let side = signal.side;
        let order_type = signal.order_type;
        let price = match order_type {
            OrderType::Limit => Some(signal.price),
            OrderType::Market => None,
        };
        tokio::spawn(async move {
            let result = env
                .executor()
                .place(&instrument, lots, price, side, &account_id, order_type)
                .await;
            let _ = tx
                .send(Completion {
                    intent,
                    side,
                    lots,
                    account_id,
                    result,
                })
                .await;
        });
    }

    async fn on_completion(
        &self,
        state: &mut DriverState,
        instrument: &Instrument,
        done: Completion,
    ) -> Result<()> {
        state.in_flight = false;
        let price = match done.result {
            Ok(price) => price,
            Err(e) => {
                if let Intent::Open(_) = done.intent {
                    self.finish_position(state, instrument, &done.account_id).await;
                }
                return Err(e.into());
            }
        };

        info!(
            bot = %self.name,
            "{} {} lots of {} for {} on {}",
            done.side, done.lots, instrument.ticker, price, done.account_id
        );
        self.annotations.on_order_executed(
            &self.name,
            &OrderExecution {
                figi: instrument.figi.clone(),
                account_id: done.account_id.clone(),
                side: done.side,
                lots: done.lots,
                price,
                time: Utc::now(),
            },
        );

        match done.intent {
            Intent::Open(stops) => {
                state.prev_side = Some(done.side);
                state.stops = stops;
            }
            Intent::Close => self.finish_position(state, instrument, &done.account_id).await,
        }
        Ok(())
    }

    /// Frees the held account and forgets the position.
    async fn finish_position(&self, state: &mut DriverState, instrument: &Instrument, account_id: &str) {
        state.account = None;
        state.prev_side = None;
        state.stops.clear();
        if let Err(e) = self.env.accounts.release(account_id, &instrument.currency).await {
            warn!(bot = %self.name, "Release of {} failed: {}", account_id, e);
        }
    }
}
