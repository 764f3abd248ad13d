// src/app.rs
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::BotConfig;
use crate::core::bot::{Bot, BotSettings, BotSetup, BotStatus};
use crate::core::engine::TradeEnv;
use crate::error::{BrokerResult, ConfigError, SubscriptionError};
use crate::storage::{AnnotationSink, PersistenceSink};
use crate::strategies::StrategyFactory;
use crate::types::{AccountSnapshot, BotId, CandleInterval, InstrumentType};

pub struct AppSettings {
    pub bot: BotSettings,
    /// Fraction charged by the live tariff.
    pub combat_fee: Decimal,
    pub sandbox_accounts: usize,
    pub sandbox_funding: HashMap<String, Decimal>,
}

struct BotEntry {
    bot: Arc<Bot>,
    handle: Option<JoinHandle<()>>,
}

/// The runtime: both trading environments, the bot table and the sinks.
pub struct App {
    sandbox: Arc<TradeEnv>,
    combat: Option<Arc<TradeEnv>>,
    settings: AppSettings,
    factory: StrategyFactory,
    persistence: Arc<dyn PersistenceSink>,
    annotations: Arc<dyn AnnotationSink>,
    bots: Mutex<HashMap<BotId, BotEntry>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl App {
    pub fn new(
        sandbox: Arc<TradeEnv>,
        combat: Option<Arc<TradeEnv>>,
        settings: AppSettings,
        persistence: Arc<dyn PersistenceSink>,
        annotations: Arc<dyn AnnotationSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            sandbox,
            combat,
            settings,
            factory: StrategyFactory,
            persistence,
            annotations,
            bots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Flips to `true` once `shutdown` is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Brings both environments up, then creates and starts `bots`.
    /// Returns the market-data supervisors; one finishing with an error
    /// means a refused subscription.
    pub async fn start(
        &self,
        bots: Vec<BotConfig>,
    ) -> Result<Vec<JoinHandle<Result<(), SubscriptionError>>>> {
        let mut supervisors = vec![
            self.sandbox
                .start(
                    self.settings.sandbox_accounts,
                    &self.settings.sandbox_funding,
                    self.shutdown_tx.subscribe(),
                )
                .await?,
        ];
        if let Some(combat) = &self.combat {
            supervisors.push(
                combat
                    .start(0, &HashMap::new(), self.shutdown_tx.subscribe())
                    .await?,
            );
        }

        for config in bots {
            let id = self.create_bot(config).await?;
            self.start_bot(&id).await?;
        }
        Ok(supervisors)
    }

    /// Validates `config` and registers a bot for it. Returns the bot id.
    pub async fn create_bot(&self, config: BotConfig) -> Result<BotId> {
        let (env, fee) = if config.sandbox {
            (self.sandbox.clone(), config.fee / Decimal::ONE_HUNDRED)
        } else {
            let env = self.combat.clone().ok_or(ConfigError::CombatDisabled)?;
            (env, self.settings.combat_fee)
        };

        let interval = CandleInterval::from_str(&config.candle_interval)?;
        if !interval.supports_realtime() {
            return Err(ConfigError::UnsupportedInterval(config.candle_interval.clone()).into());
        }
        let instrument_type = InstrumentType::from_str(&config.instrument_type)?;
        if config.window < 2 {
            return Err(ConfigError::InvalidWindow(config.window).into());
        }
        self.factory
            .create(&config.strategy, &config.strategy_params)?;

        let instrument = env.instrument(&config.figi, instrument_type).await?;
        if config.allow_margin && !instrument.supports_margin() {
            return Err(ConfigError::MarginUnavailable {
                ticker: instrument.ticker,
                figi: instrument.figi,
            }
            .into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut name = format!("{} #{}", instrument.ticker, id);
        if config.sandbox {
            name = format!("[sandbox] {}", name);
        }

        let bot = Arc::new(Bot::new(BotSetup {
            id: id.clone(),
            name: name.clone(),
            config,
            interval,
            instrument_type,
            fee,
            env,
            factory: self.factory,
            persistence: self.persistence.clone(),
            annotations: self.annotations.clone(),
            settings: self.settings.bot.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }));
        self.bots
            .lock()
            .await
            .insert(id.clone(), BotEntry { bot, handle: None });
        info!("Created bot {}", name);
        Ok(id)
    }

    pub async fn start_bot(&self, id: &str) -> Result<(), ConfigError> {
        let mut bots = self.bots.lock().await;
        let entry = bots
            .get_mut(id)
            .ok_or_else(|| ConfigError::UnknownBot(id.to_string()))?;
        if entry.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Bot {} is already running", entry.bot.name);
            return Ok(());
        }
        entry.handle = Some(tokio::spawn(entry.bot.clone().serve()));
        Ok(())
    }

    /// Returns whether the bot is paused now.
    pub async fn toggle_pause(&self, id: &str) -> Result<bool, ConfigError> {
        let bots = self.bots.lock().await;
        let entry = bots
            .get(id)
            .ok_or_else(|| ConfigError::UnknownBot(id.to_string()))?;
        Ok(entry.bot.toggle_pause())
    }

    /// Unpauses the bot, tears it down and waits for its loop to exit.
    pub async fn remove_bot(&self, id: &str) -> Result<(), ConfigError> {
        let entry = self
            .bots
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| ConfigError::UnknownBot(id.to_string()))?;
        entry.bot.remove().await;
        if let Some(handle) = entry.handle {
            if let Err(e) = handle.await {
                error!("Bot {} task failed: {}", entry.bot.name, e);
            }
        }
        Ok(())
    }

    pub async fn list_bots(&self) -> Vec<BotStatus> {
        let mut bots: Vec<BotStatus> = self
            .bots
            .lock()
            .await
            .values()
            .map(|e| e.bot.status())
            .collect();
        bots.sort_by_key(|b| b.id.parse::<u64>().unwrap_or(u64::MAX));
        bots
    }

    pub async fn list_accounts(&self, sandbox: bool) -> Result<Vec<AccountSnapshot>, ConfigError> {
        if sandbox {
            return Ok(self.sandbox.accounts.snapshot().await);
        }
        match &self.combat {
            Some(env) => Ok(env.accounts.snapshot().await),
            None => Err(ConfigError::CombatDisabled),
        }
    }

    pub async fn create_sandbox_account(&self, funding: &HashMap<String, Decimal>) -> BrokerResult<String> {
        self.sandbox.accounts.create_sandbox_account(funding).await
    }

    pub async fn remove_sandbox_account(&self, id: &str) -> BrokerResult<()> {
        self.sandbox.accounts.remove_sandbox_account(id).await
    }

    /// Stops every bot and closes the sandbox accounts.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown_tx.send_replace(true);
        let entries: Vec<BotEntry> = self.bots.lock().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Some(handle) = entry.handle {
                if let Err(e) = handle.await {
                    error!("Bot {} task failed: {}", entry.bot.name, e);
                }
            }
        }
        self.sandbox.close().await;
        if let Some(combat) = &self.combat {
            combat.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrdersConfig;
    use crate::connectors::paper::{paper_instrument, PaperBroker};
    use crate::core::engine::EnvSettings;
    use crate::storage::LogSink;
    use crate::utils::connectivity::AlwaysOnline;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn env(broker: &Arc<PaperBroker>) -> Arc<TradeEnv> {
        Arc::new(TradeEnv::new(
            broker.clone(),
            broker.clone(),
            Arc::new(AlwaysOnline),
            EnvSettings {
                channel_capacity: 16,
                send_timeout: Duration::from_millis(50),
                order_poll_interval: Duration::from_millis(5),
                reconnect_delay: Duration::from_millis(10),
                history_lookback_days: 1,
            },
        ))
    }

    async fn app() -> (App, Arc<PaperBroker>) {
        let broker = Arc::new(PaperBroker::new(true, 16));
        broker.add_instrument(paper_instrument("F1", "AAA", "rub")).await;
        let app = App::new(
            env(&broker),
            None,
            AppSettings {
                bot: BotSettings {
                    cooldown: Duration::from_secs(60),
                    restart_delay: Duration::from_millis(20),
                },
                combat_fee: dec!(0.003),
                sandbox_accounts: 2,
                sandbox_funding: HashMap::from([("rub".to_string(), dec!(1000))]),
            },
            Arc::new(LogSink),
            Arc::new(LogSink),
        );
        (app, broker)
    }

    fn config() -> BotConfig {
        BotConfig {
            sandbox: true,
            figi: "F1".into(),
            instrument_type: "share".into(),
            allow_margin: false,
            fee: dec!(0.05),
            strategy: "bollinger".into(),
            strategy_params: serde_json::json!({}),
            candle_interval: "1min".into(),
            window: 20,
            order_book_depth: 10,
            orders: OrdersConfig::default(),
        }
    }

    fn config_error(err: anyhow::Error) -> ConfigError {
        err.downcast::<ConfigError>().unwrap()
    }

    #[tokio::test]
    async fn names_bots_by_ticker_and_id() {
        let (app, _) = app().await;
        let first = app.create_bot(config()).await.unwrap();
        let second = app.create_bot(config()).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("1", "2"));

        let bots = app.list_bots().await;
        assert_eq!(bots[0].name, "[sandbox] AAA #1");
        assert_eq!(bots[1].name, "[sandbox] AAA #2");
        assert!(!bots[0].paused);
    }

    #[tokio::test]
    async fn rejects_invalid_bot_configs() {
        let (app, _) = app().await;

        let mut hourly = config();
        hourly.candle_interval = "1hour".into();
        assert!(matches!(
            config_error(app.create_bot(hourly).await.unwrap_err()),
            ConfigError::UnsupportedInterval(_)
        ));

        let mut unknown = config();
        unknown.strategy = "martingale".into();
        assert!(matches!(
            config_error(app.create_bot(unknown).await.unwrap_err()),
            ConfigError::UnknownStrategy(_)
        ));

        let mut short = config();
        short.window = 1;
        assert!(matches!(
            config_error(app.create_bot(short).await.unwrap_err()),
            ConfigError::InvalidWindow(1)
        ));

        let mut margin = config();
        margin.allow_margin = true;
        assert!(matches!(
            config_error(app.create_bot(margin).await.unwrap_err()),
            ConfigError::MarginUnavailable { .. }
        ));

        let mut live = config();
        live.sandbox = false;
        assert!(matches!(
            config_error(app.create_bot(live).await.unwrap_err()),
            ConfigError::CombatDisabled
        ));

        let mut missing = config();
        missing.figi = "NOPE".into();
        assert!(app.create_bot(missing).await.is_err());
        assert!(app.list_bots().await.is_empty());
    }

    #[tokio::test]
    async fn controls_bots_and_cleans_up_on_shutdown() {
        let (app, broker) = app().await;
        app.start(vec![config()]).await.unwrap();
        assert_eq!(app.list_accounts(true).await.unwrap().len(), 2);
        assert!(app.list_accounts(false).await.is_err());

        assert!(app.toggle_pause("1").await.unwrap());
        assert!(app.list_bots().await[0].paused);
        assert!(matches!(
            app.toggle_pause("9").await,
            Err(ConfigError::UnknownBot(_))
        ));

        let id = app.create_bot(config()).await.unwrap();
        app.start_bot(&id).await.unwrap();
        app.remove_bot("1").await.unwrap();
        assert_eq!(app.list_bots().await.len(), 1);

        let extra = app
            .create_sandbox_account(&HashMap::from([("usd".to_string(), dec!(5))]))
            .await
            .unwrap();
        app.remove_sandbox_account(&extra).await.unwrap();
        assert_eq!(broker.closed_accounts().await, vec![extra]);

        tokio::time::timeout(Duration::from_secs(2), app.shutdown())
            .await
            .unwrap();
        assert_eq!(broker.closed_accounts().await.len(), 3);
        assert!(app.list_bots().await.is_empty());
    }
}
