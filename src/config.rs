// src/config.rs

use config::{Config, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::OrderType;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    #[default]
    Paper,
    Tinkoff,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub rest_url: String,
    pub ws_url: String,
    pub sandbox_token: Option<String>,
    pub combat_token: Option<String>,
    pub app_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Paper,
            rest_url: "https://invest-public-api.tinkoff.ru/rest".to_string(),
            ws_url: "wss://invest-public-api.tinkoff.ru/ws/".to_string(),
            sandbox_token: None,
            combat_token: None,
            app_name: "trade_env".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn sandbox_token(&self) -> Result<&str, ConfigError> {
        self.sandbox_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken("APP_BROKER__SANDBOX_TOKEN"))
    }

    pub fn combat_token(&self) -> Result<&str, ConfigError> {
        self.combat_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken("APP_BROKER__COMBAT_TOKEN"))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channel_capacity: usize,
    pub send_timeout_ms: u64,
    pub order_poll_interval_ms: u64,
    pub cooldown_secs: u64,
    pub restart_delay_secs: u64,
    pub reconnect_delay_secs: u64,
    pub probe_url: Option<String>,
    pub probe_timeout_ms: u64,
    pub history_lookback_days: u32,
    /// Paper mode only: how often the random-walk feed ticks.
    pub paper_tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            send_timeout_ms: 500,
            order_poll_interval_ms: 1000,
            cooldown_secs: 60,
            restart_delay_secs: 10,
            reconnect_delay_secs: 5,
            probe_url: None,
            probe_timeout_ms: 3000,
            history_lookback_days: 30,
            paper_tick_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn paper_tick(&self) -> Duration {
        Duration::from_millis(self.paper_tick_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Accounts opened at startup.
    pub accounts: usize,
    pub funding: HashMap<String, Decimal>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            accounts: 1,
            funding: HashMap::from([("rub".to_string(), Decimal::from(100_000))]),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tariff {
    #[default]
    Investor,
    Trader,
    Premium,
}

impl Tariff {
    pub fn fee(self) -> Decimal {
        match self {
            Tariff::Investor => Decimal::new(3, 3),
            Tariff::Trader => Decimal::new(4, 4),
            Tariff::Premium => Decimal::new(25, 5),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CombatConfig {
    pub enabled: bool,
    pub tariff: Tariff,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily rolling log files go here when set.
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct JournalConfig {
    pub path: Option<String>,
    pub flush_interval_ms: Option<u64>,
}

impl JournalConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.unwrap_or(1000))
    }
}

/// How a bot's entries and their protective stops are placed.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OrdersConfig {
    pub order_type: OrderType,
    pub stop_loss_order_type: OrderType,
    pub take_profit_ratio: Decimal,
    pub stop_loss_ratio: Decimal,
    /// Stop-limit only: how far below (above, for shorts) the entry the limit sits.
    pub stop_loss_exec_ratio: Decimal,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            order_type: OrderType::Market,
            stop_loss_order_type: OrderType::Market,
            take_profit_ratio: Decimal::new(1, 2),
            stop_loss_ratio: Decimal::new(1, 2),
            stop_loss_exec_ratio: Decimal::new(15, 3),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_depth() -> u32 {
    10
}

fn default_window() -> usize {
    20
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// A bot definition. Used both for bots listed in the settings file and
/// for bots created at runtime.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BotConfig {
    #[serde(default = "default_true")]
    pub sandbox: bool,
    pub figi: String,
    pub instrument_type: String,
    #[serde(default)]
    pub allow_margin: bool,
    /// Percent. Ignored for live bots, which pay the tariff fee.
    #[serde(default)]
    pub fee: Decimal,
    pub strategy: String,
    #[serde(default = "default_params")]
    pub strategy_params: serde_json::Value,
    pub candle_interval: String,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_depth")]
    pub order_book_depth: u32,
    #[serde(default)]
    pub orders: OrdersConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub runtime: RuntimeConfig,
    pub sandbox: SandboxConfig,
    pub combat: CombatConfig,
    pub logging: LoggingConfig,
    pub journal: JournalConfig,
    pub bots: Vec<BotConfig>,
}

impl AppConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    #[cfg(test)]
    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
