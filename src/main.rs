// src/main.rs
use crate::app::{App, AppSettings};
use crate::config::{AppConfig, BrokerMode};
use crate::connectors::paper::{paper_instrument, PaperBroker};
use crate::connectors::tinkoff::{TinkoffClient, TinkoffSettings};
use crate::core::bot::BotSettings;
use crate::core::engine::{EnvSettings, TradeEnv};
use crate::storage::journal::Journal;
use crate::storage::{AnnotationSink, LogSink, PersistenceSink};
use crate::types::CandleInterval;
use crate::utils::connectivity::{AlwaysOnline, ConnectivityProbe, HttpProbe};
use dotenvy::dotenv;
use futures::future::select_all;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod app;
mod config;
mod connectors;
mod core;
mod error;
mod storage;
mod strategies;
mod types;
mod utils;

const PAPER_START_PRICE: i64 = 100;
const PAPER_LIVE_ACCOUNT: &str = "paper-live";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let cfg = AppConfig::new()?;
    let _log_guard = utils::logging::init(&cfg.logging)?;

    info!("========================================");
    info!("       TRADE ENV - v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!(
        "Broker: {:?} | combat: {} | bots: {}",
        cfg.broker.mode,
        if cfg.combat.enabled { "enabled" } else { "disabled" },
        cfg.bots.len()
    );

    // 2. Initialize Environments
    let probe: Arc<dyn ConnectivityProbe> = match &cfg.runtime.probe_url {
        Some(url) => Arc::new(HttpProbe::new(url.clone(), cfg.runtime.probe_timeout())),
        None => Arc::new(AlwaysOnline),
    };
    let settings = EnvSettings::from(&cfg.runtime);

    let mut paper_brokers: Vec<(bool, Arc<PaperBroker>)> = Vec::new();
    let (sandbox, combat) = match cfg.broker.mode {
        BrokerMode::Paper => {
            let sandbox_broker = paper_broker(&cfg, true).await;
            let sandbox = paper_env(&sandbox_broker, &probe, &settings);
            paper_brokers.push((true, sandbox_broker));

            let combat = if cfg.combat.enabled {
                let combat_broker = paper_broker(&cfg, false).await;
                let funding: Vec<(&str, Decimal)> = cfg
                    .sandbox
                    .funding
                    .iter()
                    .map(|(currency, amount)| (currency.as_str(), *amount))
                    .collect();
                combat_broker.add_account(PAPER_LIVE_ACCOUNT, &funding).await;
                let env = paper_env(&combat_broker, &probe, &settings);
                paper_brokers.push((false, combat_broker));
                Some(env)
            } else {
                None
            };
            (sandbox, combat)
        }
        BrokerMode::Tinkoff => {
            let sandbox = tinkoff_env(&cfg, cfg.broker.sandbox_token()?, true, &probe, &settings);
            let combat = if cfg.combat.enabled {
                Some(tinkoff_env(&cfg, cfg.broker.combat_token()?, false, &probe, &settings))
            } else {
                None
            };
            (sandbox, combat)
        }
    };

    // 3. Sinks
    let mut journal_task: Option<JoinHandle<()>> = None;
    let (persistence, annotations): (Arc<dyn PersistenceSink>, Arc<dyn AnnotationSink>) =
        match &cfg.journal.path {
            Some(path) => {
                let (journal, handle) = Journal::spawn(
                    path.clone(),
                    cfg.runtime.channel_capacity,
                    cfg.journal.flush_interval(),
                )
                .await?;
                journal_task = Some(handle);
                let journal = Arc::new(journal);
                (journal.clone(), journal)
            }
            None => (Arc::new(LogSink), Arc::new(LogSink)),
        };

    let app = App::new(
        sandbox,
        combat,
        AppSettings {
            bot: BotSettings {
                cooldown: cfg.runtime.cooldown(),
                restart_delay: cfg.runtime.restart_delay(),
            },
            combat_fee: cfg.combat.tariff.fee(),
            sandbox_accounts: cfg.sandbox.accounts,
            sandbox_funding: cfg.sandbox.funding.clone(),
        },
        persistence,
        annotations,
    );

    // 4. Paper feeds
    let mut feeds: HashSet<(bool, String, CandleInterval)> = HashSet::new();
    for bot in &cfg.bots {
        let Ok(interval) = bot.candle_interval.parse::<CandleInterval>() else {
            continue;
        };
        let Some((_, broker)) = paper_brokers.iter().find(|(sandbox, _)| *sandbox == bot.sandbox) else {
            continue;
        };
        if !feeds.insert((bot.sandbox, bot.figi.clone(), interval)) {
            continue;
        }
        broker
            .seed_history(
                &bot.figi,
                interval,
                Decimal::from(PAPER_START_PRICE),
                bot.window.max(2) * 2,
                chrono::Utc::now(),
            )
            .await;
        broker.spawn_random_walk(
            bot.figi.clone(),
            interval,
            bot.order_book_depth,
            Decimal::from(PAPER_START_PRICE),
            cfg.runtime.paper_tick(),
            app.shutdown_signal(),
        );
    }

    // 5. Run
    let supervisors = match app.start(cfg.bots.clone()).await {
        Ok(supervisors) => supervisors,
        Err(e) => {
            error!("Failed to start: {:#}", e);
            app.shutdown().await;
            return Err(e);
        }
    };

    for bot in app.list_bots().await {
        info!("Running {} ({} on {})", bot.name, bot.strategy, bot.figi);
    }
    for sandbox in [true, false] {
        if let Ok(accounts) = app.list_accounts(sandbox).await {
            for account in accounts {
                info!(
                    "{} account {}: {:?}",
                    if sandbox { "Sandbox" } else { "Combat" },
                    account.id,
                    account.positions
                );
            }
        }
    }

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Ctrl+C received");
            Ok(())
        }
        (finished, _, _) = select_all(supervisors) => match finished {
            Ok(Ok(())) => {
                warn!("Market data supervisor stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e)),
            Err(e) => Err(anyhow::Error::new(e)),
        },
    };

    app.shutdown().await;
    drop(app);
    if let Some(handle) = journal_task {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Journal did not flush in time");
        }
    }

    if let Err(e) = &outcome {
        error!("Fatal: {:#}", e);
    }
    outcome
}

/// In paper mode every configured figi becomes a tradable share.
async fn paper_broker(cfg: &AppConfig, sandbox: bool) -> Arc<PaperBroker> {
    let broker = Arc::new(PaperBroker::new(sandbox, cfg.runtime.channel_capacity));
    for bot in cfg.bots.iter().filter(|b| b.sandbox == sandbox) {
        broker.add_instrument(paper_instrument(&bot.figi, &bot.figi, "rub")).await;
    }
    broker
}

fn paper_env(
    broker: &Arc<PaperBroker>,
    probe: &Arc<dyn ConnectivityProbe>,
    settings: &EnvSettings,
) -> Arc<TradeEnv> {
    Arc::new(TradeEnv::new(
        broker.clone(),
        broker.clone(),
        probe.clone(),
        settings.clone(),
    ))
}

fn tinkoff_env(
    cfg: &AppConfig,
    token: &str,
    sandbox: bool,
    probe: &Arc<dyn ConnectivityProbe>,
    settings: &EnvSettings,
) -> Arc<TradeEnv> {
    let client = Arc::new(TinkoffClient::new(TinkoffSettings {
        rest_url: cfg.broker.rest_url.clone(),
        ws_url: cfg.broker.ws_url.clone(),
        token: token.to_string(),
        app_name: cfg.broker.app_name.clone(),
        sandbox,
        channel_capacity: cfg.runtime.channel_capacity,
    }));
    Arc::new(TradeEnv::new(
        client.clone(),
        client,
        probe.clone(),
        settings.clone(),
    ))
}
