// src/storage/journal.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::storage::{AnnotationSink, OrderExecution, PersistenceSink};
use crate::strategies::traits::StrategyOutput;
use crate::types::Candle;

const FLUSH_EVERY_N_ENTRIES: u32 = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    HistoricCandles {
        bot: String,
        candles: Vec<Candle>,
    },
    LiveCandle {
        bot: String,
        candle: Candle,
    },
    StrategyOutput {
        bot: String,
        time: DateTime<Utc>,
        values: StrategyOutput,
    },
    OrderExecuted {
        bot: String,
        execution: OrderExecution,
    },
}

/// Appends every entry as one JSON line. Writing happens on a background
/// task; a full queue drops the entry.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<JournalEntry>,
}

impl Journal {
    /// The writer task ends once every clone of the journal is dropped.
    pub async fn spawn(
        path: String,
        capacity: usize,
        flush_every: Duration,
    ) -> Result<(Self, JoinHandle<()>)> {
        let writer = open_writer(&path).await?;
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(write_loop(rx, writer, path, flush_every));
        Ok((Self { tx }, handle))
    }

    fn record(&self, entry: JournalEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("Journal queue full, entry dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => error!("Journal writer is gone"),
        }
    }
}

impl PersistenceSink for Journal {
    fn on_historic_candles(&self, bot: &str, candles: &[Candle]) {
        self.record(JournalEntry::HistoricCandles {
            bot: bot.to_string(),
            candles: candles.to_vec(),
        });
    }

    fn on_live_candle_update(&self, bot: &str, candle: &Candle) {
        self.record(JournalEntry::LiveCandle {
            bot: bot.to_string(),
            candle: candle.clone(),
        });
    }

    fn on_strategy_output(&self, bot: &str, time: DateTime<Utc>, output: &StrategyOutput) {
        if output.is_empty() {
            return;
        }
        self.record(JournalEntry::StrategyOutput {
            bot: bot.to_string(),
            time,
            values: output.clone(),
        });
    }
}

impl AnnotationSink for Journal {
    fn on_order_executed(&self, bot: &str, execution: &OrderExecution) {
        self.record(JournalEntry::OrderExecuted {
            bot: bot.to_string(),
            execution: execution.clone(),
        });
    }
}

async fn open_writer(path: &str) -> Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create journal directory {:?}", parent))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open journal {}", path))?;
    Ok(BufWriter::new(file))
}

async fn write_loop(
    mut rx: mpsc::Receiver<JournalEntry>,
    mut writer: BufWriter<fs::File>,
    path: String,
    flush_every: Duration,
) {
    info!(%path, "Journal started");
    let mut tick = interval(flush_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let Some(entry) = entry else {
                    break;
                };
                let mut line = match serde_json::to_vec(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Journal: failed to serialize entry: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = writer.write_all(&line).await {
                    error!("Journal: write failed, reopening: {}", e);
                    match open_writer(&path).await {
                        Ok(fresh) => {
                            writer = fresh;
                            if let Err(e) = writer.write_all(&line).await {
                                error!("Journal: write failed again, entry dropped: {}", e);
                                continue;
                            }
                        }
                        Err(e) => {
                            error!("Journal: {:#}", e);
                            continue;
                        }
                    }
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY_N_ENTRIES {
                    flush(&mut writer).await;
                    since_flush = 0;
                }
            }
            _ = tick.tick() => {
                flush(&mut writer).await;
                since_flush = 0;
            }
        }
    }

    flush(&mut writer).await;
    info!("Journal stopped");
}

async fn flush(writer: &mut BufWriter<fs::File>) {
    if let Err(e) = writer.flush().await {
        error!("Journal: flush failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::flat_candle;
    use crate::types::{CandleInterval, Side};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn writes_one_json_line_per_entry() {
        let path = std::env::temp_dir()
            .join(format!("trade_env-{}", uuid::Uuid::new_v4()))
            .join("journal.jsonl");
        let path = path.to_string_lossy().into_owned();
        let (journal, handle) = Journal::spawn(path.clone(), 16, Duration::from_secs(60))
            .await
            .unwrap();

        let candle = flat_candle("F1", CandleInterval::OneMinute, dec!(10), Utc::now());
        journal.on_historic_candles("AAA #1", &[candle.clone(), candle.clone()]);
        journal.on_live_candle_update("AAA #1", &candle);
        journal.on_strategy_output("AAA #1", Utc::now(), &StrategyOutput::new());
        journal.on_strategy_output(
            "AAA #1",
            Utc::now(),
            &StrategyOutput::from([("bollinger_lower_bound".to_string(), 9.5)]),
        );
        journal.on_order_executed(
            "AAA #1",
            &OrderExecution {
                figi: "F1".into(),
                account_id: "paper-1".into(),
                side: Side::Buy,
                lots: 3,
                price: dec!(10),
                time: Utc::now(),
            },
        );
        drop(journal);
        handle.await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "historic_candles");
        assert_eq!(lines[0]["candles"].as_array().unwrap().len(), 2);
        assert_eq!(lines[2]["values"]["bollinger_lower_bound"], 9.5);
        assert_eq!(lines[3]["execution"]["lots"], 3);
    }

    #[tokio::test]
    async fn flush_failure_is_logged_not_fatal() {
        let path = std::env::temp_dir().join(format!("trade_env-{}.jsonl", uuid::Uuid::new_v4()));
        fs::write(&path, b"").await.unwrap();
        // read-only handle: the buffered write succeeds, the flush fails
        let mut writer = BufWriter::new(fs::File::open(&path).await.unwrap());
        writer.write_all(b"{}\n").await.unwrap();
        flush(&mut writer).await;
        assert!(writer.flush().await.is_err());
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "");
        fs::remove_file(&path).await.unwrap();
    }
}
