// src/core/multiplexer.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use crate::connectors::traits::{MarketDataEvent, SubscriptionStatus, Topic};
use crate::core::subscriptions::SubscriptionTable;
use crate::error::SubscriptionError;
use crate::types::{BotId, Candle, OrderBook, TradingStatus};

/// Receiving ends handed to one bot.
pub struct MarketDataChannelStack {
    pub trading_status: mpsc::Receiver<TradingStatus>,
    pub candle: mpsc::Receiver<Candle>,
    pub order_book: mpsc::Receiver<OrderBook>,
}

#[derive(Clone)]
struct BotSenders {
    trading_status: mpsc::Sender<TradingStatus>,
    candle: mpsc::Sender<Candle>,
    order_book: mpsc::Sender<OrderBook>,
}

/// Fans every inbound market-data event out to the bots whose
/// subscription matches it.
pub struct StreamMultiplexer {
    table: Arc<SubscriptionTable>,
    senders: RwLock<HashMap<BotId, BotSenders>>,
    capacity: usize,
    send_timeout: Duration,
}

impl StreamMultiplexer {
    pub fn new(table: Arc<SubscriptionTable>, capacity: usize, send_timeout: Duration) -> Self {
        Self {
            table,
            senders: RwLock::new(HashMap::new()),
            capacity,
            send_timeout,
        }
    }

    /// Creates the bot's channels, replacing any previous set.
    pub async fn register(&self, bot_id: &str) -> MarketDataChannelStack {
        let (trading_status_tx, trading_status) = mpsc::channel(self.capacity);
        let (candle_tx, candle) = mpsc::channel(self.capacity);
        let (order_book_tx, order_book) = mpsc::channel(self.capacity);
        self.senders.write().await.insert(
            bot_id.to_string(),
            BotSenders {
                trading_status: trading_status_tx,
                candle: candle_tx,
                order_book: order_book_tx,
            },
        );
        MarketDataChannelStack {
            trading_status,
            candle,
            order_book,
        }
    }

    pub async fn deregister(&self, bot_id: &str) {
        self.senders.write().await.remove(bot_id);
    }

    /// Routes one event. A refused subscription is returned as an error;
    /// everything else is delivered or logged.
    pub async fn dispatch(&self, event: MarketDataEvent) -> Result<(), SubscriptionError> {
        match event {
            MarketDataEvent::SubscriptionAck(acks) => {
                for ack in acks {
                    if let SubscriptionStatus::Failed(status) = ack.status {
                        return Err(SubscriptionError {
                            kind: ack.kind.to_string(),
                            figi: ack.figi,
                            status,
                        });
                    }
                }
            }
            MarketDataEvent::TradingStatus(status) => {
                let topic = Topic::Info {
                    figi: status.figi.clone(),
                };
                for (bot_id, senders) in self.targets(&topic).await {
                    self.deliver(&bot_id, "trading status", &senders.trading_status, status.clone())
                        .await;
                }
            }
            MarketDataEvent::Candle(candle) => {
                let topic = Topic::Candles {
                    figi: candle.figi.clone(),
                    interval: candle.interval,
                };
                for (bot_id, senders) in self.targets(&topic).await {
                    self.deliver(&bot_id, "candle", &senders.candle, candle.clone())
                        .await;
                }
            }
            MarketDataEvent::OrderBook(book) => {
                let topic = Topic::OrderBook {
                    figi: book.figi.clone(),
                    depth: book.depth,
                };
                for (bot_id, senders) in self.targets(&topic).await {
                    self.deliver(&bot_id, "order book", &senders.order_book, book.clone())
                        .await;
                }
            }
            MarketDataEvent::Error(e) => {
                warn!("Stream error reached the dispatcher: {}", e);
            }
        }
        Ok(())
    }

    async fn targets(&self, topic: &Topic) -> Vec<(BotId, BotSenders)> {
        let bots = self.table.subscribers(topic).await;
        let senders = self.senders.read().await;
        bots.into_iter()
            .filter_map(|bot_id| senders.get(&bot_id).cloned().map(|s| (bot_id, s)))
            .collect()
    }

    async fn deliver<T>(&self, bot_id: &str, what: &str, tx: &mpsc::Sender<T>, item: T) {
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!(bot = %bot_id, "{} channel is full, waiting", what);
                if tx.send_timeout(item, self.send_timeout).await.is_err() {
                    error!(
                        bot = %bot_id,
                        "Dropped {} after waiting {:?} for a full channel",
                        what,
                        self.send_timeout
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(bot = %bot_id, "{} channel closed", what);
            }
        }
    }
}
