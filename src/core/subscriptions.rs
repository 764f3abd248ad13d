// src/core/subscriptions.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::connectors::traits::{MarketDataRequest, Topic, TopicKind};
use crate::error::{BrokerError, BrokerResult};
use crate::types::BotId;

/// Outbound half of whichever market-data connection is currently live.
#[derive(Clone, Default)]
pub struct RequestLink {
    sender: Arc<RwLock<Option<mpsc::Sender<MarketDataRequest>>>>,
}

impl RequestLink {
    pub async fn set(&self, sender: Option<mpsc::Sender<MarketDataRequest>>) {
        *self.sender.write().await = sender;
    }

    pub async fn send(&self, request: MarketDataRequest) -> BrokerResult<()> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;
        sender
            .send(request)
            .await
            .map_err(|_| BrokerError::StreamClosed)
    }
}

/// Which topics each bot asked for. One entry per (bot, topic kind).
/// Survives reconnects; the supervisor replays it onto every new connection.
pub struct SubscriptionTable {
    entries: RwLock<HashMap<(BotId, TopicKind), Topic>>,
    link: RequestLink,
}

impl SubscriptionTable {
    pub fn new(link: RequestLink) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            link,
        }
    }

    pub fn link(&self) -> &RequestLink {
        &self.link
    }

    /// Subscribes remotely, then records. A topic of the same kind that the
    /// bot held before is replaced.
    pub async fn subscribe(&self, bot_id: &str, topic: Topic) -> BrokerResult<()> {
        let mut entries = self.entries.write().await;
        self.link
            .send(MarketDataRequest::Subscribe(topic.clone()))
            .await?;

        let previous = entries.insert((bot_id.to_string(), topic.kind()), topic.clone());
        if let Some(previous) = previous.filter(|p| *p != topic) {
            if !entries.values().any(|t| *t == previous) {
                if let Err(e) = self
                    .link
                    .send(MarketDataRequest::Unsubscribe(previous.clone()))
                    .await
                {
                    debug!(bot = %bot_id, "Unsubscribe of replaced {:?} failed: {}", previous, e);
                }
            }
        }
        debug!(bot = %bot_id, ?topic, "Subscribed");
        Ok(())
    }

    /// Drops the bot's entry of `kind`. The remote topic is only
    /// unsubscribed when no other bot still uses it.
    pub async fn unsubscribe(&self, bot_id: &str, kind: TopicKind) -> BrokerResult<()> {
        let mut entries = self.entries.write().await;
        let Some(topic) = entries.remove(&(bot_id.to_string(), kind)) else {
            return Ok(());
        };
        if entries.values().any(|t| *t == topic) {
            return Ok(());
        }
        self.link.send(MarketDataRequest::Unsubscribe(topic)).await
    }

    pub async fn unsubscribe_all(&self, bot_id: &str) {
        for kind in [TopicKind::Candle, TopicKind::Info, TopicKind::OrderBook] {
            if let Err(e) = self.unsubscribe(bot_id, kind).await {
                debug!(bot = %bot_id, "Unsubscribe {} failed: {}", kind, e);
            }
        }
    }

    /// Bots subscribed to exactly `topic`.
    pub async fn subscribers(&self, topic: &Topic) -> Vec<BotId> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, t)| *t == topic)
            .map(|((bot_id, _), _)| bot_id.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<(BotId, Topic)> {
        let mut rows: Vec<(BotId, Topic)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|((bot_id, _), topic)| (bot_id.clone(), topic.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.kind().cmp(&b.1.kind())));
        rows
    }

    /// Re-issues every distinct topic on the current connection. Each
    /// failure is returned, the rest are still attempted.
    pub async fn replay(&self) -> Vec<(Topic, BrokerError)> {
        let entries = self.entries.read().await;
        let mut seen = HashSet::new();
        let mut failures = Vec::new();
        for topic in entries.values() {
            if !seen.insert(topic.clone()) {
                continue;
            }
            if let Err(e) = self
                .link
                .send(MarketDataRequest::Subscribe(topic.clone()))
                .await
            {
                warn!(?topic, "Resubscribe failed: {}", e);
                failures.push((topic.clone(), e));
            }
        }
        debug!("Replayed {} topics", seen.len());
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandleInterval;

    fn candles(figi: &str) -> Topic {
        Topic::Candles {
            figi: figi.into(),
            interval: CandleInterval::OneMinute,
        }
    }

    async fn connected() -> (SubscriptionTable, mpsc::Receiver<MarketDataRequest>) {
        let (tx, rx) = mpsc::channel(64);
        let link = RequestLink::default();
        link.set(Some(tx)).await;
        (SubscriptionTable::new(link), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<MarketDataRequest>) -> Vec<MarketDataRequest> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_entry() {
        let table = SubscriptionTable::new(RequestLink::default());
        let err = table.subscribe("1", candles("F1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert!(table.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn shared_topic_stays_until_last_holder_leaves() {
        let (table, mut rx) = connected().await;
        table.subscribe("1", candles("F1")).await.unwrap();
        table.subscribe("2", candles("F1")).await.unwrap();
        assert_eq!(table.subscribers(&candles("F1")).await.len(), 2);
        drain(&mut rx);

        table.unsubscribe("1", TopicKind::Candle).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        table.unsubscribe_all("2").await;
        assert_eq!(
            drain(&mut rx),
            vec![MarketDataRequest::Unsubscribe(candles("F1"))]
        );
        assert!(table.subscribers(&candles("F1")).await.is_empty());
    }

    #[tokio::test]
    async fn resubscribing_a_kind_replaces_the_topic() {
        let (table, mut rx) = connected().await;
        table.subscribe("1", candles("F1")).await.unwrap();
        table.subscribe("1", candles("F2")).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                MarketDataRequest::Subscribe(candles("F1")),
                MarketDataRequest::Subscribe(candles("F2")),
                MarketDataRequest::Unsubscribe(candles("F1")),
            ]
        );
        assert_eq!(table.snapshot().await, vec![("1".to_string(), candles("F2"))]);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (table, mut rx) = connected().await;
        table.subscribe("1", candles("F1")).await.unwrap();
        table.subscribe("2", candles("F1")).await.unwrap();
        table
            .subscribe("2", Topic::Info { figi: "F1".into() })
            .await
            .unwrap();
        let before = table.snapshot().await;
        drain(&mut rx);

        assert!(table.replay().await.is_empty());
        let first = drain(&mut rx);
        assert!(table.replay().await.is_empty());
        let second = drain(&mut rx);

        assert_eq!(first.len(), 2);
        assert_eq!(first.len(), second.len());
        assert_eq!(table.snapshot().await, before);
    }

    #[tokio::test]
    async fn replay_reports_each_failure() {
        let (table, rx) = connected().await;
        table.subscribe("1", candles("F1")).await.unwrap();
        table.subscribe("2", candles("F2")).await.unwrap();
        drop(rx);

        let failures = table.replay().await;
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|(_, e)| matches!(e, BrokerError::StreamClosed)));
        assert_eq!(table.snapshot().await.len(), 2);
    }
}
