// src/core/supervisor.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::connectors::traits::{MarketDataConnection, MarketDataEvent, StreamClient};
use crate::core::multiplexer::StreamMultiplexer;
use crate::core::subscriptions::SubscriptionTable;
use crate::error::SubscriptionError;
use crate::utils::connectivity::{wait_for_connectivity, ConnectivityProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

enum Outcome {
    Shutdown,
    Lost(String),
}

/// Owns the market-data receive loop and keeps it alive across
/// connection losses.
pub struct ReconnectSupervisor {
    stream: Arc<dyn StreamClient>,
    table: Arc<SubscriptionTable>,
    mux: Arc<StreamMultiplexer>,
    probe: Arc<dyn ConnectivityProbe>,
    reconnect_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl ReconnectSupervisor {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        table: Arc<SubscriptionTable>,
        mux: Arc<StreamMultiplexer>,
        probe: Arc<dyn ConnectivityProbe>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            stream,
            table,
            mux,
            probe,
            reconnect_delay,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Runs until shutdown. Only a refused subscription ends it early.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SubscriptionError> {
        loop {
            self.state_tx.send_replace(ConnectionState::Reconnecting);
            let Some(connection) = self.connect(&mut shutdown).await else {
                break;
            };
            let MarketDataConnection { requests, mut events } = connection;

            self.table.link().set(Some(requests)).await;
            let failures = self.table.replay().await;
            if !failures.is_empty() {
                warn!("{} topics could not be resubscribed", failures.len());
            }
            self.state_tx.send_replace(ConnectionState::Connected);
            info!("Market data stream connected");

            let outcome = loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break Outcome::Shutdown;
                        }
                    }
                    event = events.recv() => match event {
                        None => break Outcome::Lost("stream ended".to_string()),
                        Some(MarketDataEvent::Error(e)) => break Outcome::Lost(e.to_string()),
                        Some(event) => {
                            if let Err(e) = self.mux.dispatch(event).await {
                                error!("{}", e);
                                self.table.link().set(None).await;
                                self.state_tx.send_replace(ConnectionState::Disconnected);
                                return Err(e);
                            }
                        }
                    },
                }
            };

            self.table.link().set(None).await;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            match outcome {
                Outcome::Shutdown => break,
                Outcome::Lost(reason) => {
                    warn!("Market data stream lost: {}", reason);
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    if !wait_for_connectivity(self.probe.as_ref(), self.reconnect_delay, &mut shutdown)
                        .await
                    {
                        break;
                    }
                    info!("Reconnecting market data stream");
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Market data supervisor stopped");
        Ok(())
    }

    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<MarketDataConnection> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.stream.connect_market_data().await {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    warn!("Market data connect failed: {}", e);
                    if !self.pause(shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps one reconnect delay. False when shutdown interrupted it.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::{flat_candle, PaperBroker};
    use crate::connectors::traits::{MarketDataRequest, Topic};
    use crate::core::subscriptions::RequestLink;
    use crate::types::CandleInterval;
    use crate::utils::connectivity::AlwaysOnline;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Harness {
        broker: Arc<PaperBroker>,
        table: Arc<SubscriptionTable>,
        mux: Arc<StreamMultiplexer>,
        supervisor: Arc<ReconnectSupervisor>,
    }

    fn harness() -> Harness {
        let broker = Arc::new(PaperBroker::new(true, 64));
        let table = Arc::new(SubscriptionTable::new(RequestLink::default()));
        let mux = Arc::new(StreamMultiplexer::new(table.clone(), 64, Duration::from_millis(50)));
        let supervisor = Arc::new(ReconnectSupervisor::new(
            broker.clone(),
            table.clone(),
            mux.clone(),
            Arc::new(AlwaysOnline),
            Duration::from_millis(10),
        ));
        Harness {
            broker,
            table,
            mux,
            supervisor,
        }
    }

    async fn wait_connected(supervisor: &ReconnectSupervisor) {
        let mut state = supervisor.state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn replays_subscriptions_after_reconnect() {
        let h = harness();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = h.supervisor.clone();
        let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
        wait_connected(&h.supervisor).await;

        let mut stack = h.mux.register("1").await;
        let topic = Topic::Candles {
            figi: "F1".into(),
            interval: CandleInterval::OneMinute,
        };
        h.table.subscribe("1", topic.clone()).await.unwrap();

        let mut state = h.supervisor.state();
        h.broker.drop_connection().await;
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        wait_connected(&h.supervisor).await;
        assert_eq!(h.broker.connections().await, 2);

        let mut subscribes = 0;
        for _ in 0..100 {
            subscribes = h
                .broker
                .requests()
                .await
                .into_iter()
                .filter(|r| *r == MarketDataRequest::Subscribe(topic.clone()))
                .count();
            if subscribes == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subscribes, 2);
        assert_eq!(h.table.snapshot().await.len(), 1);

        let candle = flat_candle("F1", CandleInterval::OneMinute, dec!(1), Utc::now());
        assert!(h.broker.push(MarketDataEvent::Candle(candle.clone())).await);
        let got = tokio::time::timeout(Duration::from_secs(2), stack.candle.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(candle));

        shutdown_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn keeps_retrying_while_broker_is_down() {
        let h = harness();
        h.broker.set_online(false).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = h.supervisor.clone();
        let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.supervisor.state().borrow(), ConnectionState::Reconnecting);
        h.broker.set_online(true).await;
        wait_connected(&h.supervisor).await;

        shutdown_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(*h.supervisor.state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_subscription_stops_the_loop() {
        let h = harness();
        h.broker.reject_subscriptions("BAD").await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = h.supervisor.clone();
        let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
        wait_connected(&h.supervisor).await;

        h.table
            .subscribe("1", Topic::Info { figi: "BAD".into() })
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.figi, "BAD");
    }
}
