// src/core/orders.rs
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectors::traits::{BrokerClient, StreamClient};
use crate::error::OrderError;
use crate::types::{
    average_fill_price, ExecutionStatus, Fill, Instrument, OrderRequest, OrderTrades, OrderType,
    Side,
};

/// Fills for orders nobody waits for are kept this long.
const ORPHAN_TTL: Duration = Duration::from_secs(300);

#[derive(Default)]
struct HubState {
    waiting: HashMap<String, mpsc::Sender<Vec<Fill>>>,
    orphans: HashMap<String, (Instant, Vec<Fill>)>,
}

/// Routes trade-fill stream events to the order that is waiting for them.
/// Fills that arrive before their order registers are buffered.
#[derive(Default)]
pub struct TradesHub {
    state: Mutex<HubState>,
}

impl TradesHub {
    pub async fn register(&self, order_id: &str) -> mpsc::Receiver<Vec<Fill>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().await;
        if let Some((_, early)) = state.orphans.remove(order_id) {
            let _ = tx.try_send(early);
        }
        state.waiting.insert(order_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, order_id: &str) {
        self.state.lock().await.waiting.remove(order_id);
    }

    pub async fn route(&self, trades: OrderTrades) {
        let sender = {
            let mut state = self.state.lock().await;
            state
                .orphans
                .retain(|_, (seen, _)| seen.elapsed() < ORPHAN_TTL);
            match state.waiting.get(&trades.order_id) {
                Some(tx) => Some(tx.clone()),
                None => {
                    state
                        .orphans
                        .entry(trades.order_id.clone())
                        .or_insert_with(|| (Instant::now(), Vec::new()))
                        .1
                        .extend(trades.trades.iter().copied());
                    None
                }
            }
        };
        if let Some(tx) = sender {
            if tx.send(trades.trades).await.is_err() {
                debug!(order = %trades.order_id, "Order stopped waiting for fills");
            }
        }
    }

    /// Pumps the trade-fill stream of `account_ids` into the hub,
    /// reopening it whenever it ends, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        stream: Arc<dyn StreamClient>,
        account_ids: Vec<String>,
        retry_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match stream.connect_trades(account_ids.clone()).await {
                Ok(mut rx) => {
                    info!("Trades stream opened for {} accounts", account_ids.len());
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return;
                                }
                            }
                            trades = rx.recv() => match trades {
                                Some(trades) => self.route(trades).await,
                                None => break,
                            },
                        }
                    }
                    warn!("Trades stream ended");
                }
                Err(e) => warn!("Failed to open trades stream: {}", e),
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }
}

/// Submits orders and waits for them to fill.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    trades: Option<Arc<TradesHub>>,
    poll_interval: Duration,
}

impl OrderExecutor {
    /// Sandbox executors poll order state; pass a hub to wait on pushed fills.
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        trades: Option<Arc<TradesHub>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            trades,
            poll_interval,
        }
    }

    /// Places an order of `quantity` lots and returns its average fill price.
    pub async fn place(
        &self,
        instrument: &Instrument,
        quantity: i64,
        price: Option<Decimal>,
        side: Side,
        account_id: &str,
        order_type: OrderType,
    ) -> Result<Decimal, OrderError> {
        let request = OrderRequest {
            figi: instrument.figi.clone(),
            quantity,
            price,
            side,
            account_id: account_id.to_string(),
            order_type,
            order_id: Uuid::new_v4().to_string(),
        };

        info!(
            "Placing {} {} x{} @ {:?} on {} ({})",
            side, instrument.ticker, quantity, price, account_id, request.order_id
        );

        match &self.trades {
            Some(hub) => {
                // fills are keyed by the broker's id; early ones wait in the hub
                let order_id = self.submit(&request).await?;
                let fills = hub.register(&order_id).await;
                let result = self
                    .await_fills(&request.account_id, &order_id, quantity * instrument.lot, fills)
                    .await;
                hub.unregister(&order_id).await;
                result
            }
            None => self.await_polled(&request).await,
        }
    }

    async fn submit(&self, request: &OrderRequest) -> Result<String, OrderError> {
        let response = self.broker.post_order(request).await?;
        if matches!(
            response.status,
            ExecutionStatus::Cancelled | ExecutionStatus::Rejected
        ) {
            return Err(OrderError::Terminal {
                order_id: response.id,
                status: response.status,
            });
        }
        Ok(response.id)
    }

    async fn await_polled(&self, request: &OrderRequest) -> Result<Decimal, OrderError> {
        let order_id = self.submit(request).await?;
        loop {
            let state = self
                .broker
                .get_order_state(&request.account_id, &order_id)
                .await?;
            match state.status {
                ExecutionStatus::Filled => {
                    let price = average_fill_price(&state.fills).unwrap_or(state.avg_fill_price);
                    debug!(order = %order_id, %price, "Order filled");
                    return Ok(price);
                }
                ExecutionStatus::Cancelled | ExecutionStatus::Rejected => {
                    return Err(OrderError::Terminal {
                        order_id,
                        status: state.status,
                    });
                }
                ExecutionStatus::New | ExecutionStatus::PartiallyFilled => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Waits for pushed fills. The periodic state check settles the order
    /// when the fill stream missed some of them.
    async fn await_fills(
        &self,
        account_id: &str,
        order_id: &str,
        target_units: i64,
        mut rx: mpsc::Receiver<Vec<Fill>>,
    ) -> Result<Decimal, OrderError> {
        let mut fills: Vec<Fill> = Vec::new();
        let mut check = tokio::time::interval(self.poll_interval);
        check.tick().await;

        loop {
            tokio::select! {
                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        return Err(OrderError::FillStreamClosed(order_id.to_string()));
                    };
                    fills.extend(batch);
                    let units: i64 = fills.iter().map(|f| f.quantity).sum();
                    if units >= target_units {
                        let price = average_fill_price(&fills).unwrap_or_default();
                        debug!(order = %order_id, %price, "Order filled");
                        return Ok(price);
                    }
                }
                _ = check.tick() => {
                    let state = self.broker.get_order_state(account_id, order_id).await?;
                    match state.status {
                        ExecutionStatus::Filled => {
                            let price = average_fill_price(&state.fills)
                                .or_else(|| average_fill_price(&fills))
                                .unwrap_or(state.avg_fill_price);
                            debug!(order = %order_id, %price, "Order filled, confirmed by state check");
                            return Ok(price);
                        }
                        ExecutionStatus::Cancelled | ExecutionStatus::Rejected => {
                            return Err(OrderError::Terminal {
                                order_id: order_id.to_string(),
                                status: state.status,
                            });
                        }
                        ExecutionStatus::New | ExecutionStatus::PartiallyFilled => {}
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOrderKind {
    TakeProfit,
    StopLoss,
    StopLimit,
}

/// A protective order held locally and fired by the bot on a price tick.
#[derive(Debug, Clone, PartialEq)]
pub struct StopOrder {
    /// Side of the closing order.
    pub side: Side,
    pub kind: StopOrderKind,
    pub trigger_price: Decimal,
    pub limit_price: Option<Decimal>,
}

impl StopOrder {
    pub fn is_triggered(&self, price: Decimal) -> bool {
        match (self.kind, self.side) {
            (StopOrderKind::TakeProfit, Side::Sell) => price >= self.trigger_price,
            (StopOrderKind::TakeProfit, Side::Buy) => price <= self.trigger_price,
            (_, Side::Sell) => price <= self.trigger_price,
            (_, Side::Buy) => price >= self.trigger_price,
        }
    }
}

/// The stop-loss / take-profit pair guarding an open position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingStops {
    pub stop_loss: Option<StopOrder>,
    pub take_profit: Option<StopOrder>,
}

impl PendingStops {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none()
    }

    /// Fires at most one order. Stop-loss wins when both would trigger;
    /// firing clears the pair.
    pub fn check(&mut self, price: Decimal) -> Option<StopOrder> {
        let fired = self
            .stop_loss
            .iter()
            .chain(self.take_profit.iter())
            .find(|s| s.is_triggered(price))
            .cloned();
        if fired.is_some() {
            self.clear();
        }
        fired
    }

    pub fn clear(&mut self) {
        self.stop_loss = None;
        self.take_profit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::{paper_instrument, PaperBroker};
    use rust_decimal_macros::dec;

    fn stop(kind: StopOrderKind, side: Side, trigger: Decimal) -> StopOrder {
        StopOrder {
            side,
            kind,
            trigger_price: trigger,
            limit_price: None,
        }
    }

    #[test]
    fn trigger_table() {
        let tp = stop(StopOrderKind::TakeProfit, Side::Sell, dec!(100));
        assert!(tp.is_triggered(dec!(101)));
        assert!(!tp.is_triggered(dec!(99.99)));

        let sl = stop(StopOrderKind::StopLoss, Side::Buy, dec!(100));
        assert!(sl.is_triggered(dec!(101)));
        assert!(!sl.is_triggered(dec!(99)));

        assert!(stop(StopOrderKind::TakeProfit, Side::Buy, dec!(100)).is_triggered(dec!(100)));
        assert!(stop(StopOrderKind::StopLimit, Side::Sell, dec!(100)).is_triggered(dec!(99)));
    }

    #[test]
    fn only_one_stop_fires_and_both_clear() {
        // a degenerate pair where both trigger at the same price
        let mut stops = PendingStops {
            stop_loss: Some(stop(StopOrderKind::StopLoss, Side::Sell, dec!(100))),
            take_profit: Some(stop(StopOrderKind::TakeProfit, Side::Sell, dec!(90))),
        };
        let fired = stops.check(dec!(95)).unwrap();
        assert_eq!(fired.kind, StopOrderKind::StopLoss);
        assert!(stops.is_empty());
        assert!(stops.check(dec!(50)).is_none());
    }

    #[test]
    fn untouched_pair_stays_armed() {
        let mut stops = PendingStops {
            stop_loss: Some(stop(StopOrderKind::StopLoss, Side::Sell, dec!(90))),
            take_profit: Some(stop(StopOrderKind::TakeProfit, Side::Sell, dec!(110))),
        };
        assert!(stops.check(dec!(100)).is_none());
        assert!(!stops.is_empty());
        assert_eq!(stops.check(dec!(111)).unwrap().kind, StopOrderKind::TakeProfit);
    }

    async fn sandbox() -> (Arc<PaperBroker>, String) {
        let broker = Arc::new(PaperBroker::new(true, 16));
        broker.add_instrument(paper_instrument("F1", "AAA", "rub")).await;
        broker.set_price("F1", dec!(100)).await;
        let acc = broker.open_sandbox_account().await.unwrap();
        broker.sandbox_pay_in(&acc, "rub", dec!(10000)).await.unwrap();
        (broker, acc)
    }

    #[tokio::test]
    async fn polls_until_filled_and_averages_fills() {
        let (broker, acc) = sandbox().await;
        broker
            .script_order_states(vec![
                ExecutionStatus::New,
                ExecutionStatus::New,
                ExecutionStatus::PartiallyFilled,
                ExecutionStatus::Filled,
            ])
            .await;
        broker
            .script_fills(vec![
                Fill { price: dec!(100), quantity: 1 },
                Fill { price: dec!(103), quantity: 2 },
            ])
            .await;

        let executor = OrderExecutor::new(broker.clone(), None, Duration::from_millis(5));
        let instrument = paper_instrument("F1", "AAA", "rub");
        let price = executor
            .place(&instrument, 3, None, Side::Buy, &acc, OrderType::Market)
            .await
            .unwrap();
        assert_eq!(price, dec!(102));
        assert_eq!(broker.posted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_order_is_terminal() {
        let (broker, acc) = sandbox().await;
        broker
            .script_order_states(vec![ExecutionStatus::New, ExecutionStatus::Rejected])
            .await;
        let executor = OrderExecutor::new(broker.clone(), None, Duration::from_millis(5));
        let err = executor
            .place(&paper_instrument("F1", "AAA", "rub"), 1, None, Side::Buy, &acc, OrderType::Market)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderError::Terminal { status: ExecutionStatus::Rejected, .. }
        ));
    }

    #[tokio::test]
    async fn submission_errors_propagate() {
        let (broker, _) = sandbox().await;
        let executor = OrderExecutor::new(broker, None, Duration::from_millis(5));
        let err = executor
            .place(&paper_instrument("F1", "AAA", "rub"), 1, None, Side::Buy, "missing", OrderType::Market)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Broker(_)));
    }

    #[tokio::test]
    async fn combat_orders_complete_on_streamed_fills() {
        let broker = Arc::new(PaperBroker::new(false, 16));
        let mut instrument = paper_instrument("F1", "AAA", "rub");
        instrument.lot = 10;
        broker.add_instrument(instrument.clone()).await;
        broker.add_account("live", &[("rub", dec!(100000))]).await;
        broker
            .script_fills(vec![
                Fill { price: dec!(50), quantity: 10 },
                Fill { price: dec!(53), quantity: 20 },
            ])
            .await;

        let hub = Arc::new(TradesHub::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub.clone().run(
            broker.clone(),
            vec!["live".to_string()],
            Duration::from_millis(10),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let executor = OrderExecutor::new(broker.clone(), Some(hub), Duration::from_secs(5));
        let price = tokio::time::timeout(
            Duration::from_secs(2),
            executor.place(&instrument, 3, Some(dec!(50)), Side::Buy, "live", OrderType::Limit),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(price, dec!(52));
    }

    #[tokio::test]
    async fn streamed_fills_match_the_broker_assigned_id() {
        let broker = Arc::new(PaperBroker::new(false, 16));
        let instrument = paper_instrument("F1", "AAA", "rub");
        broker.add_instrument(instrument.clone()).await;
        broker.add_account("live", &[("rub", dec!(1000))]).await;
        broker.set_price("F1", dec!(10)).await;

        let hub = Arc::new(TradesHub::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub.clone().run(
            broker.clone(),
            vec!["live".to_string()],
            Duration::from_millis(10),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a state check would also settle the order, keep it out of reach
        let executor = OrderExecutor::new(broker.clone(), Some(hub), Duration::from_secs(60));
        let price = tokio::time::timeout(
            Duration::from_secs(2),
            executor.place(&instrument, 2, None, Side::Buy, "live", OrderType::Market),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(price, dec!(10));

        let request_id = broker.posted_orders().await[0].order_id.clone();
        assert!(broker.get_order_state("live", &request_id).await.is_err());
        assert_eq!(
            broker.get_order_state("live", "paper-order-1").await.unwrap().status,
            ExecutionStatus::Filled
        );
    }

    #[tokio::test]
    async fn state_check_settles_an_order_whose_fills_were_missed() {
        let broker = Arc::new(PaperBroker::new(false, 16));
        let instrument = paper_instrument("F1", "AAA", "rub");
        broker.add_instrument(instrument.clone()).await;
        broker.add_account("live", &[("rub", dec!(1000))]).await;
        broker
            .script_fills(vec![
                Fill { price: dec!(20), quantity: 1 },
                Fill { price: dec!(23), quantity: 2 },
            ])
            .await;

        // nothing pumps the fill stream into this hub
        let hub = Arc::new(TradesHub::default());
        let executor = OrderExecutor::new(broker.clone(), Some(hub), Duration::from_millis(10));
        let price = tokio::time::timeout(
            Duration::from_secs(2),
            executor.place(&instrument, 3, Some(dec!(20)), Side::Buy, "live", OrderType::Limit),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(price, dec!(22));
    }

    #[tokio::test]
    async fn early_fills_are_buffered() {
        let hub = TradesHub::default();
        hub.route(OrderTrades {
            order_id: "o-1".into(),
            account_id: "acc".into(),
            figi: "F1".into(),
            side: Side::Buy,
            trades: vec![Fill { price: dec!(5), quantity: 1 }],
        })
        .await;
        let mut rx = hub.register("o-1").await;
        assert_eq!(rx.recv().await.unwrap(), vec![Fill { price: dec!(5), quantity: 1 }]);
    }
}
