// src/connectors/paper.rs
//! In-memory broker. Fills orders against a mark price, keeps per-account
//! money and lot balances, and exposes a market-data stream that can be
//! fed, inspected and cut from the outside.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connectors::traits::{
    BrokerClient, MarketDataConnection, MarketDataEvent, MarketDataRequest, StreamClient,
    SubscriptionAck, SubscriptionStatus, Topic,
};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    average_fill_price, BookLevel, Candle, CandleInterval, ExecutionStatus, Fill, Instrument,
    InstrumentType, MarginAttributes, MoneyAmount, OrderBook, OrderRequest, OrderResponse,
    OrderState, OrderTrades, PortfolioPosition, Positions, SecurityPosition,
    SecurityTradingStatus, Side, TradingStatus,
};

/// A candle whose OHLC all equal `close`.
pub fn flat_candle(
    figi: &str,
    interval: CandleInterval,
    close: Decimal,
    time: DateTime<Utc>,
) -> Candle {
    Candle {
        figi: figi.to_string(),
        interval,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1,
        time,
    }
}

/// Start of the interval bucket `time` falls into.
pub fn bucket_start(time: DateTime<Utc>, interval: CandleInterval) -> DateTime<Utc> {
    let secs = interval.duration().num_seconds().max(1);
    let ts = time.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(time)
}

#[derive(Debug, Default)]
struct PaperAccount {
    money: HashMap<String, Decimal>,
    lots: HashMap<String, i64>,
}

#[derive(Debug)]
struct PaperOrder {
    account_id: String,
    pending: VecDeque<ExecutionStatus>,
    state: OrderState,
}

#[derive(Debug, Default)]
struct Ledger {
    accounts: HashMap<String, PaperAccount>,
    instruments: HashMap<String, Instrument>,
    candles: HashMap<(String, CandleInterval), Vec<Candle>>,
    marks: HashMap<String, Decimal>,
    margin: HashMap<String, MarginAttributes>,
    orders: HashMap<String, PaperOrder>,
    posted: Vec<OrderRequest>,
    closed: Vec<String>,
    failing_positions: HashSet<String>,
    order_script: Option<Vec<ExecutionStatus>>,
    fill_script: Option<Vec<Fill>>,
    next_account: u64,
    next_order: u64,
}

#[derive(Default)]
struct StreamState {
    generation: usize,
    opened: usize,
    events: Option<mpsc::Sender<MarketDataEvent>>,
    requests: Vec<MarketDataRequest>,
    rejected: HashSet<String>,
    offline: bool,
}

pub struct PaperBroker {
    sandbox: bool,
    capacity: usize,
    ledger: Mutex<Ledger>,
    stream: Arc<Mutex<StreamState>>,
    trade_listeners: Mutex<Vec<(Vec<String>, mpsc::Sender<OrderTrades>)>>,
}

impl PaperBroker {
    pub fn new(sandbox: bool, capacity: usize) -> Self {
        Self {
            sandbox,
            capacity,
            ledger: Mutex::new(Ledger::default()),
            stream: Arc::new(Mutex::new(StreamState::default())),
            trade_listeners: Mutex::new(Vec::new()),
        }
    }

    // ---- ledger setup -------------------------------------------------------

    pub async fn add_instrument(&self, instrument: Instrument) {
        self.ledger
            .lock()
            .await
            .instruments
            .insert(instrument.figi.clone(), instrument);
    }

    /// Registers an account directly, the way a live broker already has them.
    pub async fn add_account(&self, id: &str, money: &[(&str, Decimal)]) {
        let mut ledger = self.ledger.lock().await;
        let account = ledger.accounts.entry(id.to_string()).or_default();
        for (currency, amount) in money {
            account.money.insert(currency.to_string(), *amount);
        }
    }

    pub async fn add_candles(&self, candles: Vec<Candle>) {
        let mut ledger = self.ledger.lock().await;
        for candle in candles {
            ledger.marks.insert(candle.figi.clone(), candle.close);
            ledger
                .candles
                .entry((candle.figi.clone(), candle.interval))
                .or_default()
                .push(candle);
        }
        for series in ledger.candles.values_mut() {
            series.sort_by_key(|c| c.time);
        }
    }

    /// Fills `count` flat candles ending one interval before `until`.
    pub async fn seed_history(
        &self,
        figi: &str,
        interval: CandleInterval,
        price: Decimal,
        count: usize,
        until: DateTime<Utc>,
    ) {
        let last = bucket_start(until, interval);
        let candles = (1..=count as i32)
            .map(|i| flat_candle(figi, interval, price, last - interval.duration() * i))
            .collect();
        self.add_candles(candles).await;
    }

    pub async fn set_price(&self, figi: &str, price: Decimal) {
        self.ledger.lock().await.marks.insert(figi.to_string(), price);
    }

    #[cfg(test)]
    pub async fn set_margin(&self, account_id: &str, attributes: MarginAttributes) {
        self.ledger
            .lock()
            .await
            .margin
            .insert(account_id.to_string(), attributes);
    }

    /// The next posted order walks through `statuses` on successive state polls.
    #[cfg(test)]
    pub async fn script_order_states(&self, statuses: Vec<ExecutionStatus>) {
        self.ledger.lock().await.order_script = Some(statuses);
    }

    /// The next posted order is filled by exactly these executions.
    #[cfg(test)]
    pub async fn script_fills(&self, fills: Vec<Fill>) {
        self.ledger.lock().await.fill_script = Some(fills);
    }

    #[cfg(test)]
    pub async fn fail_positions(&self, account_id: &str, fail: bool) {
        let mut ledger = self.ledger.lock().await;
        if fail {
            ledger.failing_positions.insert(account_id.to_string());
        } else {
            ledger.failing_positions.remove(account_id);
        }
    }

    // ---- test inspection ----------------------------------------------------

    #[cfg(test)]
    pub async fn money(&self, account_id: &str, currency: &str) -> Decimal {
        let ledger = self.ledger.lock().await;
        ledger
            .accounts
            .get(account_id)
            .and_then(|a| a.money.get(currency))
            .copied()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn lots(&self, account_id: &str, figi: &str) -> i64 {
        let ledger = self.ledger.lock().await;
        ledger
            .accounts
            .get(account_id)
            .and_then(|a| a.lots.get(figi))
            .copied()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn posted_orders(&self) -> Vec<OrderRequest> {
        self.ledger.lock().await.posted.clone()
    }

    #[cfg(test)]
    pub async fn closed_accounts(&self) -> Vec<String> {
        self.ledger.lock().await.closed.clone()
    }

    // ---- stream control -----------------------------------------------------

    /// Delivers an event on the live connection. Returns false when there is none.
    pub async fn push(&self, event: MarketDataEvent) -> bool {
        let sender = self.stream.lock().await.events.clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Cuts the live connection; the consumer sees its event stream end.
    #[cfg(test)]
    pub async fn drop_connection(&self) {
        let mut stream = self.stream.lock().await;
        stream.events = None;
        stream.generation += 1;
    }

    #[cfg(test)]
    pub async fn set_online(&self, online: bool) {
        self.stream.lock().await.offline = !online;
    }

    #[cfg(test)]
    pub async fn reject_subscriptions(&self, figi: &str) {
        self.stream.lock().await.rejected.insert(figi.to_string());
    }

    #[cfg(test)]
    pub async fn requests(&self) -> Vec<MarketDataRequest> {
        self.stream.lock().await.requests.clone()
    }

    /// Number of market-data connections opened so far.
    #[cfg(test)]
    pub async fn connections(&self) -> usize {
        self.stream.lock().await.opened
    }

    /// Emits a random-walk candle, order book and trading status for `figi`
    /// every `period` until `shutdown` flips.
    pub fn spawn_random_walk(
        self: &Arc<Self>,
        figi: String,
        interval: CandleInterval,
        depth: u32,
        start_price: Decimal,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut price = start_price;
            let tick = Decimal::new(1, 2);
            let mut announced = false;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(period) => {
                        // ThreadRng is not Send, keep it out of the await
                        let steps = rand::thread_rng().gen_range(-5..=5);
                        price = (price + tick * Decimal::from(steps)).max(tick);
                        let now = Utc::now();
                        broker.set_price(&figi, price).await;
                        if !announced {
                            announced = broker
                                .push(MarketDataEvent::TradingStatus(TradingStatus {
                                    figi: figi.clone(),
                                    status: SecurityTradingStatus::NormalTrading,
                                    time: now,
                                }))
                                .await;
                        }
                        let candle = flat_candle(&figi, interval, price, bucket_start(now, interval));
                        broker.push(MarketDataEvent::Candle(candle)).await;
                        let book = OrderBook {
                            figi: figi.clone(),
                            depth,
                            bids: (1..=depth as i64)
                                .map(|i| BookLevel { price: price - tick * Decimal::from(i), quantity: 10 })
                                .collect(),
                            asks: (1..=depth as i64)
                                .map(|i| BookLevel { price: price + tick * Decimal::from(i), quantity: 10 })
                                .collect(),
                            time: now,
                        };
                        broker.push(MarketDataEvent::OrderBook(book)).await;
                    }
                }
            }
            debug!(figi = %figi, "Random walk feed stopped");
        })
    }

    async fn broadcast_trades(&self, trades: Vec<OrderTrades>) {
        let listeners: Vec<mpsc::Sender<OrderTrades>> = {
            let mut guard = self.trade_listeners.lock().await;
            guard.retain(|(_, tx)| !tx.is_closed());
            guard
                .iter()
                .filter(|(accounts, _)| {
                    trades
                        .first()
                        .map(|t| accounts.contains(&t.account_id))
                        .unwrap_or(false)
                })
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in listeners {
            for t in &trades {
                let _ = tx.send(t.clone()).await;
            }
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn is_sandbox(&self) -> bool {
        self.sandbox
    }

    async fn get_accounts(&self) -> BrokerResult<Vec<String>> {
        let ledger = self.ledger.lock().await;
        let mut ids: Vec<String> = ledger.accounts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open_sandbox_account(&self) -> BrokerResult<String> {
        let mut ledger = self.ledger.lock().await;
        ledger.next_account += 1;
        let id = format!("paper-{}", ledger.next_account);
        ledger.accounts.insert(id.clone(), PaperAccount::default());
        Ok(id)
    }

    async fn close_sandbox_account(&self, account_id: &str) -> BrokerResult<()> {
        let mut ledger = self.ledger.lock().await;
        ledger
            .accounts
            .remove(account_id)
            .ok_or_else(|| BrokerError::NotFound(format!("account {}", account_id)))?;
        ledger.closed.push(account_id.to_string());
        Ok(())
    }

    async fn sandbox_pay_in(
        &self,
        account_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> BrokerResult<Decimal> {
        let mut ledger = self.ledger.lock().await;
        let account = ledger
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| BrokerError::NotFound(format!("account {}", account_id)))?;
        let balance = account.money.entry(currency.to_string()).or_default();
        *balance += amount;
        Ok(*balance)
    }

    async fn get_positions(&self, account_id: &str) -> BrokerResult<Positions> {
        let ledger = self.ledger.lock().await;
        if ledger.failing_positions.contains(account_id) {
            return Err(BrokerError::Transport("positions unavailable".into()));
        }
        let account = ledger
            .accounts
            .get(account_id)
            .ok_or_else(|| BrokerError::NotFound(format!("account {}", account_id)))?;
        Ok(Positions {
            money: account
                .money
                .iter()
                .map(|(currency, amount)| MoneyAmount {
                    currency: currency.clone(),
                    amount: *amount,
                })
                .collect(),
            securities: account
                .lots
                .iter()
                .map(|(figi, lots)| SecurityPosition {
                    figi: figi.clone(),
                    balance: lots * ledger.instruments.get(figi).map(|i| i.lot).unwrap_or(1),
                })
                .collect(),
        })
    }

    async fn get_portfolio(&self, account_id: &str) -> BrokerResult<Vec<PortfolioPosition>> {
        let ledger = self.ledger.lock().await;
        let account = ledger
            .accounts
            .get(account_id)
            .ok_or_else(|| BrokerError::NotFound(format!("account {}", account_id)))?;
        Ok(account
            .lots
            .iter()
            .filter(|(_, lots)| **lots != 0)
            .map(|(figi, lots)| PortfolioPosition {
                figi: figi.clone(),
                quantity_lots: Decimal::from(*lots),
            })
            .collect())
    }

    async fn get_margin_attributes(&self, account_id: &str) -> BrokerResult<MarginAttributes> {
        let ledger = self.ledger.lock().await;
        ledger
            .margin
            .get(account_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("margin attributes of {}", account_id)))
    }

    async fn instrument_by_figi(
        &self,
        figi: &str,
        _instrument_type: InstrumentType,
    ) -> BrokerResult<Instrument> {
        let ledger = self.ledger.lock().await;
        ledger
            .instruments
            .get(figi)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("instrument {}", figi)))
    }

    async fn post_order(&self, request: &OrderRequest) -> BrokerResult<OrderResponse> {
        let (response, trades) = {
            let mut ledger = self.ledger.lock().await;
            let instrument = ledger
                .instruments
                .get(&request.figi)
                .cloned()
                .ok_or_else(|| BrokerError::NotFound(format!("instrument {}", request.figi)))?;
            let price = request
                .price
                .or_else(|| ledger.marks.get(&request.figi).copied())
                .ok_or_else(|| BrokerError::NotFound(format!("price of {}", request.figi)))?;
            if !ledger.accounts.contains_key(&request.account_id) {
                return Err(BrokerError::NotFound(format!("account {}", request.account_id)));
            }
            if request.quantity <= 0 {
                return Err(BrokerError::Api {
                    code: "30014".into(),
                    message: "quantity must be positive".into(),
                });
            }

            let mut pending: VecDeque<ExecutionStatus> = ledger
                .order_script
                .take()
                .unwrap_or_else(|| vec![ExecutionStatus::Filled])
                .into();
            let first = pending.front().copied().unwrap_or(ExecutionStatus::Filled);
            if pending.len() > 1 {
                pending.pop_front();
            }
            // an order that ends cancelled or rejected never trades
            let fills_at_all = !matches!(
                pending.back(),
                Some(ExecutionStatus::Cancelled | ExecutionStatus::Rejected)
            );

            let units = request.quantity * instrument.lot;
            let scripted = ledger.fill_script.take();
            let fills = if fills_at_all {
                scripted.unwrap_or_else(|| vec![Fill { price, quantity: units }])
            } else {
                Vec::new()
            };
            let notional: Decimal = fills
                .iter()
                .map(|f| f.price * Decimal::from(f.quantity))
                .sum();

            if let Some(account) = ledger
                .accounts
                .get_mut(&request.account_id)
                .filter(|_| fills_at_all)
            {
                let money = account.money.entry(instrument.currency.clone()).or_default();
                let lots = account.lots.entry(request.figi.clone()).or_default();
                match request.side {
                    Side::Buy => {
                        *money -= notional;
                        *lots += request.quantity;
                    }
                    Side::Sell => {
                        *money += notional;
                        *lots -= request.quantity;
                    }
                }
            }

            // the broker assigns its own id; the request id only deduplicates
            ledger.next_order += 1;
            let order_id = format!("paper-order-{}", ledger.next_order);
            let state = OrderState {
                id: order_id.clone(),
                status: first,
                requested_lots: request.quantity,
                executed_lots: 0,
                avg_fill_price: average_fill_price(&fills).unwrap_or(price),
                fills: fills.clone(),
            };
            ledger.orders.insert(
                order_id.clone(),
                PaperOrder {
                    account_id: request.account_id.clone(),
                    pending,
                    state,
                },
            );
            ledger.posted.push(request.clone());

            info!(
                "Paper {} {} x{} @ {} on {}",
                request.side, request.figi, request.quantity, price, request.account_id
            );

            let trades: Vec<OrderTrades> = fills
                .iter()
                .map(|f| OrderTrades {
                    order_id: order_id.clone(),
                    account_id: request.account_id.clone(),
                    figi: request.figi.clone(),
                    side: request.side,
                    trades: vec![*f],
                })
                .collect();
            let response = OrderResponse {
                id: order_id,
                figi: request.figi.clone(),
                status: first,
                requested_lots: request.quantity,
                executed_lots: if first == ExecutionStatus::Filled {
                    request.quantity
                } else {
                    0
                },
            };
            (response, trades)
        };

        if !self.sandbox {
            self.broadcast_trades(trades).await;
        }
        Ok(response)
    }

    async fn get_order_state(&self, account_id: &str, order_id: &str) -> BrokerResult<OrderState> {
        let mut ledger = self.ledger.lock().await;
        let order = ledger
            .orders
            .get_mut(order_id)
            .filter(|o| o.account_id == account_id)
            .ok_or_else(|| BrokerError::NotFound(format!("order {}", order_id)))?;
        let status = if order.pending.len() > 1 {
            order.pending.pop_front()
        } else {
            order.pending.front().copied()
        }
        .unwrap_or(ExecutionStatus::Filled);
        order.state.status = status;
        if status == ExecutionStatus::Filled {
            order.state.executed_lots = order.state.requested_lots;
        }
        Ok(order.state.clone())
    }

    async fn get_candles(
        &self,
        figi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: CandleInterval,
    ) -> BrokerResult<Vec<Candle>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .candles
            .get(&(figi.to_string(), interval))
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.time >= from && c.time < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl StreamClient for PaperBroker {
    async fn connect_market_data(&self) -> BrokerResult<MarketDataConnection> {
        let (request_tx, mut request_rx) = mpsc::channel::<MarketDataRequest>(self.capacity);
        let (event_tx, event_rx) = mpsc::channel::<MarketDataEvent>(self.capacity);
        let generation = {
            let mut stream = self.stream.lock().await;
            if stream.offline {
                return Err(BrokerError::Transport("paper broker is offline".into()));
            }
            stream.generation += 1;
            stream.opened += 1;
            stream.events = Some(event_tx);
            stream.generation
        };

        let stream = Arc::clone(&self.stream);
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let (sender, ack) = {
                    let mut state = stream.lock().await;
                    if state.generation != generation {
                        break;
                    }
                    state.requests.push(request.clone());
                    let ack = match &request {
                        MarketDataRequest::Subscribe(topic) => Some(ack_for(topic, &state.rejected)),
                        MarketDataRequest::Unsubscribe(_) => None,
                    };
                    (state.events.clone(), ack)
                };
                if let (Some(tx), Some(ack)) = (sender, ack) {
                    let _ = tx.send(MarketDataEvent::SubscriptionAck(vec![ack])).await;
                }
            }
        });

        Ok(MarketDataConnection {
            requests: request_tx,
            events: event_rx,
        })
    }

    async fn connect_trades(
        &self,
        account_ids: Vec<String>,
    ) -> BrokerResult<mpsc::Receiver<OrderTrades>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.trade_listeners.lock().await.push((account_ids, tx));
        Ok(rx)
    }
}

fn ack_for(topic: &Topic, rejected: &HashSet<String>) -> SubscriptionAck {
    let status = if rejected.contains(topic.figi()) {
        SubscriptionStatus::Failed("SUBSCRIPTION_STATUS_INSTRUMENT_NOT_FOUND".into())
    } else {
        SubscriptionStatus::Success
    };
    SubscriptionAck {
        kind: topic.kind(),
        figi: topic.figi().to_string(),
        status,
    }
}

/// A share in `currency` with lot 1 and a 0.01 price step.
pub fn paper_instrument(figi: &str, ticker: &str, currency: &str) -> Instrument {
    Instrument {
        figi: figi.to_string(),
        ticker: ticker.to_string(),
        instrument_type: InstrumentType::Share,
        currency: currency.to_string(),
        lot: 1,
        min_price_increment: Decimal::new(1, 2),
        dlong: Decimal::ZERO,
        dshort: Decimal::ZERO,
        short_enabled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn order(account: &str, side: Side, quantity: i64) -> OrderRequest {
        OrderRequest {
            figi: "F1".into(),
            quantity,
            price: None,
            side,
            account_id: account.into(),
            order_type: OrderType::Market,
            order_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn fills_market_orders_against_the_mark() {
        let broker = PaperBroker::new(true, 16);
        broker.add_instrument(paper_instrument("F1", "AAA", "rub")).await;
        broker.set_price("F1", dec!(50)).await;
        let acc = broker.open_sandbox_account().await.unwrap();
        broker.sandbox_pay_in(&acc, "rub", dec!(1000)).await.unwrap();

        let resp = broker.post_order(&order(&acc, Side::Buy, 4)).await.unwrap();
        assert_eq!(resp.status, ExecutionStatus::Filled);
        assert_eq!(broker.money(&acc, "rub").await, dec!(800));
        assert_eq!(broker.lots(&acc, "F1").await, 4);

        let portfolio = broker.get_portfolio(&acc).await.unwrap();
        assert_eq!(portfolio[0].quantity_lots, dec!(4));
    }

    #[tokio::test]
    async fn acks_subscriptions_and_logs_requests() {
        let broker = PaperBroker::new(true, 16);
        broker.reject_subscriptions("BAD").await;
        let mut conn = broker.connect_market_data().await.unwrap();

        let topic = Topic::Info { figi: "BAD".into() };
        conn.requests
            .send(MarketDataRequest::Subscribe(topic.clone()))
            .await
            .unwrap();
        match conn.events.recv().await {
            Some(MarketDataEvent::SubscriptionAck(acks)) => {
                assert!(matches!(acks[0].status, SubscriptionStatus::Failed(_)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(broker.requests().await, vec![MarketDataRequest::Subscribe(topic)]);

        broker.drop_connection().await;
        assert!(conn.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn history_is_served_by_half_open_range() {
        let broker = PaperBroker::new(true, 16);
        let now = Utc::now();
        broker
            .seed_history("F1", CandleInterval::OneMinute, dec!(10), 5, now)
            .await;
        let all = broker
            .get_candles("F1", now - ChronoDuration::hours(1), now, CandleInterval::OneMinute)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].time < w[1].time));
    }
}
