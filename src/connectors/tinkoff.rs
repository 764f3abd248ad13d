// src/connectors/tinkoff.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::connectors::messages::{
    candle_interval_name, direction_name, instrument_method, subscription_interval_name,
    AccountsResponse, ApiErrorBody, CandlesResponse, InstrumentResponse, MarginAttributesResponse,
    MarketDataResponse, MoneyValue, OpenSandboxAccountResponse, OrderStateResponse, PayInResponse,
    PortfolioResponse, PositionsResponse, PostOrderBody, PostOrderResponse, Quotation,
    TradesStreamLine,
};
use crate::connectors::traits::{
    BrokerClient, MarketDataConnection, MarketDataEvent, MarketDataRequest, StreamClient, Topic,
};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    Candle, CandleInterval, Instrument, InstrumentType, MarginAttributes, OrderRequest,
    OrderResponse, OrderState, OrderTrades, OrderType, PortfolioPosition, Positions,
};

const SERVICE_PREFIX: &str = "tinkoff.public.invest.api.contract.v1";

#[derive(Debug, Clone)]
pub struct TinkoffSettings {
    pub rest_url: String,
    pub ws_url: String,
    pub token: String,
    pub app_name: String,
    pub sandbox: bool,
    pub channel_capacity: usize,
}

/// Tinkoff Invest API v2 over the REST gateway and its JSON streams.
pub struct TinkoffClient {
    http_client: Client,
    settings: TinkoffSettings,
}

impl TinkoffClient {
    pub fn new(settings: TinkoffSettings) -> Self {
        Self {
            http_client: Client::new(),
            settings,
        }
    }

    fn endpoint(&self, service: &str, method: &str) -> String {
        format!(
            "{}/{}.{}/{}",
            self.settings.rest_url.trim_end_matches('/'),
            SERVICE_PREFIX,
            service,
            method
        )
    }

    fn post_request<B: Serialize + ?Sized>(
        &self,
        service: &str,
        method: &str,
        body: &B,
    ) -> reqwest::RequestBuilder {
        self.http_client
            .post(self.endpoint(service, method))
            .bearer_auth(&self.settings.token)
            .header("x-app-name", &self.settings.app_name)
            .json(body)
    }

    async fn call<B, T>(&self, service: &str, method: &str, body: &B) -> BrokerResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.post_request(service, method, body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ApiErrorBody>(&text) {
                Ok(body) => (body.code.to_string(), body.message),
                Err(_) => (status.as_u16().to_string(), text),
            };
            return Err(BrokerError::Api { code, message });
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Picks the sandbox or the live variant of an RPC.
    fn route(&self, live: (&'static str, &'static str), sandbox: &'static str) -> (&'static str, &'static str) {
        if self.settings.sandbox {
            ("SandboxService", sandbox)
        } else {
            live
        }
    }
}

#[async_trait]
impl BrokerClient for TinkoffClient {
    fn is_sandbox(&self) -> bool {
        self.settings.sandbox
    }

    async fn get_accounts(&self) -> BrokerResult<Vec<String>> {
        let (service, method) = self.route(("UsersService", "GetAccounts"), "GetSandboxAccounts");
        let resp: AccountsResponse = self.call(service, method, &json!({})).await?;
        Ok(resp.accounts.into_iter().map(|a| a.id).collect())
    }

    async fn open_sandbox_account(&self) -> BrokerResult<String> {
        let resp: OpenSandboxAccountResponse = self
            .call("SandboxService", "OpenSandboxAccount", &json!({}))
            .await?;
        info!(account = %resp.account_id, "Opened sandbox account");
        Ok(resp.account_id)
    }

    async fn close_sandbox_account(&self, account_id: &str) -> BrokerResult<()> {
        let _: serde_json::Value = self
            .call(
                "SandboxService",
                "CloseSandboxAccount",
                &json!({ "accountId": account_id }),
            )
            .await?;
        info!(account = %account_id, "Closed sandbox account");
        Ok(())
    }

    async fn sandbox_pay_in(
        &self,
        account_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> BrokerResult<Decimal> {
        let resp: PayInResponse = self
            .call(
                "SandboxService",
                "SandboxPayIn",
                &json!({ "accountId": account_id, "amount": MoneyValue::new(currency, amount) }),
            )
            .await?;
        Ok(resp.balance.amount())
    }

    async fn get_positions(&self, account_id: &str) -> BrokerResult<Positions> {
        let (service, method) = self.route(("OperationsService", "GetPositions"), "GetSandboxPositions");
        let resp: PositionsResponse = self
            .call(service, method, &json!({ "accountId": account_id }))
            .await?;
        Ok(resp.into())
    }

    async fn get_portfolio(&self, account_id: &str) -> BrokerResult<Vec<PortfolioPosition>> {
        let (service, method) = self.route(("OperationsService", "GetPortfolio"), "GetSandboxPortfolio");
        let resp: PortfolioResponse = self
            .call(service, method, &json!({ "accountId": account_id }))
            .await?;
        Ok(resp.positions.into_iter().map(Into::into).collect())
    }

    async fn get_margin_attributes(&self, account_id: &str) -> BrokerResult<MarginAttributes> {
        let resp: MarginAttributesResponse = self
            .call(
                "UsersService",
                "GetMarginAttributes",
                &json!({ "accountId": account_id }),
            )
            .await?;
        Ok(resp.into())
    }

    async fn instrument_by_figi(
        &self,
        figi: &str,
        instrument_type: InstrumentType,
    ) -> BrokerResult<Instrument> {
        let resp: InstrumentResponse = self
            .call(
                "InstrumentsService",
                instrument_method(instrument_type),
                &json!({ "idType": "INSTRUMENT_ID_TYPE_FIGI", "id": figi }),
            )
            .await?;
        Ok(resp.instrument.into_instrument(instrument_type))
    }

    async fn post_order(&self, request: &OrderRequest) -> BrokerResult<OrderResponse> {
        let (service, method) = self.route(("OrdersService", "PostOrder"), "PostSandboxOrder");
        let body = PostOrderBody {
            figi: &request.figi,
            quantity: request.quantity,
            price: request.price.map(Quotation::from),
            direction: direction_name(request.side),
            account_id: &request.account_id,
            order_type: match request.order_type {
                OrderType::Market => "ORDER_TYPE_MARKET",
                OrderType::Limit => "ORDER_TYPE_LIMIT",
            },
            order_id: &request.order_id,
        };
        let resp: PostOrderResponse = self.call(service, method, &body).await?;
        Ok(resp.into())
    }

    async fn get_order_state(&self, account_id: &str, order_id: &str) -> BrokerResult<OrderState> {
        let (service, method) = self.route(("OrdersService", "GetOrderState"), "GetSandboxOrderState");
        let resp: OrderStateResponse = self
            .call(
                service,
                method,
                &json!({ "accountId": account_id, "orderId": order_id }),
            )
            .await?;
        Ok(resp.into())
    }

    async fn get_candles(
        &self,
        figi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: CandleInterval,
    ) -> BrokerResult<Vec<Candle>> {
        let resp: CandlesResponse = self
            .call(
                "MarketDataService",
                "GetCandles",
                &json!({
                    "figi": figi,
                    "from": from.to_rfc3339(),
                    "to": to.to_rfc3339(),
                    "interval": candle_interval_name(interval),
                }),
            )
            .await?;
        Ok(resp
            .candles
            .into_iter()
            .map(|c| c.into_candle(figi, interval))
            .collect())
    }
}

fn request_frame(request: &MarketDataRequest) -> serde_json::Value {
    let (action, topic) = match request {
        MarketDataRequest::Subscribe(t) => ("SUBSCRIPTION_ACTION_SUBSCRIBE", t),
        MarketDataRequest::Unsubscribe(t) => ("SUBSCRIPTION_ACTION_UNSUBSCRIBE", t),
    };
    match topic {
        Topic::Candles { figi, interval } => json!({
            "subscribeCandlesRequest": {
                "subscriptionAction": action,
                "instruments": [{ "figi": figi, "interval": subscription_interval_name(*interval) }],
            }
        }),
        Topic::Info { figi } => json!({
            "subscribeInfoRequest": {
                "subscriptionAction": action,
                "instruments": [{ "figi": figi }],
            }
        }),
        Topic::OrderBook { figi, depth } => json!({
            "subscribeOrderBookRequest": {
                "subscriptionAction": action,
                "instruments": [{ "figi": figi, "depth": depth }],
            }
        }),
    }
}

/// Frames that fail to decode are logged and skipped; only transport
/// failures end the connection.
fn decode_market_data(text: &str) -> Option<MarketDataEvent> {
    let mut msg: MarketDataResponse = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Skipping undecodable market data frame: {}", e);
            return None;
        }
    };
    let acks = msg.take_acks();
    if !acks.is_empty() {
        return Some(MarketDataEvent::SubscriptionAck(acks));
    }
    if let Some(candle) = msg.candle {
        return match candle.into_candle() {
            Ok(c) => Some(MarketDataEvent::Candle(c)),
            Err(e) => {
                warn!("Skipping candle frame: {}", e);
                None
            }
        };
    }
    if let Some(book) = msg.orderbook {
        return Some(MarketDataEvent::OrderBook(book.into()));
    }
    // pings and other housekeeping frames
    msg.trading_status
        .map(|s| MarketDataEvent::TradingStatus(s.into()))
}

#[async_trait]
impl StreamClient for TinkoffClient {
    async fn connect_market_data(&self) -> BrokerResult<MarketDataConnection> {
        let mut request = self
            .settings
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.settings.token))
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        headers.insert("Authorization", auth);
        headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("json"));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        info!("Market data WebSocket connected");
        let (mut write, mut read) = ws_stream.split();

        let capacity = self.settings.channel_capacity;
        let (request_tx, mut request_rx) = mpsc::channel::<MarketDataRequest>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<MarketDataEvent>(capacity);

        tokio::spawn(async move {
            while let Some(req) = request_rx.recv().await {
                let frame = request_frame(&req).to_string();
                debug!(?req, "Sending market data request");
                if let Err(e) = write.send(Message::Text(frame)).await {
                    error!("Failed to send market data request: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => decode_market_data(&text),
                    Ok(Message::Close(_)) => Some(MarketDataEvent::Error(BrokerError::StreamClosed)),
                    Ok(_) => None,
                    Err(e) => Some(MarketDataEvent::Error(BrokerError::Transport(e.to_string()))),
                };
                let Some(event) = event else { continue };
                let fatal = matches!(event, MarketDataEvent::Error(_));
                if event_tx.send(event).await.is_err() || fatal {
                    break;
                }
            }
            info!("Market data WebSocket task finished");
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
        let response = self
            .post_request(
                "OrdersStreamService",
                "TradesStream",
                &json!({ "accounts": account_ids }),
            )
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Trades stream error: {}", e);
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<TradesStreamLine>(&line) {
                        Ok(TradesStreamLine {
                            result: Some(result),
                            ..
                        }) => {
                            if let Some(trades) = result.order_trades {
                                if tx.send(trades.into()).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(TradesStreamLine {
                            error: Some(err), ..
                        }) => warn!("Trades stream reported error: {}", err.message),
                        Ok(_) => {}
                        Err(e) => warn!("Undecodable trades stream line: {}", e),
                    }
                }
            }
            info!("Trades stream finished");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_subscription_frames() {
        let frame = request_frame(&MarketDataRequest::Subscribe(Topic::Candles {
            figi: "F1".into(),
            interval: CandleInterval::OneMinute,
        }));
        assert_eq!(
            frame["subscribeCandlesRequest"]["subscriptionAction"],
            "SUBSCRIPTION_ACTION_SUBSCRIBE"
        );
        assert_eq!(
            frame["subscribeCandlesRequest"]["instruments"][0]["interval"],
            "SUBSCRIPTION_INTERVAL_ONE_MINUTE"
        );

        let frame = request_frame(&MarketDataRequest::Unsubscribe(Topic::OrderBook {
            figi: "F1".into(),
            depth: 10,
        }));
        assert_eq!(frame["subscribeOrderBookRequest"]["instruments"][0]["depth"], 10);
    }

    #[test]
    fn ignores_ping_frames() {
        assert!(decode_market_data(r#"{"ping":{"time":"2023-01-10T10:00:00Z"}}"#).is_none());
    }

    #[test]
    fn skips_undecodable_frames() {
        assert!(decode_market_data("not json").is_none());
        assert!(decode_market_data(
            r#"{"candle":{"figi":"F1","interval":"SUBSCRIPTION_INTERVAL_UNKNOWN","open":{"units":"1","nano":0},"high":{"units":"1","nano":0},"low":{"units":"1","nano":0},"close":{"units":"1","nano":0},"volume":"1","time":"2023-01-10T10:00:00Z"}}"#
        )
        .is_none());
    }

    #[test]
    fn routes_sandbox_calls() {
        let client = TinkoffClient::new(TinkoffSettings {
            rest_url: "https://invest-public-api.tinkoff.ru/rest/".into(),
            ws_url: "wss://invest-public-api.tinkoff.ru/ws/".into(),
            token: "t".into(),
            app_name: "trade_env".into(),
            sandbox: true,
            channel_capacity: 16,
        });
        let (service, method) = client.route(("OrdersService", "PostOrder"), "PostSandboxOrder");
        assert_eq!(
            client.endpoint(service, method),
            "https://invest-public-api.tinkoff.ru/rest/tinkoff.public.invest.api.contract.v1.SandboxService/PostSandboxOrder"
        );
    }
}
