use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;

use super::{ClientError, TradeClient};
use crate::models::{
    Candle, OrderRequest, OrderSide, OrderState, OrderStatus, PositionSide, RemotePosition,
    TradeFill,
};

const API_BASE: &str = "https://fapi.binance.com";
const RATE_LIMIT_RPM: u32 = 1200;
const RECV_WINDOW_MS: u64 = 5000;

// Binance error codes worth distinguishing from generic rejections.
const CODE_UNKNOWN_ORDER: i64 = -2011;
const CODE_ORDER_DOES_NOT_EXIST: i64 = -2013;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance USD-M futures REST client.
///
/// Signed endpoints use the HMAC-SHA256 query-string signature scheme;
/// every request passes through a shared rate limiter.
pub struct BinanceFuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    wait_max_secs: u64,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

/// Kline row: [open_time, open, high, low, close, volume, close_time,
/// quote_volume, trades, taker_base, taker_quote, ignore].
type KlineRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    String,
    String,
    String,
);

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRow {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    un_realized_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    symbol: String,
    status: String,
    price: String,
    avg_price: String,
    executed_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTradeRow {
    order_id: i64,
    price: String,
    qty: String,
    commission: String,
    realized_pnl: String,
    side: String,
    time: i64,
}

fn parse_f64(raw: &str, field: &str) -> Result<f64> {
    raw.parse::<f64>()
        .with_context(|| format!("invalid {field} value: {raw}"))
}

fn parse_status(raw: &str) -> Result<OrderStatus> {
    Ok(match raw {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        other => bail!("unknown order status: {other}"),
    })
}

fn parse_side(raw: &str) -> Result<OrderSide> {
    Ok(match raw {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => bail!("unknown order side: {other}"),
    })
}

fn order_state_from(response: OrderResponse) -> Result<OrderState> {
    Ok(OrderState {
        order_id: response.order_id,
        symbol: response.symbol,
        status: parse_status(&response.status)?,
        price: parse_f64(&response.price, "price")?,
        avg_price: parse_f64(&response.avg_price, "avgPrice")?,
        executed_qty: parse_f64(&response.executed_qty, "executedQty")?,
    })
}

impl BinanceFuturesClient {
    /// Production client: credentials come from the environment.
    pub fn new(wait_max_secs: u64) -> Result<Self> {
        let api_key =
            std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
        let secret_key =
            std::env::var("BINANCE_SECRET_KEY").context("BINANCE_SECRET_KEY is not set")?;
        Self::with_base_url(API_BASE.to_string(), api_key, secret_key, wait_max_secs)
    }

    pub fn with_base_url(
        base_url: String,
        api_key: String,
        secret_key: String,
        wait_max_secs: u64,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());
        Ok(Self {
            http,
            base_url,
            api_key,
            secret_key,
            wait_max_secs,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| anyhow!("invalid HMAC secret key"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send_public(&self, path: &str, query: &str) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}?{}", self.base_url, path, query);
        Ok(self.http.get(&url).send().await?)
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        let query = format!(
            "{}&recvWindow={}&timestamp={}",
            params,
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        );
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        Ok(self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?)
    }

    /// Decode a response body, mapping Binance error payloads to
    /// [`ClientError::Rejected`].
    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
                return Err(
                    ClientError::Rejected(format!("{} (code {})", err.msg, err.code)).into(),
                );
            }
            bail!("{what} failed: HTTP {status}: {body}");
        }
        serde_json::from_str(&body).with_context(|| format!("failed to decode {what} response"))
    }

    /// Variant of [`Self::read_json`] for per-order endpoints, where the
    /// "unknown order" error codes get their own variant so callers can
    /// treat them as benign.
    async fn read_order_json<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
        order_id: i64,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
                if err.code == CODE_UNKNOWN_ORDER || err.code == CODE_ORDER_DOES_NOT_EXIST {
                    return Err(ClientError::UnknownOrder(order_id).into());
                }
                return Err(
                    ClientError::Rejected(format!("{} (code {})", err.msg, err.code)).into(),
                );
            }
            bail!("{what} failed: HTTP {status}: {body}");
        }
        serde_json::from_str(&body).with_context(|| format!("failed to decode {what} response"))
    }
}

#[async_trait]
impl TradeClient for BinanceFuturesClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let query = format!("symbol={symbol}&interval={timeframe}&limit={limit}");
        let response = self.send_public("/fapi/v1/klines", &query).await?;
        let rows: Vec<KlineRow> = Self::read_json(response, "klines").await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let open_time = Utc
                .timestamp_millis_opt(row.0)
                .single()
                .with_context(|| format!("invalid kline open time {}", row.0))?;
            let close = parse_f64(&row.4, "close")?;
            candles.push(Candle {
                open_time,
                open: parse_f64(&row.1, "open")?,
                high: parse_f64(&row.2, "high")?,
                low: parse_f64(&row.3, "low")?,
                close,
                volume: parse_f64(&row.5, "volume")?,
                current_price: close,
            });
        }

        // The last candle is still forming; its close lags the market, so
        // stamp the live ticker price on it instead.
        if let Some(last) = candles.last_mut() {
            last.current_price = self.fetch_price(symbol).await?;
        }
        Ok(candles)
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let query = format!("symbol={symbol}");
        let response = self.send_public("/fapi/v1/ticker/price", &query).await?;
        let ticker: TickerPrice = Self::read_json(response, "ticker price").await?;
        parse_f64(&ticker.price, "price")
    }

    async fn fetch_position(&self, symbol: &str) -> Result<Option<RemotePosition>> {
        let params = format!("symbol={symbol}");
        let response = self
            .send_signed(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        let rows: Vec<PositionRiskRow> = Self::read_json(response, "position risk").await?;

        for row in rows {
            let amount = parse_f64(&row.position_amt, "positionAmt")?;
            if amount == 0.0 {
                continue;
            }
            let side = if amount > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            return Ok(Some(RemotePosition {
                symbol: row.symbol,
                side,
                quantity: amount.abs(),
                entry_price: parse_f64(&row.entry_price, "entryPrice")?,
                mark_price: parse_f64(&row.mark_price, "markPrice")?,
                pnl: parse_f64(&row.un_realized_profit, "unRealizedProfit")?,
            }));
        }
        Ok(None)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let response = self
            .send_signed(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        let _: serde_json::Value = Self::read_json(response, "set leverage").await?;
        tracing::info!("{} leverage set to {}x", symbol, leverage);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderState> {
        let mut params = format!(
            "symbol={}&side={}&type={}",
            request.symbol,
            request.side.as_str(),
            request.order_type.as_str()
        );
        if request.quantity > 0.0 {
            params.push_str(&format!("&quantity={}", request.quantity));
        }
        if let Some(price) = request.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }
        if let Some(stop_price) = request.stop_price {
            params.push_str(&format!("&stopPrice={stop_price}"));
        }
        if request.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if request.close_position {
            params.push_str("&closePosition=true");
        }

        let response = self
            .send_signed(Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order: OrderResponse = Self::read_json(response, "place order").await?;
        order_state_from(order)
    }

    async fn fetch_order(&self, symbol: &str, order_id: i64) -> Result<OrderState> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let response = self
            .send_signed(Method::GET, "/fapi/v1/order", &params)
            .await?;
        let order: OrderResponse =
            Self::read_order_json(response, "fetch order", order_id).await?;
        order_state_from(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let response = self
            .send_signed(Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        let _: serde_json::Value =
            Self::read_order_json(response, "cancel order", order_id).await?;
        Ok(())
    }

    async fn fetch_trades(&self, symbol: &str, order_id: i64) -> Result<Vec<TradeFill>> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let response = self
            .send_signed(Method::GET, "/fapi/v1/userTrades", &params)
            .await?;
        let rows: Vec<UserTradeRow> = Self::read_json(response, "user trades").await?;

        let mut fills = Vec::with_capacity(rows.len());
        for row in rows {
            let time = Utc
                .timestamp_millis_opt(row.time)
                .single()
                .with_context(|| format!("invalid trade time {}", row.time))?;
            fills.push(TradeFill {
                order_id: row.order_id,
                price: parse_f64(&row.price, "price")?,
                quantity: parse_f64(&row.qty, "qty")?,
                fee: parse_f64(&row.commission, "commission")?,
                realized_pnl: parse_f64(&row.realized_pnl, "realizedPnl")?,
                side: parse_side(&row.side)?,
                time,
            });
        }
        Ok(fills)
    }

    /// Sleep a random interval below the configured ceiling. Jitter keeps a
    /// fleet of bots from hitting the API in lockstep.
    async fn wait(&self) {
        if self.wait_max_secs == 0 {
            return;
        }
        let secs = rand::thread_rng().gen_range(1..=self.wait_max_secs);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn test_client(server: &mockito::ServerGuard) -> BinanceFuturesClient {
        BinanceFuturesClient::with_base_url(
            server.url(),
            "test-key".to_string(),
            "test-secret".to_string(),
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_klines_parse_with_live_last_price() {
        let mut server = mockito::Server::new_async().await;
        let klines = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::Any)
            .with_body(
                r#"[
                  [1700000000000,"100.0","101.0","99.0","100.5","1000.0",1700000899999,"0",10,"0","0","0"],
                  [1700000900000,"100.5","102.0","100.0","101.5","1200.0",1700001799999,"0",12,"0","0","0"]
                ]"#,
            )
            .create_async()
            .await;
        let ticker = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_body(r#"{"symbol":"SOLUSDT","price":"105.25"}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let candles = client.fetch_klines("SOLUSDT", "15m", 2).await.unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].current_price, 100.5); // mirrors close
        assert_eq!(candles[1].close, 101.5);
        assert_eq!(candles[1].current_price, 105.25); // live ticker
        klines.assert_async().await;
        ticker.assert_async().await;
    }

    #[tokio::test]
    async fn test_place_order_parses_ack() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fapi/v1/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "SOLUSDT".into()),
                Matcher::UrlEncoded("side".into(), "BUY".into()),
                Matcher::UrlEncoded("type".into(), "MARKET".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .with_body(
                r#"{"orderId":123,"symbol":"SOLUSDT","status":"NEW","price":"0","avgPrice":"0.0000","executedQty":"0"}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let request = OrderRequest::market("SOLUSDT", OrderSide::Buy, 1.0, false);
        let state = client.place_order(&request).await.unwrap();

        assert_eq!(state.order_id, 123);
        assert_eq!(state.status, OrderStatus::New);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_maps_unknown_order_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/fapi/v1/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client.cancel_order("SOLUSDT", 99).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::UnknownOrder(99))
        ));
    }

    #[tokio::test]
    async fn test_position_risk_skips_flat_rows() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_query(Matcher::Any)
            .with_body(
                r#"[{"symbol":"SOLUSDT","positionAmt":"-2.0","entryPrice":"105.0","markPrice":"101.0","unRealizedProfit":"8.0"}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let position = client.fetch_position("SOLUSDT").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.entry_price, 105.0);
    }

    #[tokio::test]
    async fn test_flat_position_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_query(Matcher::Any)
            .with_body(
                r#"[{"symbol":"SOLUSDT","positionAmt":"0","entryPrice":"0.0","markPrice":"101.0","unRealizedProfit":"0"}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        assert!(client.fetch_position("SOLUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_trades_map_to_fills() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/userTrades")
            .match_query(Matcher::Any)
            .with_body(
                r#"[{"orderId":123,"price":"100.0","qty":"0.5","commission":"0.05","realizedPnl":"0","side":"BUY","time":1700000000000},
                    {"orderId":123,"price":"100.2","qty":"0.5","commission":"0.05","realizedPnl":"0","side":"BUY","time":1700000000100}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let fills = client.fetch_trades("SOLUSDT", 123).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].side, OrderSide::Buy);
        assert_eq!(fills[1].price, 100.2);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_code_and_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let request = OrderRequest::market("SOLUSDT", OrderSide::Buy, 1.0, false);
        let err = client.place_order(&request).await.unwrap_err();
        assert!(err.to_string().contains("Margin is insufficient"));
    }
}
