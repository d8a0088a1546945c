// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header; timestamp and recvWindow are injected into
// the parameter set before the signature is computed over the exact query
// string that goes on the wire.
//
// This layer never retries. Callers decide whether a failure is best-effort,
// retried, or downgraded to an "unknown" result.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::binance::error::ExchangeError;
use crate::binance::precision::{parse_exchange_info, round_to_precision, SymbolPrecisionCache};
use crate::binance::rate_limit::RateLimitTracker;
use crate::exchange::FuturesExchange;
use crate::types::{CloseOrderAck, OpenOrder, OrderSide, OrderSource, Position};

type HmacSha256 = Hmac<Sha256>;

/// Produce the lowercase hex HMAC-SHA256 of `payload` keyed by `secret`.
pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Binance futures REST client with HMAC-SHA256 request signing.
pub struct FuturesClient {
    secret: String,
    base_url: Url,
    recv_window_ms: u64,
    client: reqwest::Client,
    /// Server time minus local time, in milliseconds.
    time_offset_ms: AtomicI64,
    /// Set when the exchange reports timestamp drift; the next signed call
    /// re-synchronises first.
    needs_time_sync: AtomicBool,
    precision: SymbolPrecisionCache,
    rate_limits: Arc<RateLimitTracker>,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `FuturesClient`.
    ///
    /// # Arguments
    /// * `api_key`  — sent as the `X-MBX-APIKEY` header, never in query params.
    /// * `secret`   — used exclusively for HMAC signing.
    /// * `base_url` — e.g. `https://fapi.binance.com`.
    /// * `recv_window_ms` — tolerance for clock drift on signed requests.
    /// * `timeout`  — per-request bound, so a hung call cannot stall a tick.
    pub fn new(
        api_key: &str,
        secret: impl Into<String>,
        base_url: &str,
        recv_window_ms: u64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        let key_header =
            HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        default_headers.insert("X-MBX-APIKEY", key_header);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid exchange base URL '{base_url}'"))?;

        debug!(base_url = %base_url, "FuturesClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            recv_window_ms,
            client,
            time_offset_ms: AtomicI64::new(0),
            needs_time_sync: AtomicBool::new(false),
            precision: SymbolPrecisionCache::new(),
            rate_limits: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.rate_limits.clone()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Server-relative UNIX timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExchangeError> {
        self.base_url
            .join(path)
            .map_err(|e| ExchangeError::Malformed(format!("bad endpoint path {path}: {e}")))
    }

    /// Build the full URL for a signed request: caller params, then
    /// `timestamp` and `recvWindow`, then the trailing `signature`.
    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, ExchangeError> {
        let mut url = self.endpoint(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
            pairs.append_pair("timestamp", &self.timestamp_ms().to_string());
            pairs.append_pair("recvWindow", &self.recv_window_ms.to_string());
        }

        let signature = sign_payload(&self.secret, url.query().unwrap_or_default());
        url.query_pairs_mut().append_pair("signature", &signature);
        Ok(url)
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        if self.needs_time_sync.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.sync_server_time().await {
                warn!(error = %e, "server time re-sync failed");
            }
        }

        let url = self.signed_url(path, params)?;
        let result = self.execute(self.client.request(method.clone(), url), &method, path).await;

        if let Err(e) = &result {
            if e.is_timestamp_drift() {
                self.needs_time_sync.store(true, Ordering::Relaxed);
            }
        }
        result
    }

    async fn send_public(&self, path: &str) -> Result<Value, ExchangeError> {
        let url = self.endpoint(path)?;
        self.execute(self.client.get(url), &Method::GET, path).await
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        method: &Method,
        path: &str,
    ) -> Result<Value, ExchangeError> {
        let resp = request.send().await?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            warn!(%method, path, status = status.as_u16(), "exchange returned error status");
            return Err(ExchangeError::http_status(status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Malformed(format!("{method} {path}: {e}")))
    }

    /// GET /fapi/v1/time — store the offset between server and local clocks.
    #[instrument(skip(self), name = "binance::sync_server_time")]
    pub async fn sync_server_time(&self) -> Result<i64, ExchangeError> {
        let before = chrono::Utc::now().timestamp_millis();
        let body = self.send_public("/fapi/v1/time").await?;
        let after = chrono::Utc::now().timestamp_millis();

        let server = body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Malformed("time response missing 'serverTime'".into()))?;

        let offset = server - (before + after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "server time synchronised");
        Ok(offset)
    }

    /// GET /fapi/v1/exchangeInfo (public) — precision for every instrument.
    async fn load_precisions(&self) -> Result<HashMap<String, u32>, ExchangeError> {
        let body = self.send_public("/fapi/v1/exchangeInfo").await?;
        let map = parse_exchange_info(&body);
        info!(symbols = map.len(), "exchange metadata loaded");
        Ok(map)
    }
}

#[async_trait]
impl FuturesExchange for FuturesClient {
    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "binance::fetch_positions")]
    async fn fetch_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self.send_signed(Method::GET, "/fapi/v2/positionRisk", &[]).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("positionRisk is not an array".into()))?;

        let mut positions = Vec::new();
        for entry in raw {
            let position = parse_position(entry)?;
            if !position.amount.is_zero() {
                positions.push(position);
            }
        }

        debug!(count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    /// GET /fapi/v1/openAlgoOrders (signed).
    #[instrument(skip(self), name = "binance::fetch_conditional_orders")]
    async fn fetch_conditional_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let body = self.send_signed(Method::GET, "/fapi/v1/openAlgoOrders", &params).await?;

        // Some gateway versions wrap the list in an object.
        let raw = body
            .as_array()
            .or_else(|| body["orders"].as_array())
            .ok_or_else(|| ExchangeError::Malformed("openAlgoOrders is not a list".into()))?;

        let orders = raw
            .iter()
            .map(|o| parse_open_order(o, OrderSource::Conditional))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(symbol, count = orders.len(), "conditional orders fetched");
        Ok(orders)
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "binance::fetch_conventional_orders")]
    async fn fetch_conventional_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let body = self.send_signed(Method::GET, "/fapi/v1/openOrders", &params).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("openOrders is not an array".into()))?;

        let orders = raw
            .iter()
            .map(|o| parse_open_order(o, OrderSource::Conventional))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(symbol, count = orders.len(), "conventional orders fetched");
        Ok(orders)
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_conventional")]
    async fn cancel_all_conventional(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        self.send_signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params).await?;
        debug!(symbol, "conventional orders cancelled");
        Ok(())
    }

    /// DELETE /fapi/v1/algoOrder (signed).
    #[instrument(skip(self), name = "binance::cancel_conditional")]
    async fn cancel_conditional(&self, symbol: &str, id: u64) -> Result<(), ExchangeError> {
        let params = [("algoId", id.to_string())];
        self.send_signed(Method::DELETE, "/fapi/v1/algoOrder", &params).await?;
        debug!(symbol, algo_id = id, "conditional order cancelled");
        Ok(())
    }

    /// POST /fapi/v1/order (signed) — reduce-only MARKET close.
    #[instrument(skip(self), name = "binance::submit_close")]
    async fn submit_reduce_only_market_close(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<CloseOrderAck, ExchangeError> {
        let client_id = format!("guard_{}", &Uuid::new_v4().simple().to_string()[..24]);
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("reduceOnly", "true".to_string()),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", client_id),
        ];

        let body = self.send_signed(Method::POST, "/fapi/v1/order", &params).await?;

        let order_id = body["orderId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::Malformed("order response missing 'orderId'".into()))?;
        let status = body["status"]
            .as_str()
            .ok_or_else(|| ExchangeError::Malformed("order response missing 'status'".into()))?
            .to_string();

        info!(symbol, side = %side, %quantity, order_id, status = %status, "close order submitted");
        Ok(CloseOrderAck { order_id, status })
    }

    async fn round_quantity(&self, symbol: &str, quantity: Decimal) -> Decimal {
        let precision = self.precision.precision(symbol, || self.load_precisions()).await;
        round_to_precision(quantity, precision)
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `Decimal`.
fn parse_decimal(val: &Value) -> Option<Decimal> {
    match val {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn required_decimal(entry: &Value, key: &str) -> Result<Decimal, ExchangeError> {
    parse_decimal(&entry[key])
        .ok_or_else(|| ExchangeError::Malformed(format!("field '{key}' missing or not numeric")))
}

/// Accept the close-position flag as a boolean or as `"true"` / `"false"`.
fn parse_flag(val: &Value) -> bool {
    match val {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// First present string among `keys`.
fn first_str<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| entry[*k].as_str())
}

fn parse_position(entry: &Value) -> Result<Position, ExchangeError> {
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| ExchangeError::Malformed("position missing 'symbol'".into()))?;

    Ok(Position {
        symbol: symbol.to_string(),
        amount: required_decimal(entry, "positionAmt")?,
        unrealized_pnl: required_decimal(entry, "unRealizedProfit")?,
        entry_price: parse_decimal(&entry["entryPrice"]).unwrap_or_default(),
        mark_price: parse_decimal(&entry["markPrice"]).unwrap_or_default(),
    })
}

fn parse_open_order(entry: &Value, source: OrderSource) -> Result<OpenOrder, ExchangeError> {
    let id = ["algoId", "orderId"]
        .iter()
        .find_map(|k| entry[*k].as_u64())
        .ok_or_else(|| ExchangeError::Malformed("order missing id".into()))?;

    let side = first_str(entry, &["side"])
        .and_then(OrderSide::parse)
        .ok_or_else(|| ExchangeError::Malformed(format!("order {id} has no valid side")))?;

    let quantity = ["quantity", "origQty"]
        .iter()
        .find_map(|k| parse_decimal(&entry[*k]))
        .unwrap_or_default();

    Ok(OpenOrder {
        id,
        symbol: first_str(entry, &["symbol"]).unwrap_or_default().to_string(),
        side,
        quantity,
        kind: first_str(entry, &["orderType", "type"]).unwrap_or_default().to_string(),
        status: first_str(entry, &["algoStatus", "status"]).unwrap_or_default().to_string(),
        close_position: parse_flag(&entry["closePosition"]),
        source,
    })
}
