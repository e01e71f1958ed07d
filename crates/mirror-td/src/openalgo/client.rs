//! HTTP client for one account.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use mirror_core::types::{Account, Candle, Funds, OrderRecord, OrderRequest, PingInfo, QuoteSnapshot};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::parse;
use crate::{BrokerApi, BrokerError};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenAlgo-style REST client bound to one account.
pub struct OpenAlgoClient {
    http: reqwest::Client,
    account_id: String,
    label: String,
    api_key: String,
    /// Host URL without trailing slash (e.g. `http://127.0.0.1:5000`).
    base_url: String,
}

impl OpenAlgoClient {
    pub fn new(account: &Account, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            account_id: account.id.clone(),
            label: account.label().to_string(),
            api_key: account.api_key.clone(),
            base_url: account.host_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/api/v1/{name}", self.base_url)
    }

    /// POST `body` (plus `apikey`) to `endpoint` and unwrap the envelope.
    async fn post(&self, endpoint: &str, mut body: Value) -> Result<Value, BrokerError> {
        if let Some(map) = body.as_object_mut() {
            map.insert("apikey".into(), Value::String(self.api_key.clone()));
        }
        let url = self.endpoint(endpoint);
        debug!("[rest-{}] POST {url}", self.label);

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("{endpoint}: {e}")))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Transport(format!("{endpoint}: reading body: {e}")))?;

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) if status >= 500 => {
                return Err(BrokerError::Transport(format!("{endpoint}: HTTP {status}")));
            }
            Err(e) => return Err(BrokerError::Parse(format!("{endpoint}: HTTP {status}: {e}"))),
        };
        parse::check_envelope(value, status).inspect_err(|e| {
            warn!("[rest-{}] {endpoint} failed: {e}", self.label);
        })
    }
}

/// Request body for `placeorder`.
pub fn order_body(order: &OrderRequest) -> Value {
    json!({
        "strategy": order.strategy_tag,
        "symbol": order.symbol,
        "exchange": order.exchange,
        "action": order.action,
        "quantity": order.quantity.to_string(),
        "pricetype": order.price_type,
        "product": order.product,
        "price": order.price.to_string(),
        "trigger_price": order.trigger_price.to_string(),
        "disclosed_quantity": "0",
    })
}

#[async_trait]
impl BrokerApi for OpenAlgoClient {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn ping(&self) -> Result<PingInfo, BrokerError> {
        let body = self.post("ping", json!({})).await?;
        parse::parse_ping(&body)
    }

    async fn funds(&self) -> Result<Funds, BrokerError> {
        let body = self.post("funds", json!({})).await?;
        parse::parse_funds(&body)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, BrokerError> {
        let body = self.post("placeorder", order_body(order)).await?;
        let order_id = parse::parse_order_id(&body)?;
        info!(
            "[rest-{}] placed {} {} x{} -> {order_id}",
            self.label, order.action, order.symbol, order.quantity
        );
        Ok(order_id)
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>, BrokerError> {
        let body = self.post("orderbook", json!({})).await?;
        parse::parse_order_book(&body)
    }

    async fn quote(&self, symbol: &str, exchange: &str) -> Result<QuoteSnapshot, BrokerError> {
        let body = self.post("quotes", json!({"symbol": symbol, "exchange": exchange})).await?;
        parse::parse_quote(&body)
    }

    async fn history(
        &self,
        symbol: &str,
        exchange: &str,
        interval_minutes: u32,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        let body = self
            .post(
                "history",
                json!({
                    "symbol": symbol,
                    "exchange": exchange,
                    "interval": format!("{interval_minutes}m"),
                    "start_date": start.format("%Y-%m-%d").to_string(),
                    "end_date": end.format("%Y-%m-%d").to_string(),
                }),
            )
            .await?;
        parse::parse_candles(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::types::{PriceType, Product, Side};

    fn account() -> Account {
        serde_json::from_value(json!({
            "id": "acc-1",
            "name": "primary",
            "broker": "zerodha",
            "host_url": "http://127.0.0.1:5000/",
            "ws_url": "ws://127.0.0.1:8765",
            "api_key": "secret",
            "is_primary": true,
            "rank": 0
        }))
        .unwrap()
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let client = OpenAlgoClient::new(&account(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.endpoint("placeorder"), "http://127.0.0.1:5000/api/v1/placeorder");
        assert_eq!(client.account_id(), "acc-1");
    }

    #[test]
    fn placeorder_body_uses_wire_names() {
        let order = OrderRequest {
            symbol: "NIFTY28OCT2625000CE".into(),
            exchange: "NFO".into(),
            action: Side::Sell,
            quantity: 1800,
            price_type: PriceType::Market,
            product: Product::Nrml,
            price: 0.0,
            trigger_price: 0.0,
            strategy_tag: "straddle".into(),
        };
        let body = order_body(&order);
        assert_eq!(body["action"], "SELL");
        assert_eq!(body["pricetype"], "MARKET");
        assert_eq!(body["product"], "NRML");
        assert_eq!(body["quantity"], "1800");
        assert_eq!(body["strategy"], "straddle");
    }
}
