use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{
    AccountInfo, BrokerAdapter, BrokerPosition, Error, OrderAck, OrderRequest, OrderStatus,
    OrderType, PositionSide, Result, TimeInForce,
};

/// Real-funds broker adapter speaking a signed JSON-over-REST protocol.
///
/// Every request carries a millisecond timestamp and an HMAC-SHA256
/// signature of the query string. Numeric fields travel as strings to
/// avoid float truncation at the boundary.
pub struct RestBroker {
    base_url: String,
    api_key: String,
    secret: String,
    http: Client,
}

impl RestBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<String> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let resp = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<String> {
        let body = self.signed_query(params);
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }

    async fn signed_delete(&self, path: &str) -> Result<reqwest::StatusCode> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(""));
        let resp = self
            .http
            .delete(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(resp.status())
    }
}

#[async_trait]
impl BrokerAdapter for RestBroker {
    async fn get_account_info(&self) -> Result<AccountInfo> {
        let body = self.signed_get("/v1/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| Error::Broker(e.to_string()))?;
        Ok(AccountInfo {
            balance: parse_decimal(&account.balance)?,
            buying_power: parse_decimal(&account.buying_power)?,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let order_type = match request.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };
        let tif = match request.time_in_force {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        };
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&timeInForce={}",
            request.symbol, request.side, order_type, request.quantity, tif
        );
        if let Some(price) = request.limit_price {
            params.push_str(&format!("&price={price}"));
        }

        debug!(symbol = %request.symbol, side = %request.side, "Submitting order");
        let body = self.signed_post("/v1/orders", &params).await?;
        let resp: OrderResponse =
            serde_json::from_str(&body).map_err(|e| Error::Broker(e.to_string()))?;

        let status = match resp.status.as_str() {
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            "OPEN" => OrderStatus::Open,
            _ => OrderStatus::Pending,
        };
        let fill_price = match resp.fill_price {
            Some(p) => Some(parse_decimal(&p)?),
            None => None,
        };
        let filled_quantity = resp
            .filled_quantity
            .as_deref()
            .map(parse_decimal)
            .transpose()?
            .unwrap_or(0.0);

        Ok(OrderAck {
            order_id: resp.order_id,
            status,
            fill_price,
            filled_quantity,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self.signed_get("/v1/positions", "").await?;
        let resp: PositionsResponse =
            serde_json::from_str(&body).map_err(|e| Error::Broker(e.to_string()))?;

        resp.positions
            .into_iter()
            .map(|p| {
                Ok(BrokerPosition {
                    symbol: p.symbol,
                    side: if p.side.eq_ignore_ascii_case("short") {
                        PositionSide::Short
                    } else {
                        PositionSide::Long
                    },
                    quantity: parse_decimal(&p.quantity)?,
                    entry_price: parse_decimal(&p.entry_price)?,
                })
            })
            .collect()
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let status = self.signed_delete(&format!("/v1/orders/{order_id}")).await?;
        Ok(status.is_success())
    }
}

fn parse_decimal(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| Error::Broker(format!("bad decimal '{value}': {e}")))
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    balance: String,
    buying_power: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: String,
    status: String,
    #[serde(default)]
    fill_price: Option<String>,
    #[serde(default)]
    filled_quantity: Option<String>,
}

#[derive(Deserialize)]
struct PositionsResponse {
    positions: Vec<PositionDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionDetail {
    symbol: String,
    side: String,
    quantity: String,
    entry_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let broker = RestBroker::new("https://broker.test", "key", "secret");
        let a = broker.sign("symbol=BTCUSD&timestamp=1");
        let b = broker.sign("symbol=BTCUSD&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bad_decimal_is_a_broker_error() {
        assert!(matches!(parse_decimal("1.5"), Ok(v) if (v - 1.5).abs() < 1e-12));
        assert!(matches!(parse_decimal("not-a-number"), Err(Error::Broker(_))));
    }
}
