use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use common::{Error, MarketDataSource, Result};

/// Market data over plain REST: one price request per symbol per tick.
pub struct RestMarketData {
    base_url: String,
    http: Client,
}

impl RestMarketData {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl MarketDataSource for RestMarketData {
    async fn price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/v1/price?symbol={symbol}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::AdapterUnavailable(format!(
                "price endpoint returned HTTP {}",
                resp.status()
            )));
        }

        let ticker: PriceTicker = resp
            .json()
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|e| Error::AdapterUnavailable(format!("bad price payload: {e}")))
    }
}

#[derive(Deserialize)]
struct PriceTicker {
    price: String,
}

/// In-memory price source for the simulated stack and tests. A symbol with
/// no seeded price reports unavailable, like a real feed outage.
#[derive(Default)]
pub struct SimMarketData {
    prices: RwLock<HashMap<String, f64>>,
}

impl SimMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn clear_price(&self, symbol: &str) {
        self.prices.write().await.remove(symbol);
    }
}

#[async_trait]
impl MarketDataSource for SimMarketData {
    async fn price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::AdapterUnavailable(format!("no price for {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_feed_reports_outage_for_unseeded_symbol() {
        let feed = SimMarketData::new();
        feed.set_price("BTCUSD", 42_000.0).await;

        assert_eq!(feed.price("BTCUSD").await.unwrap(), 42_000.0);
        assert!(matches!(
            feed.price("ETHUSD").await,
            Err(Error::AdapterUnavailable(_))
        ));

        feed.clear_price("BTCUSD").await;
        assert!(feed.price("BTCUSD").await.is_err());
    }
}
