use async_trait::async_trait;

use crate::Result;

/// Source of current prices. May be stale or unavailable; an unavailable
/// price is an `Err`, never a sentinel value.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<f64>;
}
