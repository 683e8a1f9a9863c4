use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use std::sync::Arc;

use common::{
    AccountInfo, BrokerAdapter, BrokerPosition, Error, MarketDataSource, OrderAck, OrderRequest,
    OrderStatus, PositionSide, Result, Side,
};

/// Simulated-funds broker adapter.
///
/// Fills are simulated at the latest known price with configurable
/// slippage. Positions are netted per symbol; realized P&L is credited to
/// the simulated balance. No real order ever leaves this process.
pub struct SimBroker {
    balance: RwLock<f64>,
    positions: RwLock<HashMap<String, BrokerPosition>>,
    /// Latest known price per symbol, fed by `update_price`.
    prices: RwLock<HashMap<String, f64>>,
    /// Fallback when no price has been pushed for a symbol yet.
    market: Option<Arc<dyn MarketDataSource>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
}

impl SimBroker {
    pub fn new(initial_balance: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance,
            slippage_bps = slippage_bps,
            "SimBroker initialized"
        );
        Self {
            balance: RwLock::new(initial_balance),
            positions: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            market: None,
            slippage_bps,
        }
    }

    /// Fill at live market prices for symbols no one has pushed yet.
    pub fn with_market(mut self, market: Arc<dyn MarketDataSource>) -> Self {
        self.market = Some(market);
        self
    }

    /// Update the latest price for a symbol (called from the tick loop).
    pub async fn update_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    async fn mid_price(&self, symbol: &str) -> Result<f64> {
        if let Some(price) = self.prices.read().await.get(symbol).copied() {
            return Ok(price);
        }
        if let Some(market) = &self.market {
            return market.price(symbol).await;
        }
        Err(Error::Broker(format!(
            "SimBroker has no price for '{symbol}'. Ensure the price feed is flowing."
        )))
    }

    fn fill_price(&self, mid: f64, side: Side) -> f64 {
        // Buys pay more, sells receive less.
        match side {
            Side::Buy => mid * (1.0 + self.slippage_bps / 10_000.0),
            Side::Sell => mid * (1.0 - self.slippage_bps / 10_000.0),
        }
    }
}

#[async_trait]
impl BrokerAdapter for SimBroker {
    async fn get_account_info(&self) -> Result<AccountInfo> {
        let balance = *self.balance.read().await;
        Ok(AccountInfo {
            balance,
            buying_power: balance,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mid = self.mid_price(&request.symbol).await?;
        let fill_price = self.fill_price(mid, request.side);

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            mid = mid,
            fill = fill_price,
            qty = request.quantity,
            "Simulated fill"
        );

        let mut positions = self.positions.write().await;
        let fill_side = PositionSide::from_entry(request.side);
        match positions.get_mut(&request.symbol) {
            Some(pos) if pos.side == fill_side => {
                // Same direction: grow with volume-weighted entry.
                let total = pos.quantity + request.quantity;
                pos.entry_price =
                    (pos.entry_price * pos.quantity + fill_price * request.quantity) / total;
                pos.quantity = total;
            }
            Some(pos) => {
                // Opposite direction: reduce, realizing P&L into the balance.
                let closed = request.quantity.min(pos.quantity);
                let pnl = (fill_price - pos.entry_price) * closed * pos.side.sign();
                *self.balance.write().await += pnl;

                if request.quantity >= pos.quantity {
                    let leftover = request.quantity - pos.quantity;
                    positions.remove(&request.symbol);
                    if leftover > 0.0 {
                        positions.insert(
                            request.symbol.clone(),
                            BrokerPosition {
                                symbol: request.symbol.clone(),
                                side: fill_side,
                                quantity: leftover,
                                entry_price: fill_price,
                            },
                        );
                    }
                } else {
                    pos.quantity -= closed;
                }
            }
            None => {
                positions.insert(
                    request.symbol.clone(),
                    BrokerPosition {
                        symbol: request.symbol.clone(),
                        side: fill_side,
                        quantity: request.quantity,
                        entry_price: fill_price,
                    },
                );
            }
        }

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            status: OrderStatus::Filled,
            fill_price: Some(fill_price),
            filled_quantity: request.quantity,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.positions.read().await.values().cloned().collect())
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
        // Market orders fill immediately; there is never a resting order.
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buy_fill_applies_positive_slippage() {
        let sim = SimBroker::new(10_000.0, 10.0); // 10 bps
        sim.update_price("BTCUSD", 1000.0).await;

        let ack = sim
            .place_order(&OrderRequest::market("BTCUSD", Side::Buy, 0.01))
            .await
            .unwrap();

        let expected = 1000.0 * (1.0 + 10.0 / 10_000.0);
        let fill = ack.fill_price.unwrap();
        assert!(
            (fill - expected).abs() < 1e-9,
            "buy fill {fill}, expected {expected}"
        );
        assert_eq!(ack.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn sell_fill_applies_negative_slippage() {
        let sim = SimBroker::new(10_000.0, 10.0);
        sim.update_price("BTCUSD", 1000.0).await;

        sim.place_order(&OrderRequest::market("BTCUSD", Side::Buy, 0.01))
            .await
            .unwrap();
        let ack = sim
            .place_order(&OrderRequest::market("BTCUSD", Side::Sell, 0.01))
            .await
            .unwrap();

        let expected = 1000.0 * (1.0 - 10.0 / 10_000.0);
        assert!((ack.fill_price.unwrap() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn netting_closes_and_credits_realized_pnl() {
        let sim = SimBroker::new(10_000.0, 0.0);
        sim.update_price("ETHUSD", 100.0).await;
        sim.place_order(&OrderRequest::market("ETHUSD", Side::Buy, 2.0))
            .await
            .unwrap();

        sim.update_price("ETHUSD", 110.0).await;
        sim.place_order(&OrderRequest::market("ETHUSD", Side::Sell, 2.0))
            .await
            .unwrap();

        assert!(sim.get_positions().await.unwrap().is_empty());
        let info = sim.get_account_info().await.unwrap();
        assert!((info.balance - 10_020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_opposite_fill_flips_the_position() {
        let sim = SimBroker::new(10_000.0, 0.0);
        sim.update_price("ETHUSD", 100.0).await;
        sim.place_order(&OrderRequest::market("ETHUSD", Side::Buy, 1.0))
            .await
            .unwrap();
        sim.place_order(&OrderRequest::market("ETHUSD", Side::Sell, 3.0))
            .await
            .unwrap();

        let positions = sim.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert!((positions[0].quantity - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn order_without_price_is_rejected() {
        let sim = SimBroker::new(10_000.0, 0.0);
        let err = sim
            .place_order(&OrderRequest::market("XRPUSD", Side::Buy, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
}
