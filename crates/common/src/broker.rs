use async_trait::async_trait;

use crate::{AccountInfo, BrokerPosition, OrderAck, OrderRequest, Result};

/// Abstraction over a broker.
///
/// `SimBroker` implements this for simulated funds, `RestBroker` for real
/// funds. Which instance receives an order is decided purely by strategy
/// mode plus the safety gate's verdict; nothing else in the core may
/// depend on the concrete adapter.
///
/// Only the order router in `crates/registry` submits orders. All other
/// components see fills second-hand through the lifecycle manager.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Current balance and buying power.
    async fn get_account_info(&self) -> Result<AccountInfo>;

    /// Submit an order and return the broker's acknowledgement.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Positions currently open at the broker.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Cancel a resting order. `Ok(false)` when the broker no longer knows it.
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;
}
