use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use common::{
    ActivityEvent, BrokerAdapter, Error, Order, OrderAck, OrderRequest, OrderStatus, Result,
    Side, Signal, Venue,
};
use gate::SafetyGate;
use lifecycle::{Fill, LifecycleManager};

use crate::registry::StrategySnapshot;

/// The mode controller's routing entry point and the only component that
/// submits orders to a broker adapter.
///
/// Instance selection is purely strategy mode plus the safety gate's
/// verdict, re-validated here at submission time. A refusal on the real
/// leg never cancels the simulated leg; the sim ledger is the benchmark
/// the gate's performance checks read.
pub struct OrderRouter {
    sim: Arc<dyn BrokerAdapter>,
    real: Arc<dyn BrokerAdapter>,
    gate: Arc<SafetyGate>,
    lifecycle: Arc<LifecycleManager>,
    event_tx: mpsc::Sender<ActivityEvent>,
    adapter_timeout: Duration,
    sim_account: String,
    real_account: String,
}

impl OrderRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sim: Arc<dyn BrokerAdapter>,
        real: Arc<dyn BrokerAdapter>,
        gate: Arc<SafetyGate>,
        lifecycle: Arc<LifecycleManager>,
        event_tx: mpsc::Sender<ActivityEvent>,
        adapter_timeout: Duration,
        sim_account: impl Into<String>,
        real_account: impl Into<String>,
    ) -> Self {
        Self {
            sim,
            real,
            gate,
            lifecycle,
            event_tx,
            adapter_timeout,
            sim_account: sim_account.into(),
            real_account: real_account.into(),
        }
    }

    fn adapter(&self, venue: Venue) -> &Arc<dyn BrokerAdapter> {
        match venue {
            Venue::Simulated => &self.sim,
            Venue::Real => &self.real,
        }
    }

    fn account_id(&self, venue: Venue) -> &str {
        match venue {
            Venue::Simulated => &self.sim_account,
            Venue::Real => &self.real_account,
        }
    }

    /// Adapter connectivity probe used for readiness flags.
    pub async fn probe(&self, venue: Venue) -> bool {
        tokio::time::timeout(self.adapter_timeout, self.adapter(venue).get_account_info())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn gate(&self) -> &Arc<SafetyGate> {
        &self.gate
    }

    /// Route one signal for a strategy to every venue its mode selects.
    ///
    /// Per-leg failures are isolated: a sim-leg adapter error never stops
    /// the real leg and vice versa. The call errs only when no leg
    /// executed, with gate refusals taking precedence so callers see why
    /// real money did not move.
    pub async fn route(
        &self,
        strategy: &StrategySnapshot,
        signal: Signal,
        price: f64,
    ) -> Result<()> {
        let mut refusal: Option<Error> = None;
        let mut first_error: Option<Error> = None;
        let mut routed = 0usize;
        let mut skipped = 0usize;

        for venue in [Venue::Simulated, Venue::Real] {
            let selected = match venue {
                Venue::Simulated => strategy.mode.routes_simulated(),
                Venue::Real => strategy.mode.routes_real(),
            };
            if !selected {
                continue;
            }

            if venue == Venue::Real {
                if let Err(e) = self.gate.authorize_real_order() {
                    // Security-relevant: a real-money order was stopped.
                    warn!(
                        strategy = %strategy.id,
                        signal = %signal,
                        error = %e,
                        "Safety gate refused real-money order"
                    );
                    if let Error::SafetyGateRefused { failed } = &e {
                        let _ = self.event_tx.try_send(ActivityEvent::OrderRefused {
                            strategy_id: strategy.id.clone(),
                            failed_checks: failed.clone(),
                        });
                    }
                    refusal = Some(e);
                    continue;
                }
            }

            match self.route_leg(venue, strategy, signal, price).await {
                Ok(true) => routed += 1,
                Ok(false) => skipped += 1,
                Err(e) => {
                    warn!(
                        strategy = %strategy.id,
                        venue = %venue,
                        policy = ?e.policy(),
                        error = %e,
                        "Order leg failed"
                    );
                    let event = match &e {
                        Error::AdapterUnavailable(detail) => ActivityEvent::AdapterUnavailable {
                            venue,
                            detail: detail.clone(),
                        },
                        _ => ActivityEvent::OrderFailed {
                            strategy_id: Some(strategy.id.clone()),
                            symbol: strategy.symbol.clone(),
                            error: e.to_string(),
                        },
                    };
                    let _ = self.event_tx.try_send(event);
                    first_error.get_or_insert(e);
                }
            }
        }

        if routed == 0 && skipped == 0 {
            if let Some(e) = refusal {
                return Err(e);
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Execute one venue leg. `Ok(false)` means the leg was a deliberate
    /// no-op (nothing to exit, position cap reached).
    async fn route_leg(
        &self,
        venue: Venue,
        strategy: &StrategySnapshot,
        signal: Signal,
        price: f64,
    ) -> Result<bool> {
        let account_id = self.account_id(venue);

        let (side, quantity) = match signal {
            Signal::EnterLong | Signal::EnterShort => {
                let open = self.lifecycle.open_positions(account_id).await;
                let held = open
                    .iter()
                    .filter(|p| p.strategy_id.as_deref() == Some(strategy.id.as_str()))
                    .count();
                if held >= strategy.max_positions {
                    info!(
                        strategy = %strategy.id,
                        venue = %venue,
                        held = held,
                        "Position cap reached; entry skipped"
                    );
                    return Ok(false);
                }

                let account = self.lifecycle.account(account_id).await?;
                let quantity = account.balance * strategy.position_fraction / price;
                if quantity <= 0.0 {
                    return Ok(false);
                }
                let side = if signal == Signal::EnterLong {
                    Side::Buy
                } else {
                    Side::Sell
                };
                (side, quantity)
            }
            Signal::Exit => {
                let Some(position) = self
                    .lifecycle
                    .open_position(account_id, Some(&strategy.id), &strategy.symbol)
                    .await
                else {
                    return Ok(false);
                };
                (position.side.exit_side(), position.quantity)
            }
        };

        let request = OrderRequest::market(&strategy.symbol, side, quantity);
        let ack = self.submit(venue, &request).await?;

        let order = Order {
            id: ack.order_id.clone(),
            symbol: request.symbol.clone(),
            side,
            order_type: request.order_type,
            requested_quantity: quantity,
            filled_quantity: ack.filled_quantity,
            status: ack.status,
            strategy_id: Some(strategy.id.clone()),
            decision: Some(format!("{} {}", strategy.strategy_type, signal)),
            created_at: Utc::now(),
        };
        info!(
            order_id = %order.id,
            strategy = %strategy.id,
            venue = %venue,
            side = %side,
            qty = quantity,
            status = ?order.status,
            "Order routed"
        );

        if order.status == OrderStatus::Filled || ack.filled_quantity > 0.0 {
            let filled = if ack.filled_quantity > 0.0 {
                ack.filled_quantity
            } else {
                quantity
            };
            self.lifecycle
                .record_fill(Fill {
                    account_id: account_id.to_string(),
                    strategy_id: Some(strategy.id.clone()),
                    symbol: strategy.symbol.clone(),
                    side,
                    quantity: filled,
                    price: ack.fill_price.unwrap_or(price),
                })
                .await?;
        }

        let _ = self.event_tx.try_send(ActivityEvent::OrderRouted {
            strategy_id: strategy.id.clone(),
            venue,
            symbol: strategy.symbol.clone(),
            side,
            quantity,
        });
        Ok(true)
    }

    async fn submit(&self, venue: Venue, request: &OrderRequest) -> Result<OrderAck> {
        match tokio::time::timeout(
            self.adapter_timeout,
            self.adapter(venue).place_order(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::AdapterUnavailable(format!(
                "{venue} adapter timed out after {:?}",
                self.adapter_timeout
            ))),
        }
    }
}
