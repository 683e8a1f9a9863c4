use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::{ActivityEvent, MarketDataSource, Result, SafetyConfig, Signal};
use gate::{CheckContext, SafetyGate, Verdict};
use lifecycle::LifecycleManager;
use notify::NotificationBatcher;
use perf::PerformanceAggregator;
use registry::{OrderRouter, StrategyRegistry};

/// The main control loop: fetch one price per enabled symbol, evaluate
/// every enabled strategy on it, route resulting signals. Failures are
/// isolated per symbol and per strategy; the tick always completes for
/// the remaining siblings.
pub struct TradingTick {
    registry: Arc<StrategyRegistry>,
    router: Arc<OrderRouter>,
    market: Arc<dyn MarketDataSource>,
    lifecycle: Arc<LifecycleManager>,
    event_tx: mpsc::Sender<ActivityEvent>,
    period: Duration,
    price_timeout: Duration,
}

impl TradingTick {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        router: Arc<OrderRouter>,
        market: Arc<dyn MarketDataSource>,
        lifecycle: Arc<LifecycleManager>,
        event_tx: mpsc::Sender<ActivityEvent>,
        period: Duration,
        price_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            market,
            lifecycle,
            event_tx,
            period,
            price_timeout,
        }
    }

    async fn fetch_price(&self, symbol: &str) -> Option<f64> {
        match tokio::time::timeout(self.price_timeout, self.market.price(symbol)).await {
            Ok(Ok(price)) => Some(price),
            Ok(Err(e)) => {
                warn!(symbol = %symbol, policy = ?e.policy(), error = %e, "Price fetch failed; symbol skipped this tick");
                None
            }
            Err(_) => {
                warn!(symbol = %symbol, "Price fetch timed out; symbol skipped this tick");
                None
            }
        }
    }

    /// Close positions whose stop-loss or take-profit distance is breached.
    async fn check_protective_exits(&self, symbol: &str, price: f64) {
        let strategies = self.registry.list_strategies().await;
        let accounts = self.lifecycle.accounts().await;

        for strategy in strategies
            .iter()
            .filter(|s| s.enabled && s.symbol == symbol)
            .filter(|s| s.stop_loss_pct > 0.0 || s.take_profit_pct > 0.0)
        {
            let mut breached: Option<&'static str> = None;
            for account in &accounts {
                let Some(position) = self
                    .lifecycle
                    .open_position(&account.id, Some(&strategy.id), symbol)
                    .await
                else {
                    continue;
                };
                if position.entry_price <= 0.0 {
                    continue;
                }
                let pnl_pct = (price - position.entry_price) / position.entry_price
                    * position.side.sign();
                if strategy.stop_loss_pct > 0.0 && pnl_pct <= -strategy.stop_loss_pct {
                    breached = Some("stop-loss");
                } else if strategy.take_profit_pct > 0.0 && pnl_pct >= strategy.take_profit_pct {
                    breached = Some("take-profit");
                }
            }

            if let Some(trigger) = breached {
                info!(strategy = %strategy.id, symbol = %symbol, trigger = trigger, "Protective exit");
                if let Err(e) = self.router.route(strategy, Signal::Exit, price).await {
                    warn!(strategy = %strategy.id, error = %e, "Protective exit failed");
                }
            }
        }
    }
}

#[async_trait]
impl super::Task for TradingTick {
    fn name(&self) -> &'static str {
        "trading-tick"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> Result<()> {
        // One fetch per distinct symbol among enabled strategies.
        for symbol in self.registry.enabled_symbols().await {
            let Some(price) = self.fetch_price(&symbol).await else {
                let _ = self.event_tx.try_send(ActivityEvent::OrderFailed {
                    strategy_id: None,
                    symbol: symbol.clone(),
                    error: "price unavailable".into(),
                });
                continue;
            };

            self.registry.record_price(&symbol, price).await;
            self.lifecycle.mark_to_market(&symbol, price).await;

            for (strategy_id, signal) in self.registry.signals_for(&symbol).await {
                let snapshot = match self.registry.snapshot(&strategy_id).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(strategy = %strategy_id, error = %e, "Snapshot failed; strategy skipped");
                        continue;
                    }
                };
                debug!(strategy = %strategy_id, signal = %signal, price = price, "Signal");
                if let Err(e) = self.router.route(&snapshot, signal, price).await {
                    warn!(
                        strategy = %strategy_id,
                        policy = ?e.policy(),
                        error = %e,
                        "Routing failed; continuing with remaining strategies"
                    );
                }
            }

            self.check_protective_exits(&symbol, price).await;
        }
        Ok(())
    }
}

/// Periodic evaluation of the account-cycling policy.
pub struct CycleCheck {
    lifecycle: Arc<LifecycleManager>,
    period: Duration,
}

impl CycleCheck {
    pub fn new(lifecycle: Arc<LifecycleManager>, period: Duration) -> Self {
        Self { lifecycle, period }
    }
}

#[async_trait]
impl super::Task for CycleCheck {
    fn name(&self) -> &'static str {
        "account-cycle-check"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> Result<()> {
        self.lifecycle.run_cycle_checks().await
    }
}

/// Deletes archived history past the retention window.
pub struct ArchivePurge {
    lifecycle: Arc<LifecycleManager>,
    period: Duration,
}

impl ArchivePurge {
    pub fn new(lifecycle: Arc<LifecycleManager>, period: Duration) -> Self {
        Self { lifecycle, period }
    }
}

#[async_trait]
impl super::Task for ArchivePurge {
    fn name(&self) -> &'static str {
        "archive-purge"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> Result<()> {
        let purged = self.lifecycle.purge_archive().await?;
        if purged > 0 {
            info!(rows = purged, "Archive purged");
        }
        Ok(())
    }
}

/// Drains the notification batcher on its own timer.
pub struct NotificationFlush {
    batcher: Arc<NotificationBatcher>,
    period: Duration,
}

impl NotificationFlush {
    pub fn new(batcher: Arc<NotificationBatcher>, period: Duration) -> Self {
        Self { batcher, period }
    }
}

#[async_trait]
impl super::Task for NotificationFlush {
    fn name(&self) -> &'static str {
        "notification-flush"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> Result<()> {
        self.batcher.flush().await;
        Ok(())
    }
}

/// Re-evaluates every safety check against fresh account, performance and
/// configuration state.
pub struct GateRefresh {
    gate: Arc<SafetyGate>,
    lifecycle: Arc<LifecycleManager>,
    perf: Arc<PerformanceAggregator>,
    registry: Arc<StrategyRegistry>,
    event_tx: mpsc::Sender<ActivityEvent>,
    safety: SafetyConfig,
    /// Account whose track record backs the performance checks.
    benchmark_account: String,
    credentials_present: bool,
    period: Duration,
}

impl GateRefresh {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<SafetyGate>,
        lifecycle: Arc<LifecycleManager>,
        perf: Arc<PerformanceAggregator>,
        registry: Arc<StrategyRegistry>,
        event_tx: mpsc::Sender<ActivityEvent>,
        safety: SafetyConfig,
        benchmark_account: impl Into<String>,
        credentials_present: bool,
        period: Duration,
    ) -> Self {
        Self {
            gate,
            lifecycle,
            perf,
            registry,
            event_tx,
            safety,
            benchmark_account: benchmark_account.into(),
            credentials_present,
            period,
        }
    }
}

#[async_trait]
impl super::Task for GateRefresh {
    fn name(&self) -> &'static str {
        "gate-refresh"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) -> Result<()> {
        let summary = self.lifecycle.summary(&self.benchmark_account).await?;
        let ctx = CheckContext {
            safety: self.safety.clone(),
            perf: self.perf.account_snapshot(&self.benchmark_account),
            balance: summary.balance,
            daily_pnl: summary.daily_pnl,
            open_positions: summary.open_positions,
            credentials_present: self.credentials_present,
            configured_symbols: self.registry.configured_symbols().await,
            now: Utc::now(),
        };

        let previous = self.gate.check_states();
        let states = self.gate.evaluate_all(&ctx);
        for state in states.iter().filter(|s| s.verdict == Verdict::Fail) {
            let was_failing = previous
                .iter()
                .any(|p| p.id == state.id && p.verdict == Verdict::Fail);
            if !was_failing {
                let _ = self.event_tx.try_send(ActivityEvent::CheckFailed {
                    check_id: state.id.clone(),
                    evidence: state.evidence.clone(),
                });
            }
        }
        Ok(())
    }
}
