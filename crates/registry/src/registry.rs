use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use common::{Error, Mode, Result, Signal, Venue};
use gate::SafetyGate;
use perf::{PerfSnapshot, PerformanceAggregator};

use crate::config::{StrategyConfig, StrategyFileConfig};
use crate::router::OrderRouter;
use crate::strategies::build_strategy;
use crate::Strategy;

/// Public view of one registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub id: String,
    pub name: String,
    pub strategy_type: String,
    pub symbol: String,
    pub mode: Mode,
    pub enabled: bool,
    pub timeframe_secs: u64,
    pub position_fraction: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_positions: usize,
    /// Simulated routing verified against the sim adapter.
    pub sim_ready: bool,
    /// Real routing verified against the real adapter and the gate.
    pub real_ready: bool,
    pub perf: PerfSnapshot,
}

struct Entry {
    cfg: StrategyConfig,
    logic: Box<dyn Strategy>,
    /// Rolling window of recent prices, oldest first.
    history: Vec<f64>,
    sim_ready: bool,
    real_ready: bool,
}

impl Entry {
    fn snapshot(&self, perf: PerfSnapshot) -> StrategySnapshot {
        StrategySnapshot {
            id: self.cfg.id.clone(),
            name: self.cfg.name.clone(),
            strategy_type: self.cfg.strategy_type.clone(),
            symbol: self.cfg.symbol.clone(),
            mode: self.cfg.mode,
            enabled: self.cfg.enabled,
            timeframe_secs: self.cfg.timeframe_secs,
            position_fraction: self.cfg.position_fraction,
            stop_loss_pct: self.cfg.stop_loss_pct,
            take_profit_pct: self.cfg.take_profit_pct,
            max_positions: self.cfg.max_positions,
            sim_ready: self.sim_ready,
            real_ready: self.real_ready,
            perf,
        }
    }
}

/// Canonical set of strategies plus their enabled/mode state.
///
/// Mode and enabled changes are picked up by the scheduler on its next
/// tick; nothing here cancels in-flight work.
pub struct StrategyRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    gate: Arc<SafetyGate>,
    perf: Arc<PerformanceAggregator>,
    max_history: usize,
}

impl StrategyRegistry {
    const DEFAULT_MAX_HISTORY: usize = 500;

    /// Build the registry from config. Unknown strategy types and invalid
    /// parameters are configuration errors, surfaced before anything runs.
    pub fn from_config(
        file_cfg: &StrategyFileConfig,
        gate: Arc<SafetyGate>,
        perf: Arc<PerformanceAggregator>,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        for cfg in &file_cfg.strategies {
            if cfg.position_fraction <= 0.0 || cfg.position_fraction > 1.0 {
                return Err(Error::ConfigurationInvalid(format!(
                    "strategy '{}': position_fraction must be in (0, 1]",
                    cfg.id
                )));
            }
            if entries.contains_key(&cfg.id) {
                return Err(Error::ConfigurationInvalid(format!(
                    "duplicate strategy id '{}'",
                    cfg.id
                )));
            }
            let logic = build_strategy(cfg)?;
            info!(id = %cfg.id, kind = logic.kind(), symbol = %cfg.symbol, "Registered strategy");
            entries.insert(
                cfg.id.clone(),
                Entry {
                    cfg: cfg.clone(),
                    logic,
                    history: Vec::new(),
                    sim_ready: false,
                    real_ready: false,
                },
            );
        }
        Ok(Self {
            entries: RwLock::new(entries),
            gate,
            perf,
            max_history: Self::DEFAULT_MAX_HISTORY,
        })
    }

    /// Every registered strategy with its current snapshot. Never fails.
    pub async fn list_strategies(&self) -> Vec<StrategySnapshot> {
        let entries = self.entries.read().await;
        let mut out: Vec<StrategySnapshot> = entries
            .values()
            .map(|e| e.snapshot(self.perf.strategy_snapshot(&e.cfg.id)))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn snapshot(&self, id: &str) -> Result<StrategySnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .map(|e| e.snapshot(self.perf.strategy_snapshot(id)))
            .ok_or_else(|| Error::NotFound {
                kind: "strategy",
                id: id.to_string(),
            })
    }

    /// Enable or disable a strategy. An enabled strategy's symbol joins
    /// the per-tick price fetch set; a disabled one drops out, along with
    /// any pending evaluation, on the next tick.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "strategy",
            id: id.to_string(),
        })?;
        entry.cfg.enabled = enabled;
        info!(id = %id, enabled = enabled, "Strategy enabled flag changed");
        Ok(())
    }

    /// Change a strategy's routing mode and recompute its readiness flags.
    /// Takes effect on the scheduler's next tick. The real-leg readiness
    /// here is advisory; the router re-validates the gate verdict at
    /// order-submission time.
    pub async fn set_mode(&self, id: &str, mode: Mode, router: &OrderRouter) -> Result<()> {
        let sim_ready = if mode.routes_simulated() {
            router.probe(Venue::Simulated).await
        } else {
            false
        };
        let real_ready = if mode.routes_real() {
            router.probe(Venue::Real).await && self.gate.all_critical_passed()
        } else {
            false
        };

        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "strategy",
            id: id.to_string(),
        })?;
        entry.cfg.mode = mode;
        entry.sim_ready = sim_ready;
        entry.real_ready = real_ready;
        info!(
            id = %id,
            mode = %mode,
            sim_ready = sim_ready,
            real_ready = real_ready,
            "Strategy mode changed"
        );
        Ok(())
    }

    /// Distinct symbols among enabled strategies; one price fetch each per tick.
    pub async fn enabled_symbols(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut symbols: Vec<String> = entries
            .values()
            .filter(|e| e.cfg.enabled)
            .map(|e| e.cfg.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Append a fresh price to the window of every enabled strategy on the
    /// symbol.
    pub async fn record_price(&self, symbol: &str, price: f64) {
        let mut entries = self.entries.write().await;
        for entry in entries
            .values_mut()
            .filter(|e| e.cfg.enabled && e.cfg.symbol == symbol)
        {
            entry.history.push(price);
            if entry.history.len() > self.max_history {
                entry.history.remove(0);
            }
        }
    }

    /// Evaluate every enabled strategy on the symbol over its own window.
    pub async fn signals_for(&self, symbol: &str) -> Vec<(String, Signal)> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.cfg.enabled && e.cfg.symbol == symbol)
            .filter_map(|e| e.logic.evaluate(&e.history).map(|s| (e.cfg.id.clone(), s)))
            .collect()
    }

    /// Symbols every registered strategy is configured to trade,
    /// regardless of enabled state. Feeds the allowed-symbols check.
    pub async fn configured_symbols(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut symbols: Vec<String> = entries.values().map(|e| e.cfg.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}
