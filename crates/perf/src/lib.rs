use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::TradeOutcome;

/// Rolled-up performance numbers for one strategy or account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub trades: u64,
    pub wins: u64,
    pub profit: f64,
    /// Largest drop of the cumulative-profit curve from its running maximum.
    pub max_drawdown: f64,
}

impl PerfSnapshot {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rollup {
    trades: u64,
    wins: u64,
    profit: f64,
    peak_profit: f64,
    max_drawdown: f64,
}

impl Rollup {
    fn record(&mut self, realized_pnl: f64) {
        self.trades += 1;
        if realized_pnl > 0.0 {
            self.wins += 1;
        }
        self.profit += realized_pnl;
        if self.profit > self.peak_profit {
            self.peak_profit = self.profit;
        }
        let drawdown = self.peak_profit - self.profit;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }

    fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            trades: self.trades,
            wins: self.wins,
            profit: self.profit,
            max_drawdown: self.max_drawdown,
        }
    }
}

#[derive(Default)]
struct Inner {
    seen_close_ids: HashSet<String>,
    by_strategy: HashMap<String, Rollup>,
    by_account: HashMap<String, Rollup>,
}

/// Consumes trade-outcome events and keeps running totals per strategy and
/// per account. Replayed events are ignored (dedup by close id), so a
/// crashed-and-replayed producer cannot skew the rollups.
#[derive(Default)]
pub struct PerformanceAggregator {
    inner: RwLock<Inner>,
}

impl PerformanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome. Returns false when the close id was already seen.
    pub fn record(&self, outcome: &TradeOutcome) -> bool {
        let mut inner = self.inner.write().expect("perf lock poisoned");
        if !inner.seen_close_ids.insert(outcome.close_id.clone()) {
            debug!(close_id = %outcome.close_id, "Duplicate trade outcome ignored");
            return false;
        }

        if let Some(strategy_id) = &outcome.strategy_id {
            inner
                .by_strategy
                .entry(strategy_id.clone())
                .or_default()
                .record(outcome.realized_pnl);
        }
        inner
            .by_account
            .entry(outcome.account_id.clone())
            .or_default()
            .record(outcome.realized_pnl);
        true
    }

    pub fn strategy_snapshot(&self, strategy_id: &str) -> PerfSnapshot {
        self.inner
            .read()
            .expect("perf lock poisoned")
            .by_strategy
            .get(strategy_id)
            .map(Rollup::snapshot)
            .unwrap_or_default()
    }

    pub fn account_snapshot(&self, account_id: &str) -> PerfSnapshot {
        self.inner
            .read()
            .expect("perf lock poisoned")
            .by_account
            .get(account_id)
            .map(Rollup::snapshot)
            .unwrap_or_default()
    }

    /// Drain the outcome channel. Call from `tokio::spawn`.
    pub async fn run(self: Arc<Self>, mut outcome_rx: mpsc::Receiver<TradeOutcome>) {
        while let Some(outcome) = outcome_rx.recv().await {
            self.record(&outcome);
        }
        warn!("PerformanceAggregator: outcome channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn outcome(close_id: &str, pnl: f64) -> TradeOutcome {
        TradeOutcome {
            close_id: close_id.into(),
            account_id: "acct".into(),
            strategy_id: Some("strat".into()),
            symbol: "BTCUSD".into(),
            quantity: 1.0,
            realized_pnl: pnl,
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn rollups_accumulate_wins_and_profit() {
        let agg = PerformanceAggregator::new();
        agg.record(&outcome("c1", 10.0));
        agg.record(&outcome("c2", -4.0));
        agg.record(&outcome("c3", 6.0));

        let snap = agg.strategy_snapshot("strat");
        assert_eq!(snap.trades, 3);
        assert_eq!(snap.wins, 2);
        assert!((snap.profit - 12.0).abs() < 1e-9);
        assert!((snap.win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn replayed_outcome_changes_nothing() {
        let agg = PerformanceAggregator::new();
        assert!(agg.record(&outcome("c1", 10.0)));
        assert!(!agg.record(&outcome("c1", 10.0)));

        let snap = agg.account_snapshot("acct");
        assert_eq!(snap.trades, 1);
        assert!((snap.profit - 10.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_running_maximum() {
        let agg = PerformanceAggregator::new();
        agg.record(&outcome("c1", 10.0)); // peak 10
        agg.record(&outcome("c2", -15.0)); // trough -5, dd 15
        agg.record(&outcome("c3", 20.0)); // new peak 15, dd stays 15

        let snap = agg.account_snapshot("acct");
        assert!((snap.max_drawdown - 15.0).abs() < 1e-9);
        assert!((snap.profit - 15.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_ids_report_empty_snapshot() {
        let agg = PerformanceAggregator::new();
        let snap = agg.strategy_snapshot("nope");
        assert_eq!(snap.trades, 0);
        assert_eq!(snap.win_rate(), 0.0);
    }
}
