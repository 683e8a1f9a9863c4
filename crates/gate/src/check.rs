use chrono::{DateTime, Timelike, Utc};

use common::SafetyConfig;
use perf::PerfSnapshot;

/// Everything a check may look at. Gathered by the caller before
/// evaluation so the predicates themselves stay pure and synchronous.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub safety: SafetyConfig,
    /// Rollup of the benchmark (simulated) account's closed trades.
    pub perf: PerfSnapshot,
    pub balance: f64,
    /// Realized P&L since the start of the current UTC day.
    pub daily_pnl: f64,
    pub open_positions: usize,
    pub credentials_present: bool,
    /// Symbols the registered strategies are configured to trade.
    pub configured_symbols: Vec<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub passed: bool,
    pub evidence: String,
}

impl CheckOutcome {
    pub fn pass(evidence: impl Into<String>) -> Self {
        Self {
            passed: true,
            evidence: evidence.into(),
        }
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self {
            passed: false,
            evidence: evidence.into(),
        }
    }
}

/// One named safety predicate. Checks are independent and re-entrant;
/// the gate stores each check's latest verdict and evidence.
pub trait SafetyCheck: Send + Sync {
    fn id(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn critical(&self) -> bool;
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome;
}

/// Broker credentials are configured.
pub struct CredentialsPresent;

impl SafetyCheck for CredentialsPresent {
    fn id(&self) -> &'static str {
        "credentials"
    }
    fn description(&self) -> &'static str {
        "Real-funds broker credentials are configured"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        if ctx.credentials_present {
            CheckOutcome::pass("API key and secret present")
        } else {
            CheckOutcome::fail("API key or secret missing")
        }
    }
}

/// Enough closed trades at a sufficient win rate.
pub struct PerformanceRecord;

impl SafetyCheck for PerformanceRecord {
    fn id(&self) -> &'static str {
        "performance-record"
    }
    fn description(&self) -> &'static str {
        "Simulated track record meets trade-count and win-rate thresholds"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        let trades = ctx.perf.trades;
        let win_rate = ctx.perf.win_rate();
        let evidence = format!(
            "{trades} trades at {:.1}% win rate (need >= {} at {:.1}%)",
            win_rate * 100.0,
            ctx.safety.min_trades,
            ctx.safety.min_win_rate * 100.0
        );
        if trades >= ctx.safety.min_trades && win_rate >= ctx.safety.min_win_rate {
            CheckOutcome::pass(evidence)
        } else {
            CheckOutcome::fail(evidence)
        }
    }
}

/// Today's realized loss has not exceeded the configured maximum.
pub struct DailyLoss;

impl SafetyCheck for DailyLoss {
    fn id(&self) -> &'static str {
        "daily-loss"
    }
    fn description(&self) -> &'static str {
        "Realized loss today is within the daily limit"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        let evidence = format!(
            "daily P&L {:.2} (limit -{:.2})",
            ctx.daily_pnl, ctx.safety.max_daily_loss
        );
        if ctx.daily_pnl > -ctx.safety.max_daily_loss {
            CheckOutcome::pass(evidence)
        } else {
            CheckOutcome::fail(evidence)
        }
    }
}

/// Emergency stop: balance must stay above the configured floor.
pub struct BalanceFloor;

impl SafetyCheck for BalanceFloor {
    fn id(&self) -> &'static str {
        "balance-floor"
    }
    fn description(&self) -> &'static str {
        "Account balance is above the emergency-stop floor"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        let evidence = format!(
            "balance {:.2} (floor {:.2})",
            ctx.balance, ctx.safety.balance_floor
        );
        if ctx.balance >= ctx.safety.balance_floor {
            CheckOutcome::pass(evidence)
        } else {
            CheckOutcome::fail(evidence)
        }
    }
}

/// Every configured symbol appears on the allow list.
pub struct AllowedSymbols;

impl SafetyCheck for AllowedSymbols {
    fn id(&self) -> &'static str {
        "allowed-symbols"
    }
    fn description(&self) -> &'static str {
        "All configured symbols are on the allow list"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        if ctx.safety.allowed_symbols.is_empty() {
            return CheckOutcome::fail("allow list is empty");
        }
        let rogue: Vec<&String> = ctx
            .configured_symbols
            .iter()
            .filter(|s| !ctx.safety.allowed_symbols.contains(s))
            .collect();
        if rogue.is_empty() {
            CheckOutcome::pass(format!(
                "{} configured symbols all allowed",
                ctx.configured_symbols.len()
            ))
        } else {
            CheckOutcome::fail(format!("symbols not on allow list: {rogue:?}"))
        }
    }
}

/// Operator has explicitly approved live trading.
pub struct ManualApproval;

impl SafetyCheck for ManualApproval {
    fn id(&self) -> &'static str {
        "manual-approval"
    }
    fn description(&self) -> &'static str {
        "Operator has manually approved live trading"
    }
    fn critical(&self) -> bool {
        true
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        if ctx.safety.manual_approval {
            CheckOutcome::pass("approval flag set")
        } else {
            CheckOutcome::fail("approval flag not set")
        }
    }
}

/// Current time falls inside the configured trading-hours window.
pub struct TradingHours;

impl SafetyCheck for TradingHours {
    fn id(&self) -> &'static str {
        "trading-hours"
    }
    fn description(&self) -> &'static str {
        "Current UTC time is inside the trading-hours window"
    }
    fn critical(&self) -> bool {
        false
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        let (start, end) = ctx.safety.trading_hours_utc;
        let hour = ctx.now.hour();
        // start == end means trading around the clock. A window may wrap
        // midnight, e.g. (22, 4).
        let open = if start == end {
            true
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        };
        let evidence = format!("hour {hour} UTC, window {start}..{end}");
        if open {
            CheckOutcome::pass(evidence)
        } else {
            CheckOutcome::fail(evidence)
        }
    }
}

/// Risk-limit configuration is sane and the open-position count respects it.
pub struct PositionLimits;

impl SafetyCheck for PositionLimits {
    fn id(&self) -> &'static str {
        "position-limits"
    }
    fn description(&self) -> &'static str {
        "Position-size fraction and open-position count are within limits"
    }
    fn critical(&self) -> bool {
        false
    }
    fn evaluate(&self, ctx: &CheckContext) -> CheckOutcome {
        let fraction = ctx.safety.max_position_size_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return CheckOutcome::fail(format!("position-size fraction {fraction} out of (0, 1]"));
        }
        if ctx.safety.max_open_positions == 0 {
            return CheckOutcome::fail("max open positions is zero");
        }
        let evidence = format!(
            "{} open positions (limit {})",
            ctx.open_positions, ctx.safety.max_open_positions
        );
        if ctx.open_positions <= ctx.safety.max_open_positions {
            CheckOutcome::pass(evidence)
        } else {
            CheckOutcome::fail(evidence)
        }
    }
}

/// The standard check set, in evaluation order.
pub fn default_checks() -> Vec<Box<dyn SafetyCheck>> {
    vec![
        Box::new(CredentialsPresent),
        Box::new(PerformanceRecord),
        Box::new(DailyLoss),
        Box::new(BalanceFloor),
        Box::new(AllowedSymbols),
        Box::new(ManualApproval),
        Box::new(TradingHours),
        Box::new(PositionLimits),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn context() -> CheckContext {
        CheckContext {
            safety: SafetyConfig {
                allowed_symbols: vec!["BTCUSD".into()],
                manual_approval: true,
                ..SafetyConfig::default()
            },
            perf: PerfSnapshot {
                trades: 50,
                wins: 30,
                profit: 250.0,
                max_drawdown: 40.0,
            },
            balance: 10_000.0,
            daily_pnl: 0.0,
            open_positions: 1,
            credentials_present: true,
            configured_symbols: vec!["BTCUSD".into()],
            now: Utc::now(),
        }
    }

    #[test]
    fn performance_record_needs_both_thresholds() {
        let mut ctx = context();
        assert!(PerformanceRecord.evaluate(&ctx).passed);

        ctx.perf.trades = 5; // below min_trades
        assert!(!PerformanceRecord.evaluate(&ctx).passed);

        ctx.perf.trades = 50;
        ctx.perf.wins = 10; // 20% win rate
        assert!(!PerformanceRecord.evaluate(&ctx).passed);
    }

    #[test]
    fn daily_loss_fails_at_limit() {
        let mut ctx = context();
        ctx.daily_pnl = -ctx.safety.max_daily_loss;
        assert!(!DailyLoss.evaluate(&ctx).passed);

        ctx.daily_pnl = -(ctx.safety.max_daily_loss - 1.0);
        assert!(DailyLoss.evaluate(&ctx).passed);
    }

    #[test]
    fn allowed_symbols_rejects_rogue_and_empty_list() {
        let mut ctx = context();
        assert!(AllowedSymbols.evaluate(&ctx).passed);

        ctx.configured_symbols.push("DOGEUSD".into());
        let outcome = AllowedSymbols.evaluate(&ctx);
        assert!(!outcome.passed);
        assert!(outcome.evidence.contains("DOGEUSD"));

        ctx.safety.allowed_symbols.clear();
        assert!(!AllowedSymbols.evaluate(&ctx).passed);
    }

    #[test]
    fn trading_hours_window_wraps_midnight() {
        let mut ctx = context();
        ctx.safety.trading_hours_utc = (22, 4);
        ctx.now = Utc::now().date_naive().and_hms_opt(23, 0, 0).unwrap().and_utc();
        assert!(TradingHours.evaluate(&ctx).passed);

        ctx.now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(!TradingHours.evaluate(&ctx).passed);
    }

    #[test]
    fn position_limits_audits_configuration() {
        let mut ctx = context();
        assert!(PositionLimits.evaluate(&ctx).passed);

        ctx.safety.max_position_size_fraction = 1.5;
        assert!(!PositionLimits.evaluate(&ctx).passed);

        ctx.safety.max_position_size_fraction = 0.1;
        ctx.open_positions = 99;
        assert!(!PositionLimits.evaluate(&ctx).passed);
    }
}
