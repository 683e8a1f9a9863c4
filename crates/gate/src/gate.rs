use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{Error, Result};

use crate::check::{CheckContext, SafetyCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    NotChecked,
    Pass,
    Fail,
}

/// Latest stored result of one safety check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckState {
    pub id: String,
    pub description: String,
    pub critical: bool,
    pub verdict: Verdict,
    pub evidence: String,
    pub evaluated_at: Option<DateTime<Utc>>,
}

/// The gatekeeper in front of real-money execution.
///
/// Holds a set of named checks, each `NotChecked → {Pass, Fail}` and
/// re-entrant, plus the global real-trading flag. The flag starts
/// disabled; `disable_real_trading` always succeeds. Every real-money
/// routing decision calls `authorize_real_order` at submission time,
/// never relying on a verdict cached at mode-set time.
pub struct SafetyGate {
    checks: Vec<Box<dyn SafetyCheck>>,
    states: RwLock<HashMap<String, CheckState>>,
    disabled: HashSet<String>,
    real_enabled: AtomicBool,
}

impl SafetyGate {
    pub fn new(checks: Vec<Box<dyn SafetyCheck>>, disabled_checks: &[String]) -> Self {
        let disabled: HashSet<String> = disabled_checks.iter().cloned().collect();
        for id in &disabled {
            info!(check = %id, "Safety check disabled by configuration");
        }
        let states = checks
            .iter()
            .filter(|c| !disabled.contains(c.id()))
            .map(|c| {
                (
                    c.id().to_string(),
                    CheckState {
                        id: c.id().to_string(),
                        description: c.description().to_string(),
                        critical: c.critical(),
                        verdict: Verdict::NotChecked,
                        evidence: String::new(),
                        evaluated_at: None,
                    },
                )
            })
            .collect();

        Self {
            checks,
            states: RwLock::new(states),
            disabled,
            real_enabled: AtomicBool::new(false),
        }
    }

    /// Re-run every enabled check against a fresh context.
    pub fn evaluate_all(&self, ctx: &CheckContext) -> Vec<CheckState> {
        let now = Utc::now();
        let mut states = self.states.write().expect("gate lock poisoned");

        for check in &self.checks {
            if self.disabled.contains(check.id()) {
                continue;
            }
            let outcome = check.evaluate(ctx);
            let verdict = if outcome.passed {
                Verdict::Pass
            } else {
                Verdict::Fail
            };
            if verdict == Verdict::Fail {
                warn!(
                    check = check.id(),
                    critical = check.critical(),
                    evidence = %outcome.evidence,
                    "Safety check failed"
                );
            }
            states.insert(
                check.id().to_string(),
                CheckState {
                    id: check.id().to_string(),
                    description: check.description().to_string(),
                    critical: check.critical(),
                    verdict,
                    evidence: outcome.evidence,
                    evaluated_at: Some(now),
                },
            );
        }

        let mut result: Vec<CheckState> = states.values().cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub fn check_states(&self) -> Vec<CheckState> {
        let states = self.states.read().expect("gate lock poisoned");
        let mut result: Vec<CheckState> = states.values().cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// AND of the critical checks' latest verdicts. A critical check that
    /// was never evaluated counts as not passed.
    pub fn all_critical_passed(&self) -> bool {
        self.states
            .read()
            .expect("gate lock poisoned")
            .values()
            .filter(|s| s.critical)
            .all(|s| s.verdict == Verdict::Pass)
    }

    /// AND of every enabled check's latest verdict.
    pub fn ready_for_live_trading(&self) -> bool {
        self.states
            .read()
            .expect("gate lock poisoned")
            .values()
            .all(|s| s.verdict == Verdict::Pass)
    }

    /// Ids of critical checks whose latest verdict is not `Pass`.
    pub fn failing_critical(&self) -> Vec<String> {
        let states = self.states.read().expect("gate lock poisoned");
        let mut failed: Vec<String> = states
            .values()
            .filter(|s| s.critical && s.verdict != Verdict::Pass)
            .map(|s| s.id.clone())
            .collect();
        failed.sort();
        failed
    }

    /// Turn the real-trading flag on. Refused unless every critical check
    /// passes or `force` overrides them.
    pub fn enable_real_trading(&self, force: bool) -> bool {
        if !self.all_critical_passed() && !force {
            warn!(
                failing = ?self.failing_critical(),
                "Refusing to enable real trading"
            );
            return false;
        }
        if force && !self.all_critical_passed() {
            warn!(
                failing = ?self.failing_critical(),
                "Real trading FORCE-enabled with failing critical checks"
            );
        }
        self.real_enabled.store(true, Ordering::SeqCst);
        info!("Real trading enabled");
        true
    }

    /// Fail-safe: always succeeds, and is the state at startup.
    pub fn disable_real_trading(&self) {
        self.real_enabled.store(false, Ordering::SeqCst);
        info!("Real trading disabled");
    }

    pub fn real_trading_enabled(&self) -> bool {
        self.real_enabled.load(Ordering::SeqCst)
    }

    /// Submission-time clearance for one real-money order. Names the
    /// failing checks in the refusal so nothing is ever rejected opaquely.
    pub fn authorize_real_order(&self) -> Result<()> {
        if !self.real_enabled.load(Ordering::SeqCst) {
            return Err(Error::SafetyGateRefused {
                failed: vec!["real-trading-disabled".to_string()],
            });
        }
        let failed = self.failing_critical();
        if !failed.is_empty() {
            return Err(Error::SafetyGateRefused { failed });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckOutcome, SafetyCheck};
    use common::SafetyConfig;
    use perf::PerfSnapshot;

    struct FixedCheck {
        id: &'static str,
        critical: bool,
        passes: bool,
    }

    impl SafetyCheck for FixedCheck {
        fn id(&self) -> &'static str {
            self.id
        }
        fn description(&self) -> &'static str {
            "fixed"
        }
        fn critical(&self) -> bool {
            self.critical
        }
        fn evaluate(&self, _ctx: &CheckContext) -> CheckOutcome {
            if self.passes {
                CheckOutcome::pass("fixed pass")
            } else {
                CheckOutcome::fail("fixed fail")
            }
        }
    }

    fn ctx() -> CheckContext {
        CheckContext {
            safety: SafetyConfig::default(),
            perf: PerfSnapshot::default(),
            balance: 0.0,
            daily_pnl: 0.0,
            open_positions: 0,
            credentials_present: false,
            configured_symbols: Vec::new(),
            now: Utc::now(),
        }
    }

    fn gate_with(checks: Vec<(&'static str, bool, bool)>) -> SafetyGate {
        let boxed: Vec<Box<dyn SafetyCheck>> = checks
            .into_iter()
            .map(|(id, critical, passes)| {
                Box::new(FixedCheck {
                    id,
                    critical,
                    passes,
                }) as Box<dyn SafetyCheck>
            })
            .collect();
        SafetyGate::new(boxed, &[])
    }

    #[test]
    fn critical_fail_blocks_enable_without_force() {
        // {A: critical, pass}, {B: critical, fail}, {C: non-critical, pass}
        let gate = gate_with(vec![("a", true, true), ("b", true, false), ("c", false, true)]);
        gate.evaluate_all(&ctx());

        assert!(!gate.all_critical_passed());
        assert!(!gate.ready_for_live_trading());
        assert!(!gate.enable_real_trading(false));
        assert!(!gate.real_trading_enabled());
        assert_eq!(gate.failing_critical(), vec!["b".to_string()]);
    }

    #[test]
    fn force_overrides_failing_criticals() {
        let gate = gate_with(vec![("a", true, false)]);
        gate.evaluate_all(&ctx());

        assert!(gate.enable_real_trading(true));
        assert!(gate.real_trading_enabled());
    }

    #[test]
    fn non_critical_fail_blocks_ready_but_not_enable() {
        let gate = gate_with(vec![("a", true, true), ("c", false, false)]);
        gate.evaluate_all(&ctx());

        assert!(gate.all_critical_passed());
        assert!(!gate.ready_for_live_trading());
        assert!(gate.enable_real_trading(false));
    }

    #[test]
    fn unchecked_critical_counts_as_not_passed() {
        let gate = gate_with(vec![("a", true, true)]);
        // evaluate_all never called: verdict is NotChecked
        assert!(!gate.all_critical_passed());
        assert!(!gate.enable_real_trading(false));
    }

    #[test]
    fn disable_always_succeeds_and_is_the_default() {
        let gate = gate_with(vec![("a", true, true)]);
        assert!(!gate.real_trading_enabled());

        gate.evaluate_all(&ctx());
        assert!(gate.enable_real_trading(false));
        gate.disable_real_trading();
        assert!(!gate.real_trading_enabled());
    }

    #[test]
    fn authorize_names_failing_checks() {
        let gate = gate_with(vec![("a", true, false), ("b", true, false)]);
        gate.evaluate_all(&ctx());
        gate.enable_real_trading(true);

        match gate.authorize_real_order() {
            Err(Error::SafetyGateRefused { failed }) => {
                assert_eq!(failed, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected SafetyGateRefused, got {other:?}"),
        }
    }

    #[test]
    fn authorize_refuses_while_flag_disabled() {
        let gate = gate_with(vec![("a", true, true)]);
        gate.evaluate_all(&ctx());

        match gate.authorize_real_order() {
            Err(Error::SafetyGateRefused { failed }) => {
                assert_eq!(failed, vec!["real-trading-disabled".to_string()]);
            }
            other => panic!("expected SafetyGateRefused, got {other:?}"),
        }
    }

    #[test]
    fn checks_are_reentrant() {
        let gate = gate_with(vec![("a", true, false)]);
        gate.evaluate_all(&ctx());
        assert!(!gate.all_critical_passed());

        // Same check id re-registered as passing simulates the underlying
        // condition recovering between evaluations.
        let gate2 = gate_with(vec![("a", true, true)]);
        gate2.evaluate_all(&ctx());
        gate2.evaluate_all(&ctx());
        assert!(gate2.all_critical_passed());
    }

    #[test]
    fn disabled_checks_are_skipped_entirely() {
        let boxed: Vec<Box<dyn SafetyCheck>> = vec![
            Box::new(FixedCheck {
                id: "a",
                critical: true,
                passes: true,
            }),
            Box::new(FixedCheck {
                id: "b",
                critical: true,
                passes: false,
            }),
        ];
        let gate = SafetyGate::new(boxed, &["b".to_string()]);
        gate.evaluate_all(&ctx());

        assert!(gate.all_critical_passed());
        assert!(gate.check_states().iter().all(|s| s.id != "b"));
    }
}
