use common::{Error, Result, Signal};

use crate::config::{param_f64, param_usize, StrategyConfig};
use crate::Strategy;

/// Build the signal logic for a strategy config.
/// Unknown type tags and out-of-range parameters are configuration errors.
pub fn build_strategy(cfg: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    match cfg.strategy_type.as_str() {
        "ma-cross" => {
            let fast = param_usize(&cfg.params, "fast", 10);
            let slow = param_usize(&cfg.params, "slow", 30);
            Ok(Box::new(MaCross::new(fast, slow)?))
        }
        "mean-reversion" => {
            let period = param_usize(&cfg.params, "period", 20);
            let entry_band = param_f64(&cfg.params, "entry_band", 0.02);
            let exit_band = param_f64(&cfg.params, "exit_band", 0.005);
            Ok(Box::new(MeanReversion::new(period, entry_band, exit_band)?))
        }
        other => Err(Error::ConfigurationInvalid(format!(
            "unknown strategy type '{other}' for '{}'",
            cfg.id
        ))),
    }
}

fn sma(window: &[f64]) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

/// Moving-average crossover: enter long on a golden cross of the fast
/// average over the slow one, exit on the death cross.
pub struct MaCross {
    fast: usize,
    slow: usize,
}

impl MaCross {
    pub fn new(fast: usize, slow: usize) -> Result<Self> {
        if fast == 0 || slow == 0 || fast >= slow {
            return Err(Error::ConfigurationInvalid(format!(
                "ma-cross requires 0 < fast < slow, got fast={fast} slow={slow}"
            )));
        }
        Ok(Self { fast, slow })
    }

    fn relation(&self, history: &[f64]) -> f64 {
        let fast = sma(&history[history.len() - self.fast..]);
        let slow = sma(&history[history.len() - self.slow..]);
        fast - slow
    }
}

impl Strategy for MaCross {
    fn kind(&self) -> &'static str {
        "ma-cross"
    }

    fn evaluate(&self, history: &[f64]) -> Option<Signal> {
        // One extra point so the previous tick's relation is available.
        if history.len() < self.slow + 1 {
            return None;
        }
        let current = self.relation(history);
        let previous = self.relation(&history[..history.len() - 1]);

        if previous <= 0.0 && current > 0.0 {
            Some(Signal::EnterLong)
        } else if previous >= 0.0 && current < 0.0 {
            Some(Signal::Exit)
        } else {
            None
        }
    }
}

/// Mean reversion: enter against large deviations from the rolling mean,
/// exit once price returns inside the neutral band.
pub struct MeanReversion {
    period: usize,
    entry_band: f64,
    exit_band: f64,
}

impl MeanReversion {
    pub fn new(period: usize, entry_band: f64, exit_band: f64) -> Result<Self> {
        if period < 2 {
            return Err(Error::ConfigurationInvalid(format!(
                "mean-reversion period must be >= 2, got {period}"
            )));
        }
        if entry_band <= 0.0 || exit_band < 0.0 || exit_band >= entry_band {
            return Err(Error::ConfigurationInvalid(format!(
                "mean-reversion requires 0 <= exit_band < entry_band, got entry={entry_band} exit={exit_band}"
            )));
        }
        Ok(Self {
            period,
            entry_band,
            exit_band,
        })
    }
}

impl Strategy for MeanReversion {
    fn kind(&self) -> &'static str {
        "mean-reversion"
    }

    fn evaluate(&self, history: &[f64]) -> Option<Signal> {
        if history.len() < self.period {
            return None;
        }
        let mean = sma(&history[history.len() - self.period..]);
        if mean <= 0.0 {
            return None;
        }
        let deviation = (history[history.len() - 1] - mean) / mean;

        if deviation <= -self.entry_band {
            Some(Signal::EnterLong)
        } else if deviation >= self.entry_band {
            Some(Signal::EnterShort)
        } else if deviation.abs() <= self.exit_band {
            Some(Signal::Exit)
        } else {
            None
        }
    }
}
