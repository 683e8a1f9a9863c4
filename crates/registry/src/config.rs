use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use common::Mode;

/// Top-level strategy config file (TOML).
///
/// Example `config/strategies.toml`:
/// ```toml
/// [[strategy]]
/// id = "btc-ma"
/// type = "ma-cross"
/// name = "BTC MA crossover"
/// symbol = "BTCUSD"
/// mode = "simulated"
/// position_fraction = 0.05
///
/// [strategy.params]
/// fast = 10
/// slow = 30
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    #[serde(rename = "strategy")]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Stable identifier used in logs, events and control calls.
    pub id: String,
    /// Strategy type identifier: "ma-cross" or "mean-reversion".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Human-readable name.
    pub name: String,
    /// Symbol this strategy watches, e.g. "BTCUSD".
    pub symbol: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Evaluation timeframe the price window represents.
    #[serde(default = "default_timeframe")]
    pub timeframe_secs: u64,
    /// Order notional as a fraction of account balance.
    pub position_fraction: f64,
    /// Close when an open position loses this fraction. 0 disables.
    #[serde(default)]
    pub stop_loss_pct: f64,
    /// Close when an open position gains this fraction. 0 disables.
    #[serde(default)]
    pub take_profit_pct: f64,
    /// Concurrent open positions this strategy may hold per account.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Strategy-type-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

fn default_mode() -> Mode {
    Mode::Simulated
}

fn default_enabled() -> bool {
    true
}

fn default_timeframe() -> u64 {
    60
}

fn default_max_positions() -> usize {
    1
}

impl StrategyFileConfig {
    /// Load from a TOML file. Exits process on error.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("Failed to read strategy config at '{path}': {e}"));
        toml::from_str(&content)
            .unwrap_or_else(|e| panic!("Failed to parse strategy config at '{path}': {e}"))
    }
}

pub(crate) fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

pub(crate) fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategy_tables_with_defaults() {
        let cfg: StrategyFileConfig = toml::from_str(
            r#"
            [[strategy]]
            id = "btc-ma"
            type = "ma-cross"
            name = "BTC MA crossover"
            symbol = "BTCUSD"
            position_fraction = 0.05

            [strategy.params]
            fast = 10
            slow = 30

            [[strategy]]
            id = "eth-rev"
            type = "mean-reversion"
            name = "ETH reversion"
            symbol = "ETHUSD"
            mode = "both"
            enabled = false
            position_fraction = 0.02
            stop_loss_pct = 0.03
            "#,
        )
        .unwrap();

        assert_eq!(cfg.strategies.len(), 2);
        let btc = &cfg.strategies[0];
        assert_eq!(btc.mode, Mode::Simulated);
        assert!(btc.enabled);
        assert_eq!(btc.max_positions, 1);
        assert_eq!(param_usize(&btc.params, "fast", 0), 10);

        let eth = &cfg.strategies[1];
        assert_eq!(eth.mode, Mode::Both);
        assert!(!eth.enabled);
        assert!((eth.stop_loss_pct - 0.03).abs() < 1e-12);
    }
}
