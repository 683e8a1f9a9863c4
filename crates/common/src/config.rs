use serde::{Deserialize, Serialize};

/// Thresholds and flags consumed by the safety gate's checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum closed trades before live trading can be considered.
    pub min_trades: u64,
    /// Minimum win rate (0..1) over those trades.
    pub min_win_rate: f64,
    /// Maximum tolerated realized loss in one UTC day, in account currency.
    pub max_daily_loss: f64,
    /// Largest allowed order notional as a fraction of account balance.
    pub max_position_size_fraction: f64,
    pub max_open_positions: usize,
    /// Symbols real-money orders may ever touch.
    pub allowed_symbols: Vec<String>,
    /// Inclusive start / exclusive end, UTC hours. start == end means always open.
    pub trading_hours_utc: (u32, u32),
    /// Emergency stop: real trading requires balance above this floor.
    pub balance_floor: f64,
    /// Operator has explicitly signed off on live trading.
    pub manual_approval: bool,
    /// Check ids skipped entirely (neither pass nor fail).
    pub disabled_checks: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_trades: 20,
            min_win_rate: 0.5,
            max_daily_loss: 500.0,
            max_position_size_fraction: 0.1,
            max_open_positions: 5,
            allowed_symbols: Vec::new(),
            trading_hours_utc: (0, 0),
            balance_floor: 100.0,
            manual_approval: false,
            disabled_checks: Vec::new(),
        }
    }
}

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Real-funds broker. Left empty when unset so the credentials safety
    // check can observe their absence instead of crashing the process.
    pub broker_base_url: String,
    pub broker_api_key: String,
    pub broker_api_secret: String,

    // Market data
    pub market_data_base_url: String,

    // Telegram alerts (optional; alerts fall back to the log sink)
    pub telegram_token: Option<String>,
    pub telegram_chat_ids: Vec<i64>,

    // Archive database
    pub database_url: String,

    // Strategy definitions
    pub strategy_config_path: String,

    // Scheduler periods
    pub tick_interval_secs: u64,
    pub cycle_check_interval_secs: u64,
    pub notify_flush_interval_secs: u64,
    pub gate_refresh_interval_secs: u64,
    /// Upper bound on every broker / market data call.
    pub adapter_timeout_ms: u64,

    // Simulated-funds account
    pub sim_initial_balance: f64,
    pub sim_slippage_bps: f64,

    // Account cycling
    pub account_initial_balance: f64,
    pub cycle_max_age_hours: i64,
    pub cycle_max_trades: u64,
    pub cycle_max_drawdown_pct: f64,
    pub cycle_max_inactive_hours: i64,
    pub archive_retention_days: i64,

    pub safety: SafetyConfig,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let telegram_chat_ids = optional_env("TELEGRAM_CHAT_IDS")
            .map(|v| {
                v.split(',')
                    .map(|s| {
                        s.trim().parse::<i64>().unwrap_or_else(|_| {
                            panic!("TELEGRAM_CHAT_IDS contains non-numeric ID: '{}'", s.trim())
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let allowed_symbols = optional_env("SAFETY_ALLOWED_SYMBOLS")
            .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).collect())
            .unwrap_or_default();

        let disabled_checks = optional_env("SAFETY_DISABLED_CHECKS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let defaults = SafetyConfig::default();
        let safety = SafetyConfig {
            min_trades: parse_or("SAFETY_MIN_TRADES", defaults.min_trades),
            min_win_rate: parse_or("SAFETY_MIN_WIN_RATE", defaults.min_win_rate),
            max_daily_loss: parse_or("SAFETY_MAX_DAILY_LOSS", defaults.max_daily_loss),
            max_position_size_fraction: parse_or(
                "SAFETY_MAX_POSITION_FRACTION",
                defaults.max_position_size_fraction,
            ),
            max_open_positions: parse_or("SAFETY_MAX_OPEN_POSITIONS", defaults.max_open_positions),
            allowed_symbols,
            trading_hours_utc: (
                parse_or("SAFETY_TRADING_HOURS_START", 0u32),
                parse_or("SAFETY_TRADING_HOURS_END", 0u32),
            ),
            balance_floor: parse_or("SAFETY_BALANCE_FLOOR", defaults.balance_floor),
            manual_approval: parse_or("SAFETY_MANUAL_APPROVAL", false),
            disabled_checks,
        };

        Config {
            broker_base_url: optional_env("BROKER_BASE_URL").unwrap_or_default(),
            broker_api_key: optional_env("BROKER_API_KEY").unwrap_or_default(),
            broker_api_secret: optional_env("BROKER_API_SECRET").unwrap_or_default(),
            market_data_base_url: required_env("MARKET_DATA_BASE_URL"),
            telegram_token: optional_env("TELEGRAM_TOKEN"),
            telegram_chat_ids,
            database_url: required_env("DATABASE_URL"),
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategies.toml".to_string()),
            tick_interval_secs: parse_or("TICK_INTERVAL_SECS", 60),
            cycle_check_interval_secs: parse_or("CYCLE_CHECK_INTERVAL_SECS", 300),
            notify_flush_interval_secs: parse_or("NOTIFY_FLUSH_INTERVAL_SECS", 60),
            gate_refresh_interval_secs: parse_or("GATE_REFRESH_INTERVAL_SECS", 120),
            adapter_timeout_ms: parse_or("ADAPTER_TIMEOUT_MS", 5_000),
            sim_initial_balance: parse_or("SIM_INITIAL_BALANCE", 10_000.0),
            sim_slippage_bps: parse_or("SIM_SLIPPAGE_BPS", 10.0),
            account_initial_balance: parse_or("ACCOUNT_INITIAL_BALANCE", 10_000.0),
            cycle_max_age_hours: parse_or("CYCLE_MAX_AGE_HOURS", 24 * 30),
            cycle_max_trades: parse_or("CYCLE_MAX_TRADES", 500),
            cycle_max_drawdown_pct: parse_or("CYCLE_MAX_DRAWDOWN_PCT", 0.25),
            cycle_max_inactive_hours: parse_or("CYCLE_MAX_INACTIVE_HOURS", 24 * 14),
            archive_retention_days: parse_or("ARCHIVE_RETENTION_DAYS", 90),
            safety,
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional_env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
