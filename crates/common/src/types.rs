use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which broker adapter(s) a strategy's orders route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Simulated,
    Real,
    Both,
}

impl Mode {
    pub fn routes_simulated(self) -> bool {
        matches!(self, Mode::Simulated | Mode::Both)
    }

    pub fn routes_real(self) -> bool {
        matches!(self, Mode::Real | Mode::Both)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Simulated => write!(f, "simulated"),
            Mode::Real => write!(f, "real"),
            Mode::Both => write!(f, "both"),
        }
    }
}

/// One of the two broker adapter instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Simulated,
    Real,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Venue::Simulated => write!(f, "sim"),
            Venue::Real => write!(f, "real"),
        }
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1.0 for long, -1.0 for short. P&L = (current - entry) * qty * sign.
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// The order side that opens (or adds to) a position in this direction.
    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// The order side that reduces or closes a position in this direction.
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    pub fn from_entry(side: Side) -> PositionSide {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

/// Actionable output of a strategy's signal function. "No signal" is `None`
/// at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    EnterLong,
    EnterShort,
    Exit,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::EnterLong => write!(f, "enter-long"),
            Signal::EnterShort => write!(f, "enter-short"),
            Signal::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
}

/// An order submitted to a broker adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub time_in_force: TimeInForce,
    /// `None` for market orders.
    pub limit_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            time_in_force: TimeInForce::Ioc,
            limit_price: None,
        }
    }
}

/// Broker acknowledgement for a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub filled_quantity: f64,
}

/// Order record kept for auditing. Terminal on `Filled`/`Cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_quantity: f64,
    pub filled_quantity: f64,
    pub status: OrderStatus,
    pub strategy_id: Option<String>,
    /// Free-form note on why this order was placed (signal, cycle close).
    pub decision: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// A holding tied to an account and optionally a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    /// Volume-weighted average entry price.
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Cumulative realized P&L from partial closes over this position's life.
    pub realized_pnl: f64,
    pub strategy_id: Option<String>,
    pub account_id: String,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
}

impl Position {
    pub fn unrealized_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }
}

/// A position as reported by a broker adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Balance snapshot returned by a broker adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub buying_power: f64,
}

/// A managed trading account. Balance is reset only by account cycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner: String,
    pub venue: Venue,
    pub balance: f64,
    pub available_balance: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    /// Largest observed drop from the equity peak, as a fraction of the peak.
    pub max_drawdown_pct: f64,
    pub created_at: DateTime<Utc>,
    /// Incremented on every cycle.
    pub generation: u32,
}

/// Emitted exactly once per (partial or full) position close.
/// Consumers must dedup by `close_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub close_id: String,
    pub account_id: String,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Notable events feeding the notification batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityEvent {
    OrderRouted {
        strategy_id: String,
        venue: Venue,
        symbol: String,
        side: Side,
        quantity: f64,
    },
    OrderRefused {
        strategy_id: String,
        failed_checks: Vec<String>,
    },
    OrderFailed {
        strategy_id: Option<String>,
        symbol: String,
        error: String,
    },
    CheckFailed {
        check_id: String,
        evidence: String,
    },
    AccountCycled {
        account_id: String,
        generation: u32,
        reason: String,
    },
    PositionCloseFailed {
        account_id: String,
        symbol: String,
        error: String,
    },
    AdapterUnavailable {
        venue: Venue,
        detail: String,
    },
}
