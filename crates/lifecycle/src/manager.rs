use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use common::{
    Account, ActivityEvent, BrokerAdapter, Error, OrderRequest, Position, PositionSide,
    PositionStatus, Result, Side, TradeOutcome, Venue,
};

use crate::archive::Archive;

/// Thresholds that retire an account generation.
#[derive(Debug, Clone, Copy)]
pub struct CyclePolicy {
    pub max_age: Duration,
    /// Fills accepted per generation; the fill after this one triggers a cycle.
    pub max_trades: u64,
    pub max_drawdown_pct: f64,
    pub max_inactive: Duration,
    pub retention_days: i64,
    /// Balance every fresh generation starts from.
    pub initial_balance: f64,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::days(30),
            max_trades: 500,
            max_drawdown_pct: 0.25,
            max_inactive: Duration::days(14),
            retention_days: 90,
            initial_balance: 10_000.0,
        }
    }
}

/// A fill to record against an account.
#[derive(Debug, Clone)]
pub struct Fill {
    pub account_id: String,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
}

/// Condensed account view handed to the safety gate's checks.
#[derive(Debug, Clone, Copy)]
pub struct AccountSummary {
    pub balance: f64,
    pub daily_pnl: f64,
    pub open_positions: usize,
}

struct AccountState {
    account: Account,
    adapter: Arc<dyn BrokerAdapter>,
    positions: Vec<Position>,
    /// Recent terminal positions kept in memory; the archive is durable.
    closed: Vec<Position>,
    fills_this_generation: u64,
    generation_started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    equity_peak: f64,
    daily_pnl: f64,
    daily_anchor: NaiveDate,
    cycling: bool,
}

impl AccountState {
    fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
    }

    fn refresh_equity(&mut self) {
        let unrealized: f64 = self.open_positions().map(|p| p.unrealized_pnl).sum();
        let notional: f64 = self
            .open_positions()
            .map(|p| p.entry_price * p.quantity)
            .sum();
        let equity = self.account.balance + unrealized;
        self.account.available_balance = (self.account.balance - notional).max(0.0);
        if equity > self.equity_peak {
            self.equity_peak = equity;
        }
        if self.equity_peak > 0.0 {
            let drawdown = (self.equity_peak - equity) / self.equity_peak;
            if drawdown > self.account.max_drawdown_pct {
                self.account.max_drawdown_pct = drawdown;
            }
        }
    }

    fn roll_daily_anchor(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_anchor {
            self.daily_anchor = today;
            self.daily_pnl = 0.0;
        }
    }
}

/// Owns every account's balance and position set.
///
/// All mutation goes through this manager's single write lock, which is
/// the single-writer discipline for account state: concurrent fills on
/// one account serialize here. Trade outcomes and activity events are
/// emitted after the lock is released.
pub struct LifecycleManager {
    state: RwLock<HashMap<String, AccountState>>,
    policy: CyclePolicy,
    outcome_tx: mpsc::Sender<TradeOutcome>,
    event_tx: mpsc::Sender<ActivityEvent>,
    archive: Option<Archive>,
    adapter_timeout: StdDuration,
}

impl LifecycleManager {
    pub fn new(
        policy: CyclePolicy,
        outcome_tx: mpsc::Sender<TradeOutcome>,
        event_tx: mpsc::Sender<ActivityEvent>,
        archive: Option<Archive>,
        adapter_timeout: StdDuration,
    ) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            policy,
            outcome_tx,
            event_tx,
            archive,
            adapter_timeout,
        }
    }

    pub async fn add_account(
        &self,
        id: impl Into<String>,
        owner: impl Into<String>,
        venue: Venue,
        adapter: Arc<dyn BrokerAdapter>,
        initial_balance: f64,
    ) {
        let id = id.into();
        let now = Utc::now();
        let account = Account {
            id: id.clone(),
            owner: owner.into(),
            venue,
            balance: initial_balance,
            available_balance: initial_balance,
            total_trades: 0,
            winning_trades: 0,
            max_drawdown_pct: 0.0,
            created_at: now,
            generation: 0,
        };
        info!(account = %id, venue = %venue, balance = initial_balance, "Account registered");
        self.state.write().await.insert(
            id,
            AccountState {
                account,
                adapter,
                positions: Vec::new(),
                closed: Vec::new(),
                fills_this_generation: 0,
                generation_started_at: now,
                last_activity: now,
                equity_peak: initial_balance,
                daily_pnl: 0.0,
                daily_anchor: now.date_naive(),
                cycling: false,
            },
        );
    }

    pub async fn account(&self, id: &str) -> Result<Account> {
        let state = self.state.read().await;
        state
            .get(id)
            .map(|s| s.account.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "account",
                id: id.to_string(),
            })
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state
            .read()
            .await
            .values()
            .map(|s| s.account.clone())
            .collect()
    }

    pub async fn open_positions(&self, account_id: &str) -> Vec<Position> {
        let state = self.state.read().await;
        state
            .get(account_id)
            .map(|s| s.open_positions().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn closed_positions(&self, account_id: &str) -> Vec<Position> {
        let state = self.state.read().await;
        state
            .get(account_id)
            .map(|s| s.closed.clone())
            .unwrap_or_default()
    }

    /// The open position a strategy holds on a symbol, if any.
    pub async fn open_position(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
        symbol: &str,
    ) -> Option<Position> {
        let state = self.state.read().await;
        state.get(account_id).and_then(|s| {
            s.open_positions()
                .find(|p| p.symbol == symbol && p.strategy_id.as_deref() == strategy_id)
                .cloned()
        })
    }

    pub async fn summary(&self, account_id: &str) -> Result<AccountSummary> {
        let state = self.state.read().await;
        let st = state.get(account_id).ok_or_else(|| Error::NotFound {
            kind: "account",
            id: account_id.to_string(),
        })?;
        Ok(AccountSummary {
            balance: st.account.balance,
            daily_pnl: st.daily_pnl,
            open_positions: st.open_positions().count(),
        })
    }

    /// Record a fill against an account, then run the cycle check so a
    /// generation that just crossed its fill limit retires immediately
    /// rather than waiting for the periodic sweep.
    pub async fn record_fill(&self, fill: Fill) -> Result<()> {
        let cycle_due = self.record_fill_inner(&fill).await?;
        if let Some(reason) = cycle_due {
            self.cycle_account(&fill.account_id, &reason).await?;
        }
        Ok(())
    }

    /// Apply the fill and report whether the account is now due a cycle.
    async fn record_fill_inner(&self, fill: &Fill) -> Result<Option<String>> {
        let now = Utc::now();
        let mut outcomes = Vec::new();
        let mut archived = Vec::new();

        let cycle_due = {
            let mut state = self.state.write().await;
            let st = state
                .get_mut(&fill.account_id)
                .ok_or_else(|| Error::NotFound {
                    kind: "account",
                    id: fill.account_id.clone(),
                })?;

            st.roll_daily_anchor(now);
            st.last_activity = now;
            st.fills_this_generation += 1;

            apply_fill_to_book(st, fill, now, &mut outcomes, &mut archived);
            st.refresh_equity();

            if st.cycling {
                None
            } else {
                cycle_reason(&self.policy, st, now)
            }
        };

        self.emit_outcomes(outcomes).await;
        self.archive_positions(&archived, now).await;
        Ok(cycle_due)
    }

    /// Recompute unrealized P&L for all open positions on a symbol.
    pub async fn mark_to_market(&self, symbol: &str, price: f64) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        for st in state.values_mut() {
            st.roll_daily_anchor(now);
            let mut touched = false;
            for pos in st
                .positions
                .iter_mut()
                .filter(|p| p.status == PositionStatus::Open && p.symbol == symbol)
            {
                pos.current_price = price;
                pos.unrealized_pnl = pos.unrealized_at(price);
                touched = true;
            }
            if touched {
                st.refresh_equity();
            }
        }
    }

    /// Evaluate the cycling policy for every account. Called periodically.
    pub async fn run_cycle_checks(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<(String, String)> = {
            let state = self.state.read().await;
            state
                .values()
                .filter(|st| !st.cycling)
                .filter_map(|st| {
                    cycle_reason(&self.policy, st, now).map(|r| (st.account.id.clone(), r))
                })
                .collect()
        };

        for (account_id, reason) in due {
            if let Err(e) = self.cycle_account(&account_id, &reason).await {
                error!(account = %account_id, error = %e, "Account cycle failed");
            }
        }
        Ok(())
    }

    /// Retire the current generation: close all open positions at market
    /// (best-effort), archive the generation snapshot, bump the generation
    /// counter and reset the balance. The only path that resets balance.
    ///
    /// Returns false when a cycle for this account is already in progress;
    /// the second trigger is a no-op.
    pub async fn cycle_account(&self, account_id: &str, reason: &str) -> Result<bool> {
        let now = Utc::now();

        // Phase 1: claim the cycle and move open positions to Closing.
        let (adapter, to_close) = {
            let mut state = self.state.write().await;
            let st = state.get_mut(account_id).ok_or_else(|| Error::NotFound {
                kind: "account",
                id: account_id.to_string(),
            })?;
            if st.cycling {
                info!(account = %account_id, "Cycle already in progress; trigger ignored");
                return Ok(false);
            }
            st.cycling = true;

            let mut to_close = Vec::new();
            for pos in st
                .positions
                .iter_mut()
                .filter(|p| p.status == PositionStatus::Open)
            {
                pos.status = PositionStatus::Closing;
                to_close.push(pos.clone());
            }
            (st.adapter.clone(), to_close)
        };

        info!(
            account = %account_id,
            reason = reason,
            positions = to_close.len(),
            "Cycling account"
        );

        // Phase 2: best-effort market closes. Failures leave the position
        // in Closing and never abort the cycle.
        for pos in &to_close {
            let request =
                OrderRequest::market(&pos.symbol, pos.side.exit_side(), pos.quantity);
            let placed =
                tokio::time::timeout(self.adapter_timeout, adapter.place_order(&request)).await;
            match placed {
                Ok(Ok(ack)) => {
                    let exit_price = ack.fill_price.unwrap_or(pos.current_price);
                    self.finalize_close(account_id, &pos.id, exit_price).await;
                }
                Ok(Err(e)) => {
                    warn!(account = %account_id, symbol = %pos.symbol, error = %e, "Cycle close failed");
                    self.emit_event(ActivityEvent::PositionCloseFailed {
                        account_id: account_id.to_string(),
                        symbol: pos.symbol.clone(),
                        error: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(account = %account_id, symbol = %pos.symbol, "Cycle close timed out");
                    self.emit_event(ActivityEvent::PositionCloseFailed {
                        account_id: account_id.to_string(),
                        symbol: pos.symbol.clone(),
                        error: "adapter timed out".to_string(),
                    });
                }
            }
        }

        // Phase 3: archive the retiring generation and reset.
        let (snapshot, generation) = {
            let mut state = self.state.write().await;
            let st = state.get_mut(account_id).ok_or_else(|| Error::NotFound {
                kind: "account",
                id: account_id.to_string(),
            })?;

            let snapshot = st.account.clone();
            st.account.generation += 1;
            st.account.balance = self.policy.initial_balance;
            st.account.available_balance = self.policy.initial_balance;
            st.account.total_trades = 0;
            st.account.winning_trades = 0;
            st.account.max_drawdown_pct = 0.0;
            st.fills_this_generation = 0;
            st.generation_started_at = now;
            st.last_activity = now;
            st.equity_peak = self.policy.initial_balance;
            st.daily_pnl = 0.0;
            st.cycling = false;
            (snapshot, st.account.generation)
        };

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.store_generation(&snapshot).await {
                error!(account = %account_id, error = %e, "Failed to archive generation");
            }
        }
        self.emit_event(ActivityEvent::AccountCycled {
            account_id: account_id.to_string(),
            generation,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    pub async fn purge_archive(&self) -> Result<u64> {
        match &self.archive {
            Some(archive) => archive.purge_older_than(self.policy.retention_days).await,
            None => Ok(0),
        }
    }

    /// Close a `Closing` position at a known exit price (cycle path).
    async fn finalize_close(&self, account_id: &str, position_id: &str, exit_price: f64) {
        let now = Utc::now();
        let mut outcomes = Vec::new();
        let mut archived = Vec::new();
        {
            let mut state = self.state.write().await;
            let Some(st) = state.get_mut(account_id) else {
                return;
            };
            let Some(idx) = st.positions.iter().position(|p| p.id == position_id) else {
                return;
            };
            let mut pos = st.positions.remove(idx);
            let realized = (exit_price - pos.entry_price) * pos.quantity * pos.side.sign();
            pos.realized_pnl += realized;
            pos.current_price = exit_price;
            pos.unrealized_pnl = 0.0;
            pos.status = PositionStatus::Closed;

            st.account.balance += realized;
            st.daily_pnl += realized;
            st.account.total_trades += 1;
            if pos.realized_pnl > 0.0 {
                st.account.winning_trades += 1;
            }

            outcomes.push(TradeOutcome {
                close_id: uuid::Uuid::new_v4().to_string(),
                account_id: account_id.to_string(),
                strategy_id: pos.strategy_id.clone(),
                symbol: pos.symbol.clone(),
                quantity: pos.quantity,
                realized_pnl: realized,
                closed_at: now,
            });
            archived.push(pos.clone());
            st.closed.push(pos);
            st.refresh_equity();
        }
        self.emit_outcomes(outcomes).await;
        self.archive_positions(&archived, now).await;
    }

    async fn emit_outcomes(&self, outcomes: Vec<TradeOutcome>) {
        for outcome in outcomes {
            if self.outcome_tx.send(outcome).await.is_err() {
                warn!("Trade outcome channel closed");
            }
        }
    }

    fn emit_event(&self, event: ActivityEvent) {
        // Best-effort: a full queue drops the event rather than stalling fills.
        let _ = self.event_tx.try_send(event);
    }

    async fn archive_positions(&self, positions: &[Position], closed_at: DateTime<Utc>) {
        if let Some(archive) = &self.archive {
            for pos in positions {
                if let Err(e) = archive.store_position(pos, closed_at).await {
                    error!(position = %pos.id, error = %e, "Failed to archive position");
                }
            }
        }
    }
}

/// Mutate one account's position book for a fill. Pure bookkeeping; the
/// caller owns locking, outcome emission and archival.
fn apply_fill_to_book(
    st: &mut AccountState,
    fill: &Fill,
    now: DateTime<Utc>,
    outcomes: &mut Vec<TradeOutcome>,
    archived: &mut Vec<Position>,
) {
    let fill_dir = PositionSide::from_entry(fill.side);
    let existing = st.positions.iter().position(|p| {
        p.status == PositionStatus::Open
            && p.symbol == fill.symbol
            && p.strategy_id.as_deref() == fill.strategy_id.as_deref()
    });

    let Some(idx) = existing else {
        let opened = new_position(&st.account.id, fill, fill_dir, now);
        st.positions.push(opened);
        return;
    };

    let pos = &mut st.positions[idx];
    if pos.side == fill_dir {
        // Same direction: volume-weighted average entry.
        let total = pos.quantity + fill.quantity;
        pos.entry_price = (pos.entry_price * pos.quantity + fill.price * fill.quantity) / total;
        pos.quantity = total;
        pos.current_price = fill.price;
        pos.unrealized_pnl = pos.unrealized_at(fill.price);
        return;
    }

    // Opposite direction: reduce, close, or flip.
    let closed_qty = fill.quantity.min(pos.quantity);
    let realized = (fill.price - pos.entry_price) * closed_qty * pos.side.sign();
    pos.realized_pnl += realized;
    st.account.balance += realized;
    st.daily_pnl += realized;

    outcomes.push(TradeOutcome {
        close_id: uuid::Uuid::new_v4().to_string(),
        account_id: fill.account_id.clone(),
        strategy_id: fill.strategy_id.clone(),
        symbol: fill.symbol.clone(),
        quantity: closed_qty,
        realized_pnl: realized,
        closed_at: now,
    });

    if fill.quantity < pos.quantity {
        // Partial close: stays Open with reduced size.
        pos.quantity -= closed_qty;
        pos.current_price = fill.price;
        pos.unrealized_pnl = pos.unrealized_at(fill.price);
        return;
    }

    // Full close. Terminal positions contribute to counters exactly once.
    pos.current_price = fill.price;
    pos.unrealized_pnl = 0.0;
    pos.status = PositionStatus::Closed;
    st.account.total_trades += 1;
    if pos.realized_pnl > 0.0 {
        st.account.winning_trades += 1;
    }
    let closed = st.positions.remove(idx);
    archived.push(closed.clone());
    st.closed.push(closed);

    let leftover = fill.quantity - closed_qty;
    if leftover > 0.0 {
        let flipped = Fill {
            quantity: leftover,
            ..fill.clone()
        };
        let opened = new_position(&st.account.id, &flipped, fill_dir, now);
        st.positions.push(opened);
    }
}

fn new_position(
    account_id: &str,
    fill: &Fill,
    side: PositionSide,
    now: DateTime<Utc>,
) -> Position {
    Position {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: fill.symbol.clone(),
        side,
        quantity: fill.quantity,
        entry_price: fill.price,
        current_price: fill.price,
        unrealized_pnl: 0.0,
        realized_pnl: 0.0,
        strategy_id: fill.strategy_id.clone(),
        account_id: account_id.to_string(),
        opened_at: now,
        status: PositionStatus::Open,
    }
}

fn cycle_reason(policy: &CyclePolicy, st: &AccountState, now: DateTime<Utc>) -> Option<String> {
    if st.fills_this_generation > policy.max_trades {
        return Some(format!(
            "fill count {} exceeded {}",
            st.fills_this_generation, policy.max_trades
        ));
    }
    if now - st.generation_started_at > policy.max_age {
        return Some(format!("generation older than {}", policy.max_age));
    }
    if st.account.max_drawdown_pct >= policy.max_drawdown_pct {
        return Some(format!(
            "drawdown {:.1}% reached {:.1}%",
            st.account.max_drawdown_pct * 100.0,
            policy.max_drawdown_pct * 100.0
        ));
    }
    if now - st.last_activity > policy.max_inactive {
        return Some(format!("inactive for more than {}", policy.max_inactive));
    }
    None
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{AccountInfo, BrokerPosition, OrderAck, OrderStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter stub with scriptable behavior for cycle-close paths.
    struct StubBroker {
        orders: AtomicUsize,
        fail_orders: bool,
        delay: Option<StdDuration>,
    }

    impl StubBroker {
        fn filling() -> Self {
            Self {
                orders: AtomicUsize::new(0),
                fail_orders: false,
                delay: None,
            }
        }

        fn failing() -> Self {
            Self {
                fail_orders: true,
                ..Self::filling()
            }
        }

        fn slow(delay: StdDuration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::filling()
            }
        }
    }

    #[async_trait]
    impl BrokerAdapter for StubBroker {
        async fn get_account_info(&self) -> Result<AccountInfo> {
            Ok(AccountInfo {
                balance: 10_000.0,
                buying_power: 10_000.0,
            })
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.orders.fetch_add(1, Ordering::SeqCst);
            if self.fail_orders {
                return Err(Error::Broker("stub refuses orders".into()));
            }
            Ok(OrderAck {
                order_id: "stub".into(),
                status: OrderStatus::Filled,
                fill_price: Some(100.0),
                filled_quantity: request.quantity,
            })
        }

        async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    async fn manager_with(
        policy: CyclePolicy,
        adapter: Arc<dyn BrokerAdapter>,
    ) -> (Arc<LifecycleManager>, mpsc::Receiver<TradeOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let manager = Arc::new(LifecycleManager::new(
            policy,
            outcome_tx,
            event_tx,
            None,
            StdDuration::from_millis(200),
        ));
        manager
            .add_account("sim", "ops", Venue::Simulated, adapter, 10_000.0)
            .await;
        (manager, outcome_rx)
    }

    fn fill(symbol: &str, side: Side, quantity: f64, price: f64) -> Fill {
        Fill {
            account_id: "sim".into(),
            strategy_id: Some("s1".into()),
            symbol: symbol.into(),
            side,
            quantity,
            price,
        }
    }

    #[tokio::test]
    async fn same_direction_fills_use_weighted_average_entry() {
        let (mgr, _rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;

        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Buy, 3.0, 120.0)).await.unwrap();

        let pos = mgr.open_position("sim", Some("s1"), "BTCUSD").await.unwrap();
        assert!((pos.entry_price - 115.0).abs() < 1e-9);
        assert!((pos.quantity - 4.0).abs() < 1e-9);
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn partial_and_final_closes_sum_to_total_pnl() {
        let (mgr, mut rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;

        mgr.record_fill(fill("BTCUSD", Side::Buy, 4.0, 100.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Sell, 1.0, 110.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Sell, 3.0, 120.0)).await.unwrap();

        let mut total = 0.0;
        let mut closes = 0;
        while let Ok(outcome) = rx.try_recv() {
            total += outcome.realized_pnl;
            closes += 1;
        }
        // (110-100)*1 + (120-100)*3, i.e. (vw exit - vw entry) * total qty
        assert_eq!(closes, 2);
        assert!((total - 70.0).abs() < 1e-9);

        // The terminal position contributed to counters exactly once.
        let account = mgr.account("sim").await.unwrap();
        assert_eq!(account.total_trades, 1);
        assert_eq!(account.winning_trades, 1);
        assert!((account.balance - 10_070.0).abs() < 1e-9);
        assert!(mgr.open_positions("sim").await.is_empty());
    }

    #[tokio::test]
    async fn enter_exit_enter_leaves_one_closed_and_one_open() {
        let (mgr, _rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;

        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Sell, 1.0, 110.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();
        mgr.mark_to_market("BTCUSD", 95.0).await;

        let closed = mgr.closed_positions("sim").await;
        assert_eq!(closed.len(), 1);
        assert!((closed[0].realized_pnl - 10.0).abs() < 1e-9);

        let open = mgr.open_positions("sim").await;
        assert_eq!(open.len(), 1);
        assert!((open[0].unrealized_pnl - (-5.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn short_positions_profit_when_price_falls() {
        let (mgr, mut rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;

        mgr.record_fill(fill("ETHUSD", Side::Sell, 2.0, 100.0)).await.unwrap();
        mgr.mark_to_market("ETHUSD", 90.0).await;
        let open = mgr.open_positions("sim").await;
        assert!((open[0].unrealized_pnl - 20.0).abs() < 1e-9);

        mgr.record_fill(fill("ETHUSD", Side::Buy, 2.0, 90.0)).await.unwrap();
        let outcome = rx.try_recv().unwrap();
        assert!((outcome.realized_pnl - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_exit_flips_direction() {
        let (mgr, _rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;

        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();
        mgr.record_fill(fill("BTCUSD", Side::Sell, 3.0, 100.0)).await.unwrap();

        let open = mgr.open_positions("sim").await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, PositionSide::Short);
        assert!((open[0].quantity - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sixth_fill_triggers_cycle_with_single_generation_bump() {
        let policy = CyclePolicy {
            max_trades: 5,
            ..CyclePolicy::default()
        };
        let (mgr, _rx) = manager_with(policy, Arc::new(StubBroker::filling())).await;

        for round in 0..3 {
            let price = 100.0 + round as f64;
            mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, price)).await.unwrap();
            mgr.record_fill(fill("BTCUSD", Side::Sell, 1.0, price)).await.unwrap();
        }

        let account = mgr.account("sim").await.unwrap();
        assert_eq!(account.generation, 1);
        assert!((account.balance - 10_000.0).abs() < 1e-9);
        assert_eq!(account.total_trades, 0);
        assert!(mgr.open_positions("sim").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_cycle_triggers_collapse_to_one() {
        let (mgr, _rx) = manager_with(
            CyclePolicy::default(),
            Arc::new(StubBroker::slow(StdDuration::from_millis(50))),
        )
        .await;
        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();

        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.cycle_account("sim", "manual").await.unwrap() })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.cycle_account("sim", "manual").await.unwrap() })
        };
        let (ran_a, ran_b) = (a.await.unwrap(), b.await.unwrap());

        assert!(ran_a ^ ran_b, "exactly one trigger should run the cycle");
        let account = mgr.account("sim").await.unwrap();
        assert_eq!(account.generation, 1);
    }

    #[tokio::test]
    async fn cycle_resets_even_when_closes_fail() {
        let (mgr, _rx) = manager_with(CyclePolicy::default(), Arc::new(StubBroker::failing())).await;
        mgr.record_fill(fill("BTCUSD", Side::Buy, 1.0, 100.0)).await.unwrap();
        mgr.record_fill(fill("ETHUSD", Side::Buy, 1.0, 50.0)).await.unwrap();

        assert!(mgr.cycle_account("sim", "manual").await.unwrap());

        let account = mgr.account("sim").await.unwrap();
        assert_eq!(account.generation, 1);
        assert!((account.balance - 10_000.0).abs() < 1e-9);
        // Failed closes stay out of the open set but were never realized.
        assert!(mgr.open_positions("sim").await.is_empty());
        assert!(mgr.closed_positions("sim").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (mgr, _rx) =
            manager_with(CyclePolicy::default(), Arc::new(StubBroker::filling())).await;
        let err = mgr
            .record_fill(Fill {
                account_id: "ghost".into(),
                ..fill("BTCUSD", Side::Buy, 1.0, 100.0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "account", .. }));
    }
}
