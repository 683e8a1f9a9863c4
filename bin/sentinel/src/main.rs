use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broker::{RestBroker, RestMarketData, SimBroker};
use common::{BrokerAdapter, Config, MarketDataSource, NotificationSink, Venue};
use gate::{default_checks, SafetyGate};
use lifecycle::{Archive, CyclePolicy, LifecycleManager};
use notify::{LogSink, NotificationBatcher, TelegramSink};
use perf::PerformanceAggregator;
use registry::{OrderRouter, StrategyFileConfig, StrategyRegistry};
use scheduler::{
    ArchivePurge, CycleCheck, GateRefresh, NotificationFlush, Scheduler, Task, TradingTick,
};

const SIM_ACCOUNT: &str = "sim";
const REAL_ACCOUNT: &str = "real";
const ARCHIVE_PURGE_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    let adapter_timeout = Duration::from_millis(cfg.adapter_timeout_ms);
    info!("Sentinel starting");

    // ── Archive database ──────────────────────────────────────────────────────
    let archive = Archive::connect(&cfg.database_url)
        .await
        .context("Failed to open archive database")?;

    // ── Market data and broker adapters ───────────────────────────────────────
    let market: Arc<dyn MarketDataSource> =
        Arc::new(RestMarketData::new(cfg.market_data_base_url.clone()));
    let sim_broker: Arc<dyn BrokerAdapter> = Arc::new(
        SimBroker::new(cfg.sim_initial_balance, cfg.sim_slippage_bps).with_market(market.clone()),
    );
    let real_broker: Arc<dyn BrokerAdapter> = Arc::new(RestBroker::new(
        cfg.broker_base_url.clone(),
        cfg.broker_api_key.clone(),
        cfg.broker_api_secret.clone(),
    ));
    let credentials_present = !cfg.broker_base_url.is_empty()
        && !cfg.broker_api_key.is_empty()
        && !cfg.broker_api_secret.is_empty();

    // ── Channels ──────────────────────────────────────────────────────────────
    let (outcome_tx, outcome_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    // ── Lifecycle manager and accounts ────────────────────────────────────────
    let policy = CyclePolicy {
        max_age: chrono::Duration::hours(cfg.cycle_max_age_hours),
        max_trades: cfg.cycle_max_trades,
        max_drawdown_pct: cfg.cycle_max_drawdown_pct,
        max_inactive: chrono::Duration::hours(cfg.cycle_max_inactive_hours),
        retention_days: cfg.archive_retention_days,
        initial_balance: cfg.account_initial_balance,
    };
    let lifecycle = Arc::new(LifecycleManager::new(
        policy,
        outcome_tx,
        event_tx.clone(),
        Some(archive),
        adapter_timeout,
    ));
    lifecycle
        .add_account(
            SIM_ACCOUNT,
            "sentinel",
            Venue::Simulated,
            sim_broker.clone(),
            cfg.account_initial_balance,
        )
        .await;
    lifecycle
        .add_account(
            REAL_ACCOUNT,
            "sentinel",
            Venue::Real,
            real_broker.clone(),
            cfg.account_initial_balance,
        )
        .await;

    // ── Performance aggregator ────────────────────────────────────────────────
    let perf = Arc::new(PerformanceAggregator::new());
    tokio::spawn(perf.clone().run(outcome_rx));

    // ── Safety gate (real trading disabled until explicitly enabled) ──────────
    let gate = Arc::new(SafetyGate::new(
        default_checks(),
        &cfg.safety.disabled_checks,
    ));

    // ── Mode controller and registry ──────────────────────────────────────────
    let router = Arc::new(OrderRouter::new(
        sim_broker,
        real_broker,
        gate.clone(),
        lifecycle.clone(),
        event_tx.clone(),
        adapter_timeout,
        SIM_ACCOUNT,
        REAL_ACCOUNT,
    ));
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path);
    let registry = Arc::new(
        StrategyRegistry::from_config(&strategy_file, gate.clone(), perf.clone())
            .context("Invalid strategy configuration")?,
    );

    // ── Notifications ─────────────────────────────────────────────────────────
    let sink: Arc<dyn NotificationSink> = match &cfg.telegram_token {
        Some(token) => {
            info!(chats = cfg.telegram_chat_ids.len(), "Telegram alerting enabled");
            Arc::new(TelegramSink::new(token.clone(), &cfg.telegram_chat_ids))
        }
        None => {
            info!("No Telegram token; alerts go to the log");
            Arc::new(LogSink)
        }
    };
    let batcher = Arc::new(NotificationBatcher::new(
        sink,
        256,
        Duration::from_secs(cfg.notify_flush_interval_secs),
    ));
    tokio::spawn(batcher.clone().run(event_rx));

    // ── Scheduler tasks ───────────────────────────────────────────────────────
    let tasks: Vec<Arc<dyn Task>> = vec![
        Arc::new(TradingTick::new(
            registry.clone(),
            router.clone(),
            market,
            lifecycle.clone(),
            event_tx.clone(),
            Duration::from_secs(cfg.tick_interval_secs),
            adapter_timeout,
        )),
        Arc::new(CycleCheck::new(
            lifecycle.clone(),
            Duration::from_secs(cfg.cycle_check_interval_secs),
        )),
        Arc::new(ArchivePurge::new(lifecycle.clone(), ARCHIVE_PURGE_INTERVAL)),
        Arc::new(GateRefresh::new(
            gate.clone(),
            lifecycle.clone(),
            perf.clone(),
            registry.clone(),
            event_tx.clone(),
            cfg.safety.clone(),
            SIM_ACCOUNT,
            credentials_present,
            Duration::from_secs(cfg.gate_refresh_interval_secs),
        )),
        Arc::new(NotificationFlush::new(
            batcher.clone(),
            Duration::from_secs(cfg.notify_flush_interval_secs),
        )),
    ];
    let scheduler = Scheduler::new(tasks);
    scheduler.start().await;

    info!(
        strategies = registry.list_strategies().await.len(),
        "All subsystems started. Waiting for shutdown signal."
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping scheduler.");
    scheduler.stop().await;
    gate.disable_real_trading();
    Ok(())
}
