use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use broker::{SimBroker, SimMarketData};
use common::{BrokerAdapter, MarketDataSource, Venue};
use gate::SafetyGate;
use lifecycle::{CyclePolicy, LifecycleManager};
use perf::PerformanceAggregator;
use registry::{OrderRouter, StrategyFileConfig, StrategyRegistry};
use scheduler::{Task, TradingTick};

struct Stack {
    tick: TradingTick,
    feed: Arc<SimMarketData>,
    lifecycle: Arc<LifecycleManager>,
    perf: Arc<PerformanceAggregator>,
}

async fn stack() -> Stack {
    let feed = Arc::new(SimMarketData::new());
    let sim = Arc::new(
        SimBroker::new(10_000.0, 0.0).with_market(feed.clone() as Arc<dyn MarketDataSource>),
    );
    let gate = Arc::new(SafetyGate::new(Vec::new(), &[]));
    let perf = Arc::new(PerformanceAggregator::new());

    let (outcome_tx, outcome_rx) = mpsc::channel(64);
    let (event_tx, _event_rx) = mpsc::channel(64);
    tokio::spawn(perf.clone().run(outcome_rx));

    let lifecycle = Arc::new(LifecycleManager::new(
        CyclePolicy::default(),
        outcome_tx,
        event_tx.clone(),
        None,
        Duration::from_millis(200),
    ));
    lifecycle
        .add_account(
            "sim-acct",
            "ops",
            Venue::Simulated,
            sim.clone() as Arc<dyn BrokerAdapter>,
            10_000.0,
        )
        .await;
    // The real account exists but no strategy routes to it in this test.
    lifecycle
        .add_account(
            "real-acct",
            "ops",
            Venue::Real,
            sim.clone() as Arc<dyn BrokerAdapter>,
            10_000.0,
        )
        .await;

    let router = Arc::new(OrderRouter::new(
        sim.clone() as Arc<dyn BrokerAdapter>,
        sim.clone() as Arc<dyn BrokerAdapter>,
        gate.clone(),
        lifecycle.clone(),
        event_tx.clone(),
        Duration::from_millis(200),
        "sim-acct",
        "real-acct",
    ));

    let file_cfg: StrategyFileConfig = toml::from_str(
        r#"
        [[strategy]]
        id = "btc-ma"
        type = "ma-cross"
        name = "BTC MA"
        symbol = "BTCUSD"
        position_fraction = 0.01

        [strategy.params]
        fast = 2
        slow = 3

        [[strategy]]
        id = "eth-ma"
        type = "ma-cross"
        name = "ETH MA"
        symbol = "ETHUSD"
        position_fraction = 0.01

        [strategy.params]
        fast = 2
        slow = 3
        "#,
    )
    .unwrap();
    let registry = Arc::new(StrategyRegistry::from_config(&file_cfg, gate, perf.clone()).unwrap());

    let tick = TradingTick::new(
        registry,
        router,
        feed.clone() as Arc<dyn MarketDataSource>,
        lifecycle.clone(),
        event_tx,
        Duration::from_secs(60),
        Duration::from_millis(200),
    );

    Stack {
        tick,
        feed,
        lifecycle,
        perf,
    }
}

#[tokio::test]
async fn golden_cross_round_trip_flows_into_rollups() {
    let stack = stack().await;

    // Downtrend: builds history, no cross yet.
    for price in [10.0, 9.0, 8.0, 7.0] {
        stack.feed.set_price("BTCUSD", price).await;
        stack.tick.run().await.unwrap();
    }
    assert!(stack.lifecycle.open_positions("sim-acct").await.is_empty());

    // Sharp recovery: golden cross, entry fills on the sim adapter.
    stack.feed.set_price("BTCUSD", 12.0).await;
    stack.tick.run().await.unwrap();
    let open = stack.lifecycle.open_positions("sim-acct").await;
    assert_eq!(open.len(), 1);

    // Collapse: death cross, the position exits and the outcome reaches
    // the aggregator.
    stack.feed.set_price("BTCUSD", 1.0).await;
    stack.tick.run().await.unwrap();
    assert!(stack.lifecycle.open_positions("sim-acct").await.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let rollup = stack.perf.strategy_snapshot("btc-ma");
    assert_eq!(rollup.trades, 1);
}

#[tokio::test]
async fn failing_symbol_never_stalls_its_siblings() {
    let stack = stack().await;

    // ETHUSD's feed stays down the whole time; BTCUSD trades through the
    // same ticks regardless.
    for price in [10.0, 9.0, 8.0, 7.0, 12.0] {
        stack.feed.set_price("BTCUSD", price).await;
        stack.tick.run().await.unwrap();
    }

    let open = stack.lifecycle.open_positions("sim-acct").await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "BTCUSD");
}

#[tokio::test]
async fn unavailable_price_skips_symbol_without_failing_the_tick() {
    let stack = stack().await;

    // No price seeded at all: the tick must still succeed.
    stack.tick.run().await.unwrap();
    assert!(stack.lifecycle.open_positions("sim-acct").await.is_empty());

    // Feed recovers; history resumes accumulating from the next tick.
    stack.feed.set_price("BTCUSD", 10.0).await;
    stack.tick.run().await.unwrap();
}
