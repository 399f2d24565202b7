//! Scheduler cycles over a fixed calendar and scripted oracle.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cdem::config::{ConfigWatcher, TradingConfig};
use cdem::engine::{
    ConsensusConfig, ConsensusEngine, LifecycleSettings, MovementResolver, Scheduler,
    SchedulerSettings, TradeLifecycleManager,
};
use cdem::storage::Stores;
use cdem::strategy::exit::market_date;
use cdem::types::*;

use crate::mock_broker::MockBroker;
use crate::mock_calendar::MockCalendar;
use crate::mock_oracle::MockOracle;

struct Harness {
    _dir: tempfile::TempDir,
    config_path: PathBuf,
    broker: Arc<MockBroker>,
    calendar: Arc<MockCalendar>,
    oracle: Arc<MockOracle>,
    stores: Arc<Stores>,
    scheduler: Scheduler,
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Tuesday 2025-01-28, 10:00 in New York.
fn tuesday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 28, 15, 0, 0).unwrap()
}

/// Thursday 2025-01-30, 15:30 in New York.
fn thursday_afternoon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 30, 20, 30, 0).unwrap()
}

fn trading_config(universe: &[&str]) -> TradingConfig {
    TradingConfig {
        sp_on: false,
        test_mode: false,
        stock_universe: universe.iter().map(|t| t.to_string()).collect(),
        ..TradingConfig::default()
    }
}

/// AAPL reports Wednesday after the close (due today), MSFT next Monday
/// (not due), TSLA reported last quarter.
fn default_calendar() -> MockCalendar {
    MockCalendar::new()
        .with_event("AAPL", d(2025, 1, 29), AnnouncementTiming::AfterClose)
        .with_event("MSFT", d(2025, 2, 3), AnnouncementTiming::BeforeOpen)
        .with_event("TSLA", d(2024, 10, 23), AnnouncementTiming::AfterClose)
}

fn default_broker() -> MockBroker {
    MockBroker::new(10_000.0)
        .with_quote("AAPL", 100.0)
        .with_quote("MSFT", 400.0)
        .with_quote("NVDA", 100.0)
        .with_quote("TSLA", 250.0)
        .with_quote("SPY", 500.0)
}

fn harness(config: TradingConfig, calendar: MockCalendar, oracle: MockOracle, broker: MockBroker) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    config.save(&config_path).unwrap();
    let (watcher, loaded) = ConfigWatcher::open(config_path.clone()).unwrap();

    let stores = Arc::new(Stores::open(&dir.path().join("data")).unwrap());
    let broker = Arc::new(broker);
    let calendar = Arc::new(calendar);
    let oracle = Arc::new(oracle);

    let consensus = ConsensusEngine::new(
        oracle.clone(),
        Arc::clone(&stores),
        ConsensusConfig {
            samples: 5,
            max_attempts: 3,
            min_valid: 3,
            request_timeout: Duration::from_secs(2),
            error_backoff: Duration::from_millis(1),
        },
    );
    let lifecycle = TradeLifecycleManager::new(broker.clone(), Arc::clone(&stores), LifecycleSettings::default());
    let movement = MovementResolver::new(oracle.clone(), Arc::clone(&stores), 2);
    let settings = SchedulerSettings {
        slice: Duration::from_millis(10),
        idle_poll: Duration::from_millis(10),
        lookahead_days: 14,
        lookback_days: 120,
    };

    let scheduler = Scheduler::new(
        watcher,
        loaded,
        calendar.clone(),
        consensus,
        lifecycle,
        movement,
        Arc::clone(&stores),
        settings,
    );
    Harness { _dir: dir, config_path, broker, calendar, oracle, stores, scheduler }
}

fn default_harness() -> Harness {
    harness(
        trading_config(&["AAPL", "MSFT", "TSLA"]),
        default_calendar(),
        MockOracle::new()
            .with_score("AAPL", 85.0)
            .with_score("MSFT", 80.0)
            .with_prices("TSLA", 250.0, 260.0)
            .with_prices("AAPL", 100.0, 108.0),
        default_broker(),
    )
}

/// Write `config` and push its mtime forward so the next poll sees it.
fn rewrite_config(path: &Path, config: &TradingConfig) {
    config.save(path).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_cycle_evaluates_enters_and_backfills() {
    let mut h = default_harness();

    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.upcoming, 2);
    assert_eq!(report.verdicts, vec![("AAPL".to_string(), Consensus::Good)]);
    assert_eq!(report.entered, vec!["AAPL".to_string()]);
    assert!(report.exited.is_empty());
    assert!(report.drained.is_empty());

    // Five samples for AAPL only; MSFT is not due until Sunday.
    assert_eq!(h.oracle.sentiment_calls(), 5);
    assert_eq!(h.broker.holding("AAPL"), 27.0);
    assert_eq!(h.broker.live_stop("AAPL").unwrap().stop_price, Some(95.0));

    let aapl = h.stores.earnings.get("AAPL").unwrap().unwrap();
    assert_eq!(aapl.past_earnings_date, d(2025, 1, 29));
    assert_eq!(aapl.consensus, Some(Consensus::Good));
    assert_eq!(aapl.sentiment_score, Some(85.0));
    assert!(h.stores.earnings.get("MSFT").unwrap().is_none());

    // Last quarter's TSLA announcement found by the lookback and resolved.
    let tsla = h.stores.earnings.get("TSLA").unwrap().unwrap();
    assert_eq!(tsla.past_earnings_date, d(2024, 10, 23));
    assert_eq!(tsla.price_movement_pct, Some(4.0));
    assert_eq!(h.oracle.price_calls(), 1);

    let sentiment = h.stores.sentiment.load_all().unwrap();
    assert_eq!(sentiment.len(), 1);
    assert_eq!(sentiment[0].num_sources, 5);
}

#[tokio::test]
async fn test_second_cycle_does_not_reevaluate() {
    let mut h = default_harness();
    h.scheduler.run_cycle(tuesday_morning()).await.unwrap();

    let report = h
        .scheduler
        .run_cycle(tuesday_morning() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert!(report.verdicts.is_empty());
    assert!(report.entered.is_empty());
    assert_eq!(h.oracle.sentiment_calls(), 5);
    assert_eq!(h.oracle.price_calls(), 1);
    assert_eq!(h.broker.market_orders("AAPL").len(), 1);
}

#[tokio::test]
async fn test_bad_consensus_does_not_trade() {
    let mut h = harness(
        trading_config(&["AAPL"]),
        default_calendar(),
        MockOracle::new().with_score("AAPL", 20.0),
        default_broker(),
    );

    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.verdicts, vec![("AAPL".to_string(), Consensus::Bad)]);
    assert!(report.entered.is_empty());
    assert!(h.broker.orders().is_empty());
    assert_eq!(
        h.stores.earnings.get("AAPL").unwrap().unwrap().consensus,
        Some(Consensus::Bad)
    );
}

#[tokio::test]
async fn test_position_exits_after_reaction_session() {
    let mut h = default_harness();
    h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    h.broker.set_quote("AAPL", 108.0);

    let report = h.scheduler.run_cycle(thursday_afternoon()).await.unwrap();
    assert_eq!(report.exited, vec!["AAPL".to_string()]);
    assert_eq!(h.broker.holding("AAPL"), 0.0);
    assert!(h.broker.live_stop("AAPL").is_none());

    let rows = h.stores.positions.load_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PositionStatus::Closed);
    assert!((rows[0].pnl - 27.0 * 8.0).abs() < 1e-9);

    // The lookback sees Wednesday's announcement but keeps the verdict.
    // Thursday's session is still open, so its reaction is not queried yet.
    let aapl = h.stores.earnings.get("AAPL").unwrap().unwrap();
    assert_eq!(aapl.consensus, Some(Consensus::Good));
    assert_eq!(aapl.price_movement_pct, None);
    let price_calls = h.oracle.price_calls();

    // Friday's cycle backfills it.
    let friday = Utc.with_ymd_and_hms(2025, 1, 31, 15, 0, 0).unwrap();
    h.scheduler.run_cycle(friday).await.unwrap();
    let aapl = h.stores.earnings.get("AAPL").unwrap().unwrap();
    assert_eq!(aapl.price_movement_pct, Some(8.0));
    assert_eq!(h.oracle.price_calls(), price_calls + 1);
}

#[tokio::test]
async fn test_calendar_outage_fails_cycle() {
    let mut h = default_harness();
    h.calendar.set_error("503 Service Unavailable");
    assert!(h.scheduler.run_cycle(tuesday_morning()).await.is_err());
    assert_eq!(h.oracle.sentiment_calls(), 0);

    h.calendar.clear_error();
    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.entered, vec!["AAPL".to_string()]);
}

#[tokio::test]
async fn test_unreachable_oracle_skips_only_that_ticker() {
    let calendar = MockCalendar::new()
        .with_event("AAPL", d(2025, 1, 29), AnnouncementTiming::AfterClose)
        .with_event("NVDA", d(2025, 1, 29), AnnouncementTiming::BeforeOpen);
    let mut h = harness(
        trading_config(&["AAPL", "NVDA"]),
        calendar,
        MockOracle::new().with_score("NVDA", 90.0),
        default_broker(),
    );

    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.verdicts, vec![("NVDA".to_string(), Consensus::Good)]);
    assert_eq!(report.entered, vec!["NVDA".to_string()]);
    // Every AAPL attempt failed: five samples, three attempts each.
    assert_eq!(h.oracle.sentiment_calls(), 15 + 5);
    assert!(h.stores.earnings.get("AAPL").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Config changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ticker_added_mid_cycle_is_queued_then_processed() {
    let calendar = default_calendar().with_event("NVDA", d(2025, 1, 29), AnnouncementTiming::BeforeOpen);
    let oracle = MockOracle::new()
        .with_score("AAPL", 85.0)
        .with_score("NVDA", 90.0)
        .with_prices("TSLA", 250.0, 260.0);
    let config = TradingConfig { max_exposure: 0.9, ..trading_config(&["AAPL", "MSFT", "TSLA"]) };
    let mut h = harness(config, calendar, oracle, default_broker());

    // Picked up by the first config check inside the cycle.
    let mut edited = h.scheduler.config().clone();
    edited.stock_universe.push("NVDA".into());
    rewrite_config(&h.config_path, &edited);

    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.drained, vec!["NVDA".to_string()]);
    assert_eq!(
        report.verdicts,
        vec![("AAPL".to_string(), Consensus::Good), ("NVDA".to_string(), Consensus::Good)]
    );
    assert_eq!(report.entered, vec!["AAPL".to_string(), "NVDA".to_string()]);
    assert_eq!(h.scheduler.queued().count(), 0);
    assert!(h.scheduler.config().stock_universe.contains(&"NVDA".to_string()));
}

#[tokio::test]
async fn test_master_off_mid_cycle_stops_gathering() {
    let calendar = MockCalendar::new()
        .with_event("AAPL", d(2025, 1, 29), AnnouncementTiming::AfterClose)
        .with_event("NVDA", d(2025, 1, 29), AnnouncementTiming::BeforeOpen);
    let oracle = MockOracle::new().with_score("AAPL", 85.0).with_score("NVDA", 90.0);
    let mut h = harness(trading_config(&["AAPL", "NVDA"]), calendar, oracle, default_broker());

    let mut edited = h.scheduler.config().clone();
    edited.master_on = false;
    rewrite_config(&h.config_path, &edited);

    let report = h.scheduler.run_cycle(tuesday_morning()).await.unwrap();
    assert_eq!(report.verdicts, vec![("AAPL".to_string(), Consensus::Good)]);
    assert_eq!(h.oracle.sentiment_calls(), 5);
    assert!(!h.scheduler.config().master_on);
}

#[tokio::test]
async fn test_ticker_added_between_cycles_is_processed_immediately() {
    // Runs against the wall clock, so the date gate is bypassed.
    let today = market_date(Utc::now());
    let calendar = MockCalendar::new().with_event(
        "NVDA",
        today + ChronoDuration::days(3),
        AnnouncementTiming::BeforeOpen,
    );
    let config = TradingConfig { test_mode: true, ..trading_config(&["AAPL"]) };
    let mut h = harness(config, calendar, MockOracle::new().with_score("NVDA", 90.0), default_broker());

    let mut edited = h.scheduler.config().clone();
    edited.stock_universe.push("NVDA".into());
    h.scheduler.apply_config(edited).await;

    assert_eq!(h.scheduler.queued().count(), 0);
    assert_eq!(h.oracle.sentiment_calls(), 5);
    assert_eq!(h.broker.market_orders("NVDA").len(), 1);
    assert!(h.stores.positions.has_open("NVDA").unwrap());
}

#[tokio::test]
async fn test_idle_toggle_applied_from_config() {
    let broker = MockBroker::new(5_000.0).with_quote("SPY", 500.0);
    let mut h = harness(trading_config(&["AAPL"]), default_calendar(), MockOracle::new(), broker);

    let mut on = h.scheduler.config().clone();
    on.sp_on = true;
    h.scheduler.apply_config(on.clone()).await;
    assert_eq!(h.broker.holding("SPY"), 10.0);

    let mut off = on;
    off.sp_on = false;
    h.scheduler.apply_config(off).await;
    assert_eq!(h.broker.holding("SPY"), 0.0);
    assert_eq!(h.broker.cash(), 5_000.0);
}

#[tokio::test]
async fn test_startup_seeds_idle_then_cycles() {
    let broker = default_broker();
    broker.set_buying_power(20_000.0);
    let config = TradingConfig { sp_on: true, ..trading_config(&["AAPL", "MSFT", "TSLA"]) };
    let oracle = MockOracle::new().with_score("AAPL", 85.0).with_prices("TSLA", 250.0, 260.0);
    let mut h = harness(config, default_calendar(), oracle, broker);

    h.scheduler.startup(tuesday_morning()).await;

    // All cash parked in SPY, then part of it freed for the AAPL entry.
    let spy = h.broker.market_orders("SPY");
    assert_eq!(spy[0].side, OrderSide::Buy);
    assert_eq!(spy[0].quantity, 20.0);
    assert_eq!(spy[1].side, OrderSide::Sell);
    assert_eq!(h.broker.holding("AAPL"), 27.0);
    assert!(h.stores.positions.has_open("AAPL").unwrap());
}

#[tokio::test]
async fn test_startup_with_master_off_does_nothing() {
    let config = TradingConfig { master_on: false, sp_on: true, ..trading_config(&["AAPL"]) };
    let mut h = harness(config, default_calendar(), MockOracle::new(), default_broker());

    h.scheduler.startup(tuesday_morning()).await;
    assert!(h.broker.orders().is_empty());
    assert!(h.calendar.requests().is_empty());
}

#[tokio::test]
async fn test_enabling_master_after_startup_seeds_and_backfills() {
    let config = TradingConfig { master_on: false, sp_on: true, ..trading_config(&["AAPL"]) };
    let oracle = MockOracle::new().with_prices("TSLA", 250.0, 260.0);
    let broker = MockBroker::new(5_000.0).with_quote("SPY", 500.0);
    let mut h = harness(config, default_calendar(), oracle, broker);
    h.stores
        .earnings
        .record_event("TSLA", EarningsEvent::new(d(2024, 10, 23), AnnouncementTiming::AfterClose), None)
        .unwrap();

    h.scheduler.startup(tuesday_morning()).await;
    assert!(h.broker.orders().is_empty());
    assert_eq!(h.oracle.price_calls(), 0);

    let mut on = h.scheduler.config().clone();
    on.master_on = true;
    h.scheduler.apply_config(on).await;
    h.scheduler.prepare(tuesday_morning()).await;

    assert_eq!(h.broker.holding("SPY"), 10.0);
    let tsla = h.stores.earnings.get("TSLA").unwrap().unwrap();
    assert_eq!(tsla.price_movement_pct, Some(4.0));

    // A second enable does not repeat either task.
    h.scheduler.prepare(tuesday_morning()).await;
    assert_eq!(h.broker.market_orders("SPY").len(), 1);
    assert_eq!(h.oracle.price_calls(), 1);
}
