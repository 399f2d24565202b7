//! Trade lifecycle scenarios against the mock broker.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

use cdem::broker::Broker;
use cdem::config::TradingConfig;
use cdem::engine::{EntryOutcome, LifecycleSettings, TradeLifecycleManager};
use cdem::storage::Stores;
use cdem::strategy::RejectionReason;
use cdem::types::*;

use crate::mock_broker::{MockBroker, OrderKind};

struct Harness {
    _dir: tempfile::TempDir,
    broker: Arc<MockBroker>,
    stores: Arc<Stores>,
    manager: TradeLifecycleManager,
}

fn harness(broker: MockBroker) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let stores = Arc::new(Stores::open(dir.path()).unwrap());
    let broker = Arc::new(broker);
    let manager = TradeLifecycleManager::new(broker.clone(), Arc::clone(&stores), LifecycleSettings::default());
    Harness { _dir: dir, broker, stores, manager }
}

fn good(ticker: &str) -> ConsensusResult {
    ConsensusResult {
        ticker: ticker.to_string(),
        scores: vec![82.0, 78.0, 90.0, 85.0],
        average: 83.75,
        consensus: Consensus::Good,
    }
}

fn stocks_only() -> TradingConfig {
    TradingConfig { sp_on: false, ..TradingConfig::default() }
}

fn with_idle() -> TradingConfig {
    TradingConfig { sp_on: true, ..TradingConfig::default() }
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// UTC instant for a New York wall-clock time in January (EST, UTC-5).
fn ny(y: i32, m: u32, day: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, day, h + 5, min, 0).unwrap()
}

fn entered(outcome: EntryOutcome) -> Position {
    match outcome {
        EntryOutcome::Entered(p) => p,
        other => panic!("expected an entry, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reference_entry_sizing() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));

    let position = entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    assert_eq!(position.position_size, 27.0);
    assert_eq!(position.entry_price, 100.0);
    assert_eq!(position.current_price, 100.0);
    assert_eq!(position.pnl, 0.0);
    assert_eq!(position.status, PositionStatus::Open);

    let buys = h.broker.market_orders("AAPL");
    assert_eq!(buys.len(), 1);
    assert_eq!(buys[0].quantity, 27.0);
    assert_eq!(buys[0].mode, TradingMode::Paper);

    let stop = h.broker.live_stop("AAPL").expect("protective stop");
    assert_eq!(stop.stop_price, Some(95.0));
    assert_eq!(stop.quantity, 27.0);
    assert_eq!(position.stop_order_id.as_deref(), Some(stop.id.as_str()));
}

#[tokio::test]
async fn test_entry_is_idempotent() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));

    entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    let again = h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap();
    assert_eq!(again, EntryOutcome::Skipped(RejectionReason::AlreadyOpen));

    assert_eq!(h.broker.market_orders("AAPL").len(), 1);
    assert_eq!(h.stores.positions.load_all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_exposure_cap_blocks_entry() {
    // $10,000 equity with $4,000 already in MSFT: 40% exposure. The AAPL
    // trade would add another 27%.
    let broker = MockBroker::new(6_000.0)
        .with_quote("MSFT", 400.0)
        .with_quote("AAPL", 100.0)
        .with_holding("MSFT", 10.0);
    let h = harness(broker);
    h.stores
        .positions
        .append(&Position::open("MSFT", 10.0, 400.0, None, None, Utc::now()))
        .unwrap();

    let outcome = h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap();
    match outcome {
        EntryOutcome::Skipped(RejectionReason::ExposureCap { current, max, .. }) => {
            assert!((current - 0.40).abs() < 1e-9);
            assert_eq!(max, 0.45);
        }
        other => panic!("expected exposure rejection, got {other:?}"),
    }
    assert!(h.broker.market_orders("AAPL").is_empty());
}

#[tokio::test]
async fn test_insufficient_buying_power_blocks_entry() {
    let h = harness(MockBroker::new(2_000.0).with_quote("AAPL", 100.0).with_quote("SPY", 500.0).with_holding("SPY", 16.0));

    let outcome = h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap();
    assert!(matches!(outcome, EntryOutcome::Skipped(RejectionReason::InsufficientBuyingPower { .. })));
}

#[tokio::test]
async fn test_entry_frees_idle_capital_first() {
    // $1,000 cash, $9,000 parked in SPY, margin buying power.
    let broker = MockBroker::new(1_000.0)
        .with_quote("AAPL", 100.0)
        .with_quote("SPY", 500.0)
        .with_holding("SPY", 18.0);
    broker.set_buying_power(20_000.0);
    let h = harness(broker);

    entered(h.manager.enter(&good("AAPL"), &with_idle()).await.unwrap());

    let spy = h.broker.market_orders("SPY");
    assert_eq!(spy.len(), 1);
    assert_eq!(spy[0].side, OrderSide::Sell);
    // Shortfall of $1,727.27 sold as whole SPY shares.
    assert_eq!(spy[0].notional, Some(1727.27));
    assert_eq!(spy[0].quantity, 3.0);
    assert_eq!(h.broker.holding("SPY"), 15.0);

    // The idle sale happens before the buy.
    let orders = h.broker.orders();
    let spy_at = orders.iter().position(|o| o.symbol == "SPY").unwrap();
    let aapl_at = orders.iter().position(|o| o.symbol == "AAPL").unwrap();
    assert!(spy_at < aapl_at);
}

#[tokio::test]
async fn test_options_config_refused() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    let cfg = TradingConfig { use_options: true, ..stocks_only() };

    let outcome = h.manager.enter(&good("AAPL"), &cfg).await.unwrap();
    assert_eq!(outcome, EntryOutcome::Skipped(RejectionReason::OptionsUnsupported));
    assert!(h.broker.orders().is_empty());
}

#[tokio::test]
async fn test_invalid_quote_skips_entry() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 0.0));
    let outcome = h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap();
    assert_eq!(outcome, EntryOutcome::Skipped(RejectionReason::InvalidPrice { price: 0.0 }));
}

#[tokio::test]
async fn test_sub_share_entry_is_degenerate() {
    // $150 of risk cannot buy a single $5,000 share.
    let h = harness(MockBroker::new(10_000.0).with_quote("BRK", 5_000.0));
    let outcome = h.manager.enter(&good("BRK"), &stocks_only()).await.unwrap();
    assert!(matches!(outcome, EntryOutcome::Skipped(RejectionReason::DegenerateSize { .. })));
    assert!(h.broker.orders().is_empty());
}

#[tokio::test]
async fn test_broker_outage_is_an_error_not_a_row() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    h.broker.set_error("connection reset");

    assert!(h.manager.enter(&good("AAPL"), &stocks_only()).await.is_err());
    assert!(h.stores.positions.load_all().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Monitoring and exits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unprotected_entry_gets_stop_once_trailing() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    h.broker.reject_stop_orders(true);

    let position = entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    assert!(position.stop_order_id.is_none());
    assert!(h.broker.live_stop("AAPL").is_none());

    // Earnings a long way off; the price runs 15%.
    let far = EarningsEvent::new(d(2099, 1, 1), AnnouncementTiming::AfterClose);
    h.stores.earnings.record_event("AAPL", far, None).unwrap();
    h.broker.reject_stop_orders(false);
    h.broker.set_quote("AAPL", 115.0);

    let report = h.manager.monitor(Utc::now(), &stocks_only()).await.unwrap();
    assert_eq!(report.stops_raised, 1);
    let stop = h.broker.live_stop("AAPL").expect("trailing stop placed");
    assert_eq!(stop.stop_price, Some(109.25));

    let stored = h.stores.positions.open_positions().unwrap().remove(0);
    assert_eq!(stored.stop_order_id.as_deref(), Some(stop.id.as_str()));
    assert_eq!(stored.high_price, Some(115.0));
}

#[tokio::test]
async fn test_trailing_stop_only_ratchets_up() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    let far = EarningsEvent::new(d(2099, 1, 1), AnnouncementTiming::AfterClose);
    h.stores.earnings.record_event("AAPL", far, None).unwrap();

    h.broker.set_quote("AAPL", 120.0);
    h.manager.monitor(Utc::now(), &stocks_only()).await.unwrap();
    assert_eq!(h.broker.live_stop("AAPL").unwrap().stop_price, Some(114.0));

    // Pullback above the trigger: the high holds and the stop stays.
    h.broker.set_quote("AAPL", 112.0);
    let report = h.manager.monitor(Utc::now(), &stocks_only()).await.unwrap();
    assert_eq!(report.stops_raised, 0);
    assert_eq!(h.broker.live_stop("AAPL").unwrap().stop_price, Some(114.0));

    h.broker.set_quote("AAPL", 130.0);
    h.manager.monitor(Utc::now(), &stocks_only()).await.unwrap();
    assert_eq!(h.broker.live_stop("AAPL").unwrap().stop_price, Some(123.5));

    let stored = h.stores.positions.open_positions().unwrap().remove(0);
    assert_eq!(stored.high_price, Some(130.0));
    assert_eq!(stored.stop_price, Some(123.5));
    assert!((stored.pnl - 27.0 * 30.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_amc_exit_next_day_and_reinvest() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0).with_quote("SPY", 500.0));
    entered(h.manager.enter(&good("AAPL"), &with_idle()).await.unwrap());
    // Thursday after the close.
    let amc = EarningsEvent::new(d(2025, 1, 30), AnnouncementTiming::AfterClose);
    h.stores.earnings.record_event("AAPL", amc, Some((83.75, Consensus::Good))).unwrap();
    h.broker.set_quote("AAPL", 104.0);

    // Announcement day and next morning: hold.
    for now in [ny(2025, 1, 30, 15, 30), ny(2025, 1, 31, 10, 0)] {
        let report = h.manager.monitor(now, &with_idle()).await.unwrap();
        assert!(report.exited.is_empty(), "exited early at {now}");
    }

    let report = h.manager.monitor(ny(2025, 1, 31, 15, 5), &with_idle()).await.unwrap();
    assert_eq!(report.exited, vec!["AAPL".to_string()]);

    let rows = h.stores.positions.load_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PositionStatus::Closed);
    assert!((rows[0].pnl - 27.0 * 4.0).abs() < 1e-9);
    assert_eq!(rows[0].current_price, 104.0);

    // Stop cancelled, full size sold, proceeds parked in SPY.
    assert_eq!(h.broker.cancelled().len(), 1);
    let sells: Vec<_> = h
        .broker
        .market_orders("AAPL")
        .into_iter()
        .filter(|o| o.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].quantity, 27.0);
    let spy = h.broker.market_orders("SPY");
    assert_eq!(spy.len(), 1);
    assert_eq!(spy[0].side, OrderSide::Buy);
    assert_eq!(spy[0].notional, Some(2808.0));
}

#[tokio::test]
async fn test_bmo_exit_same_day() {
    let h = harness(MockBroker::new(10_000.0).with_quote("MSFT", 100.0));
    entered(h.manager.enter(&good("MSFT"), &stocks_only()).await.unwrap());
    let bmo = EarningsEvent::new(d(2025, 1, 28), AnnouncementTiming::BeforeOpen);
    h.stores.earnings.record_event("MSFT", bmo, None).unwrap();
    h.broker.set_quote("MSFT", 97.0);

    let early = h.manager.monitor(ny(2025, 1, 28, 11, 0), &stocks_only()).await.unwrap();
    assert!(early.exited.is_empty());
    let late = h.manager.monitor(ny(2025, 1, 28, 15, 0), &stocks_only()).await.unwrap();
    assert_eq!(late.exited, vec!["MSFT".to_string()]);

    let closed = &h.stores.positions.load_all().unwrap()[0];
    assert!((closed.pnl + 27.0 * 3.0).abs() < 1e-9);
    assert!(h.broker.market_orders("SPY").is_empty());
}

#[tokio::test]
async fn test_fallback_exit_without_earnings_record() {
    let h = harness(MockBroker::new(10_000.0).with_quote("TSLA", 200.0));
    let opened = ny(2025, 1, 27, 15, 0);
    h.stores
        .positions
        .append(&Position::open("TSLA", 10.0, 190.0, None, None, opened))
        .unwrap();
    h.stores
        .sentiment
        .append(&SentimentRecord {
            timestamp: opened,
            ticker: "TSLA".into(),
            sentiment_score: 80.0,
            consensus: Consensus::Good,
            num_sources: 5,
        })
        .unwrap();
    h.broker.set_quote("TSLA", 200.0);
    // The mock needs shares to sell.
    h.broker
        .submit_market_order(TradingMode::Paper, "TSLA", OrderSide::Buy, OrderQuantity::Shares(10.0))
        .await
        .unwrap();

    let one_day = h.manager.monitor(ny(2025, 1, 28, 15, 0), &stocks_only()).await.unwrap();
    assert!(one_day.exited.is_empty());
    let two_days = h.manager.monitor(ny(2025, 1, 29, 9, 45), &stocks_only()).await.unwrap();
    assert_eq!(two_days.exited, vec!["TSLA".to_string()]);
    assert!((h.stores.positions.load_all().unwrap()[0].pnl - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_exit_keeps_position_open() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    let opened = ny(2025, 1, 27, 15, 0);
    // Recorded open but never bought at the mock broker: the sell fails.
    h.stores
        .positions
        .append(&Position::open("AAPL", 5.0, 100.0, None, None, opened))
        .unwrap();
    let bmo = EarningsEvent::new(d(2025, 1, 28), AnnouncementTiming::BeforeOpen);
    h.stores.earnings.record_event("AAPL", bmo, None).unwrap();

    let report = h.manager.monitor(ny(2025, 1, 28, 15, 30), &stocks_only()).await.unwrap();
    assert!(report.exited.is_empty());
    let row = &h.stores.positions.load_all().unwrap()[0];
    assert_eq!(row.status, PositionStatus::Open);
}

#[tokio::test]
async fn test_failed_exit_sell_restores_cancelled_stop() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    let position = entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    let original = position.stop_order_id.clone().unwrap();
    let bmo = EarningsEvent::new(d(2025, 1, 28), AnnouncementTiming::BeforeOpen);
    h.stores.earnings.record_event("AAPL", bmo, None).unwrap();

    // The stop cancels fine, then the sell is rejected.
    h.broker.set_holding("AAPL", 0.0);
    h.broker.set_quote("AAPL", 97.0);
    let report = h.manager.monitor(ny(2025, 1, 28, 15, 30), &stocks_only()).await.unwrap();
    assert!(report.exited.is_empty());
    assert_eq!(h.broker.cancelled(), vec![original.clone()]);

    let stop = h.broker.live_stop("AAPL").expect("stop placed again");
    assert_eq!(stop.stop_price, Some(95.0));
    assert_eq!(stop.quantity, 27.0);
    assert_ne!(stop.id, original);

    let row = h.stores.positions.open_positions().unwrap().remove(0);
    assert_eq!(row.stop_order_id.as_deref(), Some(stop.id.as_str()));
    assert_eq!(row.stop_price, Some(95.0));
}

#[tokio::test]
async fn test_failed_exit_sell_without_restorable_stop_stays_open() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    entered(h.manager.enter(&good("AAPL"), &stocks_only()).await.unwrap());
    let bmo = EarningsEvent::new(d(2025, 1, 28), AnnouncementTiming::BeforeOpen);
    h.stores.earnings.record_event("AAPL", bmo, None).unwrap();

    h.broker.set_holding("AAPL", 0.0);
    h.broker.reject_stop_orders(true);
    h.manager.monitor(ny(2025, 1, 28, 15, 30), &stocks_only()).await.unwrap();

    assert!(h.broker.live_stop("AAPL").is_none());
    let row = h.stores.positions.open_positions().unwrap().remove(0);
    assert_eq!(row.status, PositionStatus::Open);
    assert!(row.stop_order_id.is_none());
}

// ---------------------------------------------------------------------------
// Idle capital
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_seed_idle_with_empty_account() {
    let h = harness(MockBroker::new(10_000.0).with_quote("SPY", 500.0));
    assert!(h.manager.seed_idle(&with_idle()).await.unwrap());
    assert_eq!(h.broker.holding("SPY"), 20.0);

    // Already invested: nothing more to do.
    assert!(!h.manager.seed_idle(&with_idle()).await.unwrap());
    assert!(!h.manager.seed_idle(&stocks_only()).await.unwrap());
    assert_eq!(h.broker.market_orders("SPY").len(), 1);
}

#[tokio::test]
async fn test_idle_toggle_moves_between_cash_and_instrument() {
    let h = harness(MockBroker::new(5_000.0).with_quote("SPY", 500.0));

    h.manager.handle_idle_toggle(&with_idle()).await.unwrap();
    assert_eq!(h.broker.holding("SPY"), 10.0);
    assert_eq!(h.broker.cash(), 0.0);

    h.manager.handle_idle_toggle(&stocks_only()).await.unwrap();
    assert_eq!(h.broker.holding("SPY"), 0.0);
    assert_eq!(h.broker.cash(), 5_000.0);
}

#[tokio::test]
async fn test_idle_toggle_is_noop_with_open_trades() {
    let h = harness(MockBroker::new(5_000.0).with_quote("SPY", 500.0));
    h.stores
        .positions
        .append(&Position::open("AAPL", 1.0, 100.0, None, None, Utc::now()))
        .unwrap();

    h.manager.handle_idle_toggle(&with_idle()).await.unwrap();
    assert!(h.broker.orders().is_empty());
}

#[tokio::test]
async fn test_live_mode_orders_carry_mode() {
    let h = harness(MockBroker::new(10_000.0).with_quote("AAPL", 100.0));
    let live = TradingConfig { paper_trading: false, ..stocks_only() };

    entered(h.manager.enter(&good("AAPL"), &live).await.unwrap());
    assert!(h.broker.orders().iter().all(|o| o.mode == TradingMode::Live));
    assert!(h.broker.orders().iter().any(|o| o.kind == OrderKind::Stop));
}
