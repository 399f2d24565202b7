//! Scheduler loop.
//!
//! Drives check cycles on the configured interval, sleeping in short
//! slices so edits to the trading config (master switch, universe,
//! interval, idle capital) take effect within one slice.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::consensus::{ConsensusEngine, ConsensusOutcome};
use super::lifecycle::{EntryOutcome, TradeLifecycleManager};
use super::movement::MovementResolver;
use crate::calendar::EarningsCalendar;
use crate::config::{ConfigDiff, ConfigWatcher, Settings, TradingConfig};
use crate::storage::Stores;
use crate::strategy::exit::market_date;
use crate::types::{Consensus, EarningsEvent};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Longest single sleep between config checks.
    pub slice: Duration,
    /// Config poll period while the master switch is off.
    pub idle_poll: Duration,
    pub lookahead_days: i64,
    pub lookback_days: i64,
}

impl From<&Settings> for SchedulerSettings {
    fn from(s: &Settings) -> Self {
        Self {
            slice: Duration::from_secs(s.agent.slice_secs.max(1)),
            idle_poll: Duration::from_secs(s.agent.idle_poll_secs.max(1)),
            lookahead_days: s.calendar.lookahead_days,
            lookback_days: s.calendar.lookback_days,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Summary of one full check cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Tickers with an announcement inside the lookahead window.
    pub upcoming: usize,
    pub verdicts: Vec<(String, Consensus)>,
    pub entered: Vec<String>,
    pub exited: Vec<String>,
    /// Queued tickers processed at the end of the cycle.
    pub drained: Vec<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    watcher: ConfigWatcher,
    config: TradingConfig,
    calendar: Arc<dyn EarningsCalendar>,
    consensus: ConsensusEngine,
    lifecycle: TradeLifecycleManager,
    movement: MovementResolver,
    stores: Arc<Stores>,
    settings: SchedulerSettings,
    /// True while a cycle is evaluating tickers.
    gathering: bool,
    /// Tickers added to the universe while gathering.
    queued: VecDeque<String>,
    /// Set by an interval change; ends the current wait.
    run_now: bool,
    /// Idle seed and movement backfill have run.
    prepared: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watcher: ConfigWatcher,
        config: TradingConfig,
        calendar: Arc<dyn EarningsCalendar>,
        consensus: ConsensusEngine,
        lifecycle: TradeLifecycleManager,
        movement: MovementResolver,
        stores: Arc<Stores>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            watcher,
            config,
            calendar,
            consensus,
            lifecycle,
            movement,
            stores,
            settings,
            gathering: false,
            queued: VecDeque::new(),
            run_now: false,
            prepared: false,
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn queued(&self) -> impl Iterator<Item = &String> {
        self.queued.iter()
    }

    /// Seed idle capital, backfill movements, and run the first cycle.
    pub async fn startup(&mut self, now: DateTime<Utc>) {
        info!(
            mode = %self.config.mode(),
            universe = ?self.config.stock_universe,
            interval_mins = self.config.check_interval_minutes,
            idle_capital = self.config.sp_on,
            test_mode = self.config.test_mode,
            "Scheduler starting"
        );

        if !self.config.master_on {
            info!("Master switch is off, waiting for it to be enabled");
            return;
        }

        self.prepare(now).await;
        if let Err(e) = self.run_cycle(now).await {
            error!(error = %e, "Startup cycle failed");
        }
    }

    /// Seed idle capital and backfill movements. Runs once, at startup or
    /// when the master switch is first enabled.
    pub async fn prepare(&mut self, now: DateTime<Utc>) {
        if self.prepared {
            return;
        }
        self.prepared = true;

        if let Err(e) = self.lifecycle.seed_idle(&self.config).await {
            warn!(error = %e, "Idle capital seed failed, continuing without");
        }
        if let Err(e) = self.movement.backfill(market_date(now)).await {
            warn!(error = %e, "Startup movement backfill failed");
        }
    }

    /// Run until the process is stopped.
    pub async fn run(&mut self) -> Result<()> {
        self.startup(Utc::now()).await;

        loop {
            if !self.config.master_on {
                tokio::time::sleep(self.settings.idle_poll).await;
                self.check_config().await;
                if !self.config.master_on {
                    continue;
                }
                info!("Master switch enabled, resuming");
                self.prepare(Utc::now()).await;
                self.run_now = true;
            }

            self.wait_for_next_cycle().await;
            if !self.config.master_on {
                info!("Master switch off, cycles paused");
                continue;
            }

            match self.run_cycle(Utc::now()).await {
                Ok(report) => log_cycle_report(&report),
                Err(e) => error!(error = %e, "Cycle failed, continuing to next"),
            }
        }
    }

    /// Sleep in slices up to the interval, reloading config every slice.
    async fn wait_for_next_cycle(&mut self) {
        let total = Duration::from_secs(self.config.check_interval_minutes.max(1) * 60);
        let mut waited = Duration::ZERO;
        info!(minutes = self.config.check_interval_minutes, "Waiting for next cycle");

        while waited < total {
            if self.run_now {
                break;
            }
            let step = self.settings.slice.min(total - waited);
            tokio::time::sleep(step).await;
            waited += step;

            self.check_config().await;
            if !self.config.master_on {
                return;
            }
        }
        self.run_now = false;
    }

    // -- Config ----------------------------------------------------------

    /// Reload the trading config if the file changed.
    pub async fn check_config(&mut self) {
        match self.watcher.poll() {
            Ok(Some(new)) => self.apply_config(new).await,
            Ok(None) => {}
            Err(e) => warn!(path = %self.watcher.path().display(), error = %e, "Failed to reload trading config"),
        }
    }

    /// Switch to `new`, reacting to whatever changed.
    pub async fn apply_config(&mut self, new: TradingConfig) {
        let diff = ConfigDiff::between(&self.config, &new);
        self.config = new;
        if diff.is_empty() {
            return;
        }

        for change in &diff.changes {
            info!(change = %change, "Config updated");
        }
        for ticker in &diff.added_tickers {
            info!(ticker = %ticker, "Ticker added to universe");
        }
        for ticker in &diff.removed_tickers {
            info!(ticker = %ticker, "Ticker removed from universe");
        }
        if diff.mode_changed {
            warn!(mode = %self.config.mode(), "Trading mode changed");
        }
        if diff.master_changed && !self.config.master_on {
            warn!("Master switch turned off");
        }

        if diff.idle_toggled {
            info!(enabled = self.config.sp_on, "Idle capital policy toggled");
            if let Err(e) = self.lifecycle.handle_idle_toggle(&self.config).await {
                error!(error = %e, "Idle capital toggle failed");
            }
        }
        if diff.interval_changed {
            self.run_now = true;
        }

        if !diff.added_tickers.is_empty() {
            if self.gathering {
                info!(tickers = ?diff.added_tickers, "Consensus in progress, queueing added tickers");
                for ticker in diff.added_tickers {
                    if !self.queued.contains(&ticker) {
                        self.queued.push_back(ticker);
                    }
                }
            } else if self.config.master_on {
                let now = Utc::now();
                match self.process_tickers(&diff.added_tickers, now).await {
                    Ok(report) => debug!(entered = ?report.entered, "Added tickers processed"),
                    Err(e) => error!(error = %e, "Failed to process added tickers"),
                }
            }
        }
    }

    // -- Cycle -----------------------------------------------------------

    /// One full check: calendar, consensus and entries, monitoring, queued
    /// tickers, and the movement backfill.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let today = market_date(now);
        let universe = self.config.stock_universe.clone();
        info!(date = %today, tickers = universe.len(), "Starting earnings check cycle");

        let upcoming = self.refresh_calendar(&universe, today).await?;
        let mut report = CycleReport { upcoming: upcoming.len(), ..CycleReport::default() };

        self.gathering = true;
        for ticker in &universe {
            let Some(event) = upcoming.get(ticker).copied() else {
                continue;
            };
            if !self.config.master_on {
                warn!("Master switch off, stopping consensus gathering");
                break;
            }
            if !self.config.stock_universe.contains(ticker) {
                debug!(ticker = %ticker, "Removed from universe mid-cycle, skipping");
                continue;
            }

            if let Err(e) = self.evaluate_ticker(ticker, event, now, &mut report).await {
                error!(ticker = %ticker, error = %e, "Ticker evaluation failed");
            }
            self.check_config().await;
        }
        self.gathering = false;

        match self.lifecycle.monitor(now, &self.config).await {
            Ok(monitor) => report.exited = monitor.exited,
            Err(e) => error!(error = %e, "Monitoring pass failed"),
        }

        if !self.queued.is_empty() {
            let queued: Vec<String> = self.queued.drain(..).collect();
            info!(tickers = ?queued, "Processing queued tickers");
            match self.process_tickers(&queued, now).await {
                Ok(extra) => {
                    report.verdicts.extend(extra.verdicts);
                    report.entered.extend(extra.entered);
                }
                Err(e) => error!(error = %e, "Failed to process queued tickers"),
            }
            report.drained = queued;
        }

        if let Err(e) = self.movement.backfill(today).await {
            warn!(error = %e, "Movement backfill failed");
        }

        Ok(report)
    }

    /// Calendar refresh and evaluation for a handful of tickers, outside
    /// the main cycle. Config is not re-checked in between.
    async fn process_tickers(&mut self, tickers: &[String], now: DateTime<Utc>) -> Result<CycleReport> {
        let today = market_date(now);
        let upcoming = self.refresh_calendar(tickers, today).await?;
        let mut report = CycleReport { upcoming: upcoming.len(), ..CycleReport::default() };

        for ticker in tickers {
            if let Some(event) = upcoming.get(ticker).copied() {
                if let Err(e) = self.evaluate_ticker(ticker, event, now, &mut report).await {
                    error!(ticker = %ticker, error = %e, "Ticker evaluation failed");
                }
            }
        }
        Ok(report)
    }

    /// Upcoming announcements for `tickers`, recording the latest past
    /// announcement of every ticker without one.
    async fn refresh_calendar(
        &self,
        tickers: &[String],
        today: NaiveDate,
    ) -> Result<HashMap<String, EarningsEvent>> {
        let until = today + ChronoDuration::days(self.settings.lookahead_days);
        let upcoming = self
            .calendar
            .upcoming(tickers, today, until)
            .await
            .with_context(|| format!("{} upcoming earnings lookup failed", self.calendar.name()))?;
        for (ticker, event) in &upcoming {
            info!(ticker = %ticker, earnings = %event, "Upcoming earnings");
        }

        let rest: Vec<String> = tickers.iter().filter(|t| !upcoming.contains_key(*t)).cloned().collect();
        if !rest.is_empty() {
            let since = today - ChronoDuration::days(self.settings.lookback_days);
            match self.calendar.most_recent_past(&rest, since, today).await {
                Ok(past) => {
                    for (ticker, event) in past {
                        if self.stores.earnings.record_past_event(&ticker, event)? {
                            info!(ticker = %ticker, earnings = %event, "Most recent earnings recorded");
                        }
                    }
                }
                Err(e) => warn!(tickers = ?rest, error = %e, "Past earnings lookup failed"),
            }
        }
        Ok(upcoming)
    }

    async fn evaluate_ticker(
        &mut self,
        ticker: &str,
        event: EarningsEvent,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.stores.earnings.clear_for_new_cycle(ticker, &event)?;

        let outcome = self
            .consensus
            .evaluate(ticker, event, market_date(now), self.config.test_mode)
            .await?;
        let ConsensusOutcome::Verdict(verdict) = outcome else {
            return Ok(());
        };
        report.verdicts.push((ticker.to_string(), verdict.consensus));

        if verdict.consensus != Consensus::Good {
            info!(ticker, consensus = %verdict.consensus, "No entry on non-Good consensus");
            return Ok(());
        }
        if let EntryOutcome::Entered(_) = self.lifecycle.enter(&verdict, &self.config).await? {
            report.entered.push(ticker.to_string());
        }
        Ok(())
    }
}

fn log_cycle_report(report: &CycleReport) {
    info!(
        upcoming = report.upcoming,
        verdicts = report.verdicts.len(),
        entered = ?report.entered,
        exited = ?report.exited,
        drained = report.drained.len(),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
