//! CDEM: Consensus-Driven Earnings Momentum agent
//!
//! Entry point. Loads settings, initialises structured logging, opens the
//! file-backed stores, wires the broker, oracle and calendar clients, and
//! runs the scheduler until Ctrl+C.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use cdem::broker::tradier::TradierClient;
use cdem::broker::Broker;
use cdem::calendar::finnhub::FinnhubClient;
use cdem::calendar::EarningsCalendar;
use cdem::config::{ConfigWatcher, Settings};
use cdem::engine::{
    ConsensusConfig, ConsensusEngine, LifecycleSettings, MovementResolver, Scheduler,
    SchedulerSettings, TradeLifecycleManager,
};
use cdem::llm::grok::GrokClient;
use cdem::llm::SentimentOracle;
use cdem::storage::Stores;

const BANNER: &str = r#"
  ____ ____  _____ __  __
 / ___|  _ \| ____|  \/  |
| |   | | | |  _| | |\/| |
| |___| |_| | |___| |  | |
 \____|____/|_____|_|  |_|

  Consensus-Driven Earnings Momentum
  v0.1.0
"#;

const DEFAULT_SETTINGS_PATH: &str = "cdem.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let settings_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());
    let settings = Settings::load(&settings_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %settings.agent.name,
        settings = %settings_path,
        data_dir = %settings.agent.data_dir,
        config_path = %settings.agent.config_path,
        "CDEM starting up"
    );

    // -- Stores and trading config ---------------------------------------

    let stores = Arc::new(Stores::open(Path::new(&settings.agent.data_dir))?);
    let (watcher, trading) = ConfigWatcher::open(&settings.agent.config_path)?;
    info!(
        mode = %trading.mode(),
        master_on = trading.master_on,
        universe = ?trading.stock_universe,
        "Trading config loaded"
    );

    // -- Clients ---------------------------------------------------------

    let tradier = TradierClient::from_env(&settings.broker)?;
    tradier
        .ensure_credentials(trading.mode())
        .with_context(|| format!("Broker credentials missing for {}", trading.mode()))?;
    let broker: Arc<dyn Broker> = Arc::new(tradier);

    let llm_key = Settings::resolve_env(&settings.llm.api_key_env)?;
    let oracle: Arc<dyn SentimentOracle> = Arc::new(GrokClient::new(llm_key, &settings.llm)?);
    info!(model = oracle.model_name(), samples = settings.llm.samples, "Sentiment oracle ready");

    let calendar_key = Settings::resolve_env(&settings.calendar.api_key_env)?;
    let calendar: Arc<dyn EarningsCalendar> =
        Arc::new(FinnhubClient::new(calendar_key, &settings.calendar)?);

    // -- Engine ----------------------------------------------------------

    let consensus = ConsensusEngine::new(
        Arc::clone(&oracle),
        Arc::clone(&stores),
        ConsensusConfig::from(&settings.llm),
    );
    let lifecycle = TradeLifecycleManager::new(
        broker,
        Arc::clone(&stores),
        LifecycleSettings::from_agent(&settings.agent)?,
    );
    let movement = MovementResolver::new(oracle, Arc::clone(&stores), settings.llm.movement_attempts);

    let mut scheduler = Scheduler::new(
        watcher,
        trading,
        calendar,
        consensus,
        lifecycle,
        movement,
        stores,
        SchedulerSettings::from(&settings),
    );

    info!("Entering main loop. Press Ctrl+C to stop.");
    tokio::select! {
        result = scheduler.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received."),
    }

    info!("CDEM shut down cleanly.");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdem=info"));

    if std::env::var("CDEM_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
