//! Configuration for the CDEM agent.
//!
//! Two layers:
//! - [`Settings`]: static operational settings read once from `cdem.toml`.
//!   Secrets (API keys, account ids) are referenced by env-var name and
//!   resolved at runtime via `std::env::var`.
//! - [`TradingConfig`]: the trading parameters edited by the operator UI,
//!   stored as JSON and hot-reloaded by comparing the file modification time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::types::{CdemError, TradingMode};

// ---------------------------------------------------------------------------
// Static settings (cdem.toml)
// ---------------------------------------------------------------------------

/// Top-level static settings.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentSettings,
    pub llm: LlmSettings,
    pub broker: BrokerSettings,
    pub calendar: CalendarSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentSettings {
    pub name: String,
    /// Directory holding the position, sentiment, earnings and interaction stores.
    pub data_dir: String,
    /// Path of the hot-reloaded trading config JSON.
    pub config_path: String,
    /// Length of one sleep slice between config checks.
    pub slice_secs: u64,
    /// Poll period while the master switch is off.
    pub idle_poll_secs: u64,
    /// Market-local time from which a due exit is executed, "HH:MM".
    pub exit_window_start: String,
    /// Days since the last sentiment capture after which a position without
    /// an earnings record is exited.
    pub fallback_exit_days: i64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: "CDEM-001".to_string(),
            data_dir: "app_data".to_string(),
            config_path: "app_data/config.json".to_string(),
            slice_secs: 300,
            idle_poll_secs: 60,
            exit_window_start: "15:00".to_string(),
            fallback_exit_days: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Parallel sentiment samples per ticker.
    pub samples: usize,
    /// Attempts per sample before it is given up.
    pub max_attempts: u32,
    /// Minimum valid samples for a verdict.
    pub min_valid: usize,
    /// Hard per-request timeout.
    pub timeout_secs: u64,
    /// Fixed backoff after a network/API failure.
    pub error_backoff_secs: u64,
    /// Attempts when asking for a session's open/close prices.
    pub movement_attempts: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "grok-4-fast-reasoning".to_string(),
            base_url: "https://api.x.ai/v1".to_string(),
            api_key_env: "XAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            samples: 5,
            max_attempts: 10,
            min_valid: 3,
            timeout_secs: 180,
            error_backoff_secs: 2,
            movement_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSettings {
    pub live_base_url: String,
    pub paper_base_url: String,
    pub live_key_env: String,
    pub live_account_env: String,
    pub paper_key_env: String,
    pub paper_account_env: String,
    /// Fixed delay before each broker request.
    pub request_spacing_ms: u64,
    pub timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            live_base_url: "https://api.tradier.com".to_string(),
            paper_base_url: "https://sandbox.tradier.com".to_string(),
            live_key_env: "TRADIER_API_KEY".to_string(),
            live_account_env: "TRADIER_ACCOUNT_ID".to_string(),
            paper_key_env: "TRADIER_PAPER_API_KEY".to_string(),
            paper_account_env: "TRADIER_PAPER_ACCOUNT_ID".to_string(),
            request_spacing_ms: 250,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalendarSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub lookahead_days: i64,
    pub lookback_days: i64,
    /// Sleep before every calendar request.
    pub request_spacing_ms: u64,
    pub max_attempts: u32,
    pub rate_limit_backoff_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            base_url: "https://finnhub.io/api/v1".to_string(),
            api_key_env: "FINNHUB_API_KEY".to_string(),
            lookahead_days: 7,
            lookback_days: 120,
            request_spacing_ms: 1100,
            max_attempts: 3,
            rate_limit_backoff_secs: 60,
            error_backoff_secs: 5,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {path}"))?;
        let settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {path}"))?;
        Ok(settings)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        match std::env::var(env_name) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(CdemError::MissingCredentials(env_name.to_string()).into()),
        }
    }

    pub fn data_path(&self, file: &str) -> PathBuf {
        Path::new(&self.agent.data_dir).join(file)
    }
}

// ---------------------------------------------------------------------------
// Trading config (config.json, hot-reloaded)
// ---------------------------------------------------------------------------

/// Trading parameters edited externally and reloaded while running.
///
/// Unknown keys written by the UI (colours, display names) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub master_on: bool,
    /// Idle-capital policy on/off.
    pub sp_on: bool,
    pub idle_capital_target: String,
    pub paper_trading: bool,
    pub stock_universe: Vec<String>,
    pub check_interval_minutes: u64,
    pub risk_per_trade: f64,
    pub max_exposure: f64,
    pub stop_loss_pct: f64,
    pub trailing_trigger: f64,
    pub trailing_pct: f64,
    pub use_options: bool,
    pub option_exp_weeks: u32,
    pub option_leverage: f64,
    pub test_mode: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            master_on: true,
            sp_on: true,
            idle_capital_target: "SPY".to_string(),
            paper_trading: true,
            stock_universe: ["META", "AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            check_interval_minutes: 60,
            risk_per_trade: 0.015,
            max_exposure: 0.45,
            stop_loss_pct: 0.05,
            trailing_trigger: 0.10,
            trailing_pct: 0.05,
            use_options: false,
            option_exp_weeks: 1,
            option_leverage: 0.5,
            test_mode: true,
        }
    }
}

impl TradingConfig {
    pub fn mode(&self) -> TradingMode {
        TradingMode::from_paper_flag(self.paper_trading)
    }

    /// Read the trading config, writing the defaults first when absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = TradingConfig::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "Created default trading config");
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read trading config: {}", path.display()))?;
        let config: TradingConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse trading config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::storage::write_atomic(path, json.as_bytes())
    }

    /// Reject values that would make sizing or scheduling meaningless.
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("risk_per_trade", self.risk_per_trade),
            ("max_exposure", self.max_exposure),
            ("stop_loss_pct", self.stop_loss_pct),
            ("trailing_pct", self.trailing_pct),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value < 1.0) {
                return Err(CdemError::Config(format!("{name} must be in (0, 1), got {value}")).into());
            }
        }
        if self.trailing_trigger < 0.0 {
            return Err(CdemError::Config("trailing_trigger must be >= 0".into()).into());
        }
        if self.check_interval_minutes == 0 {
            return Err(CdemError::Config("check_interval_minutes must be >= 1".into()).into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Field-by-field difference between two trading configs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    /// Human-readable "field: old -> new" lines for every changed scalar.
    pub changes: Vec<String>,
    pub added_tickers: Vec<String>,
    pub removed_tickers: Vec<String>,
    pub mode_changed: bool,
    pub idle_toggled: bool,
    pub interval_changed: bool,
    pub master_changed: bool,
}

impl ConfigDiff {
    pub fn between(old: &TradingConfig, new: &TradingConfig) -> Self {
        let mut diff = ConfigDiff::default();

        macro_rules! field {
            ($name:ident) => {
                if old.$name != new.$name {
                    diff.changes.push(format!(
                        "{}: {:?} -> {:?}",
                        stringify!($name),
                        old.$name,
                        new.$name
                    ));
                }
            };
        }

        field!(master_on);
        field!(sp_on);
        field!(idle_capital_target);
        field!(paper_trading);
        field!(check_interval_minutes);
        field!(risk_per_trade);
        field!(max_exposure);
        field!(stop_loss_pct);
        field!(trailing_trigger);
        field!(trailing_pct);
        field!(use_options);
        field!(option_exp_weeks);
        field!(option_leverage);
        field!(test_mode);

        diff.added_tickers = new
            .stock_universe
            .iter()
            .filter(|t| !old.stock_universe.contains(t))
            .cloned()
            .collect();
        diff.removed_tickers = old
            .stock_universe
            .iter()
            .filter(|t| !new.stock_universe.contains(t))
            .cloned()
            .collect();

        diff.mode_changed = old.paper_trading != new.paper_trading;
        diff.idle_toggled = old.sp_on != new.sp_on;
        diff.interval_changed = old.check_interval_minutes != new.check_interval_minutes;
        diff.master_changed = old.master_on != new.master_on;
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.added_tickers.is_empty() && self.removed_tickers.is_empty()
    }
}

/// Tracks the trading config file and reloads it when its mtime changes.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Load (or create) the config and remember its modification time.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, TradingConfig)> {
        let path = path.into();
        let config = TradingConfig::load_or_create(&path)?;
        let last_mtime = modified(&path);
        Ok((Self { path, last_mtime }, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new config when the file changed since the last poll.
    ///
    /// A file that fails to parse (e.g. mid-write by the UI) is reported as
    /// an error and its mtime is not recorded, so the next poll retries.
    pub fn poll(&mut self) -> Result<Option<TradingConfig>> {
        let mtime = modified(&self.path);
        if mtime.is_none() || mtime == self.last_mtime {
            return Ok(None);
        }
        let config = TradingConfig::load(&self.path)?;
        self.last_mtime = mtime;
        Ok(Some(config))
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
