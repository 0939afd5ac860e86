//! Configuration for llmpanel.
//!
//! Provides the [`PanelConfig`] struct that sizes the dispatch layer (budgets,
//! timeouts, per-role models) and says where persistent state lives. Users
//! construct it manually or overlay environment variables with
//! [`PanelConfig::from_env`]; no config-file parsing dependency is involved.
//!
//! # Example
//!
//! ```rust
//! use llmpanel::PanelConfig;
//! use std::path::PathBuf;
//! use std::time::Duration;
//!
//! let config = PanelConfig::default()
//!     .with_data_dir(PathBuf::from("/var/lib/llmpanel"))
//!     .with_call_timeout(Duration::from_secs(30));
//! assert_eq!(config.ledger_path(), PathBuf::from("/var/lib/llmpanel/usage_ledger.jsonl"));
//! ```

use crate::ledger::{BudgetConfig, LEDGER_FILE_NAME};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// File name of the persisted rate limiter windows inside [`PanelConfig::data_dir`].
pub const RATE_STATE_FILE_NAME: &str = "rate_limiter_state.json";

/// What the dispatcher does when the price table has no entry for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownModelPolicy {
    /// Dispatch anyway, recording a zero estimated cost.
    ZeroCost,
    /// Refuse the call.
    Reject,
}

/// Global configuration for a panel run.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Directory holding the usage ledger and rate limiter state.
    pub data_dir: PathBuf,
    /// Whether the rate limiter loads and saves its windows under `data_dir`.
    pub persist_rate_limits: bool,
    /// Trailing-hour and trailing-day spend ceilings.
    pub budget: BudgetConfig,
    /// Upper bound on every external call.
    pub call_timeout: Duration,
    /// Output tokens requested from (and estimated for) each call.
    pub max_output_tokens: usize,
    pub synthesizer_model: String,
    pub reviewer_model: String,
    pub expert_model: String,
    pub unknown_model_policy: UnknownModelPolicy,
    /// Buffer size of the streaming event channel.
    pub event_buffer: usize,
}

impl Default for PanelConfig {
    /// `"llmpanel_data"` in the current directory, $5/hour and $50/day ceilings,
    /// a 60 second call timeout and `claude-sonnet-4` for every role.
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("llmpanel_data"),
            persist_rate_limits: true,
            budget: BudgetConfig::new(Some(5.0), Some(50.0)),
            call_timeout: Duration::from_secs(60),
            max_output_tokens: 1_024,
            synthesizer_model: "claude-sonnet-4".to_string(),
            reviewer_model: "claude-sonnet-4".to_string(),
            expert_model: "claude-sonnet-4".to_string(),
            unknown_model_policy: UnknownModelPolicy::ZeroCost,
            event_buffer: 64,
        }
    }
}

impl PanelConfig {
    /// Defaults overlaid with `LLMPANEL_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `LLMPANEL_DATA_DIR` | `data_dir` |
    /// | `LLMPANEL_PERSIST_RATE_LIMITS` | `persist_rate_limits` (`true`/`false`) |
    /// | `LLMPANEL_HOURLY_BUDGET` | `budget.hourly_limit` (dollars, `none` disables) |
    /// | `LLMPANEL_DAILY_BUDGET` | `budget.daily_limit` (dollars, `none` disables) |
    /// | `LLMPANEL_CALL_TIMEOUT_SECS` | `call_timeout` |
    /// | `LLMPANEL_MAX_OUTPUT_TOKENS` | `max_output_tokens` |
    /// | `LLMPANEL_MODEL` | all three role models |
    /// | `LLMPANEL_SYNTHESIZER_MODEL`, `LLMPANEL_REVIEWER_MODEL`, `LLMPANEL_EXPERT_MODEL` | per-role model |
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("LLMPANEL_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(persist) = parse_env::<bool>("LLMPANEL_PERSIST_RATE_LIMITS") {
            config.persist_rate_limits = persist;
        }
        if let Some(limit) = parse_ceiling("LLMPANEL_HOURLY_BUDGET") {
            config.budget.hourly_limit = limit;
        }
        if let Some(limit) = parse_ceiling("LLMPANEL_DAILY_BUDGET") {
            config.budget.daily_limit = limit;
        }
        if let Some(secs) = parse_env::<u64>("LLMPANEL_CALL_TIMEOUT_SECS") {
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(tokens) = parse_env::<usize>("LLMPANEL_MAX_OUTPUT_TOKENS") {
            config.max_output_tokens = tokens;
        }
        if let Ok(model) = env::var("LLMPANEL_MODEL") {
            config = config.with_model(&model);
        }
        if let Ok(model) = env::var("LLMPANEL_SYNTHESIZER_MODEL") {
            config.synthesizer_model = model;
        }
        if let Ok(model) = env::var("LLMPANEL_REVIEWER_MODEL") {
            config.reviewer_model = model;
        }
        if let Ok(model) = env::var("LLMPANEL_EXPERT_MODEL") {
            config.expert_model = model;
        }
        config
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: usize) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Use one model for every role.
    pub fn with_model(mut self, model: &str) -> Self {
        self.synthesizer_model = model.to_string();
        self.reviewer_model = model.to_string();
        self.expert_model = model.to_string();
        self
    }

    pub fn with_persist_rate_limits(mut self, persist: bool) -> Self {
        self.persist_rate_limits = persist;
        self
    }

    pub fn with_unknown_model_policy(mut self, policy: UnknownModelPolicy) -> Self {
        self.unknown_model_policy = policy;
        self
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE_NAME)
    }

    pub fn rate_state_path(&self) -> PathBuf {
        self.data_dir.join(RATE_STATE_FILE_NAME)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("PanelConfig: ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

/// `Some(None)` disables a ceiling, `None` leaves the default untouched.
fn parse_ceiling(name: &str) -> Option<Option<f64>> {
    let raw = env::var(name).ok()?;
    if raw.trim().eq_ignore_ascii_case("none") {
        return Some(None);
    }
    parse_env::<f64>(name).map(Some)
}
