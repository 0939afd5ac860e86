//! The single code path every agent uses to reach an LLM.
//!
//! ```text
//! dispatch(request)
//!   ├─ resolve model metadata (ModelCache)
//!   ├─ estimate cost (CostEstimator)          ── UnknownModel (per policy)
//!   ├─ dry-run rate check (RateLimiter)       ── RateLimited
//!   ├─ budget reservation (UsageLedger)       ── BudgetExceeded
//!   ├─ commit rate reservation (RateLimiter)  ── RateLimited
//!   ├─ client.chat(...) under call_timeout    ── Provider / Timeout
//!   └─ record Transaction (UsageLedger)
//! ```
//!
//! The dispatcher owns no mutable state beyond its model metadata cache: the rate
//! limiter and ledger are injected and may be shared by many dispatchers.

use crate::client_wrapper::{ClientWrapper, TokenUsage};
use crate::config::{PanelConfig, UnknownModelPolicy};
use crate::cost::{estimate_tokens, CostEstimate, CostEstimator, UnknownModelError};
use crate::ledger::{BudgetExceeded, LedgerError, Transaction, UsageLedger};
use crate::models::{provider_for, ModelCache, ModelInfo};
use crate::rate_limiter::{RateLimitExceeded, RateLimiter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Why a dispatch did not produce a response.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    UnknownModel(#[from] UnknownModelError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),
    #[error("provider error from '{model}': {message}")]
    Provider { model: String, message: String },
    #[error("call to '{model}' timed out after {:.1}s", .timeout.as_secs_f64())]
    Timeout { model: String, timeout: Duration },
}

impl DispatchError {
    /// Short machine-friendly label, stored in response metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownModel(_) => "unknown_model",
            DispatchError::RateLimited(_) => "rate_limited",
            DispatchError::BudgetExceeded(_) => "budget_exceeded",
            DispatchError::Provider { .. } => "provider",
            DispatchError::Timeout { .. } => "timeout",
        }
    }
}

/// One system + user exchange to send.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub model: String,
    pub max_tokens: usize,
    /// Free-text tag recorded on the ledger transaction.
    pub context: String,
}

impl DispatchRequest {
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            model: model.into(),
            max_tokens: 1_024,
            context: String::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Text the input token estimate is computed from.
    fn prompt_text(&self) -> String {
        format!("{}\n{}", self.system_prompt, self.user_message)
    }
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub content: String,
    /// Normalized model key the call was made with.
    pub model: String,
    pub provider: String,
    pub estimate: CostEstimate,
    pub usage: Option<TokenUsage>,
    pub actual_cost: Option<f64>,
    /// `None` if the ledger write failed; the response is still returned.
    pub transaction_id: Option<Uuid>,
    pub elapsed: Duration,
}

/// Rate-limited, budget-aware gateway to a [`ClientWrapper`].
pub struct Dispatcher {
    client: Arc<dyn ClientWrapper>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<UsageLedger>,
    estimator: Arc<CostEstimator>,
    models: ModelCache,
    call_timeout: Duration,
    unknown_model_policy: UnknownModelPolicy,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ClientWrapper>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<UsageLedger>,
        estimator: Arc<CostEstimator>,
    ) -> Self {
        Self {
            client,
            limiter,
            ledger,
            estimator,
            models: ModelCache::default(),
            call_timeout: Duration::from_secs(60),
            unknown_model_policy: UnknownModelPolicy::ZeroCost,
        }
    }

    /// Build the limiter, ledger and estimator described by `config` around `client`.
    pub fn from_config(
        client: Arc<dyn ClientWrapper>,
        config: &PanelConfig,
    ) -> Result<Self, LedgerError> {
        let limiter = if config.persist_rate_limits {
            RateLimiter::with_persistence(config.rate_state_path())?
        } else {
            RateLimiter::new()
        };
        let ledger = UsageLedger::open(&config.data_dir, config.budget)?;
        Ok(Self::new(
            client,
            Arc::new(limiter),
            Arc::new(ledger),
            Arc::new(CostEstimator::new()),
        )
        .with_call_timeout(config.call_timeout)
        .with_unknown_model_policy(config.unknown_model_policy))
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_unknown_model_policy(mut self, policy: UnknownModelPolicy) -> Self {
        self.unknown_model_policy = policy;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn estimator(&self) -> &Arc<CostEstimator> {
        &self.estimator
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Resolve (and cache) metadata for a model name.
    pub fn model_info(&self, model: &str) -> ModelInfo {
        self.models.resolve(model, |key| ModelInfo {
            key: key.to_string(),
            provider: provider_for(key)
                .unwrap_or_else(|| self.client.provider_name())
                .to_string(),
            pricing: self.estimator.price_for(key),
        })
    }

    /// Estimate a call, applying the unknown-model policy.
    pub fn estimate(
        &self,
        model: &str,
        input_text: &str,
        output_tokens: usize,
    ) -> Result<CostEstimate, UnknownModelError> {
        match self.estimator.estimate(model, input_text, output_tokens) {
            Ok(estimate) => Ok(estimate),
            Err(e) if self.unknown_model_policy == UnknownModelPolicy::ZeroCost => {
                log::warn!("Dispatcher: {}; treating as zero cost", e);
                Ok(CostEstimate {
                    input_tokens: estimate_tokens(input_text),
                    output_tokens,
                    cost: 0.0,
                    currency: "USD".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Run one call through admission control, budget enforcement and accounting.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let info = self.model_info(&request.model);
        let estimate = self.estimate(&info.key, &request.prompt_text(), request.max_tokens)?;

        self.limiter
            .check_allowance(&info.key, estimate.input_tokens, estimate.output_tokens, false)?;
        let reservation = self.ledger.reserve(estimate.cost)?;
        self.limiter
            .check_allowance(&info.key, estimate.input_tokens, estimate.output_tokens, true)?;

        log::debug!(
            "Dispatcher: calling '{}' ({} est. input tokens, ${:.4} est.)",
            info.key,
            estimate.input_tokens,
            estimate.cost
        );

        let call = self.client.chat(
            &request.system_prompt,
            &request.user_message,
            &info.key,
            Some(request.max_tokens),
        );
        let response = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::error!("Dispatcher: provider error from '{}': {}", info.key, e);
                return Err(DispatchError::Provider {
                    model: info.key,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                log::warn!(
                    "Dispatcher: call to '{}' timed out after {:?}",
                    info.key,
                    self.call_timeout
                );
                return Err(DispatchError::Timeout {
                    model: info.key,
                    timeout: self.call_timeout,
                });
            }
        };

        let actual_cost = response
            .usage
            .and_then(|usage| self.estimator.actual_cost(&info.key, &usage).ok());
        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (estimate.input_tokens, estimate.output_tokens),
        };

        let mut transaction = Transaction::new(
            info.key.clone(),
            info.provider.clone(),
            input_tokens,
            output_tokens,
            estimate.cost,
            request.context.clone(),
        );
        if let Some(actual) = actual_cost {
            transaction = transaction.with_actual_cost(actual);
        }
        let transaction_id = match reservation.record(transaction) {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("Dispatcher: failed to record usage for '{}': {}", info.key, e);
                None
            }
        };

        Ok(DispatchOutcome {
            content: response.content,
            model: info.key,
            provider: info.provider,
            estimate,
            usage: response.usage,
            actual_cost,
            transaction_id,
            elapsed: started.elapsed(),
        })
    }
}
