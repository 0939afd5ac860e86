//! # llmpanel
//!
//! llmpanel puts a small panel of LLM agents on a problem and pays attention to what
//! that costs. A run has three phases:
//!
//! 1. **Unpack**: a synthesizer agent restates the problem and breaks it down.
//! 2. **Analyze**: a critical reviewer and one expert per requested domain work on
//!    the breakdown concurrently. Individual failures are recorded, not fatal.
//! 3. **Synthesize**: the synthesizer merges the successful analyses.
//!
//! Every LLM call goes through one [`Dispatcher`](dispatcher::Dispatcher), which
//!
//! * prices the call with the [`CostEstimator`](cost::CostEstimator),
//! * asks the per-model sliding-window [`RateLimiter`](rate_limiter::RateLimiter)
//!   for admission,
//! * checks the hourly and daily ceilings of the [`UsageLedger`](ledger::UsageLedger),
//! * bounds the provider call with a timeout,
//! * and records the estimated and (when reported) actual cost on the ledger.
//!
//! Rate limit and budget refusals are ordinary `Result` errors at the dispatcher
//! boundary; agents turn them into failed [`AgentResponse`]s.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use llmpanel::clients::openai::OpenAICompatibleClient;
//! use llmpanel::dispatcher::Dispatcher;
//! use llmpanel::{PanelConfig, Phase, ProcessOrchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     llmpanel::init_logger();
//!
//!     let config = PanelConfig::from_env().with_model("gpt-4o-mini");
//!     let client = Arc::new(OpenAICompatibleClient::openai(&std::env::var("OPENAI_API_KEY")?));
//!     let dispatcher = Arc::new(Dispatcher::from_config(client, &config)?);
//!     let orchestrator = ProcessOrchestrator::new(Arc::clone(&dispatcher), config);
//!
//!     let session = orchestrator.solve("Scale our API", &["tech", "security"]).await;
//!     if session.phase == Phase::Completed {
//!         println!("{}", session.synthesis_result.map(|r| r.content).unwrap_or_default());
//!     }
//!
//!     dispatcher.limiter().save()?;
//!     println!("{:#?}", dispatcher.ledger().summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! [`ProcessOrchestrator::solve_stream`] runs the same pipeline in a background task
//! and returns a `tokio::sync::mpsc::Receiver` of [`SessionEvent`]s.
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade. Call [`init_logger`] to install
//! `env_logger` and control verbosity with `RUST_LOG`.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// ```rust
/// llmpanel::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `llmpanel` module.
pub mod llmpanel;

// Re-exporting key items for easier external access.
pub use llmpanel::agent;
pub use llmpanel::agent::{Agent, AgentResponse, AgentRole};
pub use llmpanel::client_wrapper;
pub use llmpanel::client_wrapper::{ChatResponse, ClientError, ClientWrapper, TokenUsage};
pub use llmpanel::clients;
pub use llmpanel::config;
pub use llmpanel::config::{PanelConfig, UnknownModelPolicy};
pub use llmpanel::cost;
pub use llmpanel::dispatcher;
pub use llmpanel::event;
pub use llmpanel::event::{EventHandler, SessionEvent};
pub use llmpanel::ledger;
pub use llmpanel::models;
pub use llmpanel::orchestration;
pub use llmpanel::orchestration::{PreflightReport, ProcessOrchestrator};
pub use llmpanel::rate_limiter;
pub use llmpanel::session;
pub use llmpanel::session::{CancellationToken, Phase, SessionState};
