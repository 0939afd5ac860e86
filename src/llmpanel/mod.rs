// src/llmpanel/mod.rs

pub mod agent;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod cost;
pub mod dispatcher;
pub mod event;
pub mod ledger;
pub mod models;
pub mod orchestration;
pub mod rate_limiter;
pub mod session;

// Export the orchestrator so callers can write llmpanel::ProcessOrchestrator
// instead of llmpanel::orchestration::ProcessOrchestrator.
pub use orchestration::ProcessOrchestrator;
