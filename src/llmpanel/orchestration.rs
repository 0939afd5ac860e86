//! Three-phase problem solving.
//!
//! [`ProcessOrchestrator`] drives one [`SessionState`] through
//! Unpack → Analyze → Synthesize:
//!
//! 1. **Unpack**: the synthesizer restates the raw problem. Failure is fatal for
//!    the session: nothing downstream is started.
//! 2. **Analyze**: the reviewer and one expert per requested domain run
//!    concurrently (`tokio::spawn` per agent) on the unpack output. Each task's
//!    failure, including a panic, becomes a failed [`AgentResponse`]; the phase
//!    waits for every task and always proceeds, even with zero successes.
//!    `analysis_results` is in completion order, which varies between runs.
//! 3. **Synthesize**: the synthesizer merges the successful analyses. Failure moves
//!    the session to `Error`.
//!
//! Every phase change and agent response is published as a
//! [`SessionEvent`](crate::event::SessionEvent) to registered
//! [`EventHandler`]s, and to a channel for [`solve_stream`](ProcessOrchestrator::solve_stream).
//!
//! # Example
//!
//! ```rust,no_run
//! use llmpanel::clients::openai::OpenAICompatibleClient;
//! use llmpanel::dispatcher::Dispatcher;
//! use llmpanel::orchestration::ProcessOrchestrator;
//! use llmpanel::PanelConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PanelConfig::from_env();
//! let client = Arc::new(OpenAICompatibleClient::openai(&std::env::var("OPENAI_API_KEY")?));
//! let dispatcher = Arc::new(Dispatcher::from_config(client, &config)?);
//! let orchestrator = ProcessOrchestrator::new(dispatcher, config.with_model("gpt-4o"));
//!
//! let preflight = orchestrator.preflight("Scale our API", &["tech", "security"], None)?;
//! println!("estimated ${:.4}", preflight.estimated_cost);
//!
//! let session = orchestrator.solve("Scale our API", &["tech", "security"]).await;
//! println!("{:?}: {:?}", session.phase, session.synthesis_result.map(|r| r.content));
//! # Ok(())
//! # }
//! ```

use crate::agent::{Agent, AgentResponse, AgentRole};
use crate::config::PanelConfig;
use crate::cost::{estimate_tokens, UnknownModelError};
use crate::dispatcher::Dispatcher;
use crate::event::{EventBus, EventHandler, SessionEvent};
use crate::session::{CancellationToken, Phase, SessionState};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("problem statement is empty")]
    EmptyProblem,
    #[error(transparent)]
    UnknownModel(#[from] UnknownModelError),
    #[error("unpack failed: {0}")]
    UnpackFailed(String),
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("session cancelled before {0}")]
    Cancelled(Phase),
    #[error("failed to persist rate limiter state: {0}")]
    Persistence(String),
}

/// One planned call in a [`PreflightReport`].
#[derive(Debug, Clone, Serialize)]
pub struct PlannedCall {
    /// Role tag of the agent making the call.
    pub role: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
}

/// Dry-run projection of a full session. Nothing is reserved or recorded.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub calls: Vec<PlannedCall>,
    pub estimated_tokens: usize,
    pub estimated_cost: f64,
    pub rate_limit_ok: bool,
    /// Longest wait among the models that would currently be refused.
    pub retry_after: Option<Duration>,
    pub budget_ok: bool,
    /// Models costed at zero because the price table does not know them.
    pub unpriced_models: Vec<String>,
}

/// The Unpack → Analyze → Synthesize state machine.
#[derive(Clone)]
pub struct ProcessOrchestrator {
    dispatcher: Arc<Dispatcher>,
    config: PanelConfig,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl ProcessOrchestrator {
    pub fn new(dispatcher: Arc<Dispatcher>, config: PanelConfig) -> Self {
        Self {
            dispatcher,
            config,
            handlers: Vec::new(),
        }
    }

    /// Register an observer (builder pattern). Handlers run in registration order.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run a session to completion. The returned state is `Completed` or `Error`.
    pub async fn solve<S: AsRef<str>>(&self, problem: &str, domains: &[S]) -> SessionState {
        self.solve_with_cancel(problem, domains, CancellationToken::new())
            .await
    }

    /// [`solve`](Self::solve) with a caller-held cancellation token, checked between phases.
    pub async fn solve_with_cancel<S: AsRef<str>>(
        &self,
        problem: &str,
        domains: &[S],
        cancel: CancellationToken,
    ) -> SessionState {
        let session = SessionState::new(problem, clean_domains(domains));
        self.run(session, cancel, EventBus::new(self.handlers.clone()))
            .await
    }

    /// Run a session in the background and stream its events.
    ///
    /// The channel closes after the terminal `Complete` or `Error` event. Dropping
    /// the receiver does not stop the session.
    pub fn solve_stream<S: AsRef<str>>(
        &self,
        problem: &str,
        domains: &[S],
    ) -> mpsc::Receiver<SessionEvent> {
        self.solve_stream_with_cancel(problem, domains, CancellationToken::new())
    }

    pub fn solve_stream_with_cancel<S: AsRef<str>>(
        &self,
        problem: &str,
        domains: &[S],
        cancel: CancellationToken,
    ) -> mpsc::Receiver<SessionEvent> {
        let (sender, receiver) = mpsc::channel(self.config.event_buffer.max(1));
        let session = SessionState::new(problem, clean_domains(domains));
        let bus = EventBus::new(self.handlers.clone()).with_stream(sender);
        let this = self.clone();
        tokio::spawn(async move {
            this.run(session, cancel, bus).await;
        });
        receiver
    }

    /// Project the cost, token use and admission outlook of a session without
    /// reserving anything.
    ///
    /// `model` overrides every role's configured model. Analysis inputs are sized
    /// assuming the unpack output uses its full token allowance, and synthesis
    /// assuming every analysis does.
    pub fn preflight<S: AsRef<str>>(
        &self,
        problem: &str,
        domains: &[S],
        model: Option<&str>,
    ) -> Result<PreflightReport, OrchestrationError> {
        if problem.trim().is_empty() {
            return Err(OrchestrationError::EmptyProblem);
        }
        let domains = clean_domains(domains);
        let per_call_output = self.config.max_output_tokens;
        let analysts = self.analysts(&domains, model);
        let synthesizer = self.synthesizer(model);

        let mut calls = Vec::with_capacity(analysts.len() + 2);
        let mut unpriced = Vec::new();

        calls.push(self.plan_call(&synthesizer, problem, 0, &mut unpriced)?);
        let analysis_input = analysis_prompt(problem, "");
        for agent in &analysts {
            calls.push(self.plan_call(agent, &analysis_input, per_call_output, &mut unpriced)?);
        }
        let synthesis_input = synthesis_prompt(problem, "", &[]);
        let all_analyses = per_call_output * (analysts.len() + 1);
        calls.push(self.plan_call(&synthesizer, &synthesis_input, all_analyses, &mut unpriced)?);

        let estimated_tokens: usize = calls
            .iter()
            .map(|c| c.input_tokens + c.output_tokens)
            .sum();
        let estimated_cost: f64 = calls.iter().map(|c| c.cost).sum();

        let mut per_model: BTreeMap<&str, (u32, u64)> = BTreeMap::new();
        for call in &calls {
            let entry = per_model.entry(call.model.as_str()).or_default();
            entry.0 += 1;
            entry.1 += (call.input_tokens + call.output_tokens) as u64;
        }
        let mut retry_after: Option<Duration> = None;
        for (model, (requests, tokens)) in per_model {
            if let Err(e) = self.dispatcher.limiter().check_capacity(model, requests, tokens) {
                log::info!("Preflight: {}", e);
                retry_after = Some(retry_after.map_or(e.retry_after, |d| d.max(e.retry_after)));
            }
        }

        let budget_ok = match self.dispatcher.ledger().check_budget(estimated_cost) {
            Ok(()) => true,
            Err(e) => {
                log::info!("Preflight: {}", e);
                false
            }
        };

        unpriced.sort();
        unpriced.dedup();
        Ok(PreflightReport {
            calls,
            estimated_tokens,
            estimated_cost,
            rate_limit_ok: retry_after.is_none(),
            retry_after,
            budget_ok,
            unpriced_models: unpriced,
        })
    }

    fn plan_call(
        &self,
        agent: &Agent,
        user_text: &str,
        extra_input_tokens: usize,
        unpriced: &mut Vec<String>,
    ) -> Result<PlannedCall, UnknownModelError> {
        let info = self.dispatcher.model_info(agent.model());
        let text = format!("{}\n{}", agent.system_prompt(), user_text);
        let input_tokens = estimate_tokens(&text) + extra_input_tokens;
        let output_tokens = agent.max_tokens();
        let cost = match info.pricing {
            Some(pricing) => pricing.cost(input_tokens, output_tokens),
            None => {
                // Applies the unknown-model policy: rejects, or prices at zero.
                self.dispatcher.estimate(&info.key, &text, output_tokens)?;
                unpriced.push(info.key.clone());
                0.0
            }
        };
        Ok(PlannedCall {
            role: agent.role().tag(),
            model: info.key,
            input_tokens,
            output_tokens,
            cost,
        })
    }

    fn synthesizer(&self, model: Option<&str>) -> Agent {
        Agent::synthesizer(
            Arc::clone(&self.dispatcher),
            model.unwrap_or(&self.config.synthesizer_model),
        )
        .with_max_tokens(self.config.max_output_tokens)
    }

    /// Reviewer first, then one expert per domain.
    fn analysts(&self, domains: &[String], model: Option<&str>) -> Vec<Agent> {
        let mut agents = Vec::with_capacity(domains.len() + 1);
        agents.push(
            Agent::reviewer(
                Arc::clone(&self.dispatcher),
                model.unwrap_or(&self.config.reviewer_model),
            )
            .with_max_tokens(self.config.max_output_tokens),
        );
        for domain in domains {
            agents.push(
                Agent::domain_expert(
                    domain,
                    Arc::clone(&self.dispatcher),
                    model.unwrap_or(&self.config.expert_model),
                )
                .with_max_tokens(self.config.max_output_tokens),
            );
        }
        agents
    }

    async fn run(
        &self,
        mut session: SessionState,
        cancel: CancellationToken,
        bus: EventBus,
    ) -> SessionState {
        let started = Instant::now();
        log::info!(
            "Session {} started: {} domain(s)",
            session.session_id,
            session.domains.len()
        );

        self.execute(&mut session, &cancel, &bus).await;
        session.execution_time = started.elapsed();

        if let Err(e) = self.dispatcher.limiter().save() {
            log::warn!("{}", OrchestrationError::Persistence(e.to_string()));
        }

        let terminal = match (session.phase, session.error.clone()) {
            (Phase::Completed, _) => {
                log::info!(
                    "Session {} completed in {:?} ({} of {} analyses succeeded)",
                    session.session_id,
                    session.execution_time,
                    session.successful_analyses().count(),
                    session.analysis_results.len()
                );
                SessionEvent::Complete {
                    session: Box::new(session.clone()),
                }
            }
            (_, error) => SessionEvent::Error {
                session_id: session.session_id.clone(),
                message: error.unwrap_or_else(|| "session ended without completing".to_string()),
                session: Box::new(session.clone()),
            },
        };
        bus.emit(terminal).await;
        session
    }

    async fn execute(
        &self,
        session: &mut SessionState,
        cancel: &CancellationToken,
        bus: &EventBus,
    ) {
        if session.problem.trim().is_empty() {
            session.fail(OrchestrationError::EmptyProblem.to_string());
            return;
        }

        // Unpack
        if !self.enter(session, Phase::Unpacking, cancel, bus).await {
            return;
        }
        let unpack = self.synthesizer(None).process(&session.problem).await;
        self.publish(session, Phase::Unpacking, &unpack, bus).await;
        let breakdown = unpack.content.clone();
        let unpack_error = unpack.error.clone();
        let unpacked = unpack.success;
        session.unpack_result = Some(unpack);
        if !unpacked {
            let reason = unpack_error.unwrap_or_else(|| "unknown error".to_string());
            session.fail(OrchestrationError::UnpackFailed(reason).to_string());
            return;
        }

        // Analyze
        if !self.enter(session, Phase::Analyzing, cancel, bus).await {
            return;
        }
        let input = Arc::new(analysis_prompt(&session.problem, &breakdown));
        let mut pending: FuturesUnordered<_> = self
            .analysts(&session.domains, None)
            .into_iter()
            .map(|agent| {
                let input = Arc::clone(&input);
                let fallback = (
                    agent.id.clone(),
                    agent.name.clone(),
                    agent.role().clone(),
                    agent.model().to_string(),
                );
                let handle = tokio::spawn(async move { agent.process(&input).await });
                async move {
                    match handle.await {
                        Ok(response) => response,
                        Err(e) => {
                            let (id, name, role, model) = fallback;
                            log::error!("Agent '{}' task aborted: {}", id, e);
                            AgentResponse::failed(
                                id,
                                name,
                                role,
                                model,
                                format!("agent task aborted: {}", e),
                                HashMap::new(),
                            )
                        }
                    }
                }
            })
            .collect();

        while let Some(response) = pending.next().await {
            self.publish(session, Phase::Analyzing, &response, bus).await;
            session.analysis_results.push(response);
        }

        // Synthesize
        if !self.enter(session, Phase::Synthesizing, cancel, bus).await {
            return;
        }
        let (prompt, metadata) = {
            let successful: Vec<&AgentResponse> = session.successful_analyses().collect();
            (
                synthesis_prompt(&session.problem, &breakdown, &successful),
                contribution_metadata(&successful),
            )
        };
        let synthesis = self
            .synthesizer(None)
            .process_with_metadata(&prompt, metadata)
            .await;
        self.publish(session, Phase::Synthesizing, &synthesis, bus).await;
        let synthesis_error = synthesis.error.clone();
        let synthesized = synthesis.success;
        session.synthesis_result = Some(synthesis);
        if !synthesized {
            let reason = synthesis_error.unwrap_or_else(|| "unknown error".to_string());
            session.fail(OrchestrationError::SynthesisFailed(reason).to_string());
            return;
        }

        if let Err(e) = session.advance(Phase::Completed) {
            session.fail(e.to_string());
        }
    }

    /// Advance to `phase` and announce it, unless the session was cancelled.
    async fn enter(
        &self,
        session: &mut SessionState,
        phase: Phase,
        cancel: &CancellationToken,
        bus: &EventBus,
    ) -> bool {
        if cancel.is_cancelled() {
            session.cancelled = true;
            session.fail(OrchestrationError::Cancelled(phase).to_string());
            return false;
        }
        if let Err(e) = session.advance(phase) {
            session.fail(e.to_string());
            return false;
        }
        bus.emit(SessionEvent::PhaseChange {
            session_id: session.session_id.clone(),
            phase,
        })
        .await;
        true
    }

    async fn publish(
        &self,
        session: &SessionState,
        phase: Phase,
        response: &AgentResponse,
        bus: &EventBus,
    ) {
        bus.emit(SessionEvent::AgentResponse {
            session_id: session.session_id.clone(),
            phase,
            response: response.clone(),
        })
        .await;
    }
}

/// Trim, drop empties and drop case-insensitive duplicates, keeping first-seen order.
fn clean_domains<S: AsRef<str>>(domains: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    domains
        .iter()
        .map(|d| d.as_ref().trim())
        .filter(|d| !d.is_empty())
        .filter(|d| seen.insert(d.to_lowercase()))
        .map(str::to_string)
        .collect()
}

fn analysis_prompt(problem: &str, breakdown: &str) -> String {
    format!("Problem:\n{}\n\nProblem breakdown:\n{}", problem, breakdown)
}

fn synthesis_prompt(problem: &str, breakdown: &str, analyses: &[&AgentResponse]) -> String {
    let mut prompt = analysis_prompt(problem, breakdown);
    prompt.push_str("\n\nExpert analyses:\n");
    if analyses.is_empty() {
        prompt.push_str("(none succeeded; answer from the breakdown alone)\n");
    }
    for response in analyses {
        prompt.push_str(&format!(
            "\n### {} [{}]\n{}\n",
            response.agent_name,
            response.role.tag(),
            response.content
        ));
    }
    prompt
}

/// `contributors` lists every successful analyst's role tag; `domains` the experts' domains.
fn contribution_metadata(analyses: &[&AgentResponse]) -> HashMap<String, Value> {
    let contributors: Vec<Value> = analyses
        .iter()
        .map(|r| Value::from(r.role.tag()))
        .collect();
    let domains: Vec<Value> = analyses
        .iter()
        .filter_map(|r| match &r.role {
            AgentRole::DomainExpert { domain } => Some(Value::from(domain.as_str())),
            _ => None,
        })
        .collect();
    let mut metadata = HashMap::new();
    metadata.insert("contributors".to_string(), Value::Array(contributors));
    metadata.insert("domains".to_string(), Value::Array(domains));
    metadata
}
