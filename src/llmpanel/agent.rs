//! Agents
//!
//! An [`Agent`] wraps one [`AgentRole`] around a shared
//! [`Dispatcher`](crate::dispatcher::Dispatcher). It is pure request/response: one
//! call to [`Agent::process`] makes at most one dispatched LLM call and always
//! produces an [`AgentResponse`], converting rate-limit, budget, provider and
//! timeout failures into a response with `success = false`.
//!
//! The role is a closed enum chosen at construction time; it decides the agent's
//! identity and built-in instructions.
//!
//! # Example
//!
//! ```rust,no_run
//! use llmpanel::agent::Agent;
//! use llmpanel::dispatcher::Dispatcher;
//! use std::sync::Arc;
//!
//! # async fn run(dispatcher: Arc<Dispatcher>) {
//! let expert = Agent::domain_expert("security", dispatcher, "gpt-4o");
//! let response = expert.process("Review this login flow.").await;
//! if !response.success {
//!     eprintln!("{} failed: {:?}", response.agent_name, response.error);
//! }
//! # }
//! ```

use crate::dispatcher::{DispatchRequest, Dispatcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const SYNTHESIZER_PROMPT: &str = "You keep a multi-expert discussion coherent. \
When given a raw problem, restate it precisely and break it into the questions the \
experts must answer. When given expert analyses, merge them into one actionable \
answer, resolving disagreements explicitly.";

const REVIEWER_PROMPT: &str = "You are a critical reviewer. Identify risks, hidden \
assumptions, missing requirements and weak reasoning in the problem breakdown you \
are given. Be specific and concise.";

/// The closed set of roles an agent can play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentRole {
    /// Unpacks the problem and synthesizes the final answer.
    Synthesizer,
    /// Critical analysis of the unpacked problem.
    Reviewer,
    /// Analysis from one domain's perspective.
    DomainExpert { domain: String },
}

impl AgentRole {
    /// Short stable tag: `synthesizer`, `reviewer` or `expert:<domain>`.
    pub fn tag(&self) -> String {
        match self {
            AgentRole::Synthesizer => "synthesizer".to_string(),
            AgentRole::Reviewer => "reviewer".to_string(),
            AgentRole::DomainExpert { domain } => format!("expert:{}", domain),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            AgentRole::DomainExpert { domain } => Some(domain),
            _ => None,
        }
    }

    fn system_prompt(&self) -> String {
        match self {
            AgentRole::Synthesizer => SYNTHESIZER_PROMPT.to_string(),
            AgentRole::Reviewer => REVIEWER_PROMPT.to_string(),
            AgentRole::DomainExpert { domain } => format!(
                "You are a domain expert in {domain}. Analyze the problem breakdown you \
                 are given strictly from the {domain} perspective and give concrete \
                 recommendations."
            ),
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Immutable result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub role: AgentRole,
    pub content: String,
    /// Normalized model key used (or requested, when the call never happened).
    pub model: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    pub fn succeeded(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        role: AgentRole,
        model: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            role,
            content: content.into(),
            model: model.into(),
            success: true,
            error: None,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        role: AgentRole,
        model: impl Into<String>,
        error: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            role,
            content: String::new(),
            model: model.into(),
            success: false,
            error: Some(error.into()),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// A role bound to a dispatcher and a model.
#[derive(Clone)]
pub struct Agent {
    /// Stable identifier (`synthesizer`, `reviewer`, `expert-<domain>`).
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    role: AgentRole,
    model: String,
    max_tokens: usize,
    personality: Option<String>,
    dispatcher: Arc<Dispatcher>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
        dispatcher: Arc<Dispatcher>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            model: model.into(),
            max_tokens: 1_024,
            personality: None,
            dispatcher,
        }
    }

    pub fn synthesizer(dispatcher: Arc<Dispatcher>, model: impl Into<String>) -> Self {
        Self::new(
            "synthesizer",
            "Synthesizer",
            AgentRole::Synthesizer,
            dispatcher,
            model,
        )
    }

    pub fn reviewer(dispatcher: Arc<Dispatcher>, model: impl Into<String>) -> Self {
        Self::new(
            "reviewer",
            "Critical Reviewer",
            AgentRole::Reviewer,
            dispatcher,
            model,
        )
    }

    pub fn domain_expert(
        domain: &str,
        dispatcher: Arc<Dispatcher>,
        model: impl Into<String>,
    ) -> Self {
        let domain = domain.trim();
        Self::new(
            format!("expert-{}", domain.to_lowercase().replace(' ', "-")),
            format!("{} Expert", title_case(domain)),
            AgentRole::DomainExpert {
                domain: domain.to_string(),
            },
            dispatcher,
            model,
        )
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Extra tone guidance appended to the role instructions (builder pattern).
    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = Some(personality.into());
        self
    }

    pub fn role(&self) -> &AgentRole {
        &self.role
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// The full system prompt sent with every call.
    pub fn system_prompt(&self) -> String {
        match &self.personality {
            Some(personality) => format!(
                "{}\n\nPersonality: {}",
                self.role.system_prompt(),
                personality
            ),
            None => self.role.system_prompt(),
        }
    }

    /// Run one dispatched call. Never fails; errors become `success = false`.
    pub async fn process(&self, input: &str) -> AgentResponse {
        self.process_with_metadata(input, HashMap::new()).await
    }

    /// Like [`process`](Self::process), attaching caller metadata to the response.
    pub async fn process_with_metadata(
        &self,
        input: &str,
        mut metadata: HashMap<String, Value>,
    ) -> AgentResponse {
        let request = DispatchRequest::new(&self.model, self.system_prompt(), input)
            .with_max_tokens(self.max_tokens)
            .with_context(format!("agent:{}", self.role.tag()));

        match self.dispatcher.dispatch(request).await {
            Ok(outcome) => {
                metadata.insert("provider".into(), Value::from(outcome.provider));
                metadata.insert("estimated_cost".into(), Value::from(outcome.estimate.cost));
                metadata.insert(
                    "elapsed_ms".into(),
                    Value::from(outcome.elapsed.as_millis() as u64),
                );
                if let Some(usage) = outcome.usage {
                    metadata.insert("input_tokens".into(), Value::from(usage.input_tokens));
                    metadata.insert("output_tokens".into(), Value::from(usage.output_tokens));
                }
                if let Some(actual) = outcome.actual_cost {
                    metadata.insert("actual_cost".into(), Value::from(actual));
                }
                if let Some(id) = outcome.transaction_id {
                    metadata.insert("transaction_id".into(), Value::from(id.to_string()));
                }
                log::info!(
                    "Agent '{}' responded ({} chars)",
                    self.id,
                    outcome.content.len()
                );
                AgentResponse::succeeded(
                    &self.id,
                    &self.name,
                    self.role.clone(),
                    outcome.model,
                    outcome.content,
                    metadata,
                )
            }
            Err(e) => {
                log::warn!("Agent '{}' failed: {}", self.id, e);
                metadata.insert("error_kind".into(), Value::from(e.kind()));
                AgentResponse::failed(
                    &self.id,
                    &self.name,
                    self.role.clone(),
                    &self.model,
                    e.to_string(),
                    metadata,
                )
            }
        }
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tags() {
        assert_eq!(AgentRole::Synthesizer.tag(), "synthesizer");
        assert_eq!(AgentRole::Reviewer.tag(), "reviewer");
        let expert = AgentRole::DomainExpert {
            domain: "security".into(),
        };
        assert_eq!(expert.tag(), "expert:security");
        assert_eq!(expert.domain(), Some("security"));
    }

    #[test]
    fn test_expert_prompt_names_domain() {
        let role = AgentRole::DomainExpert {
            domain: "databases".into(),
        };
        assert!(role.system_prompt().contains("domain expert in databases"));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("machine learning"), "Machine Learning");
        assert_eq!(title_case("tech"), "Tech");
    }
}
